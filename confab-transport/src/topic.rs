//! Topic grammar and reply-topic construction.
//!
//! Topics are `/`-separated segment strings. Subscription patterns may use
//! `+` to match exactly one segment and `#` to match the remainder.
//!
//! Reply routing uses two shapes:
//! - per-request: `{prefix}/{session_id}/{client_id}/{request_id}`, carried
//!   outbound in `replyTopic` so the far end can address exactly one waiter;
//! - per-client: `{prefix}/{client_id}`, for far ends that only echo
//!   correlation ids in the payload.

/// Check if a topic matches a subscription pattern.
///
/// - `+` matches exactly one segment
/// - `#` matches everything remaining, including nothing
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let topic_parts: Vec<&str> = topic.split('/').collect();
    let pattern_parts: Vec<&str> = pattern.split('/').collect();

    let mut t_idx = 0;
    let mut p_idx = 0;

    while p_idx < pattern_parts.len() {
        let p = pattern_parts[p_idx];

        if p == "#" {
            return true;
        }

        if t_idx >= topic_parts.len() {
            return false;
        }

        if p == "+" || p == topic_parts[t_idx] {
            t_idx += 1;
            p_idx += 1;
        } else {
            return false;
        }
    }

    t_idx == topic_parts.len()
}

/// Build the per-request reply topic.
pub fn reply_topic(prefix: &str, session_id: &str, client_id: &str, request_id: &str) -> String {
    format!("{prefix}/{session_id}/{client_id}/{request_id}")
}

/// Build the subscription pattern covering all per-request reply topics for
/// one client.
pub fn reply_pattern(prefix: &str, client_id: &str) -> String {
    format!("{prefix}/+/{client_id}/+")
}

/// Build the per-client general reply topic.
pub fn client_topic(prefix: &str, client_id: &str) -> String {
    format!("{prefix}/{client_id}")
}

/// Correlation ids recovered from a per-request reply topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyAddress {
    pub session_id: String,
    pub request_id: String,
}

/// Parse a per-request reply topic back into its correlation ids.
///
/// Returns `None` when the topic does not have the
/// `{prefix}/{session}/{client}/{request}` shape for this client.
pub fn parse_reply_topic(prefix: &str, client_id: &str, topic: &str) -> Option<ReplyAddress> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.len() != 3 || parts[1] != client_id {
        return None;
    }
    if parts[0].is_empty() || parts[2].is_empty() {
        return None;
    }
    Some(ReplyAddress {
        session_id: parts[0].to_string(),
        request_id: parts[2].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_pattern_matching() {
        // Exact match
        assert!(topic_matches("chat/ask", "chat/ask"));
        assert!(!topic_matches("chat/ask", "chat/reply"));

        // Single wildcard
        assert!(topic_matches("chat/+", "chat/ask"));
        assert!(topic_matches("chat/+/done", "chat/s1/done"));
        assert!(!topic_matches("chat/+", "chat/s1/done"));
        assert!(!topic_matches("chat/+", "other/ask"));

        // Multi-level wildcard
        assert!(topic_matches("chat/#", "chat/ask"));
        assert!(topic_matches("chat/#", "chat/s1/c1/r1"));
        assert!(topic_matches("chat/#", "chat")); // # matches zero or more
    }

    #[test]
    fn test_reply_topic_round_trip() {
        let topic = reply_topic("confab/reply", "sess-9", "confab-ab12cd34", "deadbeef00112233");
        assert_eq!(topic, "confab/reply/sess-9/confab-ab12cd34/deadbeef00112233");

        let pattern = reply_pattern("confab/reply", "confab-ab12cd34");
        assert!(topic_matches(&pattern, &topic));

        let addr = parse_reply_topic("confab/reply", "confab-ab12cd34", &topic).unwrap();
        assert_eq!(addr.session_id, "sess-9");
        assert_eq!(addr.request_id, "deadbeef00112233");
    }

    #[test]
    fn test_parse_rejects_foreign_topics() {
        // other client
        assert!(parse_reply_topic(
            "confab/reply",
            "me",
            "confab/reply/sess-1/somebody-else/aaaa"
        )
        .is_none());
        // wrong prefix
        assert!(parse_reply_topic("confab/reply", "me", "other/sess-1/me/aaaa").is_none());
        // wrong arity
        assert!(parse_reply_topic("confab/reply", "me", "confab/reply/sess-1/me").is_none());
        // the per-client general topic is not a per-request topic
        assert!(parse_reply_topic("confab/reply", "me", "confab/reply/me").is_none());
    }

    #[test]
    fn test_strict_pattern_ignores_general_topic() {
        let pattern = reply_pattern("confab/reply", "me");
        assert!(!topic_matches(&pattern, &client_topic("confab/reply", "me")));
    }
}
