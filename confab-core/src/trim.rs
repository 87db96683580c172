//! Dialog trimming under message-count and token budgets.
//!
//! Trimming is a pure function over the dialog so it can run under the
//! session lock without blocking. Whatever the budget, the output keeps a
//! system message at index 0.

use confab_common::SessionConfig;

use crate::session::{DialogMessage, Role};

/// System prompt used when a dialog somehow lost its system message.
const FALLBACK_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Budget configuration for [`trim`].
#[derive(Debug, Clone)]
pub struct TrimPolicy {
    /// Keep at most this many user/assistant pairs (2 messages each).
    pub max_pairs: Option<usize>,
    /// Token ceiling for the whole dialog. Takes precedence over
    /// `max_pairs` when both are set.
    pub max_tokens: Option<usize>,
    /// Safety margin subtracted from `max_tokens` to absorb counting
    /// error at the generation boundary.
    pub margin: usize,
}

impl Default for TrimPolicy {
    fn default() -> Self {
        Self {
            max_pairs: None,
            max_tokens: None,
            margin: 5,
        }
    }
}

impl TrimPolicy {
    /// Keep the last `n` message pairs.
    pub fn pairs(n: usize) -> Self {
        Self {
            max_pairs: Some(n),
            ..Self::default()
        }
    }

    /// Trim to a token ceiling with the default margin.
    pub fn tokens(max: usize) -> Self {
        Self {
            max_tokens: Some(max),
            ..Self::default()
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            max_pairs: Some(config.max_pairs),
            max_tokens: config.max_tokens,
            margin: config.token_margin,
        }
    }
}

/// Estimate token count for text.
///
/// Rough approximation: 1 token ≈ 4 characters. Good enough for budget
/// decisions without a tokenizer dependency.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Estimated token count of a whole dialog.
pub fn dialog_tokens(dialog: &[DialogMessage]) -> usize {
    dialog.iter().map(|m| estimate_tokens(&m.content)).sum()
}

/// Trim a dialog with the default token counter.
pub fn trim(dialog: Vec<DialogMessage>, policy: &TrimPolicy) -> Vec<DialogMessage> {
    trim_with(dialog, policy, dialog_tokens)
}

/// Trim a dialog using an injected token counter.
///
/// Token budget: drop the oldest non-system pair until the counter reports
/// at or below `max_tokens - margin`, or nothing but the system message is
/// left. Message budget: keep the most recent `2 * max_pairs` non-system
/// messages. Already-trimmed input comes back unchanged, and a non-empty
/// output always starts with a system message.
pub fn trim_with<F>(
    mut dialog: Vec<DialogMessage>,
    policy: &TrimPolicy,
    count_tokens: F,
) -> Vec<DialogMessage>
where
    F: Fn(&[DialogMessage]) -> usize,
{
    if dialog.is_empty() {
        return dialog;
    }

    if dialog[0].role != Role::System {
        dialog.insert(0, DialogMessage::system(FALLBACK_SYSTEM_PROMPT));
    }

    if let Some(max_tokens) = policy.max_tokens {
        let target = max_tokens.saturating_sub(policy.margin);
        while count_tokens(&dialog) > target && dialog.len() > 1 {
            // oldest pair sits right after the system message
            let upto = 3.min(dialog.len());
            dialog.drain(1..upto);
        }
        return dialog;
    }

    if let Some(max_pairs) = policy.max_pairs {
        let keep = max_pairs.saturating_mul(2);
        if dialog.len() > keep + 1 {
            let cutoff = dialog.len() - keep;
            dialog.drain(1..cutoff);
        }
    }

    dialog
}
