//! Three-layer context compression for structured world state.
//!
//! Each turn gets a compact prompt assembled from three layers: a static
//! layer (system prompt plus capabilities, first turn only), a working
//! layer (dense key=value scalars plus a delta-suppressed grid), and an
//! episodic layer derived from a bounded ring of recent events. The grid
//! is the dominant token cost, so it is resent only when its 64-bit hash
//! changes.

use confab_common::MemoryConfig;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt::Write;
use xxhash_rust::xxh3::xxh3_64;

/// One recorded turn event, the unit stored in the episodic ring.
///
/// Coordinates are `(row, col)` with row 0 at the north edge, so a
/// decreasing row means moving north.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackEvent {
    /// Position after this turn
    pub position: (i64, i64),
    /// Obstacle encountered this turn, if any
    pub obstacle: Option<(i64, i64)>,
}

impl TrackEvent {
    pub fn moved(row: i64, col: i64) -> Self {
        Self {
            position: (row, col),
            obstacle: None,
        }
    }

    pub fn blocked(row: i64, col: i64, obstacle: (i64, i64)) -> Self {
        Self {
            position: (row, col),
            obstacle: Some(obstacle),
        }
    }
}

/// Per-session episodic memory. Created with the session, wiped with it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryState {
    /// Recent events, oldest dropped past capacity
    pub ring: VecDeque<TrackEvent>,
    /// Obstacles already reported at least once, insertion ordered
    pub explained_obstacles: Vec<(i64, i64)>,
    /// Hash of the last grid actually sent, for delta suppression
    pub last_grid_hash: Option<u64>,
    /// Turns composed so far
    pub turn: u64,
}

/// Structured state snapshot supplied by the caller for one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorldState {
    /// Current position, `(row, col)`
    pub position: Option<(i64, i64)>,
    /// Scalar facts, rendered one `key=value` line each in insertion order
    pub facts: Vec<(String, String)>,
    /// Large 2-D grid as row strings, subject to delta suppression
    pub grid: Option<Vec<String>>,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(mut self, row: i64, col: i64) -> Self {
        self.position = Some((row, col));
        self
    }

    pub fn fact(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.facts.push((key.into(), value.to_string()));
        self
    }

    pub fn with_grid(mut self, rows: Vec<String>) -> Self {
        self.grid = Some(rows);
        self
    }
}

/// 64-bit content hash of a grid, row order included.
pub fn grid_hash(rows: &[String]) -> u64 {
    let mut joined = String::with_capacity(rows.iter().map(|r| r.len() + 1).sum());
    for row in rows {
        joined.push_str(row);
        joined.push('\n');
    }
    xxh3_64(joined.as_bytes())
}

/// Composes the per-turn prompt from session memory and a world snapshot.
#[derive(Clone)]
pub struct ContextMemory {
    config: MemoryConfig,
    capabilities: Vec<String>,
}

impl ContextMemory {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            capabilities: Vec::new(),
        }
    }

    /// Set the abbreviated capability listing for the static layer.
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Record an event into the session's bounded ring.
    pub fn observe(&self, memory: &mut MemoryState, event: TrackEvent) {
        memory.ring.push_back(event);
        while memory.ring.len() > self.config.ring_capacity {
            memory.ring.pop_front();
        }
    }

    /// Compose the prompt layers for one turn.
    ///
    /// Returns `(static_layer, working_plus_episodic)`; the static layer is
    /// present only on the session's first turn or when `force_static` is
    /// set. Advances the turn counter and updates the stored grid hash.
    pub fn compose(
        &self,
        memory: &mut MemoryState,
        world: &WorldState,
        system_prompt: &str,
        force_static: bool,
    ) -> (Option<String>, String) {
        let static_layer = if memory.turn == 0 || force_static {
            Some(self.static_layer(system_prompt))
        } else {
            None
        };

        let mut text = self.working_layer(memory, world);
        let episodic = self.episodic_layer(memory);
        if !episodic.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&episodic);
        }

        memory.turn += 1;
        (static_layer, text)
    }

    fn static_layer(&self, system_prompt: &str) -> String {
        if self.capabilities.is_empty() {
            return system_prompt.to_string();
        }
        format!(
            "{system_prompt}\nCapabilities: {}",
            self.capabilities.join(", ")
        )
    }

    /// Dense one-line-per-field scalars plus the delta-suppressed grid.
    fn working_layer(&self, memory: &mut MemoryState, world: &WorldState) -> String {
        let mut out = String::new();

        if let Some((row, col)) = world.position {
            let _ = writeln!(out, "position={row},{col}");
        }
        for (key, value) in &world.facts {
            let _ = writeln!(out, "{key}={value}");
        }

        if let Some(rows) = &world.grid {
            let hash = grid_hash(rows);
            if memory.last_grid_hash == Some(hash) {
                out.push_str("grid=unchanged\n");
            } else {
                out.push_str("grid:\n");
                for row in rows {
                    out.push_str(row);
                    out.push('\n');
                }
                memory.last_grid_hash = Some(hash);
            }
        }

        // drop the trailing newline so layers join cleanly
        if out.ends_with('\n') {
            out.pop();
        }
        out
    }

    /// Natural-language compression of the recent ring: movement trend,
    /// oscillation, and obstacle sightings. Recomputed each turn, never
    /// stored.
    fn episodic_layer(&self, memory: &mut MemoryState) -> String {
        let window: Vec<TrackEvent> = memory
            .ring
            .iter()
            .rev()
            .take(self.config.recent_window)
            .rev()
            .copied()
            .collect();

        let mut lines: Vec<String> = Vec::new();
        let mut recent: Vec<&str> = Vec::new();

        if let Some(trend) = movement_trend(&window) {
            recent.push(trend);
        }
        if is_oscillating(&window) {
            recent.push("oscillating (likely stuck)");
        }
        if !recent.is_empty() {
            lines.push(format!("recent: {}", recent.join(", ")));
        }

        for event in &window {
            let Some(obstacle) = event.obstacle else {
                continue;
            };
            if !memory.explained_obstacles.contains(&obstacle) {
                lines.push(format!(
                    "new obstacle at ({}, {})",
                    obstacle.0, obstacle.1
                ));
                memory.explained_obstacles.push(obstacle);
            }
        }

        // the prompt lists only the most recent sightings
        if !memory.explained_obstacles.is_empty() {
            let listed: Vec<String> = memory
                .explained_obstacles
                .iter()
                .rev()
                .take(self.config.max_obstacles)
                .rev()
                .map(|(r, c)| format!("({r}, {c})"))
                .collect();
            lines.push(format!("obstacles: {}", listed.join(" ")));
        }

        lines.join("\n")
    }
}

/// Net movement direction across the window, e.g. "trending north-east".
fn movement_trend(window: &[TrackEvent]) -> Option<&'static str> {
    let first = window.first()?.position;
    let last = window.last()?.position;
    if window.len() < 2 {
        return None;
    }

    // row 0 is the north edge, so north is a decreasing row
    let south = last.0 - first.0;
    let east = last.1 - first.1;
    let trend = match (south.signum(), east.signum()) {
        (-1, 0) => "trending north",
        (-1, 1) => "trending north-east",
        (0, 1) => "trending east",
        (1, 1) => "trending south-east",
        (1, 0) => "trending south",
        (1, -1) => "trending south-west",
        (0, -1) => "trending west",
        (-1, -1) => "trending north-west",
        _ => return None,
    };
    Some(trend)
}

/// True when more than half of the window's moves land on a position
/// already visited inside the window.
fn is_oscillating(window: &[TrackEvent]) -> bool {
    if window.len() < 3 {
        return false;
    }

    let mut seen: HashSet<(i64, i64)> = HashSet::new();
    let mut revisits = 0usize;
    for event in window {
        if !seen.insert(event.position) {
            revisits += 1;
        }
    }
    revisits * 2 > window.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ContextMemory {
        ContextMemory::new(MemoryConfig::default())
    }

    fn grid() -> Vec<String> {
        vec!["##..#".into(), "#...#".into(), "#####".into()]
    }

    #[test]
    fn static_layer_only_on_first_turn() {
        let ctx = manager().with_capabilities(vec!["move".into(), "scan".into()]);
        let mut memory = MemoryState::default();
        let world = WorldState::new().at(1, 1);

        let (first, _) = ctx.compose(&mut memory, &world, "You are a scout.", false);
        let header = first.expect("first turn carries the static layer");
        assert!(header.contains("You are a scout."));
        assert!(header.contains("Capabilities: move, scan"));

        let (second, _) = ctx.compose(&mut memory, &world, "You are a scout.", false);
        assert!(second.is_none());

        let (forced, _) = ctx.compose(&mut memory, &world, "You are a scout.", true);
        assert!(forced.is_some());
        assert_eq!(memory.turn, 3);
    }

    #[test]
    fn working_layer_is_dense_lines() {
        let ctx = manager();
        let mut memory = MemoryState::default();
        let world = WorldState::new()
            .at(2, 3)
            .fact("hp", 10)
            .fact("status", "ok");

        let (_, text) = ctx.compose(&mut memory, &world, "sys", false);
        assert_eq!(text, "position=2,3\nhp=10\nstatus=ok");
    }

    #[test]
    fn unchanged_grid_is_suppressed() {
        let ctx = manager();
        let mut memory = MemoryState::default();
        let world = WorldState::new().with_grid(grid());

        let (_, first) = ctx.compose(&mut memory, &world, "sys", false);
        assert!(first.contains("grid:"));
        assert!(first.contains("##..#"));

        let (_, second) = ctx.compose(&mut memory, &world, "sys", false);
        assert!(second.contains("grid=unchanged"));
        assert!(!second.contains("##..#"));
    }

    #[test]
    fn changed_cell_resends_the_grid() {
        let ctx = manager();
        let mut memory = MemoryState::default();
        ctx.compose(&mut memory, &WorldState::new().with_grid(grid()), "sys", false);

        let mut changed = grid();
        changed[1] = "#..@#".into();
        let (_, text) = ctx.compose(
            &mut memory,
            &WorldState::new().with_grid(changed),
            "sys",
            false,
        );
        assert!(text.contains("grid:"));
        assert!(text.contains("#..@#"));
        assert!(!text.contains("grid=unchanged"));
    }

    #[test]
    fn absent_grid_keeps_the_stored_hash() {
        let ctx = manager();
        let mut memory = MemoryState::default();
        ctx.compose(&mut memory, &WorldState::new().with_grid(grid()), "sys", false);
        let hash = memory.last_grid_hash;

        ctx.compose(&mut memory, &WorldState::new().at(0, 0), "sys", false);
        assert_eq!(memory.last_grid_hash, hash);

        // same grid again still counts as unchanged
        let (_, text) = ctx.compose(&mut memory, &WorldState::new().with_grid(grid()), "sys", false);
        assert!(text.contains("grid=unchanged"));
    }

    #[test]
    fn straight_runs_read_as_trends() {
        let ctx = manager();
        let mut memory = MemoryState::default();
        for row in (0..5).rev() {
            ctx.observe(&mut memory, TrackEvent::moved(row, 2));
        }

        let (_, text) = ctx.compose(&mut memory, &WorldState::new(), "sys", false);
        assert!(text.contains("trending north"));
        assert!(!text.contains("stuck"));
    }

    #[test]
    fn diagonal_runs_combine_directions() {
        let ctx = manager();
        let mut memory = MemoryState::default();
        for i in 0..4 {
            ctx.observe(&mut memory, TrackEvent::moved(3 + i, 3 + i));
        }

        let (_, text) = ctx.compose(&mut memory, &WorldState::new(), "sys", false);
        assert!(text.contains("trending south-east"));
    }

    #[test]
    fn revisiting_positions_reads_as_oscillation() {
        let ctx = manager();
        let mut memory = MemoryState::default();
        for i in 0..8 {
            let col = i % 2;
            ctx.observe(&mut memory, TrackEvent::moved(4, col));
        }

        let (_, text) = ctx.compose(&mut memory, &WorldState::new(), "sys", false);
        assert!(text.contains("oscillating (likely stuck)"));
    }

    #[test]
    fn obstacles_are_called_out_once() {
        let ctx = manager();
        let mut memory = MemoryState::default();
        ctx.observe(&mut memory, TrackEvent::blocked(1, 1, (1, 2)));

        let (_, first) = ctx.compose(&mut memory, &WorldState::new(), "sys", false);
        assert!(first.contains("new obstacle at (1, 2)"));
        assert!(first.contains("obstacles: (1, 2)"));

        ctx.observe(&mut memory, TrackEvent::blocked(1, 1, (1, 2)));
        let (_, second) = ctx.compose(&mut memory, &WorldState::new(), "sys", false);
        assert!(!second.contains("new obstacle"));
        assert!(second.contains("obstacles: (1, 2)"));
    }

    #[test]
    fn obstacle_listing_is_bounded() {
        let config = MemoryConfig {
            max_obstacles: 3,
            ..MemoryConfig::default()
        };
        let ctx = ContextMemory::new(config);
        let mut memory = MemoryState::default();

        for i in 0..6 {
            ctx.observe(&mut memory, TrackEvent::blocked(0, i, (0, i)));
        }
        let (_, text) = ctx.compose(&mut memory, &WorldState::new(), "sys", false);

        // every sighting is remembered, the prompt shows the newest three
        assert_eq!(memory.explained_obstacles.len(), 6);
        assert!(text.contains("obstacles: (0, 3) (0, 4) (0, 5)"));
        assert!(!text.contains("obstacles: (0, 0)"));
    }

    #[test]
    fn ring_drops_oldest_past_capacity() {
        let config = MemoryConfig {
            ring_capacity: 4,
            ..MemoryConfig::default()
        };
        let ctx = ContextMemory::new(config);
        let mut memory = MemoryState::default();

        for i in 0..10 {
            ctx.observe(&mut memory, TrackEvent::moved(0, i));
        }
        assert_eq!(memory.ring.len(), 4);
        assert_eq!(memory.ring.front().unwrap().position, (0, 6));
    }
}
