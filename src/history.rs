//! Sliding-window record of past execution intervals.

use std::collections::{HashMap, VecDeque};

/// One recorded interval. Appended at grant time with `end = start + quota`;
/// the end may be adjusted down when the client returns.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub name: String,
    pub start: f64,
    pub end: f64,
}

/// Ordered sequence of execution intervals, oldest first. Starts grow
/// monotonically because only the scheduler daemon records grants.
#[derive(Debug, Default)]
pub struct UsageHistory {
    entries: VecDeque<HistoryEntry>,
}

impl UsageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Record a fresh grant of `quota` ms starting at `start`.
    pub fn record(&mut self, name: &str, start: f64, quota: f64) {
        self.entries.push_back(HistoryEntry {
            name: name.to_string(),
            start,
            end: start + quota,
        });
    }

    /// Adjust the client's most recent entry when it reports back: the client
    /// ran `overuse` ms past its granted end, but may also have stopped early.
    /// Only the newest entry for the name is touched. Returns the entry's
    /// actual usage after adjustment.
    pub fn adjust_return(&mut self, name: &str, now: f64, overuse: f64) -> Option<f64> {
        let entry = self.entries.iter_mut().rev().find(|e| e.name == name)?;
        entry.end = now.min(entry.end + overuse);
        Some(entry.end - entry.start)
    }

    /// Drop entries that ended before `window_start`.
    pub fn prune(&mut self, window_start: f64) {
        self.entries.retain(|e| e.end >= window_start);
    }

    /// Per-client usage inside the window, clipping entries at `window_start`.
    pub fn usage_since(&self, window_start: f64) -> HashMap<String, f64> {
        let mut usage: HashMap<String, f64> = HashMap::new();
        for entry in &self.entries {
            *usage.entry(entry.name.clone()).or_default() +=
                entry.end - entry.start.max(window_start);
        }
        usage
    }

    /// End timestamp of the oldest entry, if any.
    pub fn earliest_end(&self) -> Option<f64> {
        self.entries.front().map(|e| e.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_appends_with_quota_length() {
        let mut history = UsageHistory::new();
        history.record("a", 100.0, 250.0);
        let entry = history.iter().next().unwrap();
        assert_eq!(entry.start, 100.0);
        assert_eq!(entry.end, 350.0);
    }

    #[test]
    fn adjust_touches_only_the_most_recent_entry() {
        let mut history = UsageHistory::new();
        history.record("a", 0.0, 100.0);
        history.record("b", 50.0, 100.0);
        history.record("a", 200.0, 100.0);

        // client "a" reports back at t=260 with 10ms overuse: the newer entry
        // is capped at now, the older one stays untouched
        let actual = history.adjust_return("a", 260.0, 10.0).unwrap();
        assert_eq!(actual, 60.0);

        let entries: Vec<_> = history.iter().cloned().collect();
        assert_eq!(entries[0].end, 100.0);
        assert_eq!(entries[2].end, 260.0);
    }

    #[test]
    fn adjust_extends_by_overuse_when_late() {
        let mut history = UsageHistory::new();
        history.record("a", 0.0, 100.0);
        let actual = history.adjust_return("a", 500.0, 25.0).unwrap();
        assert_eq!(actual, 125.0);
    }

    #[test]
    fn adjust_unknown_name_is_none() {
        let mut history = UsageHistory::new();
        history.record("a", 0.0, 100.0);
        assert!(history.adjust_return("b", 50.0, 0.0).is_none());
    }

    #[test]
    fn prune_drops_entries_fully_before_the_window() {
        let mut history = UsageHistory::new();
        history.record("a", 0.0, 100.0); // ends 100
        history.record("b", 500.0, 100.0); // ends 600
        history.prune(300.0);
        assert_eq!(history.len(), 1);
        assert_eq!(history.iter().next().unwrap().name, "b");
    }

    #[test]
    fn usage_clips_at_the_window_start() {
        let mut history = UsageHistory::new();
        history.record("a", 0.0, 400.0); // 0..400, 200 inside
        history.record("a", 500.0, 100.0); // fully inside
        history.record("b", 600.0, 50.0);

        let usage = history.usage_since(200.0);
        assert_eq!(usage["a"], 300.0);
        assert_eq!(usage["b"], 50.0);
    }

    #[test]
    fn earliest_end_is_the_front_entry() {
        let mut history = UsageHistory::new();
        assert!(history.earliest_end().is_none());
        history.record("a", 0.0, 100.0);
        history.record("b", 10.0, 500.0);
        assert_eq!(history.earliest_end(), Some(100.0));
    }
}
