use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

/// One client's window in the local backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LocalRecord {
    count: u64,
    window_start_ms: u64,
    window_ms: u64,
}

impl LocalRecord {
    fn fresh(now_ms: u64, window_ms: u64) -> Self {
        Self {
            count: 1,
            window_start_ms: now_ms,
            window_ms,
        }
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.window_start_ms) > self.window_ms
    }
}

/// Result of a local check-and-increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalHit {
    /// Requests counted in the current window, including this one
    pub count: u64,
    /// When the current window started
    pub window_start_ms: u64,
}

/// In-memory per-process window counter.
///
/// Records are created on first use, replaced once their window has passed,
/// and removed by [`LocalStore::sweep`].
#[derive(Debug, Default)]
pub struct LocalStore {
    records: DashMap<String, LocalRecord>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request against `key` and return the updated window
    pub fn hit(&self, key: &str, window_ms: u64, now_ms: u64) -> LocalHit {
        let record = match self.records.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.is_expired(now_ms) {
                    *record = LocalRecord::fresh(now_ms, window_ms);
                } else {
                    record.count += 1;
                }
                *record
            }
            Entry::Vacant(vacant) => {
                debug!("Creating local rate limit record for key: {}", key);
                *vacant.insert(LocalRecord::fresh(now_ms, window_ms))
            }
        };

        LocalHit {
            count: record.count,
            window_start_ms: record.window_start_ms,
        }
    }

    /// Remove every record whose window has elapsed. Returns how many went.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let mut removed = 0;
        self.records.retain(|_, record| {
            let keep = !record.is_expired(now_ms);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Current count for a key, if tracked
    pub fn count(&self, key: &str) -> Option<u64> {
        self.records.get(key).map(|record| record.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_hit_starts_window() {
        let store = LocalStore::new();
        let hit = store.hit("rl:1.2.3.4", 1_000, 5_000);

        assert_eq!(hit.count, 1);
        assert_eq!(hit.window_start_ms, 5_000);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_hits_within_window_accumulate() {
        let store = LocalStore::new();

        for expected in 1..=4 {
            let hit = store.hit("rl:1.2.3.4", 1_000, 5_000 + expected * 100);
            assert_eq!(hit.count, expected);
            assert_eq!(hit.window_start_ms, 5_100);
        }
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let store = LocalStore::new();
        store.hit("k", 1_000, 0);

        // Exactly one window later still belongs to the first window
        assert_eq!(store.hit("k", 1_000, 1_000).count, 2);

        // Past it, the window starts over
        let hit = store.hit("k", 1_000, 1_001);
        assert_eq!(hit.count, 1);
        assert_eq!(hit.window_start_ms, 1_001);
    }

    #[test]
    fn test_keys_are_independent() {
        let store = LocalStore::new();
        store.hit("rl:a", 1_000, 0);
        store.hit("rl:a", 1_000, 1);

        assert_eq!(store.hit("rl:b", 1_000, 2).count, 1);
        assert_eq!(store.count("rl:a"), Some(2));
    }

    #[test]
    fn test_sweep_removes_only_expired_records() {
        let store = LocalStore::new();
        store.hit("old", 1_000, 0);
        store.hit("fresh", 1_000, 900);
        store.hit("long", 60_000, 0);

        let removed = store.sweep(1_500);

        assert_eq!(removed, 1);
        assert_eq!(store.count("old"), None);
        assert_eq!(store.count("fresh"), Some(1));
        assert_eq!(store.count("long"), Some(1));
    }

    #[test]
    fn test_sweep_keeps_record_at_window_edge() {
        let store = LocalStore::new();
        store.hit("edge", 1_000, 0);

        assert_eq!(store.sweep(1_000), 0);
        assert_eq!(store.sweep(1_001), 1);
        assert!(store.is_empty());
    }
}
