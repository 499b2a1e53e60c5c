//! Memoized lookup results.
//!
//! Hits remember who provided them so they can be dropped once that provider is disposed.
//! Misses remember the registry epoch they were computed at; a miss from an older epoch is
//! treated as "not attempted", because a module registered or loaded since may now answer.

use std::sync::Weak;

use dashmap::DashMap;

use crate::loader::context::IsolationContext;

/// Where a cached hit came from.
#[derive(Debug, Clone)]
pub(crate) enum Provider {
    /// The context's own modules or package
    Own,
    /// The host's native modules
    Native,
    /// Another context
    Context(Weak<IsolationContext>),
}

impl Provider {
    fn is_live(&self) -> bool {
        match self {
            Provider::Own | Provider::Native => true,
            Provider::Context(context) => context
                .upgrade()
                .is_some_and(|context| !context.is_disposed()),
        }
    }
}

#[derive(Debug, Clone)]
enum Memo<T> {
    Hit { provider: Provider, value: T },
    Miss { epoch: u64 },
}

/// Result of consulting a [`LookupCache`].
#[derive(Debug)]
pub(crate) enum Cached<T> {
    /// A live hit
    Hit(T),
    /// A miss recorded at the current epoch
    Miss,
    /// Nothing usable recorded
    Unknown,
}

/// Per-context memo of complete lookups, keyed by simple name.
#[derive(Debug)]
pub(crate) struct LookupCache<T> {
    entries: DashMap<String, Memo<T>>,
}

impl<T: Clone> LookupCache<T> {
    pub(crate) fn new() -> Self {
        LookupCache {
            entries: DashMap::new(),
        }
    }

    pub(crate) fn get(&self, name: &str, epoch: u64) -> Cached<T> {
        let (cached, stale) = match self.entries.get(name).as_deref() {
            None => (Cached::Unknown, false),
            Some(Memo::Hit { provider, value }) => {
                if provider.is_live() {
                    (Cached::Hit(value.clone()), false)
                } else {
                    (Cached::Unknown, true)
                }
            }
            Some(Memo::Miss { epoch: at }) => {
                if *at == epoch {
                    (Cached::Miss, false)
                } else {
                    (Cached::Unknown, false)
                }
            }
        };

        // The read guard is gone, so removal cannot deadlock on the shard.
        if stale {
            self.entries
                .remove_if(name, |_, memo| matches!(memo, Memo::Hit { provider, .. } if !provider.is_live()));
        }
        cached
    }

    pub(crate) fn hit(&self, name: &str, provider: Provider, value: T) {
        self.entries
            .insert(name.to_string(), Memo::Hit { provider, value });
    }

    pub(crate) fn miss(&self, name: &str, epoch: u64) {
        self.entries.insert(name.to_string(), Memo::Miss { epoch });
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Per-context memo of failed global scans: simple name to the epoch of the failure.
#[derive(Debug, Default)]
pub(crate) struct MissCache {
    entries: DashMap<String, u64>,
}

impl MissCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_fresh(&self, name: &str, epoch: u64) -> bool {
        self.entries.get(name).is_some_and(|at| *at == epoch)
    }

    pub(crate) fn record(&self, name: &str, epoch: u64) {
        self.entries.insert(name.to_string(), epoch);
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hits_and_epoch_misses() {
        let cache: LookupCache<u32> = LookupCache::new();
        assert!(matches!(cache.get("A", 1), Cached::Unknown));

        cache.miss("A", 1);
        assert!(matches!(cache.get("A", 1), Cached::Miss));
        // A newer epoch makes the miss stale
        assert!(matches!(cache.get("A", 2), Cached::Unknown));

        cache.hit("A", Provider::Own, 7);
        assert!(matches!(cache.get("A", 5), Cached::Hit(7)));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(matches!(cache.get("A", 5), Cached::Unknown));
    }

    #[test]
    fn test_dead_provider_drops_hit() {
        let cache: LookupCache<u32> = LookupCache::new();
        cache.hit("A", Provider::Context(Weak::new()), 1);
        assert!(matches!(cache.get("A", 0), Cached::Unknown));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_miss_cache() {
        let misses = MissCache::new();
        assert!(!misses.is_fresh("A", 3));
        misses.record("A", 3);
        assert!(misses.is_fresh("A", 3));
        assert!(!misses.is_fresh("A", 4));
        assert_eq!(misses.len(), 1);
        misses.clear();
        assert_eq!(misses.len(), 0);
    }
}
