use std::collections::HashMap;

use parking_lot::Mutex;

use crate::incoming::{Sample, WireSample};

#[derive(Debug)]
struct Entry {
    sample: Sample,
    /// Received since the last flush.
    is_new: bool,
}

#[derive(Debug)]
struct ShardState {
    items: HashMap<String, Entry>,
    /// Unix seconds of the most recent merge into this shard.
    last_access: i64,
    /// Set once the shard has been unlinked from the cache; writers that
    /// still hold a reference must resolve the host again.
    retired: bool,
}

/// Outcome of flushing one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardFlush {
    /// Wire samples emitted for items that were new.
    pub new_values: usize,
    /// Items left in the shard afterwards.
    pub remaining: usize,
}

/// Per-host partition of the cache holding the latest sample per item.
#[derive(Debug)]
pub struct Shard {
    host: String,
    max_ttl_secs: i64,
    state: Mutex<ShardState>,
}

impl Shard {
    pub fn new(host: impl Into<String>, max_ttl_secs: i64, now: i64) -> Self {
        Self {
            host: host.into(),
            max_ttl_secs,
            state: Mutex::new(ShardState {
                items: HashMap::new(),
                last_access: now,
                retired: false,
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn max_ttl_secs(&self) -> i64 {
        self.max_ttl_secs
    }

    /// Number of items currently held.
    pub fn size(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn last_access(&self) -> i64 {
        self.state.lock().last_access
    }

    /// True once a flush emptied the shard. A retired shard accepts no
    /// further data.
    pub fn is_retired(&self) -> bool {
        self.state.lock().retired
    }

    /// True when the shard has gone longer than its TTL without a merge.
    pub fn expired(&self, now: i64) -> bool {
        now - self.state.lock().last_access > self.max_ttl_secs
    }

    /// Returns a copy of the cached sample for `item_key` and its new flag.
    pub fn get(&self, item_key: &str) -> Option<(Sample, bool)> {
        self.state
            .lock()
            .items
            .get(item_key)
            .map(|entry| (entry.sample.clone(), entry.is_new))
    }

    /// Merge `sample` into the item map, replacing any existing entry for
    /// the same item key and marking it new.
    ///
    /// Hands the sample back if the shard was retired by a concurrent flush.
    pub(crate) fn set_data(&self, sample: Sample, now: i64) -> Result<(), Sample> {
        let mut state = self.state.lock();
        if state.retired {
            return Err(sample);
        }

        state.last_access = now;

        let key = sample.item_key();
        match state.items.get_mut(&key) {
            Some(entry) => {
                entry.sample = sample;
                entry.is_new = true;
            }
            None => {
                state.items.insert(
                    key,
                    Entry {
                        sample,
                        is_new: true,
                    },
                );
            }
        }

        Ok(())
    }

    /// Emit new items into `out` and reap stale ones.
    ///
    /// New items are emitted and demoted. Items that were already demoted
    /// are deleted when the shard is past its TTL, so an item needs two
    /// flushes after its last update to disappear. An emptied shard is
    /// marked retired; the caller must unlink it.
    pub(crate) fn flush(
        &self,
        now: i64,
        use_timestamp: bool,
        out: &mut Vec<WireSample>,
    ) -> ShardFlush {
        let mut state = self.state.lock();
        let expired = now - state.last_access > self.max_ttl_secs;
        let mut new_values = 0;

        state.items.retain(|_, entry| {
            if entry.is_new {
                new_values += entry.sample.wire_samples(use_timestamp, out);
                entry.is_new = false;
                true
            } else {
                !expired
            }
        });

        let remaining = state.items.len();
        if remaining == 0 {
            state.retired = true;
        }

        ShardFlush {
            new_values,
            remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incoming::CollectdMetric;

    fn sample(plugin: &str, value: f64) -> Sample {
        Sample::Collectd(CollectdMetric {
            values: vec![value],
            dstypes: vec!["gauge".to_string()],
            dsnames: vec!["value".to_string()],
            host: "hostname".to_string(),
            plugin: plugin.to_string(),
            type_name: "gauge".to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_set_data_merges_same_key() {
        let shard = Shard::new("hostname", 4, 100);
        shard.set_data(sample("cpu", 1.0), 100).unwrap();
        shard.set_data(sample("cpu", 2.0), 101).unwrap();
        shard.set_data(sample("mem", 3.0), 101).unwrap();

        assert_eq!(shard.size(), 2);
        assert_eq!(shard.last_access(), 101);

        let (cached, is_new) = shard.get("cpu_gauge").unwrap();
        assert!(is_new);
        assert_eq!(cached.values(), &[2.0]);
    }

    #[test]
    fn test_flush_is_two_phase() {
        let shard = Shard::new("hostname", 4, 100);
        shard.set_data(sample("cpu", 1.0), 100).unwrap();

        let mut out = Vec::new();
        let first = shard.flush(110, false, &mut out);
        assert_eq!(first.new_values, 1);
        assert_eq!(first.remaining, 1);
        assert_eq!(out.len(), 1);
        assert!(!shard.get("cpu_gauge").unwrap().1);

        out.clear();
        let second = shard.flush(110, false, &mut out);
        assert_eq!(second.new_values, 0);
        assert_eq!(second.remaining, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_stale_items_kept_within_ttl() {
        let shard = Shard::new("hostname", 4, 100);
        shard.set_data(sample("cpu", 1.0), 100).unwrap();

        let mut out = Vec::new();
        shard.flush(101, false, &mut out);
        let flushed = shard.flush(104, false, &mut out);
        assert_eq!(flushed.remaining, 1);
        assert!(!shard.expired(104));
        assert!(shard.expired(105));
    }

    #[test]
    fn test_update_to_other_item_keeps_shard_alive() {
        let shard = Shard::new("hostname", 4, 100);
        shard.set_data(sample("cpu", 1.0), 100).unwrap();

        let mut out = Vec::new();
        shard.flush(101, false, &mut out);

        // Expiry is judged per shard, so a fresh merge shields stale items.
        shard.set_data(sample("mem", 1.0), 108).unwrap();
        let flushed = shard.flush(109, false, &mut out);
        assert_eq!(flushed.remaining, 2);
    }

    #[test]
    fn test_retired_shard_rejects_writes() {
        let shard = Shard::new("hostname", 0, 100);
        let mut out = Vec::new();
        let flushed = shard.flush(100, false, &mut out);
        assert_eq!(flushed.remaining, 0);

        let rejected = shard.set_data(sample("cpu", 1.0), 101);
        assert!(rejected.is_err());
        assert_eq!(shard.size(), 0);
    }
}
