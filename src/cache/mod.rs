//! Sharded, TTL-evicting sample cache.
//!
//! Samples enter through [`CacheServer::put`], which hands them to a single
//! ingestion worker over a bounded queue. The worker is the only writer of
//! shard item maps. Scrapes call [`Cache::flush`], which emits new items,
//! reaps stale ones and unlinks emptied shards.

pub mod pool;
pub mod shard;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::incoming::{Sample, WireSample};

pub use pool::{BufferPool, InsertionBuffer};
pub use shard::{Shard, ShardFlush};

/// Capacity of the ingestion queue and of the insertion buffer free-list.
pub const INGEST_QUEUE_CAPACITY: usize = 1000;

/// Default time a shard may go without updates before stale items are reaped.
pub const DEFAULT_MAX_TTL: Duration = Duration::from_secs(300);

/// Current wall-clock time in whole Unix seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Per-host activity observed by one flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostActivity {
    pub host: String,
    /// Wire samples emitted for this host.
    pub new_values: usize,
}

/// Result of a cache flush.
#[derive(Debug, Default)]
pub struct Flush {
    pub samples: Vec<WireSample>,
    /// Every host visited, including hosts removed by this flush.
    pub hosts: Vec<HostActivity>,
}

/// Two-level map of host to [`Shard`].
#[derive(Debug)]
pub struct Cache {
    shards: RwLock<HashMap<String, Arc<Shard>>>,
    max_ttl_secs: i64,
}

impl Cache {
    pub fn new(max_ttl: Duration) -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            max_ttl_secs: i64::try_from(max_ttl.as_secs()).unwrap_or(i64::MAX),
        }
    }

    /// Number of hosts with a live shard.
    pub fn size(&self) -> usize {
        self.shards.read().len()
    }

    pub fn shard(&self, host: &str) -> Option<Arc<Shard>> {
        self.shards.read().get(host).cloned()
    }

    fn get_or_create_shard(&self, host: &str, now: i64) -> Arc<Shard> {
        if let Some(shard) = self.shard(host) {
            if !shard.is_retired() {
                return shard;
            }
        }

        let mut shards = self.shards.write();
        match shards.entry(host.to_string()) {
            // Retired but not yet unlinked by its flush.
            Entry::Occupied(mut entry) => {
                if entry.get().is_retired() {
                    debug!(host, "replacing retired shard");
                    entry.insert(Arc::new(Shard::new(host, self.max_ttl_secs, now)));
                }
                Arc::clone(entry.get())
            }
            Entry::Vacant(entry) => {
                debug!(host, "creating shard");
                Arc::clone(entry.insert(Arc::new(Shard::new(host, self.max_ttl_secs, now))))
            }
        }
    }

    /// Remove `host` only while it still maps to `shard`.
    fn unlink(&self, host: &str, shard: &Arc<Shard>) -> bool {
        let mut shards = self.shards.write();
        if shards.get(host).is_some_and(|s| Arc::ptr_eq(s, shard)) {
            shards.remove(host);
            return true;
        }
        false
    }

    /// Merge a sample into its host's shard, creating the shard if needed.
    pub fn insert(&self, sample: Sample, now: i64) {
        let mut sample = sample;

        loop {
            let shard = self.get_or_create_shard(sample.host_key(), now);
            match shard.set_data(sample, now) {
                Ok(()) => return,
                // Retired by a flush between lookup and lock; resolve again.
                Err(rejected) => sample = rejected,
            }
        }
    }

    /// Flush every shard at the current wall-clock time.
    pub fn flush(&self, use_timestamp: bool) -> Flush {
        self.flush_at(unix_now(), use_timestamp)
    }

    /// Flush every shard as of `now` (Unix seconds).
    ///
    /// Shards are flushed under the shared map lock, one shard lock at a
    /// time, so ingestion into existing shards continues during the pass.
    /// The exclusive lock is taken afterwards only to unlink shards the
    /// pass emptied.
    pub fn flush_at(&self, now: i64, use_timestamp: bool) -> Flush {
        let mut emptied = Vec::new();

        let flush = {
            let shards = self.shards.read();
            let mut flush = Flush {
                samples: Vec::new(),
                hosts: Vec::with_capacity(shards.len()),
            };

            for (host, shard) in shards.iter() {
                let result = shard.flush(now, use_timestamp, &mut flush.samples);
                flush.hosts.push(HostActivity {
                    host: host.clone(),
                    new_values: result.new_values,
                });

                if result.remaining == 0 {
                    emptied.push((host.clone(), Arc::clone(shard)));
                }
            }

            flush
        };

        for (host, shard) in emptied {
            if self.unlink(&host, &shard) {
                debug!(host = %host, "removing empty shard");
            }
        }

        flush
    }
}

/// Front end of the cache: owns the ingestion queue, its worker task and
/// the insertion buffer free-list.
pub struct CacheServer {
    cache: Arc<Cache>,
    pool: Arc<BufferPool>,
    tx: mpsc::Sender<Box<InsertionBuffer>>,
    /// Queue receiver, taken by `start`.
    rx: Mutex<Option<mpsc::Receiver<Box<InsertionBuffer>>>>,
    /// Handle for the ingestion worker.
    run_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CacheServer {
    /// Creates a cache server whose shards reap items idle for `max_ttl`.
    pub fn new(max_ttl: Duration) -> Self {
        let (tx, rx) = mpsc::channel(INGEST_QUEUE_CAPACITY);

        Self {
            cache: Arc::new(Cache::new(max_ttl)),
            pool: Arc::new(BufferPool::new(INGEST_QUEUE_CAPACITY)),
            tx,
            rx: Mutex::new(Some(rx)),
            run_task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Spawns the ingestion worker.
    ///
    /// On cancellation the worker drains whatever is already queued
    /// before exiting.
    pub async fn start(&self, ctx: CancellationToken) -> Result<()> {
        let Some(mut rx) = self.rx.lock().take() else {
            bail!("cache server already started");
        };

        let cache = Arc::clone(&self.cache);
        let pool = Arc::clone(&self.pool);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    buf = rx.recv() => match buf {
                        Some(buf) => ingest(&cache, &pool, buf),
                        None => return,
                    },
                }
            }

            rx.close();
            let mut drained = 0usize;
            while let Ok(buf) = rx.try_recv() {
                ingest(&cache, &pool, buf);
                drained += 1;
            }
            info!(drained, "cache ingestion worker stopped");
        });

        *self.run_task.lock().await = Some(task);

        Ok(())
    }

    /// Enqueue a sample for the ingestion worker.
    ///
    /// Waits while the queue is full. Fails only once the worker is gone.
    pub async fn put(&self, sample: Sample) -> Result<()> {
        let mut buf = self.pool.acquire();
        buf.sample = Some(sample);

        if self.tx.send(buf).await.is_err() {
            bail!("cache ingestion worker has stopped");
        }

        Ok(())
    }

    /// Flush the cache; see [`Cache::flush`].
    pub fn flush(&self, use_timestamp: bool) -> Flush {
        self.cache.flush(use_timestamp)
    }

    /// Number of hosts in the cache.
    pub fn size(&self) -> usize {
        self.cache.size()
    }

    /// Waits for the ingestion worker to finish.
    pub async fn wait_for_shutdown(&self) {
        let run_task = { self.run_task.lock().await.take() };
        if let Some(run_task) = run_task {
            if let Err(e) = run_task.await {
                warn!(error = %e, "cache ingestion task join failed");
            }
        }
    }
}

fn ingest(cache: &Cache, pool: &BufferPool, mut buf: Box<InsertionBuffer>) {
    if let Some(sample) = buf.sample.take() {
        cache.insert(sample, unix_now());
    }
    pool.release(buf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incoming::CollectdMetric;

    fn sample(host: &str, plugin: &str, value: f64) -> Sample {
        Sample::Collectd(CollectdMetric {
            values: vec![value],
            dstypes: vec!["gauge".to_string()],
            dsnames: vec!["value".to_string()],
            host: host.to_string(),
            plugin: plugin.to_string(),
            type_name: "gauge".to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_insert_creates_shard_per_host() {
        let cache = Cache::new(Duration::from_secs(4));
        cache.insert(sample("h1", "cpu", 1.0), 100);
        cache.insert(sample("h1", "mem", 1.0), 100);
        cache.insert(sample("h2", "cpu", 1.0), 100);

        assert_eq!(cache.size(), 2);
        assert_eq!(cache.shard("h1").unwrap().size(), 2);
        assert_eq!(cache.shard("h2").unwrap().size(), 1);
    }

    #[test]
    fn test_reinsert_is_idempotent() {
        let cache = Cache::new(Duration::from_secs(4));
        for _ in 0..3 {
            cache.insert(sample("h1", "cpu", 7.0), 100);
        }
        assert_eq!(cache.shard("h1").unwrap().size(), 1);
    }

    #[test]
    fn test_flush_reports_host_activity() {
        let cache = Cache::new(Duration::from_secs(4));
        cache.insert(sample("h1", "cpu", 1.0), 100);
        cache.insert(sample("h1", "mem", 2.0), 100);
        cache.insert(sample("h2", "cpu", 3.0), 100);

        let flush = cache.flush_at(101, false);
        assert_eq!(flush.samples.len(), 3);

        let mut hosts = flush.hosts.clone();
        hosts.sort_by(|a, b| a.host.cmp(&b.host));
        assert_eq!(
            hosts,
            vec![
                HostActivity {
                    host: "h1".to_string(),
                    new_values: 2
                },
                HostActivity {
                    host: "h2".to_string(),
                    new_values: 1
                },
            ]
        );

        let flush = cache.flush_at(102, false);
        assert!(flush.samples.is_empty());
        assert!(flush.hosts.iter().all(|h| h.new_values == 0));
        assert_eq!(cache.size(), 2);
    }

    #[test]
    fn test_shard_lifecycle() {
        let cache = Cache::new(Duration::from_secs(4));
        cache.insert(sample("h1", "cpu", 1.0), 100);
        let old = cache.shard("h1").unwrap();

        cache.flush_at(101, false);
        let flush = cache.flush_at(110, false);
        assert_eq!(cache.size(), 0);
        assert_eq!(flush.hosts.len(), 1);

        // A writer still holding the unlinked shard ends up in a fresh one.
        cache.insert(sample("h1", "cpu", 2.0), 111);
        let fresh = cache.shard("h1").unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(fresh.size(), 1);
        assert_eq!(old.size(), 0);
    }

    #[test]
    fn test_insert_replaces_retired_shard() {
        let cache = Cache::new(Duration::from_secs(4));
        cache.insert(sample("h1", "cpu", 1.0), 100);
        let old = cache.shard("h1").unwrap();

        // Empty the shard behind the cache's back so it is retired but
        // still linked.
        let mut out = Vec::new();
        old.flush(101, false, &mut out);
        old.flush(110, false, &mut out);
        assert!(old.is_retired());
        assert_eq!(cache.size(), 1);

        cache.insert(sample("h1", "cpu", 2.0), 111);
        let fresh = cache.shard("h1").unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(!fresh.is_retired());
        assert_eq!(fresh.size(), 1);
        assert_eq!(cache.size(), 1);

        // A later flush does not unlink the replacement.
        cache.flush_at(112, false);
        assert!(Arc::ptr_eq(&cache.shard("h1").unwrap(), &fresh));
    }

    #[test]
    fn test_flush_shares_map_lock_with_readers() {
        let cache = Arc::new(Cache::new(Duration::from_secs(4)));
        cache.insert(sample("h1", "cpu", 1.0), 100);
        cache.insert(sample("h2", "cpu", 1.0), 100);

        let reader = cache.shards.read();

        let (tx, rx) = std::sync::mpsc::channel();
        let flusher = Arc::clone(&cache);
        std::thread::spawn(move || {
            let flush = flusher.flush_at(101, false);
            let _ = tx.send(flush.samples.len());
        });

        let flushed = rx.recv_timeout(Duration::from_secs(5));
        drop(reader);
        assert_eq!(flushed, Ok(2));
        assert_eq!(cache.size(), 2);
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        let cache = Cache::new(Duration::from_secs(u64::MAX));
        cache.insert(sample("h1", "cpu", 1.0), 100);

        cache.flush_at(100, false);
        cache.flush_at(100, false);
        assert_eq!(cache.size(), 1);

        cache.flush_at(i64::MAX / 2, false);
        assert_eq!(cache.shard("h1").unwrap().size(), 1);
    }

    #[tokio::test]
    async fn test_put_waits_while_queue_is_full() {
        let server = Arc::new(CacheServer::new(DEFAULT_MAX_TTL));
        for i in 0..INGEST_QUEUE_CAPACITY {
            server
                .put(sample("h1", &format!("plugin{i}"), i as f64))
                .await
                .unwrap();
        }

        let blocked = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.put(sample("h1", "overflow", 1.0)).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());
        assert_eq!(server.size(), 0);

        let cancel = CancellationToken::new();
        server.start(cancel.clone()).await.unwrap();
        blocked.await.unwrap().unwrap();

        cancel.cancel();
        server.wait_for_shutdown().await;

        let shard = server.cache().shard("h1").unwrap();
        assert_eq!(shard.size(), INGEST_QUEUE_CAPACITY + 1);
        assert!(shard.get("overflow_gauge").is_some());
    }

    #[tokio::test]
    async fn test_server_put_reaches_cache() {
        let server = CacheServer::new(DEFAULT_MAX_TTL);
        let cancel = CancellationToken::new();
        server.start(cancel.clone()).await.unwrap();
        assert!(server.start(cancel.clone()).await.is_err());

        for i in 0..10 {
            server
                .put(sample("hostname", &format!("plugin{i}"), i as f64))
                .await
                .unwrap();
        }

        cancel.cancel();
        server.wait_for_shutdown().await;

        assert_eq!(server.size(), 1);
        assert_eq!(server.cache().shard("hostname").unwrap().size(), 10);
        assert!(server.pool().available() > 0);
    }

    #[tokio::test]
    async fn test_put_fails_after_worker_stops() {
        let server = CacheServer::new(DEFAULT_MAX_TTL);
        let cancel = CancellationToken::new();
        server.start(cancel.clone()).await.unwrap();
        cancel.cancel();
        server.wait_for_shutdown().await;

        assert!(server.put(sample("h1", "cpu", 1.0)).await.is_err());
    }
}
