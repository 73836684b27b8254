//! Fan-in of every connection's message and status streams.
//!
//! The set of sources is fixed when a dispatcher is built. Each dispatcher
//! waits on all of its sources and the shutdown token at once; which ready
//! source is served first is unspecified.

use std::collections::HashMap;
use std::sync::Arc;

use prometheus::Counter;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::amqp::{ConnectionHandle, RawMessage};
use crate::cache::CacheServer;
use crate::export::metrics::GatewayMetrics;
use crate::health::{HealthRecord, LinkStatus};
use crate::incoming::{self, DataSource};

/// A message together with the connection it arrived on.
#[derive(Debug)]
pub struct Delivery {
    pub connection: usize,
    pub data_source: DataSource,
    pub message: RawMessage,
}

struct Origin {
    endpoint: String,
    data_source: DataSource,
}

/// Merges the message buffers of all connections.
pub struct MessageDispatcher {
    sources: StreamMap<usize, ReceiverStream<RawMessage>>,
    origins: HashMap<usize, Origin>,
    cancel: CancellationToken,
}

impl MessageDispatcher {
    /// Takes the message buffer of every handle that still has one.
    pub fn new(handles: &mut [ConnectionHandle], cancel: CancellationToken) -> Self {
        let sources = handles.iter_mut().filter_map(|handle| {
            let rx = handle.take_messages()?;
            Some((
                handle.index(),
                handle.endpoint().to_string(),
                handle.data_source(),
                rx,
            ))
        });

        Self::from_sources(sources, cancel)
    }

    /// Builds a dispatcher from `(index, endpoint, data source, buffer)`
    /// tuples.
    pub fn from_sources(
        sources: impl IntoIterator<Item = (usize, String, DataSource, mpsc::Receiver<RawMessage>)>,
        cancel: CancellationToken,
    ) -> Self {
        let mut map = StreamMap::new();
        let mut origins = HashMap::new();

        for (index, endpoint, data_source, rx) in sources {
            map.insert(index, ReceiverStream::new(rx));
            origins.insert(
                index,
                Origin {
                    endpoint,
                    data_source,
                },
            );
        }

        Self {
            sources: map,
            origins,
            cancel,
        }
    }

    /// Number of sources that have not ended yet.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Next message from any connection.
    ///
    /// Returns `None` on shutdown or once every source has ended.
    pub async fn next(&mut self) -> Option<Delivery> {
        let (connection, message) = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            item = self.sources.next() => item?,
        };

        let data_source = self.origins.get(&connection)?.data_source;

        Some(Delivery {
            connection,
            data_source,
            message,
        })
    }

    /// Parse every delivered message and queue its samples in the cache.
    ///
    /// Unparseable messages are logged and counted, then dropped.
    pub async fn run(mut self, cache: Arc<CacheServer>, metrics: Arc<GatewayMetrics>) {
        let counters: HashMap<usize, (Counter, Counter)> = self
            .origins
            .iter()
            .map(|(index, origin)| {
                (
                    *index,
                    (
                        metrics
                            .messages_processed
                            .with_label_values(&[origin.endpoint.as_str()]),
                        metrics
                            .messages_dropped
                            .with_label_values(&[origin.endpoint.as_str()]),
                    ),
                )
            })
            .collect();

        while let Some(delivery) = self.next().await {
            let samples = match incoming::parse(delivery.data_source, &delivery.message.body) {
                Ok(samples) => samples,
                Err(e) => {
                    debug!(
                        connection = delivery.connection,
                        error = %e,
                        "dropping unparseable message",
                    );
                    if let Some((_, dropped)) = counters.get(&delivery.connection) {
                        dropped.inc();
                    }
                    continue;
                }
            };

            for sample in samples {
                metrics.observe_interval(sample.interval());
                if let Err(e) = cache.put(sample).await {
                    warn!(error = %e, "cache unavailable, stopping message dispatcher");
                    return;
                }
            }

            if let Some((processed, _)) = counters.get(&delivery.connection) {
                processed.inc();
            }
        }

        info!("message dispatcher stopped");
    }
}

/// Merges the status streams of all connections.
pub struct StatusDispatcher {
    sources: StreamMap<usize, UnboundedReceiverStream<LinkStatus>>,
    cancel: CancellationToken,
}

impl StatusDispatcher {
    /// Takes the status stream of every handle that still has one.
    pub fn new(handles: &mut [ConnectionHandle], cancel: CancellationToken) -> Self {
        let sources = handles
            .iter_mut()
            .filter_map(|handle| Some((handle.index(), handle.take_status()?)));

        Self::from_sources(sources, cancel)
    }

    pub fn from_sources(
        sources: impl IntoIterator<Item = (usize, mpsc::UnboundedReceiver<LinkStatus>)>,
        cancel: CancellationToken,
    ) -> Self {
        let mut map = StreamMap::new();
        for (index, rx) in sources {
            map.insert(index, UnboundedReceiverStream::new(rx));
        }

        Self {
            sources: map,
            cancel,
        }
    }

    /// Next status change from any connection, or `None` on shutdown.
    pub async fn next(&mut self) -> Option<(usize, LinkStatus)> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            item = self.sources.next() => item,
        }
    }

    /// Fold every status change into `health`; the latest report wins.
    pub async fn run(mut self, health: Arc<HealthRecord>) {
        while let Some((connection, status)) = self.next().await {
            debug!(connection, status = ?status, "bus status changed");
            health.set_bus_status(status);
        }

        info!("status dispatcher stopped");
    }
}
