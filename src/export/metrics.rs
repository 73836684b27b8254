use anyhow::Result;
use prometheus::{CounterVec, Gauge, Opts, Registry};

use crate::amqp::ConnectionMetrics;

/// Gateway self-metrics, all under the "telemetry_gateway" namespace.
pub struct GatewayMetrics {
    /// Messages received per endpoint.
    pub messages_received: CounterVec,
    /// Messages parsed and handed to the cache per endpoint.
    pub messages_processed: CounterVec,
    /// Messages dropped because their body could not be parsed.
    pub messages_dropped: CounterVec,
    /// Reconnect attempts per endpoint.
    pub reconnects: CounterVec,
    /// Smallest collection interval reported by any producer.
    pub min_collect_interval: Gauge,
}

impl GatewayMetrics {
    /// Creates the metrics and registers them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self> {
        let messages_received = CounterVec::new(
            Opts::new(
                "messages_received_total",
                "Total messages received from the bus by endpoint.",
            )
            .namespace("telemetry_gateway"),
            &["endpoint"],
        )?;
        let messages_processed = CounterVec::new(
            Opts::new(
                "messages_processed_total",
                "Total messages parsed and queued for the cache by endpoint.",
            )
            .namespace("telemetry_gateway"),
            &["endpoint"],
        )?;
        let messages_dropped = CounterVec::new(
            Opts::new(
                "messages_dropped_total",
                "Total messages dropped as unparseable by endpoint.",
            )
            .namespace("telemetry_gateway"),
            &["endpoint"],
        )?;
        let reconnects = CounterVec::new(
            Opts::new(
                "reconnects_total",
                "Total reconnect attempts by endpoint.",
            )
            .namespace("telemetry_gateway"),
            &["endpoint"],
        )?;
        let min_collect_interval = Gauge::with_opts(
            Opts::new(
                "min_collect_interval_seconds",
                "Smallest collection interval reported by any producer.",
            )
            .namespace("telemetry_gateway"),
        )?;

        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(messages_processed.clone()))?;
        registry.register(Box::new(messages_dropped.clone()))?;
        registry.register(Box::new(reconnects.clone()))?;
        registry.register(Box::new(min_collect_interval.clone()))?;

        Ok(Self {
            messages_received,
            messages_processed,
            messages_dropped,
            reconnects,
            min_collect_interval,
        })
    }

    /// Counters handed to the receive task of `endpoint`.
    pub fn connection(&self, endpoint: &str) -> ConnectionMetrics {
        ConnectionMetrics {
            received: self.messages_received.with_label_values(&[endpoint]),
            reconnects: self.reconnects.with_label_values(&[endpoint]),
        }
    }

    /// Lower the minimum collection interval if `interval` is smaller.
    pub fn observe_interval(&self, interval: f64) {
        if interval <= 0.0 {
            return;
        }

        let current = self.min_collect_interval.get();
        if current == 0.0 || interval < current {
            self.min_collect_interval.set(interval);
        }
    }
}
