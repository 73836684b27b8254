//! Flush-on-scrape collector.
//!
//! Registered alongside the static gateway metrics, [`ScrapeCollector`]
//! turns every gather into a cache flush: it reports process health, the
//! samples that arrived since the previous scrape, and a heartbeat plus
//! value count per host.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use prometheus::core::{Collector, Desc};
use prometheus::proto::{self, LabelPair, MetricFamily, MetricType};

use crate::cache::{Cache, HostActivity};
use crate::health::HealthRecord;
use crate::incoming::{ValueKind, WireSample};

pub const LAST_PULL_METRIC: &str = "telemetry_gateway_last_pull_timestamp_seconds";
pub const BUS_CONNECTED_METRIC: &str = "telemetry_gateway_bus_connected";
pub const DOC_STORE_CONNECTED_METRIC: &str = "telemetry_gateway_doc_store_connected";
pub const CACHE_HOSTS_METRIC: &str = "telemetry_gateway_cache_hosts";
pub const HOST_STATUS_METRIC: &str = "collectd_last_metric_for_host_status";
pub const HOST_COUNT_METRIC: &str = "collectd_metric_per_host";

const HOST_STATUS_HELP: &str = "Status of metrics for host currently active.";
const HOST_COUNT_HELP: &str = "No of metrics for host currently read.";

/// Prometheus collector that flushes the cache on every gather.
pub struct ScrapeCollector {
    cache: Arc<Cache>,
    health: Arc<HealthRecord>,
    use_timestamp: bool,
    descs: Vec<Desc>,
}

impl ScrapeCollector {
    /// Creates a collector. With `use_timestamp` set, flushed samples carry
    /// the producer's collection time.
    pub fn new(cache: Arc<Cache>, health: Arc<HealthRecord>, use_timestamp: bool) -> Result<Self> {
        let descs = vec![
            Desc::new(
                LAST_PULL_METRIC.to_string(),
                "Unix time of the most recent scrape.".to_string(),
                Vec::new(),
                HashMap::new(),
            )?,
            Desc::new(
                BUS_CONNECTED_METRIC.to_string(),
                "Last reported bus link status (1=up, 0=down).".to_string(),
                Vec::new(),
                HashMap::new(),
            )?,
            Desc::new(
                DOC_STORE_CONNECTED_METRIC.to_string(),
                "Outcome of the last document store write (1=ok, 0=failed).".to_string(),
                Vec::new(),
                HashMap::new(),
            )?,
            Desc::new(
                CACHE_HOSTS_METRIC.to_string(),
                "Number of hosts held in the cache after the last flush.".to_string(),
                Vec::new(),
                HashMap::new(),
            )?,
            Desc::new(
                HOST_STATUS_METRIC.to_string(),
                HOST_STATUS_HELP.to_string(),
                vec!["instance".to_string()],
                HashMap::new(),
            )?,
            Desc::new(
                HOST_COUNT_METRIC.to_string(),
                HOST_COUNT_HELP.to_string(),
                vec!["instance".to_string()],
                HashMap::new(),
            )?,
        ];

        Ok(Self {
            cache,
            health,
            use_timestamp,
            descs,
        })
    }
}

impl Collector for ScrapeCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let now_ms = chrono::Utc::now().timestamp_millis();

        let mut families = vec![
            single_gauge(
                LAST_PULL_METRIC,
                "Unix time of the most recent scrape.",
                now_ms as f64 / 1000.0,
                now_ms,
            ),
            single_gauge(
                BUS_CONNECTED_METRIC,
                "Last reported bus link status (1=up, 0=down).",
                self.health.bus_connectivity() as f64,
                now_ms,
            ),
        ];

        if let Some(state) = self.health.doc_store_state() {
            families.push(single_gauge(
                DOC_STORE_CONNECTED_METRIC,
                "Outcome of the last document store write (1=ok, 0=failed).",
                state as f64,
                now_ms,
            ));
        }

        let flush = self.cache.flush(self.use_timestamp);

        families.extend(group_samples(flush.samples));
        families.extend(host_families(&flush.hosts));
        families.push(single_gauge(
            CACHE_HOSTS_METRIC,
            "Number of hosts held in the cache after the last flush.",
            self.cache.size() as f64,
            now_ms,
        ));

        families
    }
}

/// Group wire samples into one family per metric name.
///
/// The first sample seen for a name fixes the family's help and type;
/// later samples of a different type are dropped.
fn group_samples(samples: Vec<WireSample>) -> Vec<MetricFamily> {
    let mut families: BTreeMap<String, MetricFamily> = BTreeMap::new();

    for sample in samples {
        let family = families.entry(sample.name.clone()).or_insert_with(|| {
            let mut family = MetricFamily::default();
            family.set_name(sample.name.clone());
            family.set_help(sample.help.clone());
            family.set_field_type(metric_type(sample.kind));
            family
        });

        if family.get_field_type() != metric_type(sample.kind) {
            tracing::debug!(name = %sample.name, "dropping sample with conflicting type");
            continue;
        }

        let labels: Vec<(&str, &str)> = sample
            .labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        family.mut_metric().push(metric(
            sample.kind,
            &labels,
            sample.value,
            sample.timestamp_ms,
        ));
    }

    families.into_values().collect()
}

/// Heartbeat and value count per host.
fn host_families(hosts: &[HostActivity]) -> Vec<MetricFamily> {
    if hosts.is_empty() {
        return Vec::new();
    }

    let mut status = family(HOST_STATUS_METRIC, HOST_STATUS_HELP, ValueKind::Gauge);
    let mut count = family(HOST_COUNT_METRIC, HOST_COUNT_HELP, ValueKind::Gauge);

    for host in hosts {
        let labels = [("instance", host.host.as_str())];
        let heartbeat = if host.new_values > 0 { 1.0 } else { 0.0 };

        status
            .mut_metric()
            .push(metric(ValueKind::Gauge, &labels, heartbeat, None));
        count.mut_metric().push(metric(
            ValueKind::Gauge,
            &labels,
            host.new_values as f64,
            None,
        ));
    }

    vec![status, count]
}

fn metric_type(kind: ValueKind) -> MetricType {
    match kind {
        ValueKind::Gauge => MetricType::GAUGE,
        ValueKind::Counter => MetricType::COUNTER,
    }
}

fn family(name: &str, help: &str, kind: ValueKind) -> MetricFamily {
    let mut family = MetricFamily::default();
    family.set_name(name.to_string());
    family.set_help(help.to_string());
    family.set_field_type(metric_type(kind));
    family
}

fn single_gauge(name: &str, help: &str, value: f64, timestamp_ms: i64) -> MetricFamily {
    let mut family = family(name, help, ValueKind::Gauge);
    family
        .mut_metric()
        .push(metric(ValueKind::Gauge, &[], value, Some(timestamp_ms)));
    family
}

fn metric(
    kind: ValueKind,
    labels: &[(&str, &str)],
    value: f64,
    timestamp_ms: Option<i64>,
) -> proto::Metric {
    let mut m = proto::Metric::default();

    for (name, label_value) in labels {
        let mut pair = LabelPair::default();
        pair.set_name(name.to_string());
        pair.set_value(label_value.to_string());
        m.mut_label().push(pair);
    }

    match kind {
        ValueKind::Gauge => {
            let mut gauge = proto::Gauge::default();
            gauge.set_value(value);
            m.set_gauge(gauge);
        }
        ValueKind::Counter => {
            let mut counter = proto::Counter::default();
            counter.set_value(value);
            m.set_counter(counter);
        }
    }

    if let Some(ts) = timestamp_ms {
        m.set_timestamp_ms(ts);
    }

    m
}
