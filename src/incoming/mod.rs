//! Decoding of bus message bodies into cacheable samples.
//!
//! Each connection declares a [`DataSource`] that selects the parser for
//! its bodies. Parsers produce [`Sample`] values, which are the cache's
//! only view of message semantics: host key, item key, interval and the
//! conversion into exposition-ready [`WireSample`]s.

pub mod ceilometer;
pub mod collectd;

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use thiserror::Error;

pub use ceilometer::CeilometerMetric;
pub use collectd::CollectdMetric;

/// Message format produced by the agents publishing on an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Collectd,
    Ceilometer,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collectd => "collectd",
            Self::Ceilometer => "ceilometer",
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while decoding a message body.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("message body is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("malformed {data_source} payload: {err}")]
    Json {
        data_source: DataSource,
        #[source]
        err: serde_json::Error,
    },

    #[error("ceilometer message has no oslo.message envelope")]
    MissingEnvelope,
}

/// Decode one message body into the samples it carries.
pub fn parse(data_source: DataSource, body: &[u8]) -> Result<Vec<Sample>, ParseError> {
    let text = std::str::from_utf8(body)?;

    let samples = match data_source {
        DataSource::Collectd => collectd::parse(text)?
            .into_iter()
            .map(Sample::Collectd)
            .collect(),
        DataSource::Ceilometer => ceilometer::parse(text)?
            .into_iter()
            .map(Sample::Ceilometer)
            .collect(),
    };

    Ok(samples)
}

/// One parsed unit of telemetry, tagged by its source format.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    Collectd(CollectdMetric),
    Ceilometer(CeilometerMetric),
}

impl Sample {
    pub fn data_source(&self) -> DataSource {
        match self {
            Self::Collectd(_) => DataSource::Collectd,
            Self::Ceilometer(_) => DataSource::Ceilometer,
        }
    }

    /// Identifies the producing host; selects the cache shard.
    pub fn host_key(&self) -> &str {
        match self {
            Self::Collectd(m) => &m.host,
            Self::Ceilometer(m) => &m.publisher,
        }
    }

    /// Identifies one metric series within its host.
    pub fn item_key(&self) -> String {
        match self {
            Self::Collectd(m) => m.item_key(),
            Self::Ceilometer(m) => m.item_key(),
        }
    }

    /// Collection interval reported by the producer, in seconds.
    pub fn interval(&self) -> f64 {
        match self {
            Self::Collectd(m) => m.interval,
            Self::Ceilometer(_) => ceilometer::DEFAULT_INTERVAL_SECS,
        }
    }

    pub fn values(&self) -> &[f64] {
        match self {
            Self::Collectd(m) => &m.values,
            Self::Ceilometer(m) => &m.values,
        }
    }

    /// Append one wire sample per value index to `out`.
    ///
    /// Values whose type cannot be expressed in the exposition format are
    /// skipped. Returns the number of samples appended.
    pub fn wire_samples(&self, use_timestamp: bool, out: &mut Vec<WireSample>) -> usize {
        let before = out.len();

        for index in 0..self.values().len() {
            let sample = match self {
                Self::Collectd(m) => m.wire_sample(index, use_timestamp),
                Self::Ceilometer(m) => m.wire_sample(index, use_timestamp),
            };

            match sample {
                Some(sample) => out.push(sample),
                None => {
                    tracing::warn!(
                        host = self.host_key(),
                        item = %self.item_key(),
                        index,
                        "skipping value with unsupported type",
                    );
                }
            }
        }

        out.len() - before
    }
}

/// Exposition value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Gauge,
    Counter,
}

/// A single exposition-ready sample.
#[derive(Debug, Clone, PartialEq)]
pub struct WireSample {
    pub name: String,
    pub help: String,
    pub kind: ValueKind,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    /// Producer collection time in milliseconds since the epoch.
    pub timestamp_ms: Option<i64>,
}

/// Replace every character outside `[A-Za-z0-9_:]` with `_`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Label names additionally may not be empty or contain `:`.
pub(crate) fn sanitize_label_name(name: &str) -> String {
    if name.is_empty() {
        return "plugin".to_string();
    }

    sanitize_name(name).replace(':', "_")
}
