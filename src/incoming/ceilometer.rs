use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{sanitize_label_name, sanitize_name, DataSource, ParseError, ValueKind, WireSample};

/// Ceilometer does not report a collection interval; samples are assumed
/// to arrive at this period.
pub const DEFAULT_INTERVAL_SECS: f64 = 5.0;

const NAIVE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// One metering sample from a Ceilometer notification payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CeilometerMetric {
    pub publisher: String,
    /// First segment of `counter_name`.
    pub plugin: String,
    /// The sample's `resource_id`.
    pub plugin_instance: String,
    pub type_name: String,
    pub type_instance: String,
    pub values: Vec<f64>,
    pub timestamp_ms: Option<i64>,
    pub payload: Map<String, Value>,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    request: Option<Request>,
    #[serde(rename = "oslo.message", default)]
    oslo_message: Option<String>,
}

#[derive(Deserialize)]
struct Request {
    #[serde(rename = "oslo.message")]
    oslo_message: String,
}

#[derive(Deserialize)]
struct Notification {
    #[serde(default)]
    publisher_id: String,
    #[serde(default)]
    payload: Payloads,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Payloads {
    Many(Vec<Map<String, Value>>),
    One(Map<String, Value>),
}

impl Default for Payloads {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

fn json_error(err: serde_json::Error) -> ParseError {
    ParseError::Json {
        data_source: DataSource::Ceilometer,
        err,
    }
}

/// Parse an oslo messaging envelope into its metering samples.
pub fn parse(text: &str) -> Result<Vec<CeilometerMetric>, ParseError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(json_error)?;

    let inner = envelope
        .request
        .map(|r| r.oslo_message)
        .or(envelope.oslo_message)
        .ok_or(ParseError::MissingEnvelope)?;

    let notification: Notification = serde_json::from_str(&inner).map_err(json_error)?;

    let payloads = match notification.payload {
        Payloads::Many(payloads) => payloads,
        Payloads::One(payload) => vec![payload],
    };

    Ok(payloads
        .into_iter()
        .map(|payload| CeilometerMetric::from_payload(notification.publisher_id.clone(), payload))
        .collect())
}

impl CeilometerMetric {
    /// Build a sample from a single payload entry.
    pub fn from_payload(publisher: String, payload: Map<String, Value>) -> Self {
        let counter_name = str_field(&payload, "counter_name").unwrap_or("unknown");
        let mut parts = counter_name.split('.');

        let plugin = parts.next().unwrap_or_default().to_string();
        let type_name = parts.next().map_or_else(|| plugin.clone(), str::to_string);
        let type_instance = parts.next().unwrap_or_default().to_string();

        let plugin_instance = str_field(&payload, "resource_id")
            .unwrap_or_default()
            .to_string();

        let values = match payload.get("counter_volume").and_then(Value::as_f64) {
            Some(volume) => vec![volume],
            None => {
                tracing::debug!(publisher = %publisher, "payload has no counter_volume");
                Vec::new()
            }
        };

        let timestamp_ms = str_field(&payload, "timestamp").and_then(parse_timestamp_ms);

        Self {
            publisher,
            plugin,
            plugin_instance,
            type_name,
            type_instance,
            values,
            timestamp_ms,
            payload,
        }
    }

    pub fn counter_name(&self) -> &str {
        str_field(&self.payload, "counter_name").unwrap_or("unknown")
    }

    pub fn item_key(&self) -> String {
        if self.plugin_instance.is_empty() {
            self.counter_name().to_string()
        } else {
            format!("{}_{}", self.counter_name(), self.plugin_instance)
        }
    }

    pub fn metric_name(&self) -> String {
        sanitize_name(&format!(
            "ceilometer_{}",
            self.counter_name().replace('.', "_")
        ))
    }

    pub fn value_kind(&self) -> ValueKind {
        match str_field(&self.payload, "counter_type") {
            Some("gauge") => ValueKind::Gauge,
            _ => ValueKind::Counter,
        }
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();

        let plugin_value = if self.type_instance.is_empty() {
            &self.plugin_instance
        } else {
            &self.type_instance
        };
        labels.insert(sanitize_label_name(&self.plugin), plugin_value.clone());
        labels.insert("publisher".to_string(), self.publisher.clone());
        labels.insert(
            "type".to_string(),
            str_field(&self.payload, "counter_type")
                .unwrap_or("base")
                .to_string(),
        );

        for (label, field) in [
            ("project", "project_id"),
            ("resource", "resource_id"),
            ("unit", "counter_unit"),
            ("counter", "counter_name"),
        ] {
            if let Some(value) = str_field(&self.payload, field) {
                labels.insert(label.to_string(), value.to_string());
            }
        }

        labels
    }

    pub fn help(&self) -> String {
        format!(
            "Service Telemetry exporter: '{}' Type: '{}' Dstype: '{}' Dsname: '{}'",
            self.plugin,
            self.type_name,
            str_field(&self.payload, "counter_type").unwrap_or("counter"),
            self.counter_name(),
        )
    }

    pub fn wire_sample(&self, index: usize, use_timestamp: bool) -> Option<WireSample> {
        let value = *self.values.get(index)?;

        Some(WireSample {
            name: self.metric_name(),
            help: self.help(),
            kind: self.value_kind(),
            labels: self.labels(),
            value,
            timestamp_ms: if use_timestamp {
                self.timestamp_ms
            } else {
                None
            },
        })
    }
}

fn str_field<'a>(payload: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

/// Parse the timestamp layouts Ceilometer is known to emit. Timestamps
/// without an offset are taken as UTC.
fn parse_timestamp_ms(raw: &str) -> Option<i64> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.timestamp_millis());
    }

    NAIVE_TIMESTAMP_FORMATS.iter().find_map(|format| {
        NaiveDateTime::parse_from_str(raw, format)
            .ok()
            .map(|ts| ts.and_utc().timestamp_millis())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{"request": {"oslo.version": "2.0", "oslo.message": "{\"message_id\": \"499e0dda-9298-4b03-a49c-d7affcedb6b9\", \"publisher_id\": \"telemetry.publisher.controller-0.redhat.local\", \"event_type\": \"metering\", \"priority\": \"SAMPLE\", \"payload\": [{\"source\": \"openstack\", \"counter_name\": \"disk.device.read.bytes\", \"counter_type\": \"cumulative\", \"counter_unit\": \"B\", \"counter_volume\": 18872832, \"user_id\": \"5df14d3577ff4c61b0837c268a8f4c70\", \"project_id\": \"5dfb98560ce74cf780c21fb18a5ad1de\", \"resource_id\": \"285778e1-c81b-427a-826a-ebb72467b665-vda\", \"timestamp\": \"2020-04-15T13:24:02.108816\", \"resource_metadata\": {\"display_name\": \"cirros\", \"name\": \"instance-00000001\", \"disk_name\": \"vda\"}, \"monotonic_time\": null}], \"timestamp\": \"2020-04-15 13:24:02.114844\"}"}}"#;

    const RESOURCE: &str = "285778e1-c81b-427a-826a-ebb72467b665-vda";

    #[test]
    fn test_parse_sample_message() {
        let metrics = parse(SAMPLE).unwrap();
        assert_eq!(metrics.len(), 1);

        let m = &metrics[0];
        assert_eq!(m.publisher, "telemetry.publisher.controller-0.redhat.local");
        assert_eq!(m.plugin, "disk");
        assert_eq!(m.plugin_instance, RESOURCE);
        assert_eq!(m.type_name, "device");
        assert_eq!(m.type_instance, "read");
        assert_eq!(m.values, vec![18872832.0]);
        assert_eq!(m.timestamp_ms, Some(1_586_957_042_108));
    }

    #[test]
    fn test_naming_and_labels() {
        let m = parse(SAMPLE).unwrap().remove(0);

        assert_eq!(m.item_key(), format!("disk.device.read.bytes_{RESOURCE}"));
        assert_eq!(m.metric_name(), "ceilometer_disk_device_read_bytes");
        assert_eq!(m.value_kind(), ValueKind::Counter);

        let labels = m.labels();
        assert_eq!(labels["disk"], "read");
        assert_eq!(
            labels["publisher"],
            "telemetry.publisher.controller-0.redhat.local"
        );
        assert_eq!(labels["type"], "cumulative");
        assert_eq!(labels["project"], "5dfb98560ce74cf780c21fb18a5ad1de");
        assert_eq!(labels["resource"], RESOURCE);
        assert_eq!(labels["unit"], "B");
        assert_eq!(labels["counter"], "disk.device.read.bytes");
        assert_eq!(labels.len(), 7);
    }

    #[test]
    fn test_single_segment_counter_name() {
        let mut payload = Map::new();
        payload.insert("counter_name".into(), Value::from("cpu"));
        payload.insert("counter_type".into(), Value::from("gauge"));
        payload.insert("counter_volume".into(), Value::from(0.5));
        payload.insert("resource_id".into(), Value::from("vm-1"));

        let m = CeilometerMetric::from_payload("pub".to_string(), payload);
        assert_eq!(m.plugin, "cpu");
        assert_eq!(m.type_name, "cpu");
        assert_eq!(m.type_instance, "");
        assert_eq!(m.value_kind(), ValueKind::Gauge);
        assert_eq!(m.labels()["cpu"], "vm-1");
    }

    #[test]
    fn test_top_level_envelope_and_single_payload() {
        let text = r#"{"oslo.message": "{\"publisher_id\": \"p1\", \"payload\": {\"counter_name\": \"memory.usage\", \"counter_volume\": 42}}"}"#;

        let metrics = parse(text).unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].publisher, "p1");
        assert_eq!(metrics[0].item_key(), "memory.usage");
        assert_eq!(metrics[0].labels()["type"], "base");
    }

    #[test]
    fn test_missing_envelope() {
        let err = parse(r#"{"request": {}}"#).unwrap_err();
        assert!(matches!(err, ParseError::Json { .. }));

        let err = parse(r#"{"other": 1}"#).unwrap_err();
        assert!(matches!(err, ParseError::MissingEnvelope));
    }

    #[test]
    fn test_missing_volume_yields_no_wire_samples() {
        let mut payload = Map::new();
        payload.insert("counter_name".into(), Value::from("image.size"));

        let m = CeilometerMetric::from_payload("pub".to_string(), payload);
        assert!(m.values.is_empty());
        assert!(m.wire_sample(0, false).is_none());
    }

    #[test]
    fn test_timestamp_layouts() {
        assert_eq!(
            parse_timestamp_ms("2020-04-15T13:24:02.108816"),
            Some(1_586_957_042_108)
        );
        assert_eq!(
            parse_timestamp_ms("2020-04-15 13:24:02.114844"),
            Some(1_586_957_042_114)
        );
        assert_eq!(
            parse_timestamp_ms("2020-04-15T13:24:02+00:00"),
            Some(1_586_957_042_000)
        );
        assert_eq!(parse_timestamp_ms("yesterday"), None);
    }
}
