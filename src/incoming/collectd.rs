use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer};

use super::{sanitize_label_name, sanitize_name, DataSource, ParseError, ValueKind, WireSample};

/// One value list as emitted by collectd's JSON writer.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CollectdMetric {
    /// Non-finite values arrive as `null` and decode to NaN.
    #[serde(default, deserialize_with = "values_or_nan")]
    pub values: Vec<f64>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub dstypes: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub dsnames: Vec<String>,
    /// Collection time in fractional seconds since the epoch.
    #[serde(default)]
    pub time: f64,
    #[serde(default)]
    pub interval: f64,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub plugin: String,
    #[serde(default)]
    pub plugin_instance: String,
    #[serde(rename = "type", default)]
    pub type_name: String,
    #[serde(default)]
    pub type_instance: String,
}

fn values_or_nan<'de, D>(deserializer: D) -> Result<Vec<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let values: Option<Vec<Option<f64>>> = Option::deserialize(deserializer)?;
    Ok(values
        .unwrap_or_default()
        .into_iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect())
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<Vec<T>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Parse a collectd JSON document (an array of value lists).
pub fn parse(text: &str) -> Result<Vec<CollectdMetric>, ParseError> {
    serde_json::from_str(text).map_err(|err| ParseError::Json {
        data_source: DataSource::Collectd,
        err,
    })
}

impl CollectdMetric {
    pub fn item_key(&self) -> String {
        let mut key = if self.plugin == self.type_name {
            self.type_name.clone()
        } else {
            format!("{}_{}", self.plugin, self.type_name)
        };

        if !self.plugin_instance.is_empty() {
            key.push('_');
            key.push_str(&self.plugin_instance);
        }
        if !self.type_instance.is_empty() {
            key.push('_');
            key.push_str(&self.type_instance);
        }

        key
    }

    /// Name of the data source at `index`.
    ///
    /// Falls back to the index itself for multi-value lists without names,
    /// and to `value` for single-value lists.
    pub fn ds_name(&self, index: usize) -> Cow<'_, str> {
        if let Some(name) = self.dsnames.get(index) {
            return Cow::Borrowed(name);
        }

        if self.values.len() != 1 {
            Cow::Owned(index.to_string())
        } else {
            Cow::Borrowed("value")
        }
    }

    pub fn metric_name(&self, index: usize) -> String {
        let mut name = if self.plugin == self.type_name {
            format!("collectd_{}", self.type_name)
        } else {
            format!("collectd_{}_{}", self.plugin, self.type_name)
        };

        let ds_name = self.ds_name(index);
        if ds_name != "value" {
            name.push('_');
            name.push_str(&ds_name);
        }

        if matches!(self.dstype(index), "counter" | "derive") {
            name.push_str("_total");
        }

        sanitize_name(&name)
    }

    pub fn value_kind(&self, index: usize) -> Option<ValueKind> {
        match self.dstype(index) {
            "gauge" => Some(ValueKind::Gauge),
            "counter" | "derive" => Some(ValueKind::Counter),
            _ => None,
        }
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        let plugin_label = sanitize_label_name(&self.plugin);
        let mut labels = BTreeMap::new();

        if !self.plugin_instance.is_empty() {
            labels.insert(plugin_label.clone(), self.plugin_instance.clone());
        }
        if !self.type_instance.is_empty() {
            if self.plugin_instance.is_empty() {
                labels.insert(plugin_label.clone(), self.type_instance.clone());
            } else {
                labels.insert("type".to_string(), self.type_instance.clone());
            }
        }

        labels
            .entry(plugin_label)
            .or_insert_with(|| "base".to_string());
        labels
            .entry("type".to_string())
            .or_insert_with(|| "base".to_string());
        labels.insert("instance".to_string(), self.host.clone());

        labels
    }

    pub fn help(&self, index: usize) -> String {
        format!(
            "Service Telemetry exporter: '{}' Type: '{}' Dstype: '{}' Dsname: '{}'",
            self.plugin,
            self.type_name,
            self.dstype(index),
            self.ds_name(index),
        )
    }

    /// Convert the value at `index`, or `None` if its type is unsupported.
    pub fn wire_sample(&self, index: usize, use_timestamp: bool) -> Option<WireSample> {
        let kind = self.value_kind(index)?;
        let value = *self.values.get(index)?;

        Some(WireSample {
            name: self.metric_name(index),
            help: self.help(index),
            kind,
            labels: self.labels(),
            value,
            timestamp_ms: use_timestamp.then(|| (self.time * 1000.0) as i64),
        })
    }

    fn dstype(&self, index: usize) -> &str {
        self.dstypes.get(index).map(String::as_str).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[{"values":[2121],"dstypes":["derive"],"dsnames":["samples"],
        "time":1543590542.347,"interval":5.0,"host":"localhost","plugin":"interface",
        "plugin_instance":"eth0","type":"if_packets","type_instance":"rx"}]"#;

    fn metric(plugin: &str, type_name: &str) -> CollectdMetric {
        CollectdMetric {
            values: vec![1.0, 2.0],
            dstypes: vec!["gauge".to_string(), "derive".to_string()],
            dsnames: vec!["ds1".to_string(), "ds2".to_string()],
            time: 1.5,
            interval: 10.0,
            host: "hostname".to_string(),
            plugin: plugin.to_string(),
            plugin_instance: "pluginnameinstance".to_string(),
            type_name: type_name.to_string(),
            type_instance: "collectdinstance".to_string(),
        }
    }

    #[test]
    fn test_parse_sample_document() {
        let metrics = parse(SAMPLE).unwrap();
        assert_eq!(metrics.len(), 1);

        let m = &metrics[0];
        assert_eq!(m.host, "localhost");
        assert_eq!(m.plugin, "interface");
        assert_eq!(m.plugin_instance, "eth0");
        assert_eq!(m.type_name, "if_packets");
        assert_eq!(m.type_instance, "rx");
        assert_eq!(m.values, vec![2121.0]);
        assert_eq!(m.interval, 5.0);
    }

    #[test]
    fn test_parse_tolerates_nulls() {
        let text = r#"[
            {"values":[null,3],"dstypes":["gauge","gauge"],"dsnames":null,"time":1.0,
             "interval":10,"host":"h1","plugin":"cpu","plugin_instance":"",
             "type":"percent","type_instance":""},
            {"values":[5],"dstypes":null,"dsnames":["value"],"time":1.0,
             "interval":10,"host":"h2","plugin":"load","plugin_instance":"",
             "type":"load","type_instance":""},
            {"values":null,"host":"h3","plugin":"memory","type":"memory"}
        ]"#;

        let metrics = parse(text).unwrap();
        assert_eq!(metrics.len(), 3);

        assert!(metrics[0].values[0].is_nan());
        assert_eq!(metrics[0].values[1], 3.0);
        assert!(metrics[0].dsnames.is_empty());
        assert_eq!(metrics[0].ds_name(1), "1");
        assert!(metrics[0].wire_sample(0, false).unwrap().value.is_nan());

        assert_eq!(metrics[1].values, vec![5.0]);
        assert!(metrics[1].dstypes.is_empty());
        assert!(metrics[1].wire_sample(0, false).is_none());

        assert!(metrics[2].values.is_empty());
    }

    #[test]
    fn test_parse_rejects_non_array() {
        assert!(parse(r#"{"values":[1]}"#).is_err());
        assert!(parse("not json").is_err());
    }

    #[test]
    fn test_item_key() {
        assert_eq!(
            metric("cpu", "percent").item_key(),
            "cpu_percent_pluginnameinstance_collectdinstance"
        );

        let mut m = metric("load", "load");
        m.plugin_instance.clear();
        m.type_instance.clear();
        assert_eq!(m.item_key(), "load");
    }

    #[test]
    fn test_ds_name_fallbacks() {
        let mut m = metric("cpu", "percent");
        assert_eq!(m.ds_name(1), "ds2");

        m.dsnames.clear();
        assert_eq!(m.ds_name(1), "1");

        m.values = vec![1.0];
        assert_eq!(m.ds_name(0), "value");
    }

    #[test]
    fn test_metric_name() {
        let m = metric("cpu", "percent");
        assert_eq!(m.metric_name(0), "collectd_cpu_percent_ds1");
        assert_eq!(m.metric_name(1), "collectd_cpu_percent_ds2_total");

        let mut m = metric("load", "load");
        m.values = vec![0.5];
        m.dsnames = vec!["value".to_string()];
        m.dstypes = vec!["gauge".to_string()];
        assert_eq!(m.metric_name(0), "collectd_load");

        let mut m = metric("if-octets", "if.rx");
        m.dstypes = vec!["counter".to_string(), "counter".to_string()];
        assert_eq!(m.metric_name(0), "collectd_if_octets_if_rx_ds1_total");
    }

    #[test]
    fn test_labels() {
        let labels = metric("cpu", "percent").labels();
        assert_eq!(labels["cpu"], "pluginnameinstance");
        assert_eq!(labels["type"], "collectdinstance");
        assert_eq!(labels["instance"], "hostname");

        let mut m = metric("cpu", "percent");
        m.plugin_instance.clear();
        let labels = m.labels();
        assert_eq!(labels["cpu"], "collectdinstance");
        assert_eq!(labels["type"], "base");

        m.type_instance.clear();
        let labels = m.labels();
        assert_eq!(labels["cpu"], "base");
        assert_eq!(labels["type"], "base");
    }

    #[test]
    fn test_wire_sample() {
        let m = metric("cpu", "percent");

        let gauge = m.wire_sample(0, false).unwrap();
        assert_eq!(gauge.kind, ValueKind::Gauge);
        assert_eq!(gauge.value, 1.0);
        assert_eq!(gauge.timestamp_ms, None);
        assert_eq!(
            gauge.help,
            "Service Telemetry exporter: 'cpu' Type: 'percent' Dstype: 'gauge' Dsname: 'ds1'"
        );

        let counter = m.wire_sample(1, true).unwrap();
        assert_eq!(counter.kind, ValueKind::Counter);
        assert_eq!(counter.timestamp_ms, Some(1500));
    }

    #[test]
    fn test_wire_sample_unknown_dstype() {
        let mut m = metric("cpu", "percent");
        m.dstypes[0] = "absolute".to_string();
        assert!(m.wire_sample(0, false).is_none());
        assert!(m.wire_sample(1, false).is_some());
    }
}
