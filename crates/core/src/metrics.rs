use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

/// Gauge collector rendered in the Prometheus text exposition format
pub struct MetricsCollector {
    gauges: Arc<Mutex<BTreeMap<String, Gauge>>>,
    help: Arc<Mutex<BTreeMap<String, String>>>,
}

/// Gauge - value that can go up or down
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gauge {
    pub name: String,
    pub value: f64,
    pub labels: BTreeMap<String, String>,
    pub last_updated: DateTime<Utc>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            gauges: Arc::new(Mutex::new(BTreeMap::new())),
            help: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Attach a `# HELP` line to a metric family
    pub fn describe(&self, name: &str, help: &str) {
        self.help
            .lock()
            .unwrap()
            .insert(name.to_string(), help.to_string());
    }

    /// Set a gauge value
    pub fn set_gauge(&self, name: &str, value: f64, labels: BTreeMap<String, String>) {
        let mut gauges = self.gauges.lock().unwrap();
        let key = Self::metric_key(name, &labels);

        gauges
            .entry(key)
            .and_modify(|g| {
                g.value = value;
                g.last_updated = Utc::now();
            })
            .or_insert_with(|| Gauge {
                name: name.to_string(),
                value,
                labels,
                last_updated: Utc::now(),
            });
    }

    /// Render every gauge, grouped by family, in registration-independent
    /// (sorted) order.
    pub fn render_prometheus(&self) -> String {
        let gauges = self.gauges.lock().unwrap();
        let help = self.help.lock().unwrap();

        let mut families: BTreeMap<&str, Vec<&Gauge>> = BTreeMap::new();
        for gauge in gauges.values() {
            families.entry(gauge.name.as_str()).or_default().push(gauge);
        }

        let mut out = String::new();
        for (name, samples) in families {
            if let Some(text) = help.get(name) {
                let _ = writeln!(out, "# HELP {} {}", name, text);
            }
            let _ = writeln!(out, "# TYPE {} gauge", name);
            for gauge in samples {
                let _ = writeln!(
                    out,
                    "{}{} {}",
                    name,
                    Self::render_labels(&gauge.labels),
                    format_value(gauge.value)
                );
            }
        }
        out
    }

    fn render_labels(labels: &BTreeMap<String, String>) -> String {
        if labels.is_empty() {
            return String::new();
        }
        let pairs = labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
            .collect::<Vec<_>>()
            .join(",");
        format!("{{{}}}", pairs)
    }

    /// Generate a unique key for a metric with labels
    fn metric_key(name: &str, labels: &BTreeMap<String, String>) -> String {
        if labels.is_empty() {
            return name.to_string();
        }

        let label_str = labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");

        format!("{}:{}", name, label_str)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn format_value(value: f64) -> String {
    if value.is_infinite() {
        if value > 0.0 { "+Inf" } else { "-Inf" }.to_string()
    } else if value.is_nan() {
        "NaN".to_string()
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_set() {
        let collector = MetricsCollector::new();
        let labels = BTreeMap::new();

        collector.set_gauge("workers_running", 3.0, labels.clone());
        collector.set_gauge("workers_running", 4.0, labels.clone());

        collector.set_gauge("workers_running", 1.0, BTreeMap::from([("app".to_string(), "x".to_string())]));

        let text = collector.render_prometheus();
        assert_eq!(
            text.lines().collect::<Vec<_>>(),
            vec![
                "# TYPE workers_running gauge",
                "workers_running 4",
                "workers_running{app=\"x\"} 1",
            ]
        );
    }

    #[test]
    fn test_render_groups_families() {
        let collector = MetricsCollector::new();
        collector.describe("b_total", "Things seen");
        collector.set_gauge("b_total", 2.0, BTreeMap::new());
        collector.set_gauge(
            "a_gate",
            1.0,
            BTreeMap::from([("status".to_string(), "run\"ning".to_string())]),
        );
        collector.set_gauge("c_rate", 0.25, BTreeMap::new());

        let text = collector.render_prometheus();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "# TYPE a_gate gauge",
                "a_gate{status=\"run\\\"ning\"} 1",
                "# HELP b_total Things seen",
                "# TYPE b_total gauge",
                "b_total 2",
                "# TYPE c_rate gauge",
                "c_rate 0.25",
            ]
        );
    }

    #[test]
    fn test_empty_collector_renders_nothing() {
        assert!(MetricsCollector::new().render_prometheus().is_empty());
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(f64::INFINITY), "+Inf");
        assert_eq!(format_value(7.0), "7");
        assert_eq!(format_value(0.5), "0.5");
    }
}
