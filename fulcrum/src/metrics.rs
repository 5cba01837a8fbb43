//! Metrics registry: counters, gauges, and histograms with labels.
//!
//! Series identity is `(name, ordered label pairs)`. Help text and type are
//! registered per name and emitted once per family in the text exposition.
//! Histograms use a fixed latency bucket ladder with cumulative counts, the
//! way the exposition format expects them.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Request latency buckets in seconds.
const DEFAULT_BUCKETS: [f64; 12] = [
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    fn as_str(self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Histogram => "histogram",
        }
    }
}

pub type Labels<'a> = &'a [(&'a str, &'a str)];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SeriesKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl SeriesKey {
    fn new(name: &str, labels: Labels<'_>) -> Self {
        Self {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

#[derive(Debug)]
enum MetricValue {
    Counter(f64),
    Gauge(f64),
    Histogram {
        buckets: Vec<u64>,
        sum: f64,
        count: u64,
    },
}

#[derive(Debug, Default)]
struct RegistryInner {
    series: BTreeMap<SeriesKey, MetricValue>,
    meta: BTreeMap<String, (MetricType, String)>,
}

/// The process-wide metrics registry.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach help text and a type to a metric name.
    pub fn register(&self, name: &str, help: &str, ty: MetricType) {
        self.locked()
            .meta
            .insert(name.to_string(), (ty, help.to_string()));
    }

    pub fn counter_inc(&self, name: &str, labels: Labels<'_>) {
        self.counter_add(name, 1.0, labels);
    }

    pub fn counter_add(&self, name: &str, value: f64, labels: Labels<'_>) {
        let mut inner = self.locked();
        let entry = inner
            .series
            .entry(SeriesKey::new(name, labels))
            .or_insert(MetricValue::Counter(0.0));
        if let MetricValue::Counter(v) = entry {
            *v += value;
        }
    }

    pub fn gauge_set(&self, name: &str, value: f64, labels: Labels<'_>) {
        let mut inner = self.locked();
        let entry = inner
            .series
            .entry(SeriesKey::new(name, labels))
            .or_insert(MetricValue::Gauge(0.0));
        if let MetricValue::Gauge(v) = entry {
            *v = value;
        }
    }

    pub fn gauge_inc(&self, name: &str, labels: Labels<'_>) {
        self.gauge_add(name, 1.0, labels);
    }

    pub fn gauge_dec(&self, name: &str, labels: Labels<'_>) {
        self.gauge_add(name, -1.0, labels);
    }

    fn gauge_add(&self, name: &str, delta: f64, labels: Labels<'_>) {
        let mut inner = self.locked();
        let entry = inner
            .series
            .entry(SeriesKey::new(name, labels))
            .or_insert(MetricValue::Gauge(0.0));
        if let MetricValue::Gauge(v) = entry {
            *v += delta;
        }
    }

    pub fn histogram_observe(&self, name: &str, value: f64, labels: Labels<'_>) {
        let mut inner = self.locked();
        let entry = inner
            .series
            .entry(SeriesKey::new(name, labels))
            .or_insert_with(|| MetricValue::Histogram {
                buckets: vec![0; DEFAULT_BUCKETS.len()],
                sum: 0.0,
                count: 0,
            });
        if let MetricValue::Histogram {
            buckets,
            sum,
            count,
        } = entry
        {
            for (i, bound) in DEFAULT_BUCKETS.iter().enumerate() {
                if value <= *bound {
                    buckets[i] += 1;
                }
            }
            *sum += value;
            *count += 1;
        }
    }

    /// Render the registry in the text exposition format: `# HELP` and
    /// `# TYPE` once per family, one sample line per series, histograms
    /// expanded to `_bucket`/`_sum`/`_count`.
    pub fn render(&self) -> String {
        let inner = self.locked();
        let mut out = String::new();
        let mut current_family: Option<&str> = None;

        for (key, value) in &inner.series {
            if current_family != Some(key.name.as_str()) {
                current_family = Some(key.name.as_str());
                if let Some((ty, help)) = inner.meta.get(&key.name) {
                    out.push_str(&format!("# HELP {} {}\n", key.name, help));
                    out.push_str(&format!("# TYPE {} {}\n", key.name, ty.as_str()));
                }
            }

            let labels = format_labels(&key.labels);
            match value {
                MetricValue::Counter(v) => {
                    out.push_str(&format!("{}{} {:.0}\n", key.name, labels, v));
                }
                MetricValue::Gauge(v) => {
                    out.push_str(&format!("{}{} {:.2}\n", key.name, labels, v));
                }
                MetricValue::Histogram {
                    buckets,
                    sum,
                    count,
                } => {
                    for (i, bound) in DEFAULT_BUCKETS.iter().enumerate() {
                        out.push_str(&format!(
                            "{}_bucket{} {}\n",
                            key.name,
                            merge_labels(&key.labels, &format!("{bound:.3}")),
                            buckets[i]
                        ));
                    }
                    out.push_str(&format!(
                        "{}_bucket{} {}\n",
                        key.name,
                        merge_labels(&key.labels, "+Inf"),
                        count
                    ));
                    out.push_str(&format!("{}_sum{} {:.6}\n", key.name, labels, sum));
                    out.push_str(&format!("{}_count{} {}\n", key.name, labels, count));
                }
            }
        }
        out
    }

    /// Pre-register the standard proxy metric families.
    pub fn register_defaults(&self) {
        self.register("lb_requests_total", "Total requests", MetricType::Counter);
        self.register(
            "lb_requests_failed_total",
            "Failed requests",
            MetricType::Counter,
        );
        self.register(
            "lb_connections_active",
            "Active connections",
            MetricType::Gauge,
        );
        self.register("lb_backends_healthy", "Healthy backends", MetricType::Gauge);
        self.register(
            "lb_request_duration_seconds",
            "Request latency",
            MetricType::Histogram,
        );
        self.register(
            "lb_bytes_received_total",
            "Bytes received from backends",
            MetricType::Counter,
        );
        self.register(
            "lb_bytes_sent_total",
            "Bytes sent to backends",
            MetricType::Counter,
        );
        self.register(
            "lb_pool_hits_total",
            "Connection pool hits",
            MetricType::Counter,
        );
        self.register(
            "lb_pool_misses_total",
            "Connection pool misses",
            MetricType::Counter,
        );
        self.register(
            "lb_ratelimit_denied_total",
            "Requests denied by the rate limiter",
            MetricType::Counter,
        );
    }
}

fn format_labels(labels: &[(String, String)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect();
    format!("{{{}}}", pairs.join(","))
}

fn merge_labels(labels: &[(String, String)], le: &str) -> String {
    let mut pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect();
    pairs.push(format!("le=\"{le}\""));
    format!("{{{}}}", pairs.join(","))
}
