use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::{json, Value};

/// Maximum observations retained per histogram series.
pub const HISTOGRAM_CAPACITY: usize = 1000;

/// Upper bounds for exported histogram buckets (milliseconds by
/// convention), plus an implicit `+Inf`.
const BUCKET_BOUNDS: [f64; 7] = [10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 10_000.0];

#[derive(Debug, Clone)]
enum MetricValue {
    Counter(f64),
    Gauge(f64),
    Histogram(VecDeque<f64>),
}

impl MetricValue {
    fn type_name(&self) -> &'static str {
        match self {
            MetricValue::Counter(_) => "counter",
            MetricValue::Gauge(_) => "gauge",
            MetricValue::Histogram(_) => "histogram",
        }
    }
}

#[derive(Debug, Clone)]
struct Metric {
    name: String,
    labels: Vec<(String, String)>,
    value: MetricValue,
}

/// Summary statistics for one histogram series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramStats {
    pub count: usize,
    pub sum: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// One entry of [`MetricsRegistry::all`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricEntry {
    pub key: String,
    pub kind: &'static str,
    pub value: Value,
}

/// Counters, gauges and histograms keyed by name plus a sorted label
/// set, with a Prometheus-compatible text export.
///
/// Keys render as `name{k1="v1",k2="v2"}` with labels sorted
/// lexicographically by key; the label-free form is the plain name.
/// Series of different shapes never collide: a counter write to an
/// existing gauge key is refused and logged.
pub struct MetricsRegistry {
    metrics: Mutex<HashMap<String, Metric>>,
}

/// Render the composite key for `name` and `labels`.
pub(crate) fn metric_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<(&str, &str)> = labels.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let mut out = String::with_capacity(name.len() + 16);
    out.push_str(name);
    out.push('{');
    for (i, (k, v)) in sorted.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{k}=\"{v}\"");
    }
    out.push('}');
    out
}

fn sorted_labels(labels: &[(&str, &str)]) -> Vec<(String, String)> {
    let mut sorted: Vec<(String, String)> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    sorted
}

/// Render a key for `name` with `labels` plus one extra trailing label
/// (used for `le` on bucket lines).
fn key_with_extra(name: &str, labels: &[(String, String)], extra: (&str, &str)) -> String {
    let mut out = String::with_capacity(name.len() + 24);
    out.push_str(name);
    out.push('{');
    for (k, v) in labels {
        let _ = write!(out, "{k}=\"{v}\",");
    }
    let _ = write!(out, "{}=\"{}\"", extra.0, extra.1);
    out.push('}');
    out
}

fn render_suffixed(name: &str, suffix: &str, labels: &[(String, String)]) -> String {
    let mut out = String::with_capacity(name.len() + suffix.len() + 16);
    out.push_str(name);
    out.push_str(suffix);
    if !labels.is_empty() {
        out.push('{');
        for (i, (k, v)) in labels.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "{k}=\"{v}\"");
        }
        out.push('}');
    }
    out
}

/// Percentile by index: sorted ascending, `p_k = sorted[floor(count*k/100)]`
/// clamped to the last element.
fn percentile(sorted: &[f64], k: u32) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = (sorted.len() * k as usize) / 100;
    sorted[index.min(sorted.len() - 1)]
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            metrics: Mutex::new(HashMap::new()),
        }
    }

    /// Add `value` to a counter (creating it at zero). Non-positive
    /// values are refused: counters are monotonic.
    pub fn inc_counter_by(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        if !value.is_finite() || value <= 0.0 {
            tracing::warn!(metric = name, value, "counter increment must be positive");
            return;
        }
        let key = metric_key(name, labels);
        let mut metrics = self.metrics.lock().unwrap();
        match metrics.get_mut(&key) {
            Some(Metric {
                value: MetricValue::Counter(total),
                ..
            }) => *total += value,
            Some(existing) => {
                tracing::warn!(
                    metric = %key,
                    existing = existing.value.type_name(),
                    "refusing counter write to a different metric shape"
                );
            }
            None => {
                metrics.insert(
                    key,
                    Metric {
                        name: name.to_string(),
                        labels: sorted_labels(labels),
                        value: MetricValue::Counter(value),
                    },
                );
            }
        }
    }

    /// Increment a counter by one.
    pub fn inc_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.inc_counter_by(name, labels, 1.0);
    }

    /// Set a gauge to an absolute value (last write wins).
    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        if !value.is_finite() {
            tracing::warn!(metric = name, "gauge value must be finite");
            return;
        }
        let key = metric_key(name, labels);
        let mut metrics = self.metrics.lock().unwrap();
        match metrics.get_mut(&key) {
            Some(Metric {
                value: MetricValue::Gauge(current),
                ..
            }) => *current = value,
            Some(existing) => {
                tracing::warn!(
                    metric = %key,
                    existing = existing.value.type_name(),
                    "refusing gauge write to a different metric shape"
                );
            }
            None => {
                metrics.insert(
                    key,
                    Metric {
                        name: name.to_string(),
                        labels: sorted_labels(labels),
                        value: MetricValue::Gauge(value),
                    },
                );
            }
        }
    }

    /// Append an observation to a histogram series. The oldest
    /// observation is dropped once the series holds
    /// [`HISTOGRAM_CAPACITY`] entries.
    pub fn record_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        if !value.is_finite() {
            tracing::warn!(metric = name, "histogram observation must be finite");
            return;
        }
        let key = metric_key(name, labels);
        let mut metrics = self.metrics.lock().unwrap();
        match metrics.get_mut(&key) {
            Some(Metric {
                value: MetricValue::Histogram(observations),
                ..
            }) => {
                if observations.len() >= HISTOGRAM_CAPACITY {
                    observations.pop_front();
                }
                observations.push_back(value);
            }
            Some(existing) => {
                tracing::warn!(
                    metric = %key,
                    existing = existing.value.type_name(),
                    "refusing histogram write to a different metric shape"
                );
            }
            None => {
                let mut observations = VecDeque::with_capacity(64);
                observations.push_back(value);
                metrics.insert(
                    key,
                    Metric {
                        name: name.to_string(),
                        labels: sorted_labels(labels),
                        value: MetricValue::Histogram(observations),
                    },
                );
            }
        }
    }

    /// Current counter value, or 0 when absent.
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let metrics = self.metrics.lock().unwrap();
        match metrics.get(&metric_key(name, labels)) {
            Some(Metric {
                value: MetricValue::Counter(v),
                ..
            }) => *v,
            _ => 0.0,
        }
    }

    /// Current gauge value, or 0 when absent.
    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let metrics = self.metrics.lock().unwrap();
        match metrics.get(&metric_key(name, labels)) {
            Some(Metric {
                value: MetricValue::Gauge(v),
                ..
            }) => *v,
            _ => 0.0,
        }
    }

    /// Summary statistics for a histogram series, or `None` when the
    /// series is absent or empty.
    pub fn histogram_stats(&self, name: &str, labels: &[(&str, &str)]) -> Option<HistogramStats> {
        let metrics = self.metrics.lock().unwrap();
        let observations = match metrics.get(&metric_key(name, labels)) {
            Some(Metric {
                value: MetricValue::Histogram(obs),
                ..
            }) if !obs.is_empty() => obs,
            _ => return None,
        };

        let mut sorted: Vec<f64> = observations.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        Some(HistogramStats {
            count,
            sum,
            avg: sum / count as f64,
            min: sorted[0],
            max: sorted[count - 1],
            p50: percentile(&sorted, 50),
            p95: percentile(&sorted, 95),
            p99: percentile(&sorted, 99),
        })
    }

    /// Snapshot of every series: key, shape, and current value (summary
    /// statistics for histograms).
    pub fn all(&self) -> Vec<MetricEntry> {
        let metrics = self.metrics.lock().unwrap();
        let mut keys: Vec<&String> = metrics.keys().collect();
        keys.sort();
        keys.into_iter()
            .map(|key| {
                let metric = &metrics[key];
                let value = match &metric.value {
                    MetricValue::Counter(v) | MetricValue::Gauge(v) => json!(v),
                    MetricValue::Histogram(obs) => json!({
                        "count": obs.len(),
                        "sum": obs.iter().sum::<f64>(),
                    }),
                };
                MetricEntry {
                    key: key.clone(),
                    kind: metric.value.type_name(),
                    value,
                }
            })
            .collect()
    }

    /// Prometheus text exposition. `# HELP` and `# TYPE` are emitted
    /// once per metric name; histograms expand to cumulative
    /// `_bucket{le=...}` lines plus `_sum` and `_count`. The output
    /// always ends with a newline.
    pub fn to_text(&self) -> String {
        let metrics = self.metrics.lock().unwrap();

        // Group series under their base name so HELP/TYPE appear once.
        let mut by_name: BTreeMap<&str, Vec<(&String, &Metric)>> = BTreeMap::new();
        for (key, metric) in metrics.iter() {
            by_name.entry(metric.name.as_str()).or_default().push((key, metric));
        }

        let mut out = String::new();
        for (name, mut series) in by_name {
            series.sort_by(|a, b| a.0.cmp(b.0));
            let type_name = series[0].1.value.type_name();
            let _ = writeln!(out, "# HELP {name} {name}");
            let _ = writeln!(out, "# TYPE {name} {type_name}");

            for (key, metric) in series {
                match &metric.value {
                    MetricValue::Counter(v) | MetricValue::Gauge(v) => {
                        let _ = writeln!(out, "{key} {v}");
                    }
                    MetricValue::Histogram(observations) => {
                        let bucket_name = format!("{name}_bucket");
                        for bound in BUCKET_BOUNDS {
                            let count =
                                observations.iter().filter(|v| **v <= bound).count();
                            let le = format_bound(bound);
                            let _ = writeln!(
                                out,
                                "{} {count}",
                                key_with_extra(&bucket_name, &metric.labels, ("le", &le))
                            );
                        }
                        let _ = writeln!(
                            out,
                            "{} {}",
                            key_with_extra(&bucket_name, &metric.labels, ("le", "+Inf")),
                            observations.len()
                        );
                        let sum: f64 = observations.iter().sum();
                        let _ = writeln!(
                            out,
                            "{} {sum}",
                            render_suffixed(name, "_sum", &metric.labels)
                        );
                        let _ = writeln!(
                            out,
                            "{} {}",
                            render_suffixed(name, "_count", &metric.labels),
                            observations.len()
                        );
                    }
                }
            }
        }

        if out.is_empty() {
            out.push('\n');
        }
        out
    }

    /// Drop every series.
    pub fn clear(&self) {
        self.metrics.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.metrics.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn format_bound(bound: f64) -> String {
    if bound.fract() == 0.0 {
        format!("{}", bound as u64)
    } else {
        format!("{bound}")
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("series", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_sorts_labels_lexicographically() {
        assert_eq!(metric_key("reqs", &[]), "reqs");
        assert_eq!(
            metric_key("reqs", &[("method", "GET"), ("code", "200")]),
            "reqs{code=\"200\",method=\"GET\"}"
        );
    }

    #[test]
    fn counters_accumulate_and_default_to_zero() {
        let registry = MetricsRegistry::new();
        assert_eq!(registry.counter("hits", &[]), 0.0);
        registry.inc_counter("hits", &[]);
        registry.inc_counter_by("hits", &[], 4.0);
        assert_eq!(registry.counter("hits", &[]), 5.0);
    }

    #[test]
    fn counters_refuse_non_positive_increments() {
        let registry = MetricsRegistry::new();
        registry.inc_counter_by("hits", &[], 0.0);
        registry.inc_counter_by("hits", &[], -3.0);
        registry.inc_counter_by("hits", &[], f64::NAN);
        assert_eq!(registry.counter("hits", &[]), 0.0);
    }

    #[test]
    fn gauges_take_last_write() {
        let registry = MetricsRegistry::new();
        registry.set_gauge("temp", &[], 20.0);
        registry.set_gauge("temp", &[], -3.5);
        assert_eq!(registry.gauge("temp", &[]), -3.5);
    }

    #[test]
    fn shape_conflicts_are_refused() {
        let registry = MetricsRegistry::new();
        registry.set_gauge("value", &[], 1.0);
        registry.inc_counter("value", &[]);
        assert_eq!(registry.gauge("value", &[]), 1.0);
        assert_eq!(registry.counter("value", &[]), 0.0);
    }

    #[test]
    fn histogram_stats_from_one_to_one_hundred() {
        let registry = MetricsRegistry::new();
        for v in 1..=100 {
            registry.record_histogram("dist", &[], v as f64);
        }
        let stats = registry.histogram_stats("dist", &[]).unwrap();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.sum, 5050.0);
        assert_eq!(stats.avg, 50.5);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 100.0);
        assert!((stats.p50 - 50.0).abs() <= 1.0);
        assert!((stats.p95 - 95.0).abs() <= 1.0);
        assert!((stats.p99 - 99.0).abs() <= 1.0);
    }

    #[test]
    fn histogram_drops_oldest_at_capacity() {
        let registry = MetricsRegistry::new();
        for v in 0..(HISTOGRAM_CAPACITY + 100) {
            registry.record_histogram("dist", &[], v as f64);
        }
        let stats = registry.histogram_stats("dist", &[]).unwrap();
        assert_eq!(stats.count, HISTOGRAM_CAPACITY);
        assert_eq!(stats.min, 100.0);
    }

    #[test]
    fn empty_histogram_has_no_stats() {
        let registry = MetricsRegistry::new();
        assert!(registry.histogram_stats("missing", &[]).is_none());
    }

    #[test]
    fn text_export_matches_expected_lines() {
        let registry = MetricsRegistry::new();
        for _ in 0..100 {
            registry.inc_counter("http_requests_total", &[]);
        }
        registry.set_gauge("active_connections", &[], 42.0);
        registry.record_histogram("request_duration_ms", &[], 100.0);
        registry.record_histogram("request_duration_ms", &[], 200.0);

        let text = registry.to_text();
        assert!(text.contains("# HELP http_requests_total http_requests_total"));
        assert!(text.contains("# TYPE http_requests_total counter"));
        assert!(text.contains("http_requests_total 100"));
        assert!(text.contains("active_connections 42"));
        assert!(text.contains("# TYPE request_duration_ms histogram"));
        assert!(text.contains("request_duration_ms_bucket{le=\"100\"} 1"));
        assert!(text.contains("request_duration_ms_bucket{le=\"500\"} 2"));
        assert!(text.contains("request_duration_ms_bucket{le=\"+Inf\"} 2"));
        assert!(text.contains("request_duration_ms_sum 300"));
        assert!(text.contains("request_duration_ms_count 2"));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn text_export_round_trips_simple_values() {
        let registry = MetricsRegistry::new();
        registry.inc_counter_by("a_total", &[("x", "1")], 7.0);
        registry.set_gauge("b_gauge", &[], 2.5);

        let text = registry.to_text();
        let mut parsed: Vec<(String, f64)> = Vec::new();
        for line in text.lines() {
            if line.starts_with('#') || line.is_empty() {
                continue;
            }
            let (key, value) = line.rsplit_once(' ').unwrap();
            parsed.push((key.to_string(), value.parse().unwrap()));
        }
        assert!(parsed.contains(&("a_total{x=\"1\"}".to_string(), 7.0)));
        assert!(parsed.contains(&("b_gauge".to_string(), 2.5)));
    }

    #[test]
    fn labeled_histogram_bucket_lines_include_labels() {
        let registry = MetricsRegistry::new();
        registry.record_histogram("lat_ms", &[("route", "/api")], 40.0);
        let text = registry.to_text();
        assert!(text.contains("lat_ms_bucket{route=\"/api\",le=\"50\"} 1"));
        assert!(text.contains("lat_ms_sum{route=\"/api\"} 40"));
        assert!(text.contains("lat_ms_count{route=\"/api\"} 1"));
    }

    #[test]
    fn empty_export_is_a_single_newline() {
        let registry = MetricsRegistry::new();
        assert_eq!(registry.to_text(), "\n");
    }

    #[test]
    fn clear_removes_everything() {
        let registry = MetricsRegistry::new();
        registry.inc_counter("hits", &[]);
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.counter("hits", &[]), 0.0);
    }
}
