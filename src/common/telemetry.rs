use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tracing::field::{Field, Visit};
use tracing::{info, Event, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

pub const METRIC_LABELS_ENV: &str = "RNN_PPO_METRIC_LABELS";

/// One record per update cycle (or per evaluation run).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CycleMetrics {
    pub update: usize,
    pub mean_return: f32,
    pub win_rate: f32,
    /// Cumulative environment steps over all replicas.
    pub env_steps: u64,
    pub episodes: f32,
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, metrics: &CycleMetrics);
}

/// Emits each record as a structured `tracing` event.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record(&self, metrics: &CycleMetrics) {
        info!(
            category = "ACTOR",
            update = metrics.update,
            timesteps = metrics.env_steps,
            mean_return = metrics.mean_return,
            win_rate = metrics.win_rate,
            episodes = metrics.episodes,
            "metrics"
        );
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct RecordingMetricsSink {
    records: Mutex<Vec<CycleMetrics>>,
}

impl RecordingMetricsSink {
    pub fn records(&self) -> Vec<CycleMetrics> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl MetricsSink for RecordingMetricsSink {
    fn record(&self, metrics: &CycleMetrics) {
        match self.records.lock() {
            Ok(mut records) => records.push(*metrics),
            Err(poisoned) => poisoned.into_inner().push(*metrics),
        }
    }
}

#[derive(Default)]
pub struct DashboardVisitor {
    category: Option<String>,
    fields: Vec<(String, String)>,
}

impl DashboardVisitor {
    fn record_value(&mut self, field: &Field, value: String) {
        let name = field.name();
        if name == "category" {
            self.category = Some(value);
            return;
        }
        if name == "message" {
            return;
        }
        self.fields.push((name.to_string(), value));
    }
}

impl Visit for DashboardVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.record_value(field, format!("{value:.4}"));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_value(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_value(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_value(field, value.to_string());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_value(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.record_value(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record_value(field, format!("{value:?}"));
    }
}

#[derive(Default, Clone)]
pub struct MetricRegistry {
    labels: HashMap<String, String>,
}

impl MetricRegistry {
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register("global_grad_norm", "Grad norm");
        registry.register("steps_per_second", "Steps per second");
        registry.register("learning_rate", "Learning rate");
        registry.register("value_loss", "Value loss");
        registry.register("approx_kl", "Approx KL");
        registry.register("clip_fraction", "Clip fraction");
        registry.register("win_rate", "Win rate");
        registry
    }

    /// Reads `key=Label` pairs separated by commas from the environment.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(raw) = std::env::var(METRIC_LABELS_ENV) {
            self.apply_overrides(&raw);
        }
        self
    }

    fn apply_overrides(&mut self, raw: &str) {
        for entry in raw.split(',') {
            let Some((key, label)) = entry.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let label = label.trim();
            if !key.is_empty() && !label.is_empty() {
                self.register(key, label);
            }
        }
    }

    pub fn register(&mut self, key: impl Into<String>, label: impl Into<String>) {
        self.labels.insert(key.into(), label.into());
    }

    pub fn resolve(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

pub struct DashboardFormatter {
    registry: MetricRegistry,
}

impl DashboardFormatter {
    pub fn new(registry: MetricRegistry) -> Self {
        Self { registry }
    }

    fn category_label(raw: Option<&str>) -> &'static str {
        match raw.unwrap_or("MISC").to_ascii_uppercase().as_str() {
            "TRAINER" | "TRAIN" => "TRAINER",
            "EVALUATOR" | "EVAL" => "EVALUATOR",
            "ACTOR" | "ACT" => "ACTOR",
            "COORDINATOR" => "COORDINATOR",
            _ => "MISC",
        }
    }

    fn style_category(label: &str, ansi: bool) -> String {
        if !ansi {
            return label.to_string();
        }
        let code = match label {
            "TRAINER" => "\x1b[1;35m",
            "EVALUATOR" => "\x1b[1;32m",
            "ACTOR" => "\x1b[1;36m",
            "COORDINATOR" => "\x1b[1;34m",
            _ => "\x1b[1;33m",
        };
        format!("{code}{label}\x1b[0m")
    }

    fn pretty_key(&self, key: &str) -> String {
        if let Some(label) = self.registry.resolve(key) {
            return label.to_string();
        }

        let mut chars = key.replace('_', " ").chars().collect::<Vec<_>>();
        if let Some(first) = chars.first_mut() {
            *first = first.to_ascii_uppercase();
        }
        chars.into_iter().collect()
    }
}

impl<S, N> FormatEvent<S, N> for DashboardFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = DashboardVisitor::default();
        event.record(&mut visitor);

        let label = Self::category_label(visitor.category.as_deref());
        let styled = Self::style_category(label, writer.has_ansi_escapes());
        write!(writer, "{styled} - ")?;

        let mut wrote_metric = false;
        for (key, value) in visitor.fields {
            if wrote_metric {
                write!(writer, " | ")?;
            }
            wrote_metric = true;
            write!(writer, "{}: {}", self.pretty_key(&key), value)?;
        }

        if !wrote_metric {
            write!(writer, "No metrics")?;
        }

        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_overrides_and_fallback_labels() {
        let mut registry = MetricRegistry::with_defaults();
        registry.apply_overrides("win_rate=Success, bogus ,=x,mean_return=Return");
        let formatter = DashboardFormatter::new(registry);

        assert_eq!(formatter.pretty_key("win_rate"), "Success");
        assert_eq!(formatter.pretty_key("mean_return"), "Return");
        assert_eq!(formatter.pretty_key("episode_length"), "Episode length");
        assert_eq!(DashboardFormatter::category_label(Some("coordinator")), "COORDINATOR");
        assert_eq!(DashboardFormatter::category_label(None), "MISC");
    }

    #[test]
    fn recording_sink_keeps_order() {
        let sink = RecordingMetricsSink::default();
        for update in 0..3 {
            sink.record(&CycleMetrics {
                update,
                ..CycleMetrics::default()
            });
        }
        let updates = sink.records().iter().map(|m| m.update).collect::<Vec<_>>();
        assert_eq!(updates, vec![0, 1, 2]);
    }
}
