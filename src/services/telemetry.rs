use serde_json::Value;
use strum::Display;

/// Severity of a telemetry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A fire-and-forget observability event.
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub event: &'static str,
    pub category: &'static str,
    pub severity: Severity,
    pub fields: Value,
}

impl TelemetryEvent {
    pub fn new(event: &'static str, category: &'static str, severity: Severity) -> Self {
        Self {
            event,
            category,
            severity,
            fields: Value::Null,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = fields;
        self
    }
}

/// Port to the telemetry sink. Implementations must never block the caller
/// and must never propagate an error into job processing.
pub trait TelemetrySink: Send + Sync {
    fn record_event(&self, event: TelemetryEvent);
}

/// Telemetry sink backed by structured logs and Prometheus counters.
pub struct LogTelemetry;

impl TelemetrySink for LogTelemetry {
    fn record_event(&self, event: TelemetryEvent) {
        metrics::counter!(
            "gateway_events_total",
            "event" => event.event,
            "category" => event.category,
            "severity" => event.severity.to_string(),
        )
        .increment(1);

        match event.severity {
            Severity::Info => tracing::info!(
                event = event.event,
                category = event.category,
                fields = %event.fields,
                "telemetry event"
            ),
            Severity::Warning => tracing::warn!(
                event = event.event,
                category = event.category,
                fields = %event.fields,
                "telemetry event"
            ),
            Severity::Critical => tracing::error!(
                event = event.event,
                category = event.category,
                fields = %event.fields,
                "telemetry event"
            ),
        }
    }
}

/// Sink that drops everything, for tests and minimal deployments.
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record_event(&self, _event: TelemetryEvent) {}
}
