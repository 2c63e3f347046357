//! Observations emitted by the controller.
//!
//! A [`MetricsSink`] is handed to the controller at construction, there is no global registry.

use std::time::Duration;

use crate::traffic::TrafficKind;

/// Receives observations from the reconcile path.
pub trait MetricsSink: Send + Sync {
    /// Time from the creation of a traffic object until its first DNS Record was created.
    fn observe_admission_latency(&self, kind: TrafficKind, latency: Duration);

    /// Outcome of processing a single work queue key.
    fn observe_reconcile(&self, controller: &str, outcome: ReconcileOutcome, duration: Duration);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ReconcileOutcome {
    Success,
    Retry,
    Dropped,
}

/// Emits all observations as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn observe_admission_latency(&self, kind: TrafficKind, latency: Duration) {
        tracing::info!(
            traffic.kind = %kind,
            latency_seconds = latency.as_secs_f64(),
            "traffic object admitted"
        );
    }

    fn observe_reconcile(&self, controller: &str, outcome: ReconcileOutcome, duration: Duration) {
        tracing::debug!(
            controller.name = controller,
            %outcome,
            duration_seconds = duration.as_secs_f64(),
            "reconcile finished"
        );
    }
}
