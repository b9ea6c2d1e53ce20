//! Job lifecycle metrics
//!
//! Counts lifecycle events and records completed-job durations. Recording goes
//! through [`MetricsRecorder`] so reconcilers and the watcher engine can be
//! tested without an OpenTelemetry pipeline.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

use crate::status::BackendKind;

/// Global meter for bridge metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("bridge"));

// ============================================================================
// Job Lifecycle Metrics
// ============================================================================

/// Counter of job lifecycle events
///
/// Labels:
/// - `event`: context_created, context_failed, context_killed, job_failed,
///   job_completed, submitted
/// - `backend`: lsf, slurm, quantum (omitted when unknown)
pub static JOB_EVENTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("bridge_job_events_total")
        .with_description("Total number of bridge job lifecycle events")
        .with_unit("{events}")
        .build()
});

/// Histogram of completed job duration
///
/// Labels:
/// - `backend`: lsf, slurm, quantum (omitted when unknown)
pub static JOB_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("bridge_job_duration_minutes")
        .with_description("Duration of completed bridge jobs in minutes")
        .with_unit("min")
        .build()
});

/// Lifecycle events worth counting
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobEvent {
    /// Record, RBAC and watcher pod were created
    ContextCreated,
    /// Watcher pod failed while the job was live
    ContextFailed,
    /// Cancellation relayed to the watcher
    ContextKilled,
    /// Remote job ended in FAILED or UNKNOWN
    JobFailed,
    /// Remote job completed successfully
    JobCompleted,
    /// Remote scheduler accepted a submission
    Submitted,
}

impl JobEvent {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContextCreated => "context_created",
            Self::ContextFailed => "context_failed",
            Self::ContextKilled => "context_killed",
            Self::JobFailed => "job_failed",
            Self::JobCompleted => "job_completed",
            Self::Submitted => "submitted",
        }
    }
}

fn labels(event: Option<JobEvent>, backend: Option<BackendKind>) -> Vec<KeyValue> {
    let mut attrs = Vec::with_capacity(2);
    if let Some(event) = event {
        attrs.push(KeyValue::new("event", event.as_str()));
    }
    if let Some(backend) = backend {
        attrs.push(KeyValue::new("backend", backend.as_str()));
    }
    attrs
}

/// Sink for lifecycle metrics
pub trait MetricsRecorder: Send + Sync {
    /// Count one event
    fn record(&self, event: JobEvent, backend: Option<BackendKind>);

    /// Record the duration of a completed job
    fn record_duration(&self, minutes: f64, backend: Option<BackendKind>);
}

/// Recorder backed by the global OpenTelemetry meter
#[derive(Clone, Copy, Debug, Default)]
pub struct OtelRecorder;

impl MetricsRecorder for OtelRecorder {
    fn record(&self, event: JobEvent, backend: Option<BackendKind>) {
        JOB_EVENTS.add(1, &labels(Some(event), backend));
    }

    fn record_duration(&self, minutes: f64, backend: Option<BackendKind>) {
        JOB_DURATION.record(minutes, &labels(None, backend));
    }
}

/// Recorder that drops everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {
    fn record(&self, _event: JobEvent, _backend: Option<BackendKind>) {}

    fn record_duration(&self, _minutes: f64, _backend: Option<BackendKind>) {}
}
