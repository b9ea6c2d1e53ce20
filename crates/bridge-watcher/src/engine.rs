//! Watcher engine
//!
//! Drives one job through `NEW -> SUBMITTED -> POLLING -> TERMINAL`. All state
//! lives in the coordination record, so a restarted watcher resumes from the
//! remote id it finds there. The loop sleeps for the poll interval between
//! cycles and stops early when the shutdown token is cancelled.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use bridge_common::metrics::{JobEvent, MetricsRecorder};
use bridge_common::record::{keys, CoordinationRecord, RecordStore, RecordUpdate};
use bridge_common::time::now_timestamp;
use bridge_common::JobStatus;

use crate::backend::{submit_failure_message, BackendAdapter, JobSnapshot};
use crate::config::WatcherSettings;
use crate::error::Result;
use crate::stager::ArtifactStager;

/// Message written when the output bucket cannot be used
pub const BUCKET_FAILURE_MESSAGE: &str = "Failed to create S3 bucket. Data is not uploaded to S3";

/// Lifecycle phase, for logging
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    New,
    Submitted,
    Polling,
    Terminal,
}

/// How the engine stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The job reached a terminal status
    Finished(JobStatus),
    /// Shutdown was requested before the job finished
    Interrupted,
}

impl Outcome {
    /// Process exit code: zero only for a successful terminal status
    ///
    /// An interrupted watcher leaves the record non-terminal, so it exits
    /// non-zero and the controller classifies the failed pod.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Finished(status) if status.is_success() => 0,
            Self::Finished(_) | Self::Interrupted => 1,
        }
    }
}

pub struct WatcherEngine {
    settings: Arc<WatcherSettings>,
    records: Arc<dyn RecordStore>,
    backend: Arc<dyn BackendAdapter>,
    stager: ArtifactStager,
    metrics: Arc<dyn MetricsRecorder>,
}

impl WatcherEngine {
    pub fn new(
        settings: Arc<WatcherSettings>,
        records: Arc<dyn RecordStore>,
        backend: Arc<dyn BackendAdapter>,
        stager: ArtifactStager,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            settings,
            records,
            backend,
            stager,
            metrics,
        }
    }

    /// Run until the job is terminal or `shutdown` is cancelled
    #[instrument(skip(self, shutdown), fields(job = %self.settings.job_name, backend = %self.settings.backend))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<Outcome> {
        let mut record = self.records.load().await?;

        let remote_id = match record.remote_id() {
            Some(id) => {
                let id = id.to_string();
                info!(remote_id = %id, "resuming job found in record");
                if let Some(status) = self.resume(&mut record, &id).await? {
                    return Ok(Outcome::Finished(status));
                }
                id
            }
            None => match self.submit(&mut record).await? {
                Ok(id) => id,
                Err(status) => return Ok(Outcome::Finished(status)),
            },
        };

        debug!(phase = ?Phase::Polling, interval = ?self.settings.poll_interval, "entering poll loop");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested, leaving poll loop");
                    return Ok(Outcome::Interrupted);
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }

            if let Some(status) = self.cycle(&mut record, &remote_id).await {
                info!(phase = ?Phase::Terminal, status = %status, "job finished");
                return Ok(Outcome::Finished(status));
            }
        }
    }

    /// Write the changed subset of `update`, keeping the local snapshot in step
    async fn write(&self, record: &mut CoordinationRecord, update: RecordUpdate) -> Result<()> {
        let changes = record.changes(&update);
        if changes.is_empty() {
            return Ok(());
        }
        self.records.write(&changes).await?;
        record.apply(&changes);
        Ok(())
    }

    /// NEW: stage and submit. `Err(status)` carries the terminal status when submission is abandoned.
    async fn submit(
        &self,
        record: &mut CoordinationRecord,
    ) -> Result<std::result::Result<String, JobStatus>> {
        let kind = self.backend.kind();

        if record.kill_requested() {
            info!("kill requested before submission, not submitting");
            self.write(record, RecordUpdate::new().status(JobStatus::Kill))
                .await?;
            return Ok(Err(JobStatus::Kill));
        }

        info!(phase = ?Phase::New, "submitting job");
        let submitted = async {
            self.backend.authenticate().await?;
            if !self.settings.payload.additional_data.is_empty() {
                self.stager.download_inputs(self.backend.as_ref()).await?;
            }
            let request = self.stager.stage_submission().await?;
            Ok::<_, crate::error::WatcherError>(self.backend.submit(&request).await?)
        }
        .await;

        match submitted {
            Ok(id) => {
                info!(phase = ?Phase::Submitted, remote_id = %id, "job submitted");
                self.write(
                    record,
                    RecordUpdate::new()
                        .remote_id(id.clone())
                        .status(JobStatus::Submitted)
                        .set(keys::SUBMIT_TIME, now_timestamp()),
                )
                .await?;
                self.metrics.record(JobEvent::Submitted, Some(kind));
                Ok(Ok(id))
            }
            Err(e) => {
                warn!(error = %e, "submission failed, not retrying");
                self.write(
                    record,
                    RecordUpdate::new()
                        .status(JobStatus::Failed)
                        .message(submit_failure_message(kind)),
                )
                .await?;
                Ok(Err(JobStatus::Failed))
            }
        }
    }

    /// Resume with a known remote id: a live job continues polling, a job only
    /// history remembers is finished immediately.
    async fn resume(&self, record: &mut CoordinationRecord, remote_id: &str) -> Result<Option<JobStatus>> {
        if let Err(e) = self.backend.authenticate().await {
            warn!(error = %e, "authentication failed, will retry in the poll loop");
            return Ok(None);
        }

        let poll_error = match self.backend.poll(remote_id).await {
            Ok(snapshot) => return Ok(self.observe(record, remote_id, snapshot).await),
            Err(e) => e,
        };
        warn!(remote_id, error = %poll_error, "live lookup failed, consulting history");

        match self.backend.history(remote_id).await {
            Ok(Some(entry)) => {
                let status = self.backend.translate(&entry.native_state).status;
                let mut update = RecordUpdate::new()
                    .status(status)
                    .set(keys::HISTORY, "true")
                    .message(format!(
                        "Job with id {remote_id} found in history with state {}. Can't retrieve more information",
                        entry.native_state
                    ));
                if let Some(time) = entry.time {
                    update.insert(keys::SUBMIT_TIME, time);
                }
                self.write(record, update).await?;
                info!(remote_id, status = %status, "job state recovered from history");
                Ok(Some(status))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(remote_id, error = %e, "history lookup failed");
                Ok(None)
            }
        }
    }

    /// One POLLING cycle; transient failures are logged and retried next cycle
    async fn cycle(&self, record: &mut CoordinationRecord, remote_id: &str) -> Option<JobStatus> {
        match self.records.load().await {
            Ok(fresh) => *record = fresh,
            Err(e) => warn!(error = %e, "cannot reload record, using last snapshot"),
        }

        if let Err(e) = self.backend.authenticate().await {
            warn!(error = %e, "authentication failed");
            return None;
        }

        match self.backend.poll(remote_id).await {
            Ok(snapshot) => self.observe(record, remote_id, snapshot).await,
            Err(e) => {
                warn!(remote_id, error = %e, "poll failed");
                None
            }
        }
    }

    /// Translate a snapshot, relay kills, finish terminal jobs and write the result
    async fn observe(
        &self,
        record: &mut CoordinationRecord,
        remote_id: &str,
        snapshot: JobSnapshot,
    ) -> Option<JobStatus> {
        let translation = self.backend.translate(&snapshot.native_state);
        let mut status = translation.status;
        debug!(native = %snapshot.native_state, status = %status, "polled job");

        if !status.is_terminal() && record.kill_requested() {
            match self.backend.cancel(remote_id, &snapshot.native_state).await {
                Ok(()) => {
                    info!(remote_id, "kill relayed to remote scheduler");
                    status = JobStatus::Kill;
                }
                Err(e) => warn!(remote_id, error = %e, "cancel failed, will retry"),
            }
        }

        let mut update = RecordUpdate::new().status(status);
        if let Some(time) = &snapshot.submit_time {
            update.insert(keys::SUBMIT_TIME, time.clone());
        }
        if let Some(time) = &snapshot.start_time {
            update.insert(keys::START_TIME, time.clone());
        }

        if status.is_terminal() {
            let mut message = translation.message.clone();
            match self.stager.upload_outputs(self.backend.as_ref(), remote_id).await {
                Ok(report) if !report.skipped.is_empty() => {
                    warn!(skipped = ?report.skipped, "some outputs were not uploaded");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "output upload failed");
                    message.get_or_insert_with(|| BUCKET_FAILURE_MESSAGE.to_string());
                }
            }
            let message = message.or_else(|| {
                self.backend
                    .completion_message(&snapshot, self.stager.uploads_enabled())
            });
            if let Some(message) = message {
                update.insert(keys::MESSAGE, message);
            }
            update.insert(
                keys::END_TIME,
                snapshot.end_time.clone().unwrap_or_else(now_timestamp),
            );
        }

        if let Err(e) = self.write(record, update).await {
            warn!(error = %e, "cannot write record, will retry next cycle");
            return None;
        }
        status.is_terminal().then_some(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::settings;
    use crate::backend::{HistoryEntry, MockBackendAdapter, ScriptPayload, Translation};
    use crate::error::BackendError;
    use crate::storage::tests::MemoryStore;
    use crate::storage::ObjectStore;
    use async_trait::async_trait;
    use bridge_common::crd::ScriptLocation;
    use bridge_common::record::UploadConfig;
    use bridge_common::BackendKind;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    /// Record store backed by a shared map
    #[derive(Clone, Default)]
    struct MemoryRecords {
        data: Arc<Mutex<BTreeMap<String, String>>>,
        writes: Arc<Mutex<Vec<RecordUpdate>>>,
    }

    impl MemoryRecords {
        fn with(pairs: &[(&str, &str)]) -> Self {
            let records = Self::default();
            for (k, v) in pairs {
                records
                    .data
                    .lock()
                    .unwrap()
                    .insert(k.to_string(), v.to_string());
            }
            records
        }

        fn value(&self, key: &str) -> Option<String> {
            self.data.lock().unwrap().get(key).cloned()
        }

        fn set(&self, key: &str, value: &str) {
            self.data
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
        }
    }

    #[async_trait]
    impl RecordStore for MemoryRecords {
        async fn load(&self) -> bridge_common::Result<CoordinationRecord> {
            Ok(CoordinationRecord::new(
                "sim-bridge-cm",
                self.data.lock().unwrap().clone(),
            ))
        }

        async fn write(&self, update: &RecordUpdate) -> bridge_common::Result<()> {
            let mut data = self.data.lock().unwrap();
            for (k, v) in update.entries() {
                data.insert(k.clone(), v.clone());
            }
            self.writes.lock().unwrap().push(update.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct CapturingRecorder {
        events: Mutex<Vec<(JobEvent, Option<BackendKind>)>>,
    }

    impl MetricsRecorder for CapturingRecorder {
        fn record(&self, event: JobEvent, backend: Option<BackendKind>) {
            self.events.lock().unwrap().push((event, backend));
        }

        fn record_duration(&self, _minutes: f64, _backend: Option<BackendKind>) {}
    }

    struct Harness {
        records: MemoryRecords,
        recorder: Arc<CapturingRecorder>,
        _staging: tempfile::TempDir,
        engine: WatcherEngine,
    }

    fn harness(
        records: MemoryRecords,
        backend: MockBackendAdapter,
        configure: impl FnOnce(&mut WatcherSettings),
        store: Option<MemoryStore>,
    ) -> Harness {
        let staging = tempfile::tempdir().unwrap();
        let mut settings = settings(BackendKind::Slurm, "http://127.0.0.1:1/");
        settings.poll_interval = Duration::from_millis(5);
        settings.staging_dir = staging.path().to_path_buf();
        settings.payload.script = "echo hi".to_string();
        settings.payload.script_location = ScriptLocation::Inline;
        configure(&mut settings);

        let settings = Arc::new(settings);
        let store = store.map(|s| Arc::new(s) as Arc<dyn ObjectStore>);
        let recorder = Arc::new(CapturingRecorder::default());
        let engine = WatcherEngine::new(
            settings.clone(),
            Arc::new(records.clone()),
            Arc::new(backend),
            ArtifactStager::new(settings, store),
            recorder.clone(),
        );
        Harness {
            records,
            recorder,
            _staging: staging,
            engine,
        }
    }

    /// Mock translating with the SLURM vocabulary
    fn slurm_backend() -> MockBackendAdapter {
        let mut backend = MockBackendAdapter::new();
        backend.expect_kind().return_const(BackendKind::Slurm);
        backend.expect_authenticate().returning(|| Ok(()));
        backend.expect_translate().returning(|native| {
            Translation::from(match native {
                "PENDING" => JobStatus::Pending,
                "RUNNING" => JobStatus::Running,
                "COMPLETED" => JobStatus::Done,
                "CANCELLED" => JobStatus::Kill,
                "FAILED" => JobStatus::Failed,
                _ => JobStatus::Unknown,
            })
        });
        backend.expect_output_files().returning(Vec::new);
        backend.expect_completion_message().returning(|_, _| None);
        backend
    }

    /// Poll answers in order, the last one repeating
    fn polls(backend: &mut MockBackendAdapter, states: &'static [&'static str]) {
        let mut calls = 0usize;
        backend.expect_poll().returning(move |_| {
            let state = states[calls.min(states.len() - 1)];
            calls += 1;
            Ok(JobSnapshot {
                native_state: state.to_string(),
                start_time: Some("2024-03-01T10:00:00Z".to_string()),
                end_time: (state == "COMPLETED").then(|| "2024-03-01T10:30:00Z".to_string()),
                ..Default::default()
            })
        });
    }

    fn base_record() -> MemoryRecords {
        MemoryRecords::with(&[
            ("resourceURL", "http://slurm.example/"),
            ("backend", "slurm"),
            ("updateinterval", "1"),
        ])
    }

    // =========================================================================
    // Submission
    // =========================================================================

    mod submission {
        use super::*;

        #[tokio::test]
        async fn inline_slurm_job_runs_to_done() {
            let mut backend = slurm_backend();
            backend
                .expect_submit()
                .withf(|r| r.script == ScriptPayload::Content("echo hi".to_string()))
                .times(1)
                .returning(|_| Ok("4242".to_string()));
            polls(&mut backend, &["RUNNING", "COMPLETED"]);

            let h = harness(base_record(), backend, |_| {}, None);
            let outcome = h.engine.run(CancellationToken::new()).await.unwrap();

            assert_eq!(outcome, Outcome::Finished(JobStatus::Done));
            assert_eq!(outcome.exit_code(), 0);

            let first = h.records.writes.lock().unwrap()[0].clone();
            assert_eq!(first.get(keys::REMOTE_ID), Some("4242"));
            assert_eq!(first.get(keys::STATUS), Some("SUBMITTED"));
            assert!(first.get(keys::SUBMIT_TIME).is_some());

            assert_eq!(h.records.value(keys::STATUS).as_deref(), Some("DONE"));
            assert_eq!(
                h.records.value(keys::START_TIME).as_deref(),
                Some("2024-03-01T10:00:00Z")
            );
            assert_eq!(
                h.records.value(keys::END_TIME).as_deref(),
                Some("2024-03-01T10:30:00Z")
            );
            assert_eq!(
                *h.recorder.events.lock().unwrap(),
                vec![(JobEvent::Submitted, Some(BackendKind::Slurm))]
            );
        }

        #[tokio::test]
        async fn failed_submission_is_terminal_and_not_retried() {
            let mut backend = slurm_backend();
            backend
                .expect_submit()
                .times(1)
                .returning(|_| Err(BackendError::Rejected("id 0".to_string())));
            backend.expect_poll().never();

            let h = harness(base_record(), backend, |_| {}, None);
            let outcome = h.engine.run(CancellationToken::new()).await.unwrap();

            assert_eq!(outcome, Outcome::Finished(JobStatus::Failed));
            assert_eq!(outcome.exit_code(), 1);
            assert_eq!(h.records.value(keys::STATUS).as_deref(), Some("FAILED"));
            assert_eq!(
                h.records.value(keys::MESSAGE).as_deref(),
                Some("Failed to submit a job to HPC")
            );
            assert!(h.recorder.events.lock().unwrap().is_empty());
        }

        #[tokio::test]
        async fn kill_before_submission_skips_submit() {
            let mut backend = slurm_backend();
            backend.expect_submit().never();
            let records = base_record();
            records.set(keys::KILL, "true");

            let h = harness(records, backend, |_| {}, None);
            let outcome = h.engine.run(CancellationToken::new()).await.unwrap();
            assert_eq!(outcome, Outcome::Finished(JobStatus::Kill));
            assert_eq!(h.records.value(keys::STATUS).as_deref(), Some("KILL"));
        }

        #[tokio::test]
        async fn unreadable_s3_script_fails_submission() {
            let mut backend = slurm_backend();
            backend.expect_submit().never();

            let h = harness(
                base_record(),
                backend,
                |s| {
                    s.payload.script = "code:missing.sh".to_string();
                    s.payload.script_location = ScriptLocation::S3;
                },
                Some(MemoryStore::default()),
            );
            let outcome = h.engine.run(CancellationToken::new()).await.unwrap();
            assert_eq!(outcome, Outcome::Finished(JobStatus::Failed));
        }
    }

    // =========================================================================
    // Polling
    // =========================================================================

    mod polling {
        use super::*;

        #[tokio::test]
        async fn kill_flag_cancels_and_marks_kill() {
            let mut backend = slurm_backend();
            polls(&mut backend, &["RUNNING"]);
            backend
                .expect_cancel()
                .withf(|id, native| id == "7" && native == "RUNNING")
                .times(1)
                .returning(|_, _| Ok(()));

            let records = base_record();
            records.set(keys::REMOTE_ID, "7");
            records.set(keys::STATUS, "RUNNING");
            let h = harness(records.clone(), backend, |_| {}, None);

            let engine = tokio::spawn(async move {
                let outcome = h.engine.run(CancellationToken::new()).await.unwrap();
                (outcome, h)
            });
            // the first (resume) observation runs before the flag is set
            tokio::time::sleep(Duration::from_millis(20)).await;
            records.set(keys::KILL, "true");

            let (outcome, h) = engine.await.unwrap();
            assert_eq!(outcome, Outcome::Finished(JobStatus::Kill));
            assert_eq!(outcome.exit_code(), 1);
            assert_eq!(h.records.value(keys::STATUS).as_deref(), Some("KILL"));
            assert!(h.records.value(keys::END_TIME).is_some());
        }

        #[tokio::test]
        async fn failed_cancel_keeps_polling() {
            let mut backend = slurm_backend();
            polls(&mut backend, &["RUNNING", "RUNNING", "CANCELLED"]);
            let mut attempts = 0;
            backend.expect_cancel().returning(move |_, _| {
                attempts += 1;
                Err(BackendError::Status {
                    operation: "cancel",
                    status: 500,
                    body: format!("attempt {attempts}"),
                })
            });

            let records = base_record();
            records.set(keys::REMOTE_ID, "7");
            records.set(keys::KILL, "true");
            let h = harness(records, backend, |_| {}, None);

            let outcome = h.engine.run(CancellationToken::new()).await.unwrap();
            assert_eq!(outcome, Outcome::Finished(JobStatus::Kill));
        }

        #[tokio::test]
        async fn kill_after_completion_keeps_final_status() {
            let mut backend = slurm_backend();
            polls(&mut backend, &["COMPLETED"]);
            backend.expect_cancel().never();

            let records = base_record();
            records.set(keys::REMOTE_ID, "7");
            records.set(keys::KILL, "true");
            let h = harness(records, backend, |_| {}, None);

            let outcome = h.engine.run(CancellationToken::new()).await.unwrap();
            assert_eq!(outcome, Outcome::Finished(JobStatus::Done));
            assert_eq!(outcome.exit_code(), 0);
            assert_eq!(h.records.value(keys::STATUS).as_deref(), Some("DONE"));
        }

        #[tokio::test]
        async fn kill_after_failure_keeps_failure_message() {
            let mut backend = MockBackendAdapter::new();
            backend.expect_kind().return_const(BackendKind::Quantum);
            backend.expect_authenticate().returning(|| Ok(()));
            backend
                .expect_poll()
                .returning(|_| Ok(JobSnapshot::with_state("Cancelled - Ran too long")));
            backend.expect_translate().returning(|_| Translation {
                status: JobStatus::Failed,
                message: Some("Job execution takes too long, aborted by runtime".to_string()),
            });
            backend.expect_output_files().returning(Vec::new);
            backend.expect_cancel().never();

            let records = base_record();
            records.set(keys::REMOTE_ID, "q-1");
            records.set(keys::KILL, "true");
            let h = harness(records, backend, |_| {}, None);

            let outcome = h.engine.run(CancellationToken::new()).await.unwrap();
            assert_eq!(outcome, Outcome::Finished(JobStatus::Failed));
            assert_eq!(
                h.records.value(keys::MESSAGE).as_deref(),
                Some("Job execution takes too long, aborted by runtime")
            );
        }

        #[tokio::test]
        async fn unchanged_status_is_not_rewritten() {
            let mut backend = slurm_backend();
            polls(&mut backend, &["RUNNING", "RUNNING", "RUNNING", "COMPLETED"]);
            let records = base_record();
            records.set(keys::REMOTE_ID, "7");
            let h = harness(records, backend, |_| {}, None);

            h.engine.run(CancellationToken::new()).await.unwrap();

            let statuses: Vec<Option<String>> = h
                .records
                .writes
                .lock()
                .unwrap()
                .iter()
                .map(|w| w.get(keys::STATUS).map(str::to_string))
                .collect();
            assert_eq!(
                statuses,
                vec![Some("RUNNING".to_string()), Some("DONE".to_string())]
            );
        }

        #[tokio::test]
        async fn transient_poll_errors_are_retried() {
            let mut backend = slurm_backend();
            let mut calls = 0;
            backend.expect_poll().returning(move |_| {
                calls += 1;
                match calls {
                    1 | 2 => Err(BackendError::Status {
                        operation: "poll",
                        status: 503,
                        body: String::new(),
                    }),
                    _ => Ok(JobSnapshot::with_state("FAILED")),
                }
            });
            backend.expect_history().returning(|_| Ok(None));

            let records = base_record();
            records.set(keys::REMOTE_ID, "7");
            let h = harness(records, backend, |_| {}, None);

            let outcome = h.engine.run(CancellationToken::new()).await.unwrap();
            assert_eq!(outcome, Outcome::Finished(JobStatus::Failed));
            assert_eq!(outcome.exit_code(), 1);
        }

        #[tokio::test]
        async fn shutdown_interrupts_the_loop() {
            let mut backend = slurm_backend();
            polls(&mut backend, &["RUNNING"]);
            let records = base_record();
            records.set(keys::REMOTE_ID, "7");
            let h = harness(records, backend, |_| {}, None);

            let token = CancellationToken::new();
            token.cancel();
            let outcome = h.engine.run(token).await.unwrap();
            assert_eq!(outcome, Outcome::Interrupted);
            assert_eq!(outcome.exit_code(), 1);
            assert_eq!(h.records.value(keys::STATUS).as_deref(), Some("RUNNING"));
        }
    }

    // =========================================================================
    // Resume and completion
    // =========================================================================

    mod completion {
        use super::*;

        #[tokio::test]
        async fn history_resume_finishes_without_polling_loop() {
            let mut backend = slurm_backend();
            backend.expect_poll().times(1).returning(|_| {
                Err(BackendError::Status {
                    operation: "poll",
                    status: 404,
                    body: String::new(),
                })
            });
            backend.expect_history().returning(|_| {
                Ok(Some(HistoryEntry {
                    native_state: "COMPLETED".to_string(),
                    time: Some("2024-03-01T11:00:00Z".to_string()),
                }))
            });

            let records = base_record();
            records.set(keys::REMOTE_ID, "77");
            let h = harness(records, backend, |_| {}, None);

            let outcome = h.engine.run(CancellationToken::new()).await.unwrap();
            assert_eq!(outcome, Outcome::Finished(JobStatus::Done));
            assert_eq!(h.records.value(keys::HISTORY).as_deref(), Some("true"));
            assert_eq!(
                h.records.value(keys::SUBMIT_TIME).as_deref(),
                Some("2024-03-01T11:00:00Z")
            );
            assert_eq!(
                h.records.value(keys::MESSAGE).as_deref(),
                Some("Job with id 77 found in history with state COMPLETED. Can't retrieve more information")
            );
        }

        #[tokio::test]
        async fn translation_message_wins_over_completion_message() {
            let mut backend = MockBackendAdapter::new();
            backend.expect_kind().return_const(BackendKind::Quantum);
            backend.expect_authenticate().returning(|| Ok(()));
            backend
                .expect_poll()
                .returning(|_| Ok(JobSnapshot::with_state("Cancelled - Ran too long")));
            backend.expect_translate().returning(|_| Translation {
                status: JobStatus::Failed,
                message: Some("Job execution takes too long, aborted by runtime".to_string()),
            });
            backend.expect_output_files().returning(Vec::new);
            backend.expect_completion_message().never();

            let records = base_record();
            records.set(keys::REMOTE_ID, "q-1");
            let h = harness(records, backend, |_| {}, None);

            let outcome = h.engine.run(CancellationToken::new()).await.unwrap();
            assert_eq!(outcome, Outcome::Finished(JobStatus::Failed));
            assert!(h
                .records
                .value(keys::MESSAGE)
                .unwrap()
                .contains("too long"));
        }

        #[tokio::test]
        async fn outputs_are_uploaded_when_bucket_configured() {
            let mut backend = MockBackendAdapter::new();
            backend.expect_kind().return_const(BackendKind::Lsf);
            backend.expect_authenticate().returning(|| Ok(()));
            backend.expect_poll().returning(|_| {
                Ok(JobSnapshot {
                    native_state: "DONE".to_string(),
                    working_dir: Some("/home/alice".to_string()),
                    ..Default::default()
                })
            });
            backend
                .expect_translate()
                .returning(|_| Translation::from(JobStatus::Done));
            backend
                .expect_output_files()
                .returning(|| vec!["/home/alice/sim.out".to_string()]);
            backend
                .expect_fetch_output()
                .returning(|_, _| Ok(Some(b"result".to_vec())));
            backend
                .expect_completion_message()
                .withf(|_, uploaded| *uploaded)
                .returning(|_, _| Some("see bucket".to_string()));

            let store = MemoryStore::default();
            let records = base_record();
            records.set(keys::REMOTE_ID, "318");
            let h = harness(
                records,
                backend,
                |s| {
                    s.upload = Some(UploadConfig {
                        bucket: "results".to_string(),
                        files: vec!["/home/alice/sim.out".to_string()],
                    })
                },
                Some(store.clone()),
            );

            let outcome = h.engine.run(CancellationToken::new()).await.unwrap();
            assert_eq!(outcome, Outcome::Finished(JobStatus::Done));
            assert_eq!(store.object("results", "sim/sim.out").as_deref(), Some("result"));
            assert_eq!(h.records.value(keys::MESSAGE).as_deref(), Some("see bucket"));
            assert!(h.records.value(keys::END_TIME).is_some());
        }

        #[tokio::test]
        async fn unusable_bucket_sets_message_but_finishes() {
            let mut backend = slurm_backend();
            polls(&mut backend, &["COMPLETED"]);
            let records = base_record();
            records.set(keys::REMOTE_ID, "7");
            let store = MemoryStore {
                refuse_buckets: true,
                ..Default::default()
            };
            let h = harness(
                records,
                backend,
                |s| {
                    s.upload = Some(UploadConfig {
                        bucket: "results".to_string(),
                        files: Vec::new(),
                    })
                },
                Some(store),
            );

            let outcome = h.engine.run(CancellationToken::new()).await.unwrap();
            assert_eq!(outcome, Outcome::Finished(JobStatus::Done));
            assert_eq!(
                h.records.value(keys::MESSAGE).as_deref(),
                Some(BUCKET_FAILURE_MESSAGE)
            );
        }
    }
}
