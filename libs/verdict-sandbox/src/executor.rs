/// Submission Executor - Run Aggregation
///
/// **Responsibility:**
/// Drive a submission through up to `number_of_runs` full cycles of
/// provision → write → compile → execute → classify → release, then average
/// the measurements.
///
/// **Guarantees:**
/// - Every provisioned sandbox is released before the next step, on success
///   and on failure
/// - Runs stop at the first verdict other than Accepted
/// - A compile failure ends the submission without averaging
/// - Any unclassified failure, including a panic, finalizes the submission
///   with an internal-error verdict; nothing is left in Running
///
/// This module is the glue layer - it knows nothing about:
/// - How isolate is invoked (isolate.rs / engine.rs)
/// - How verdicts are decided (evaluator.rs)
use crate::config::ResourceLimits;
use crate::engine::{CompileOutcome, Engine};
use crate::error::Result;
use crate::evaluator::{self, RunOutcome};
use crate::isolate::IsolationBackend;
use crate::sandbox::{Provisioner, Sandbox};
use crate::slots::SlotAllocator;
use crate::store::SubmissionStore;
use chrono::Utc;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};
use verdict_common::types::{Submission, SubmissionState, Verdict};

/// What one run ended with
#[derive(Debug)]
enum RunStep {
    CompileFailed { output: String },
    Classified(RunOutcome),
}

/// Per-run measurements of one submission
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunSamples {
    times: Vec<f64>,
    memories: Vec<u64>,
}

impl RunSamples {
    pub fn record(&mut self, time: f64, memory: u64) {
        self.times.push(time);
        self.memories.push(memory);
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Mean time rounded to the millisecond and mean memory truncated to the
    /// KB, or `None` when nothing was recorded
    pub fn mean(&self) -> Option<(f64, u64)> {
        if self.is_empty() {
            return None;
        }
        let count = self.times.len();
        let time = self.times.iter().sum::<f64>() / count as f64;
        let memory = self.memories.iter().sum::<u64>() / count as u64;
        Some(((time * 1000.0).round() / 1000.0, memory))
    }
}

fn describe_panic(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct Executor {
    provisioner: Provisioner,
    engine: Engine,
    slots: Arc<SlotAllocator>,
    store: Arc<dyn SubmissionStore>,
}

impl Executor {
    pub fn new(
        backend: Arc<dyn IsolationBackend>,
        limits: ResourceLimits,
        slots: Arc<SlotAllocator>,
        store: Arc<dyn SubmissionStore>,
    ) -> Result<Self> {
        Ok(Self {
            provisioner: Provisioner::new(backend.clone()),
            engine: Engine::new(backend, limits)?,
            slots,
            store,
        })
    }

    async fn persist(&self, submission: &Submission) {
        if let Err(e) = self.store.save(submission).await {
            // Non-fatal - the verdict stands
            error!(submission_id = submission.id, error = %e, "Failed to persist submission");
        }
    }

    /// Judge a submission and return the finalized record
    ///
    /// Never fails: every outcome, including internal failures, is recorded
    /// on the returned submission and persisted.
    #[tracing::instrument(
        skip_all,
        fields(
            submission_id = submission.id,
            language = %submission.language.name,
            runs = submission.number_of_runs
        )
    )]
    pub async fn judge(&self, mut submission: Submission) -> Submission {
        submission.state = SubmissionState::Running;
        submission.verdict = None;
        self.persist(&submission).await;

        let result = AssertUnwindSafe(self.run_all(&mut submission))
            .catch_unwind()
            .await;

        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => Some(format!("panic: {}", describe_panic(payload.as_ref()))),
        };

        if let Some(description) = failure {
            error!(error = %description, "Submission failed with an internal error");
            submission.mark_failed(description);
        }

        info!(
            verdict = ?submission.verdict,
            state = ?submission.state,
            time = ?submission.time,
            memory = ?submission.memory,
            "Submission finalized"
        );
        self.persist(&submission).await;
        submission
    }

    async fn run_all(&self, submission: &mut Submission) -> Result<()> {
        let lease = self.slots.acquire(submission.id).await?;
        let slot = lease.slot();
        let runs = submission.number_of_runs.max(1);
        let mut samples = RunSamples::default();

        for run in 1..=runs {
            let step = self.run_once(submission, slot).await?;

            match step {
                RunStep::CompileFailed { output } => {
                    info!(run, slot, "Compilation failed; no further runs");
                    submission.stdout = String::new();
                    submission.stderr = output;
                    submission.verdict = Some(Verdict::CompileError);
                    submission.finished_at = Some(Utc::now());
                    submission.state = SubmissionState::Completed;
                    return Ok(());
                }
                RunStep::Classified(outcome) => {
                    info!(
                        run,
                        slot,
                        verdict = ?outcome.verdict,
                        time = outcome.time,
                        memory = outcome.memory,
                        "Run classified"
                    );
                    samples.record(outcome.time, outcome.memory);
                    outcome.apply_to(submission);
                    self.persist(submission).await;

                    if !outcome.verdict.is_accepted() {
                        if run < runs {
                            warn!(run, remaining = runs - run, "Stopping early");
                        }
                        break;
                    }
                }
            }
        }

        if let Some((time, memory)) = samples.mean() {
            submission.time = Some(time);
            submission.memory = Some(memory);
        }
        submission.state = SubmissionState::Completed;
        Ok(())
    }

    /// One full cycle on `slot`; the box is cleaned before the lease can be
    /// handed on, including when init fails halfway or the run panics
    async fn run_once(&self, submission: &Submission, slot: u32) -> Result<RunStep> {
        let sandbox = match self
            .provisioner
            .init(slot, &submission.language.source_file)
            .await
        {
            Ok(sandbox) => sandbox,
            Err(e) => {
                self.provisioner.cleanup(slot).await;
                return Err(e);
            }
        };

        let step = AssertUnwindSafe(self.drive(&sandbox, submission))
            .catch_unwind()
            .await;
        sandbox.release().await;
        match step {
            Ok(step) => step,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    async fn drive(&self, sandbox: &Sandbox, submission: &Submission) -> Result<RunStep> {
        let handle = sandbox.handle();
        sandbox
            .write_artifacts(&submission.source_code, &submission.input)
            .await?;

        if let CompileOutcome::Failed { output } =
            self.engine.compile(handle, &submission.language).await?
        {
            return Ok(RunStep::CompileFailed { output });
        }

        let artifacts = self.engine.execute(handle, &submission.language).await?;
        Ok(RunStep::Classified(evaluator::evaluate(
            &artifacts,
            submission.expected_output.as_deref(),
            Utc::now(),
        )))
    }
}
