use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a submission's source is materialized, built and run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageSpec {
    pub name: String,
    pub source_file: String,
    /// Absent for interpreted languages: `run_cmd` executes the source directly
    #[serde(default)]
    pub compile_cmd: Option<String>,
    pub run_cmd: String,
}

impl LanguageSpec {
    pub fn is_compiled(&self) -> bool {
        self.compile_cmd
            .as_deref()
            .map(|cmd| !cmd.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Lifecycle of a submission record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// Which flavour of runtime error a run ended with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeErrorKind {
    Sigsegv,
    Sigxfsz,
    Sigfpe,
    Sigabrt,
    /// Program exited with a non-zero exit code
    Nzec,
    /// Killed by a signal without a dedicated status
    Other(i32),
}

impl RuntimeErrorKind {
    pub fn from_signal(signal: i32) -> Self {
        match signal {
            11 => RuntimeErrorKind::Sigsegv,
            25 => RuntimeErrorKind::Sigxfsz,
            8 => RuntimeErrorKind::Sigfpe,
            6 => RuntimeErrorKind::Sigabrt,
            other => RuntimeErrorKind::Other(other),
        }
    }
}

/// Outcome of a single run. Exactly one is produced per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    CompileError,
    RuntimeError(RuntimeErrorKind),
    InternalError,
}

impl Verdict {
    /// Stable numeric status id, shared with queue states (1 and 2)
    pub fn id(&self) -> u8 {
        match self {
            Verdict::Accepted => 3,
            Verdict::WrongAnswer => 4,
            Verdict::TimeLimitExceeded => 5,
            Verdict::CompileError => 6,
            Verdict::RuntimeError(RuntimeErrorKind::Sigsegv) => 7,
            Verdict::RuntimeError(RuntimeErrorKind::Sigxfsz) => 8,
            Verdict::RuntimeError(RuntimeErrorKind::Sigfpe) => 9,
            Verdict::RuntimeError(RuntimeErrorKind::Sigabrt) => 10,
            Verdict::RuntimeError(RuntimeErrorKind::Nzec) => 11,
            Verdict::RuntimeError(RuntimeErrorKind::Other(_)) => 12,
            Verdict::InternalError => 13,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Verdict::Accepted => "Accepted",
            Verdict::WrongAnswer => "Wrong Answer",
            Verdict::TimeLimitExceeded => "Time Limit Exceeded",
            Verdict::CompileError => "Compilation Error",
            Verdict::RuntimeError(RuntimeErrorKind::Sigsegv) => "Runtime Error (SIGSEGV)",
            Verdict::RuntimeError(RuntimeErrorKind::Sigxfsz) => "Runtime Error (SIGXFSZ)",
            Verdict::RuntimeError(RuntimeErrorKind::Sigfpe) => "Runtime Error (SIGFPE)",
            Verdict::RuntimeError(RuntimeErrorKind::Sigabrt) => "Runtime Error (SIGABRT)",
            Verdict::RuntimeError(RuntimeErrorKind::Nzec) => "Runtime Error (NZEC)",
            Verdict::RuntimeError(RuntimeErrorKind::Other(_)) => "Runtime Error (Other)",
            Verdict::InternalError => "Internal Error",
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

fn default_runs() -> u32 {
    1
}

/// A submission record as stored by the producer and updated by the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: u64,
    pub source_code: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub expected_output: Option<String>,
    pub language: LanguageSpec,
    #[serde(default = "default_runs")]
    pub number_of_runs: u32,

    #[serde(default)]
    pub state: SubmissionState,
    #[serde(default)]
    pub verdict: Option<Verdict>,
    /// CPU seconds
    #[serde(default)]
    pub time: Option<f64>,
    /// Kilobytes
    #[serde(default)]
    pub memory: Option<u64>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Submission {
    pub fn new(id: u64, language: LanguageSpec, source_code: impl Into<String>) -> Self {
        Self {
            id,
            source_code: source_code.into(),
            input: String::new(),
            expected_output: None,
            language,
            number_of_runs: 1,
            state: SubmissionState::Pending,
            verdict: None,
            time: None,
            memory: None,
            stdout: String::new(),
            stderr: String::new(),
            finished_at: None,
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = input.into();
        self
    }

    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = Some(expected.into());
        self
    }

    pub fn with_runs(mut self, runs: u32) -> Self {
        self.number_of_runs = runs;
        self
    }

    /// Numeric status: 1 in queue, 2 processing, otherwise the verdict id
    pub fn status_id(&self) -> u8 {
        match (self.state, self.verdict) {
            (_, Some(verdict)) => verdict.id(),
            (SubmissionState::Running, None) => 2,
            _ => 1,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            SubmissionState::Completed | SubmissionState::Failed
        )
    }

    /// Finalize as an internal error, keeping whatever measurements exist
    pub fn mark_failed(&mut self, description: impl Into<String>) {
        self.stderr = description.into();
        self.verdict = Some(Verdict::InternalError);
        self.state = SubmissionState::Failed;
        self.finished_at = Some(Utc::now());
    }
}
