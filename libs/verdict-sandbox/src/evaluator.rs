/// Verdict Classifier
///
/// **Core Responsibility:**
/// Turn one run's resource report and captured output into a verdict.
///
/// **Critical Properties:**
/// - Knows nothing about isolate invocation or slots
/// - Pure: (report, expected output, actual output) → verdict
/// - Never fails: undecodable output is repaired, missing report keys are
///   treated as absent
///
/// **Decision order (first match wins):**
/// 1. status TO → Time Limit Exceeded
/// 2. status SG → runtime error named after the signal
/// 3. status RE → runtime error (NZEC)
/// 4. status XX → Internal Error
/// 5. no expected output, or outputs equal after normalization → Accepted
/// 6. otherwise → Wrong Answer
///
/// **Normalization Rules:**
/// - Trailing whitespace stripped from every line: YES
/// - Trailing whitespace stripped from the whole text: YES
/// - Leading whitespace: preserved
/// - Case sensitivity: YES (exact match required)
use crate::report::{ReportStatus, ResourceReport};
use chrono::{DateTime, Utc};
use verdict_common::types::{RuntimeErrorKind, Submission, Verdict};

/// Raw artifacts of one execution, read back from the box
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    pub report: ResourceReport,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Classified result of one run
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub verdict: Verdict,
    /// CPU seconds, 0.0 when the report has none
    pub time: f64,
    /// KB, 0 when the report has none
    pub memory: u64,
    pub stdout: String,
    pub stderr: String,
    pub finished_at: DateTime<Utc>,
}

impl RunOutcome {
    /// Copy this run's result onto the submission record
    pub fn apply_to(&self, submission: &mut Submission) {
        submission.verdict = Some(self.verdict);
        submission.time = Some(self.time);
        submission.memory = Some(self.memory);
        submission.stdout = self.stdout.clone();
        submission.stderr = self.stderr.clone();
        submission.finished_at = Some(self.finished_at);
    }
}

/// Trailing ASCII whitespace and NUL padding; Unicode spaces are content
fn trim_trailing(s: &str) -> &str {
    s.trim_end_matches(|c: char| c.is_ascii_whitespace() || c == '\0')
}

/// Normalize output for comparison
pub fn normalize_output(output: &str) -> String {
    let joined = output
        .split('\n')
        .map(trim_trailing)
        .collect::<Vec<_>>()
        .join("\n");
    trim_trailing(&joined).to_string()
}

pub fn outputs_match(expected: &str, actual: &str) -> bool {
    normalize_output(expected) == normalize_output(actual)
}

/// Decode captured bytes, replacing invalid sequences with U+FFFD
pub fn repair_encoding(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Decide the verdict for one run
pub fn classify(report: &ResourceReport, expected_output: Option<&str>, stdout: &str) -> Verdict {
    match report.status() {
        Some(ReportStatus::TimedOut) => Verdict::TimeLimitExceeded,
        Some(ReportStatus::Signalled) => Verdict::RuntimeError(
            // A signalled report without a signal number still is a crash
            report
                .exit_signal()
                .map(RuntimeErrorKind::from_signal)
                .unwrap_or(RuntimeErrorKind::Other(0)),
        ),
        Some(ReportStatus::RuntimeError) => Verdict::RuntimeError(RuntimeErrorKind::Nzec),
        Some(ReportStatus::SandboxError) => Verdict::InternalError,
        _ => match expected_output {
            None => Verdict::Accepted,
            Some(expected) if outputs_match(expected, stdout) => Verdict::Accepted,
            Some(_) => Verdict::WrongAnswer,
        },
    }
}

/// Classify a run and collect everything the record needs from it
pub fn evaluate(
    artifacts: &RunArtifacts,
    expected_output: Option<&str>,
    finished_at: DateTime<Utc>,
) -> RunOutcome {
    let stdout = repair_encoding(&artifacts.stdout);
    let mut stderr = repair_encoding(&artifacts.stderr);
    let report = &artifacts.report;

    let verdict = classify(report, expected_output, &stdout);

    if verdict == Verdict::InternalError {
        let message = report
            .message()
            .map(str::to_string)
            .unwrap_or_else(|| "isolate reported an internal error without a message".to_string());
        if !stderr.is_empty() {
            stderr.push('\n');
        }
        stderr.push_str(&message);
    }

    RunOutcome {
        verdict,
        time: report.cpu_time().unwrap_or(0.0),
        memory: report.memory_kb().unwrap_or(0),
        stdout,
        stderr,
        finished_at,
    }
}
