/// Execution Engine - Compile and Execution Stages
///
/// **Core Responsibility:**
/// Build the submission inside its box and run it under resource limits,
/// returning the raw artifacts for the evaluator.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to compile and run (commands, limits, file layout)
/// - Engine does NOT decide verdicts
/// - Engine does NOT interpret the isolation tool's exit status
/// - Engine reads artifacts only after the run has returned
use crate::config::ResourceLimits;
use crate::error::{Result, SandboxError};
use crate::evaluator::RunArtifacts;
use crate::isolate::{IsolationBackend, RunSpec};
use crate::report::ResourceReport;
use crate::sandbox::{SandboxHandle, STDERR_FILE, STDIN_FILE, STDOUT_FILE};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use verdict_common::types::LanguageSpec;

/// Result of the compile stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    /// Interpreted language, nothing to build
    Skipped,
    Succeeded,
    /// Non-zero exit; `output` is the combined stdout and stderr
    Failed { output: String },
}

async fn kill_process_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            warn!(pid, error = %e, "Failed to kill compiler process group");
        }
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "Failed to reap compiler");
    }
}

/// Read a file the sandbox may not have produced; absent files read as empty
async fn read_optional(path: &Path) -> Result<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(SandboxError::io(format!("Failed to read {}", path.display()), e)),
    }
}

pub struct Engine {
    backend: Arc<dyn IsolationBackend>,
    limits: ResourceLimits,
}

impl Engine {
    pub fn new(backend: Arc<dyn IsolationBackend>, limits: ResourceLimits) -> Result<Self> {
        limits.validate()?;
        Ok(Self { backend, limits })
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Run the language's compile command with the box as working directory
    ///
    /// The command is operator configuration and runs through `/bin/sh`
    /// as-is; stdout and stderr share one file so their interleaving survives.
    #[tracing::instrument(skip_all, fields(slot = handle.slot(), language = %language.name))]
    pub async fn compile(
        &self,
        handle: &SandboxHandle,
        language: &LanguageSpec,
    ) -> Result<CompileOutcome> {
        let compile_cmd = match language.compile_cmd.as_deref() {
            Some(cmd) if !cmd.trim().is_empty() => cmd,
            _ => return Ok(CompileOutcome::Skipped),
        };

        let output_path = handle.compile_output_path();
        let output_file = std::fs::File::create(&output_path).map_err(|e| {
            SandboxError::io(
                format!("Failed to create compile output {}", output_path.display()),
                e,
            )
        })?;
        let output_clone = output_file
            .try_clone()
            .map_err(|e| SandboxError::io("Failed to share compile output file", e))?;

        let start = Instant::now();
        // Own process group, so a timeout takes down everything the shell started
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(compile_cmd)
            .current_dir(handle.box_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::from(output_file))
            .stderr(Stdio::from(output_clone))
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SandboxError::Spawn {
                program: "/bin/sh".to_string(),
                source,
            })?;

        let limit = self.limits.compile_time_limit;
        let status = match timeout(Duration::from_secs_f64(limit), child.wait()).await {
            Ok(status) => {
                Some(status.map_err(|e| SandboxError::io("Failed to wait for compiler", e))?)
            }
            Err(_) => {
                kill_process_group(&mut child).await;
                None
            }
        };
        let compilation_time_ms = start.elapsed().as_millis() as u64;

        let mut output =
            String::from_utf8_lossy(&read_optional(&output_path).await?).into_owned();

        let Some(status) = status else {
            warn!(compilation_time_ms, limit, "Compilation timed out");
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&format!("Compilation exceeded the time limit of {}s", limit));
            return Ok(CompileOutcome::Failed { output });
        };

        if status.success() {
            info!(compilation_time_ms, "Compilation succeeded");
            Ok(CompileOutcome::Succeeded)
        } else {
            warn!(
                compilation_time_ms,
                exit_code = ?status.code(),
                error_preview = output.lines().next().unwrap_or(""),
                "Compilation failed"
            );
            Ok(CompileOutcome::Failed { output })
        }
    }

    /// Run the program inside the sandbox and collect its artifacts
    #[tracing::instrument(skip_all, fields(slot = handle.slot(), language = %language.name))]
    pub async fn execute(
        &self,
        handle: &SandboxHandle,
        language: &LanguageSpec,
    ) -> Result<RunArtifacts> {
        let command: Vec<String> = language
            .run_cmd
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if command.is_empty() {
            return Err(SandboxError::EmptyCommand(language.name.clone()));
        }

        let spec = RunSpec {
            stdin_file: STDIN_FILE.to_string(),
            stdout_file: STDOUT_FILE.to_string(),
            stderr_file: STDERR_FILE.to_string(),
            report_path: handle.report_path(),
            home: handle.workdir().to_path_buf(),
            command,
        };

        let start = Instant::now();
        self.backend.run(handle.slot(), &spec, &self.limits).await?;
        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandboxed run returned"
        );

        let report_path = handle.report_path();
        let stdout_path = handle.stdout_path();
        let stderr_path = handle.stderr_path();
        self.backend
            .reclaim_ownership(&[
                handle.box_dir(),
                report_path.as_path(),
                stdout_path.as_path(),
                stderr_path.as_path(),
            ])
            .await?;

        let report = ResourceReport::load(&report_path).await?;
        let stdout = read_optional(&stdout_path).await?;
        let stderr = read_optional(&stderr_path).await?;

        if report.is_empty() {
            warn!(slot = handle.slot(), "Resource report is empty");
        }
        debug!(
            status = ?report.status(),
            time = ?report.cpu_time(),
            wall_time = ?report.wall_time(),
            memory_kb = ?report.memory_kb(),
            exit_code = ?report.exit_code(),
            killed = report.killed(),
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            "Artifacts collected"
        );

        Ok(RunArtifacts {
            report,
            stdout,
            stderr,
        })
    }
}
