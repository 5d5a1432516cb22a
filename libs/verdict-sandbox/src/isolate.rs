/// Isolation Tool Boundary
///
/// **Responsibility:**
/// Drive the external `isolate` binary: allocate a box, run a program in it
/// under resource limits, release it.
///
/// **Boundary:**
/// - Knows the isolate command line and nothing about verdicts
/// - Never interprets the exit status of a `--run` invocation; the outcome
///   lives in the meta file the tool writes
/// - Arguments are built as a list, never a shell string
use crate::config::{ResourceLimits, SandboxSettings};
use crate::error::{Result, SandboxError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Everything the tool needs for one `--run` besides the limits
#[derive(Debug, Clone, PartialEq)]
pub struct RunSpec {
    /// Names relative to the box directory
    pub stdin_file: String,
    pub stdout_file: String,
    pub stderr_file: String,
    /// Host path of the meta file
    pub report_path: PathBuf,
    /// Pinned as HOME inside the sandbox
    pub home: PathBuf,
    /// argv of the program, resolved inside the box
    pub command: Vec<String>,
}

/// The operations the pipeline needs from an isolation tool
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Allocate a fresh sandbox for `slot` and return its working directory.
    /// The private area is `<workdir>/box`.
    async fn init(&self, slot: u32) -> Result<PathBuf>;

    /// Run a program inside the sandbox. Returns once the tool has returned.
    async fn run(&self, slot: u32, spec: &RunSpec, limits: &ResourceLimits) -> Result<()>;

    /// Release the sandbox. Must succeed for slots that are not initialized.
    async fn cleanup(&self, slot: u32) -> Result<()>;

    /// Make files written by the sandbox readable by this process
    async fn reclaim_ownership(&self, paths: &[&Path]) -> Result<()>;
}

fn format_seconds(value: f64) -> String {
    // isolate accepts fractional seconds; avoid exponent notation
    let text = format!("{:.3}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text.is_empty() {
        "0".to_string()
    } else {
        text.to_string()
    }
}

/// Structured `isolate` argument list
#[derive(Debug, Clone, PartialEq)]
pub struct IsolateCommand {
    args: Vec<String>,
}

impl IsolateCommand {
    fn base(settings: &SandboxSettings, slot: u32) -> Vec<String> {
        let mut args = Vec::new();
        if settings.use_cgroups {
            args.push("--cg".to_string());
        }
        if settings.verbose {
            args.push("--verbose".to_string());
        }
        args.push(format!("--box-id={}", slot));
        args
    }

    pub fn init(settings: &SandboxSettings, slot: u32) -> Self {
        let mut args = Self::base(settings, slot);
        args.push("--init".to_string());
        Self { args }
    }

    pub fn cleanup(settings: &SandboxSettings, slot: u32) -> Self {
        let mut args = Self::base(settings, slot);
        args.push("--cleanup".to_string());
        Self { args }
    }

    pub fn run(
        settings: &SandboxSettings,
        slot: u32,
        spec: &RunSpec,
        limits: &ResourceLimits,
    ) -> Result<Self> {
        limits.validate()?;
        if spec.command.is_empty() {
            return Err(SandboxError::EmptyCommand(String::new()));
        }

        let mut args = Self::base(settings, slot);
        args.push(format!("--stdin={}", spec.stdin_file));
        args.push(format!("--stdout={}", spec.stdout_file));
        args.push(format!("--stderr={}", spec.stderr_file));
        args.push(format!("--meta={}", spec.report_path.display()));
        args.push(format!("--time={}", format_seconds(limits.cpu_time_limit)));
        args.push(format!("--extra-time={}", format_seconds(limits.cpu_extra_time)));
        args.push(format!("--wall-time={}", format_seconds(limits.wall_time_limit)));
        args.push(format!("--stack={}", limits.stack_limit_kb));
        args.push(format!("--processes={}", limits.max_processes));
        if limits.per_process_memory {
            args.push(format!("--mem={}", limits.memory_limit_kb));
        } else {
            args.push(format!("--cg-mem={}", limits.memory_limit_kb));
        }
        if !limits.per_process_timing {
            args.push("--cg-timing".to_string());
        }
        args.push(format!("--fsize={}", limits.max_file_size_kb));
        args.push(format!("--env=HOME={}", spec.home.display()));
        args.push("--dir=/etc:noexec".to_string());
        args.push("--run".to_string());
        args.push("--".to_string());
        args.extend(spec.command.iter().cloned());

        Ok(Self { args })
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// Backend invoking the real `isolate` binary
pub struct IsolateCli {
    settings: SandboxSettings,
}

impl IsolateCli {
    pub fn new(settings: SandboxSettings) -> Self {
        Self { settings }
    }

    async fn invoke(&self, command: &IsolateCommand) -> Result<std::process::Output> {
        let program = self.settings.isolate_bin.display().to_string();
        debug!(program = %program, args = ?command.args(), "Invoking isolate");

        Command::new(&self.settings.isolate_bin)
            .args(command.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| SandboxError::Spawn { program, source })
    }
}

#[async_trait]
impl IsolationBackend for IsolateCli {
    async fn init(&self, slot: u32) -> Result<PathBuf> {
        let output = self.invoke(&IsolateCommand::init(&self.settings, slot)).await?;

        if !output.status.success() {
            return Err(SandboxError::Tool {
                operation: "init",
                slot,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let workdir = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if workdir.is_empty() {
            return Err(SandboxError::Tool {
                operation: "init",
                slot,
                message: "no working directory reported".to_string(),
            });
        }

        Ok(PathBuf::from(workdir))
    }

    async fn run(&self, slot: u32, spec: &RunSpec, limits: &ResourceLimits) -> Result<()> {
        let command = IsolateCommand::run(&self.settings, slot, spec, limits)?;
        let output = self.invoke(&command).await?;

        // Non-zero is expected whenever the program fails; the meta file says why
        debug!(
            slot,
            status = ?output.status.code(),
            "isolate run returned"
        );
        if self.settings.verbose && !output.stderr.is_empty() {
            debug!(slot, isolate_stderr = %String::from_utf8_lossy(&output.stderr), "isolate diagnostics");
        }
        Ok(())
    }

    async fn cleanup(&self, slot: u32) -> Result<()> {
        let output = self
            .invoke(&IsolateCommand::cleanup(&self.settings, slot))
            .await?;

        if !output.status.success() {
            warn!(
                slot,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "isolate cleanup reported a failure; treating slot as released"
            );
        }
        Ok(())
    }

    async fn reclaim_ownership(&self, paths: &[&Path]) -> Result<()> {
        if !self.settings.fix_permissions || paths.is_empty() {
            return Ok(());
        }

        let owner = format!(
            "{}:{}",
            nix::unistd::Uid::current(),
            nix::unistd::Gid::current()
        );

        let output = Command::new("sudo")
            .arg("chown")
            .arg(&owner)
            .args(paths)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| SandboxError::Spawn {
                program: "sudo".to_string(),
                source,
            })?;

        if !output.status.success() {
            // Missing files are reported when they are read
            warn!(
                owner = %owner,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Failed to reclaim ownership of sandbox files"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> RunSpec {
        RunSpec {
            stdin_file: "stdin.txt".to_string(),
            stdout_file: "stdout.txt".to_string(),
            stderr_file: "stderr.txt".to_string(),
            report_path: PathBuf::from("/var/local/lib/isolate/7/box/meta.txt"),
            home: PathBuf::from("/var/local/lib/isolate/7"),
            command: vec!["/usr/bin/python3".to_string(), "script.py".to_string()],
        }
    }

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(5.0), "5");
        assert_eq!(format_seconds(0.5), "0.5");
        assert_eq!(format_seconds(2.25), "2.25");
        assert_eq!(format_seconds(0.0), "0");
        assert_eq!(format_seconds(1e-7), "0");
    }

    #[test]
    fn test_init_and_cleanup_args() {
        let settings = SandboxSettings::default();
        assert_eq!(
            IsolateCommand::init(&settings, 3).args(),
            ["--cg", "--box-id=3", "--init"]
        );
        assert_eq!(
            IsolateCommand::cleanup(&settings, 3).args(),
            ["--cg", "--box-id=3", "--cleanup"]
        );

        let settings = SandboxSettings {
            use_cgroups: false,
            verbose: true,
            ..SandboxSettings::default()
        };
        assert_eq!(
            IsolateCommand::init(&settings, 0).args(),
            ["--verbose", "--box-id=0", "--init"]
        );
    }

    #[test]
    fn test_run_args_with_cgroup_limits() {
        let settings = SandboxSettings::default();
        let limits = ResourceLimits::default();

        let command = IsolateCommand::run(&settings, 7, &spec(), &limits).unwrap();
        let expected = [
            "--cg",
            "--box-id=7",
            "--stdin=stdin.txt",
            "--stdout=stdout.txt",
            "--stderr=stderr.txt",
            "--meta=/var/local/lib/isolate/7/box/meta.txt",
            "--time=5",
            "--extra-time=1",
            "--wall-time=10",
            "--stack=64000",
            "--processes=60",
            "--cg-mem=128000",
            "--cg-timing",
            "--fsize=1024",
            "--env=HOME=/var/local/lib/isolate/7",
            "--dir=/etc:noexec",
            "--run",
            "--",
            "/usr/bin/python3",
            "script.py",
        ];
        assert_eq!(command.args(), expected);
    }

    #[test]
    fn test_run_args_with_per_process_limits() {
        let settings = SandboxSettings::default();
        let limits = ResourceLimits {
            per_process_memory: true,
            per_process_timing: true,
            cpu_extra_time: 0.5,
            ..ResourceLimits::default()
        };

        let command = IsolateCommand::run(&settings, 7, &spec(), &limits).unwrap();
        let args = command.args();

        assert!(args.contains(&"--mem=128000".to_string()));
        assert!(args.contains(&"--extra-time=0.5".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--cg-mem")));
        assert!(!args.contains(&"--cg-timing".to_string()));
    }

    #[test]
    fn test_run_args_keep_program_arguments_verbatim() {
        let mut spec = spec();
        spec.command = vec!["./a.out".to_string(), "$(rm -rf /)".to_string()];

        let command =
            IsolateCommand::run(&SandboxSettings::default(), 1, &spec, &ResourceLimits::default())
                .unwrap();
        assert_eq!(command.args().last().unwrap(), "$(rm -rf /)");
    }

    #[test]
    fn test_run_rejects_invalid_limits() {
        let limits = ResourceLimits {
            memory_limit_kb: 0,
            ..ResourceLimits::default()
        };
        let result = IsolateCommand::run(&SandboxSettings::default(), 1, &spec(), &limits);
        assert!(matches!(result, Err(SandboxError::InvalidLimit { .. })));
    }

    #[test]
    fn test_run_rejects_empty_command() {
        let mut spec = spec();
        spec.command.clear();
        let result =
            IsolateCommand::run(&SandboxSettings::default(), 1, &spec, &ResourceLimits::default());
        assert!(matches!(result, Err(SandboxError::EmptyCommand(_))));
    }

    /// Requires the isolate binary and permission to use it
    #[tokio::test]
    #[ignore]
    async fn test_real_isolate_init_cleanup_is_idempotent() {
        let backend = IsolateCli::new(SandboxSettings::default());

        let workdir = backend.init(999).await.expect("isolate init");
        assert!(workdir.join("box").exists());

        backend.cleanup(999).await.unwrap();
        backend.cleanup(999).await.unwrap();

        let workdir = backend.init(999).await.expect("re-init after double cleanup");
        assert!(workdir.join("box").exists());
        backend.cleanup(999).await.unwrap();
    }
}
