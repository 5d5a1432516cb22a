//! In-process isolation backend for tests.
//!
//! Boxes are plain directories under a temporary root; every `run` pops the
//! next scripted result and writes it where isolate would.

use crate::config::ResourceLimits;
use crate::error::{Result, SandboxError};
use crate::isolate::{IsolationBackend, RunSpec};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Init(u32),
    Run(u32),
    Cleanup(u32),
}

/// What the "sandboxed program" produces on one run
#[derive(Debug, Clone, Default)]
pub struct ScriptedRun {
    pub report: String,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ScriptedRun {
    pub fn ok(time: f64, memory: u64, stdout: &str) -> Self {
        Self {
            report: format!("time:{}\ntime-wall:{}\ncg-mem:{}\nexitcode:0\n", time, time, memory),
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        }
    }

    pub fn with_report(report: &str) -> Self {
        Self {
            report: report.to_string(),
            ..Self::default()
        }
    }
}

pub struct ScriptedIsolate {
    root: TempDir,
    runs: Mutex<VecDeque<ScriptedRun>>,
    calls: Mutex<Vec<Call>>,
    commands: Mutex<Vec<Vec<String>>>,
    fail_init: AtomicBool,
    skip_report: AtomicBool,
    panic_on_run: AtomicBool,
    stall_cleanup: AtomicBool,
}

impl ScriptedIsolate {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().expect("temp root"),
            runs: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            fail_init: AtomicBool::new(false),
            skip_report: AtomicBool::new(false),
            panic_on_run: AtomicBool::new(false),
            stall_cleanup: AtomicBool::new(false),
        }
    }

    pub fn with_runs(runs: impl IntoIterator<Item = ScriptedRun>) -> Self {
        let backend = Self::new();
        backend.runs.lock().unwrap().extend(runs);
        backend
    }

    pub fn fail_init(&self) {
        self.fail_init.store(true, Ordering::SeqCst);
    }

    /// Make `run` return without writing a meta file
    pub fn skip_report(&self) {
        self.skip_report.store(true, Ordering::SeqCst);
    }

    /// Make the next `cleanup` hang until its future is dropped
    pub fn stall_cleanup(&self) {
        self.stall_cleanup.store(true, Ordering::SeqCst);
    }

    /// Make the next `run` panic
    pub fn panic_on_run(&self) {
        self.panic_on_run.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn run_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Run(_)))
            .count()
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().unwrap().clone()
    }

    pub fn workdir(&self, slot: u32) -> PathBuf {
        self.root.path().join(slot.to_string())
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

fn write(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes)
        .map_err(|e| SandboxError::io(format!("scripted write {}", path.display()), e))
}

#[async_trait]
impl IsolationBackend for ScriptedIsolate {
    async fn init(&self, slot: u32) -> Result<PathBuf> {
        self.record(Call::Init(slot));
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(SandboxError::Tool {
                operation: "init",
                slot,
                message: "Box already exists".to_string(),
            });
        }

        let workdir = self.workdir(slot);
        if workdir.exists() {
            std::fs::remove_dir_all(&workdir).map_err(|e| SandboxError::io("scripted reset", e))?;
        }
        std::fs::create_dir_all(workdir.join("box"))
            .map_err(|e| SandboxError::io("scripted init", e))?;
        Ok(workdir)
    }

    async fn run(&self, slot: u32, spec: &RunSpec, _limits: &ResourceLimits) -> Result<()> {
        self.record(Call::Run(slot));
        self.commands.lock().unwrap().push(spec.command.clone());
        if self.panic_on_run.swap(false, Ordering::SeqCst) {
            panic!("scripted run panicked");
        }

        let scripted = self.runs.lock().unwrap().pop_front().unwrap_or_default();
        let box_dir = self.workdir(slot).join("box");

        if !self.skip_report.load(Ordering::SeqCst) {
            write(&spec.report_path, scripted.report.as_bytes())?;
        }
        write(&box_dir.join(&spec.stdout_file), &scripted.stdout)?;
        write(&box_dir.join(&spec.stderr_file), &scripted.stderr)?;
        Ok(())
    }

    async fn cleanup(&self, slot: u32) -> Result<()> {
        self.record(Call::Cleanup(slot));
        if self.stall_cleanup.swap(false, Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let workdir = self.workdir(slot);
        if workdir.exists() {
            std::fs::remove_dir_all(&workdir)
                .map_err(|e| SandboxError::io("scripted cleanup", e))?;
        }
        Ok(())
    }

    async fn reclaim_ownership(&self, _paths: &[&Path]) -> Result<()> {
        Ok(())
    }
}
