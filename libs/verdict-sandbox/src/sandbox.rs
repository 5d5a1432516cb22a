//! Sandbox provisioning and artifact writing.
//!
//! A [`Sandbox`] is the scoped acquisition of one isolate box: it is created
//! by [`Provisioner::init`] and released exactly once, either explicitly with
//! [`Sandbox::release`] or, if the owner never got that far (panic, task
//! cancellation), from `Drop`.

use crate::error::{Result, SandboxError};
use crate::isolate::IsolationBackend;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub const STDIN_FILE: &str = "stdin.txt";
pub const STDOUT_FILE: &str = "stdout.txt";
pub const STDERR_FILE: &str = "stderr.txt";
pub const META_FILE: &str = "meta.txt";
pub const COMPILE_OUTPUT_FILE: &str = "compile_output.txt";

/// Paths of one provisioned box
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxHandle {
    slot: u32,
    workdir: PathBuf,
    box_dir: PathBuf,
    source_file: String,
}

impl SandboxHandle {
    pub fn new(slot: u32, workdir: PathBuf, source_file: impl Into<String>) -> Self {
        let box_dir = workdir.join("box");
        Self {
            slot,
            workdir,
            box_dir,
            source_file: source_file.into(),
        }
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn box_dir(&self) -> &Path {
        &self.box_dir
    }

    pub fn source_path(&self) -> PathBuf {
        self.box_dir.join(&self.source_file)
    }

    pub fn stdin_path(&self) -> PathBuf {
        self.box_dir.join(STDIN_FILE)
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.box_dir.join(STDOUT_FILE)
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.box_dir.join(STDERR_FILE)
    }

    pub fn report_path(&self) -> PathBuf {
        self.box_dir.join(META_FILE)
    }

    pub fn compile_output_path(&self) -> PathBuf {
        self.box_dir.join(COMPILE_OUTPUT_FILE)
    }
}

/// Allocates sandboxes from the isolation backend
#[derive(Clone)]
pub struct Provisioner {
    backend: Arc<dyn IsolationBackend>,
}

impl Provisioner {
    pub fn new(backend: Arc<dyn IsolationBackend>) -> Self {
        Self { backend }
    }

    /// Request a fresh sandbox for `slot`
    pub async fn init(&self, slot: u32, source_file: &str) -> Result<Sandbox> {
        let workdir = self.backend.init(slot).await?;
        debug!(slot, workdir = %workdir.display(), "Sandbox initialized");

        Ok(Sandbox {
            handle: SandboxHandle::new(slot, workdir, source_file),
            backend: self.backend.clone(),
            released: false,
        })
    }

    /// Release `slot` regardless of its state. Failures are logged, never returned.
    pub async fn cleanup(&self, slot: u32) {
        if let Err(e) = self.backend.cleanup(slot).await {
            error!(slot, error = %e, "Sandbox cleanup failed");
        }
    }
}

/// A provisioned sandbox, released exactly once
pub struct Sandbox {
    handle: SandboxHandle,
    backend: Arc<dyn IsolationBackend>,
    released: bool,
}

impl Sandbox {
    pub fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    /// Materialize the source file and stdin inside the box, overwriting
    /// whatever was there
    pub async fn write_artifacts(&self, source_code: &str, input: &str) -> Result<()> {
        let source_path = self.handle.source_path();
        tokio::fs::write(&source_path, source_code)
            .await
            .map_err(|e| {
                SandboxError::io(format!("Failed to write source {}", source_path.display()), e)
            })?;

        let stdin_path = self.handle.stdin_path();
        tokio::fs::write(&stdin_path, input).await.map_err(|e| {
            SandboxError::io(format!("Failed to write stdin {}", stdin_path.display()), e)
        })?;

        debug!(
            slot = self.handle.slot,
            source_bytes = source_code.len(),
            input_bytes = input.len(),
            "Artifacts written"
        );
        Ok(())
    }

    /// Release the sandbox. Cleanup failures are logged, never returned.
    pub async fn release(mut self) {
        let result = self.backend.cleanup(self.handle.slot).await;
        // Set after the await so a cancelled release falls back to Drop
        self.released = true;
        match result {
            Ok(()) => debug!(slot = self.handle.slot, "Sandbox released"),
            Err(e) => error!(slot = self.handle.slot, error = %e, "Sandbox cleanup failed"),
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        // Cannot await in Drop: hand the cleanup to the runtime
        let slot = self.handle.slot;
        let backend = self.backend.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(slot, "Sandbox dropped without release; cleaning up in background");
                runtime.spawn(async move {
                    if let Err(e) = backend.cleanup(slot).await {
                        error!(slot, error = %e, "Background sandbox cleanup failed");
                    }
                });
            }
            Err(_) => {
                error!(slot, "Sandbox dropped outside a runtime; slot left initialized");
            }
        }
    }
}
