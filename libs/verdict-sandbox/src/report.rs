//! Parsing of the resource-usage report ("meta file") isolate writes after a run.
//!
//! The file is newline-separated `key:value` pairs; values may themselves
//! contain `:`. No key is guaranteed to be present.

use crate::error::{Result, SandboxError};
use std::path::Path;

/// How the sandboxed program terminated, when it did not simply exit with 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportStatus {
    /// `TO`
    TimedOut,
    /// `SG`
    Signalled,
    /// `RE`
    RuntimeError,
    /// `XX`
    SandboxError,
    Other(String),
}

impl ReportStatus {
    pub fn parse(code: &str) -> Self {
        match code.trim() {
            "TO" => ReportStatus::TimedOut,
            "SG" => ReportStatus::Signalled,
            "RE" => ReportStatus::RuntimeError,
            "XX" => ReportStatus::SandboxError,
            other => ReportStatus::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceReport {
    entries: Vec<(String, String)>,
}

impl ResourceReport {
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| match line.split_once(':') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (line.to_string(), String::new()),
            })
            .collect();

        Self { entries }
    }

    /// Read and parse the report at `path`, repairing invalid UTF-8
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            SandboxError::io(format!("Failed to read report {}", path.display()), e)
        })?;
        Ok(Self::parse(&String::from_utf8_lossy(&bytes)))
    }

    /// Value of `key`; the last occurrence wins
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn status(&self) -> Option<ReportStatus> {
        self.get("status").map(ReportStatus::parse)
    }

    /// CPU seconds
    pub fn cpu_time(&self) -> Option<f64> {
        self.parsed("time")
    }

    pub fn wall_time(&self) -> Option<f64> {
        self.parsed("time-wall")
    }

    /// Peak memory in KB: the control group total when measured, otherwise
    /// the largest resident set
    pub fn memory_kb(&self) -> Option<u64> {
        self.parsed("cg-mem").or_else(|| self.parsed("max-rss"))
    }

    pub fn exit_signal(&self) -> Option<i32> {
        self.parsed("exitsig")
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.parsed("exitcode")
    }

    pub fn killed(&self) -> bool {
        self.get("killed").map(|v| v.trim() == "1").unwrap_or(false)
    }

    pub fn message(&self) -> Option<&str> {
        self.get("message")
    }
}
