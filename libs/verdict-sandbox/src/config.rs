// Resource limits, sandbox settings and language configuration
use crate::error::SandboxError;
use crate::slots::SlotStrategy;
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use verdict_common::types::LanguageSpec;

/// Read `key` through `lookup`, parsing it, or fall back to `default`
fn lookup_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("Invalid value for {}: '{}' ({})", key, raw, e)),
        None => Ok(default),
    }
}

/// Limits the isolation tool enforces on every run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Seconds of CPU time
    pub cpu_time_limit: f64,
    /// Grace seconds before a program over its CPU limit is killed
    pub cpu_extra_time: f64,
    /// Seconds of wall-clock time
    pub wall_time_limit: f64,
    pub stack_limit_kb: u64,
    pub max_processes: u32,
    pub memory_limit_kb: u64,
    /// Limit each process's address space instead of the whole control group
    pub per_process_memory: bool,
    /// Measure time per process instead of for the whole control group
    pub per_process_timing: bool,
    pub max_file_size_kb: u64,
    /// Seconds the host-side compile command may take
    pub compile_time_limit: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_time_limit: 5.0,
            cpu_extra_time: 1.0,
            wall_time_limit: 10.0,
            stack_limit_kb: 64_000,
            max_processes: 60,
            memory_limit_kb: 128_000,
            per_process_memory: false,
            per_process_timing: false,
            max_file_size_kb: 1024,
            compile_time_limit: 30.0,
        }
    }
}

impl ResourceLimits {
    /// Load limits from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let limits = Self {
            cpu_time_limit: lookup_or(&lookup, "CPU_TIME_LIMIT", defaults.cpu_time_limit)?,
            cpu_extra_time: lookup_or(&lookup, "CPU_EXTRA_TIME", defaults.cpu_extra_time)?,
            wall_time_limit: lookup_or(&lookup, "WALL_TIME_LIMIT", defaults.wall_time_limit)?,
            stack_limit_kb: lookup_or(&lookup, "STACK_LIMIT", defaults.stack_limit_kb)?,
            max_processes: lookup_or(
                &lookup,
                "MAX_PROCESSES_AND_OR_THREADS",
                defaults.max_processes,
            )?,
            memory_limit_kb: lookup_or(&lookup, "MEMORY_LIMIT", defaults.memory_limit_kb)?,
            per_process_memory: lookup_or(
                &lookup,
                "ENABLE_PER_PROCESS_AND_THREAD_MEMORY_LIMIT",
                defaults.per_process_memory,
            )?,
            per_process_timing: lookup_or(
                &lookup,
                "ENABLE_PER_PROCESS_AND_THREAD_TIME_LIMIT",
                defaults.per_process_timing,
            )?,
            max_file_size_kb: lookup_or(&lookup, "MAX_FILE_SIZE", defaults.max_file_size_kb)?,
            compile_time_limit: lookup_or(
                &lookup,
                "COMPILE_TIME_LIMIT",
                defaults.compile_time_limit,
            )?,
        };

        limits.validate()?;
        Ok(limits)
    }

    /// Reject limits the isolation tool would misinterpret
    pub fn validate(&self) -> std::result::Result<(), SandboxError> {
        let seconds = [
            ("cpu_time_limit", self.cpu_time_limit),
            ("wall_time_limit", self.wall_time_limit),
            ("compile_time_limit", self.compile_time_limit),
        ];
        for (name, value) in seconds {
            if !value.is_finite() || value <= 0.0 {
                return Err(SandboxError::InvalidLimit {
                    name,
                    reason: format!("expected a positive number of seconds, got {}", value),
                });
            }
        }

        if !self.cpu_extra_time.is_finite() || self.cpu_extra_time < 0.0 {
            return Err(SandboxError::InvalidLimit {
                name: "cpu_extra_time",
                reason: format!("expected zero or more seconds, got {}", self.cpu_extra_time),
            });
        }

        if self.wall_time_limit < self.cpu_time_limit {
            return Err(SandboxError::InvalidLimit {
                name: "wall_time_limit",
                reason: format!(
                    "{}s is below the CPU time limit of {}s",
                    self.wall_time_limit, self.cpu_time_limit
                ),
            });
        }

        let counts = [
            ("stack_limit_kb", self.stack_limit_kb),
            ("max_processes", u64::from(self.max_processes)),
            ("memory_limit_kb", self.memory_limit_kb),
            ("max_file_size_kb", self.max_file_size_kb),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(SandboxError::InvalidLimit {
                    name,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        Ok(())
    }
}

/// How the isolation tool is driven on this host
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSettings {
    pub isolate_bin: PathBuf,
    /// Pass `--cg` so runs are placed in a control group
    pub use_cgroups: bool,
    pub verbose: bool,
    /// chown sandbox-written files back to this process before reading them
    pub fix_permissions: bool,
    pub slot_strategy: SlotStrategy,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            isolate_bin: PathBuf::from("isolate"),
            use_cgroups: true,
            verbose: false,
            fix_permissions: true,
            slot_strategy: SlotStrategy::Pool { size: 1000 },
        }
    }
}

impl SandboxSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let slot_strategy = match lookup("SLOT_STRATEGY")
            .map(|s| s.trim().to_lowercase())
            .as_deref()
        {
            None | Some("pool") => SlotStrategy::Pool {
                size: lookup_or(&lookup, "SLOT_POOL_SIZE", 1000u32)?,
            },
            Some("modulo") => SlotStrategy::Modulo {
                modulus: lookup_or(&lookup, "SLOT_MODULUS", 2_147_483_647u64)?,
            },
            Some(other) => bail!(
                "Invalid value for SLOT_STRATEGY: '{}' (expected 'pool' or 'modulo')",
                other
            ),
        };

        Ok(Self {
            isolate_bin: lookup("ISOLATE_BIN")
                .map(PathBuf::from)
                .unwrap_or(defaults.isolate_bin),
            use_cgroups: lookup_or(&lookup, "ISOLATE_USE_CGROUPS", defaults.use_cgroups)?,
            verbose: lookup_or(&lookup, "ISOLATE_VERBOSE", defaults.verbose)?,
            fix_permissions: lookup_or(
                &lookup,
                "ISOLATE_FIX_PERMISSIONS",
                defaults.fix_permissions,
            )?,
            slot_strategy,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageSpec>,
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<String, LanguageSpec>,
}

impl LanguageConfigManager {
    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path).context("Failed to read languages.json")?;

        let languages_json: LanguagesJson =
            serde_json::from_str(&content).context("Failed to parse languages.json")?;

        let mut configs = HashMap::new();
        for lang in languages_json.languages {
            if lang.run_cmd.trim().is_empty() {
                bail!("Language '{}' has an empty run_cmd", lang.name);
            }
            if lang.source_file.trim().is_empty() || lang.source_file.contains('/') {
                bail!(
                    "Language '{}' must name a plain source file, got '{}'",
                    lang.name,
                    lang.source_file
                );
            }
            if configs.insert(lang.name.clone(), lang).is_some() {
                bail!("Duplicate language entry in languages.json");
            }
        }

        Ok(Self { configs })
    }

    /// Load with default path (config/languages.json)
    pub fn load_default() -> Result<Self> {
        let default_path = Path::new("config/languages.json");
        Self::load(default_path)
    }

    /// Get configuration for a language by name
    pub fn get(&self, name: &str) -> Result<&LanguageSpec> {
        self.configs
            .get(name)
            .ok_or_else(|| anyhow!("No configuration found for language: {}", name))
    }

    /// List all supported languages, sorted
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}
