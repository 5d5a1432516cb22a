use anyhow::{bail, Context, Result};
use std::path::PathBuf;

/// Worker process settings, read once at boot
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub redis_url: String,
    /// Submissions judged at the same time
    pub concurrency: usize,
    pub languages_path: PathBuf,
    pub json_logs: bool,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let concurrency = match lookup("WORKER_CONCURRENCY") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .with_context(|| format!("Invalid value for WORKER_CONCURRENCY: '{}'", raw))?,
            None => 1,
        };
        if concurrency == 0 {
            bail!("WORKER_CONCURRENCY must be at least 1");
        }

        Ok(Self {
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            concurrency,
            languages_path: lookup("LANGUAGES_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config/languages.json")),
            json_logs: lookup("LOG_FORMAT")
                .map(|format| format.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<WorkerConfig> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.languages_path, PathBuf::from("config/languages.json"));
        assert!(!config.json_logs);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("REDIS_URL", "redis://queue:6380"),
            ("WORKER_CONCURRENCY", " 8 "),
            ("LANGUAGES_CONFIG", "/etc/verdict/languages.json"),
            ("LOG_FORMAT", "JSON"),
        ])
        .unwrap();
        assert_eq!(config.redis_url, "redis://queue:6380");
        assert_eq!(config.concurrency, 8);
        assert_eq!(
            config.languages_path,
            PathBuf::from("/etc/verdict/languages.json")
        );
        assert!(config.json_logs);
    }

    #[test]
    fn test_rejects_bad_concurrency() {
        assert!(config(&[("WORKER_CONCURRENCY", "0")]).is_err());
        assert!(config(&[("WORKER_CONCURRENCY", "many")]).is_err());
    }
}
