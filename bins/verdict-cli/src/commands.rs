// CLI commands for judging and queueing submissions
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use verdict_common::types::Submission;
use verdict_sandbox::config::{LanguageConfigManager, ResourceLimits, SandboxSettings};
use verdict_sandbox::executor::Executor;
use verdict_sandbox::isolate::IsolateCli;
use verdict_sandbox::slots::SlotAllocator;
use verdict_sandbox::store::{MemoryStore, SubmissionStore};

/// Files and options describing one submission
#[derive(Debug, Clone)]
pub struct SubmissionFiles {
    pub id: u64,
    pub language: String,
    pub source: PathBuf,
    pub input: Option<PathBuf>,
    pub expected: Option<PathBuf>,
    pub runs: Option<u32>,
}

#[derive(Debug, Serialize)]
struct StatusReport<'a> {
    status_id: u8,
    status: &'a str,
    #[serde(flatten)]
    submission: &'a Submission,
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn default_runs() -> Result<u32> {
    match std::env::var("NUMBER_OF_RUNS") {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for NUMBER_OF_RUNS: '{}'", raw)),
        Err(_) => Ok(1),
    }
}

/// Build a Pending record from files on disk
pub fn build_submission(
    languages: &LanguageConfigManager,
    files: &SubmissionFiles,
    default_runs: u32,
) -> Result<Submission> {
    let language = languages.get(&files.language)?.clone();
    let runs = files.runs.unwrap_or(default_runs);
    if runs == 0 {
        bail!("Number of runs must be at least 1");
    }

    let mut submission =
        Submission::new(files.id, language, read_file(&files.source)?).with_runs(runs);
    if let Some(input) = &files.input {
        submission = submission.with_input(read_file(input)?);
    }
    if let Some(expected) = &files.expected {
        submission = submission.with_expected_output(read_file(expected)?);
    }
    Ok(submission)
}

fn status_json(submission: &Submission) -> Result<String> {
    let status = match submission.verdict {
        Some(verdict) => verdict.description(),
        None if submission.status_id() == 2 => "Processing",
        None => "In Queue",
    };
    serde_json::to_string_pretty(&StatusReport {
        status_id: submission.status_id(),
        status,
        submission,
    })
    .context("Failed to serialize submission")
}

async fn connect(redis_url: &str) -> Result<redis::aio::ConnectionManager> {
    let client = redis::Client::open(redis_url)
        .with_context(|| format!("Invalid Redis URL: {}", redis_url))?;
    redis::aio::ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", redis_url))
}

/// Run the full pipeline locally and print the finalized record
pub async fn judge(config_path: &Path, files: &SubmissionFiles) -> Result<()> {
    let languages = LanguageConfigManager::load(config_path)?;
    let submission = build_submission(&languages, files, default_runs()?)?;

    let limits = ResourceLimits::from_env()?;
    let settings = SandboxSettings::from_env()?;
    let slots = Arc::new(SlotAllocator::new(settings.slot_strategy)?);
    let store: Arc<dyn SubmissionStore> = Arc::new(MemoryStore::new());
    let executor = Executor::new(Arc::new(IsolateCli::new(settings)), limits, slots, store)?;

    let judged = executor.judge(submission).await;
    println!("{}", status_json(&judged)?);
    Ok(())
}

pub fn list_languages(config_path: &Path) -> Result<()> {
    let languages = LanguageConfigManager::load(config_path)?;

    println!("Configured languages ({}):", config_path.display());
    for name in languages.list_languages() {
        let spec = languages.get(&name)?;
        match spec.compile_cmd.as_deref() {
            Some(compile) if spec.is_compiled() => println!(
                "  {:<10} {:<12} compile: {}  run: {}",
                name, spec.source_file, compile, spec.run_cmd
            ),
            _ => println!("  {:<10} {:<12} run: {}", name, spec.source_file, spec.run_cmd),
        }
    }
    Ok(())
}

/// Print the effective limits; fails when they would be rejected at run time
pub fn show_limits() -> Result<()> {
    let limits = ResourceLimits::from_env()?;
    let settings = SandboxSettings::from_env()?;

    println!(
        "{}",
        serde_json::to_string_pretty(&limits).context("Failed to serialize limits")?
    );
    println!("isolate binary:   {}", settings.isolate_bin.display());
    println!("control groups:   {}", settings.use_cgroups);
    println!("slot strategy:    {:?}", settings.slot_strategy);
    println!("✅ Limits are valid");
    Ok(())
}

/// Store a Pending record and push its id onto the queue
pub async fn submit(config_path: &Path, redis_url: &str, files: &SubmissionFiles) -> Result<()> {
    let languages = LanguageConfigManager::load(config_path)?;
    let submission = build_submission(&languages, files, default_runs()?)?;

    let mut conn = connect(redis_url).await?;
    if verdict_common::redis::load_submission(&mut conn, submission.id)
        .await?
        .is_some()
    {
        bail!("Submission {} already exists", submission.id);
    }

    verdict_common::redis::store_submission(&mut conn, &submission)
        .await
        .context("Failed to store submission")?;
    verdict_common::redis::push_submission(&mut conn, submission.id)
        .await
        .context("Failed to enqueue submission")?;

    println!(
        "✅ Submission {} queued ({} run(s), language {})",
        submission.id, submission.number_of_runs, submission.language.name
    );
    Ok(())
}

pub async fn status(redis_url: &str, id: u64) -> Result<()> {
    let mut conn = connect(redis_url).await?;
    match verdict_common::redis::load_submission(&mut conn, id).await? {
        Some(submission) => {
            println!("{}", status_json(&submission)?);
            Ok(())
        }
        None => bail!("Submission {} not found", id),
    }
}
