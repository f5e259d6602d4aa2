use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gwsync_adapters::source_for_spec;
use gwsync_core::JobState;
use gwsync_engine::{load_jobs_file, provision_shared, JobRunner, JobsFile, SyncJob, SyncSettings};
use gwsync_sta::StaClient;

#[derive(Debug, Parser)]
#[command(name = "gwsync")]
#[command(about = "Groundwater level sync into a SensorThings store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List every registered job.
    Jobs,
    /// Run one job, optionally resuming from saved state.
    Run {
        job: String,
        /// Read state from this file before the run and write it back after.
        #[arg(long)]
        state_file: Option<PathBuf>,
        /// Inline state JSON; wins over --state-file for the first batch.
        #[arg(long)]
        state: Option<String>,
        /// Per-batch row cap, carried in state like a saved limit.
        #[arg(long)]
        limit: Option<i64>,
        /// Stage and count without writing to the store.
        #[arg(long)]
        dry: bool,
        /// Run up to N batches back to back, threading state through.
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
    /// Run every enabled job once, with per-job state under a directory.
    RunAll {
        /// Operator toggle file; jobs missing from it run enabled.
        #[arg(long)]
        jobs_file: Option<PathBuf>,
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
        #[arg(long)]
        dry: bool,
    },
    /// Create a job's shared sensors and observed properties, nothing else.
    Provision {
        job: String,
        #[arg(long)]
        dry: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Jobs) {
        Commands::Jobs => {
            for job in gwsync_registry::all_jobs() {
                println!("{:<42} {:<18} {:?}", job.name, job.agency, job.kind);
            }
        }
        Commands::Run { job, state_file, state, limit, dry, repeat } => {
            let job = lookup(&job)?;
            let settings = SyncSettings::from_env();
            let sink = StaClient::new(settings.sta_client_config())?;
            let source = source_for_spec(&job.source, &settings.source_settings())?;
            let runner = JobRunner::new(source.as_ref(), &sink);

            let mut current = initial_state(state.as_deref(), state_file.as_deref())?;
            if let Some(limit) = limit {
                current.0.insert("limit".to_string(), limit.into());
            }

            for batch in 1..=repeat.max(1) {
                let summary = runner.render(&job, &current, dry).await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
                current = summary.state.clone();
                // A dry run inserts nothing, so its cursor advance must not
                // outlive the process.
                if !dry {
                    if let Some(path) = &state_file {
                        save_state(path, &current)?;
                    }
                }
                if summary.extracted == 0 {
                    tracing::info!(job = job.name, batch, "feed drained, stopping early");
                    break;
                }
            }
        }
        Commands::RunAll { jobs_file, state_dir, dry } => {
            let toggles = match &jobs_file {
                Some(path) => load_jobs_file(path)?,
                None => JobsFile::default(),
            };
            let settings = SyncSettings::from_env();
            let sink = StaClient::new(settings.sta_client_config())?;
            let source_settings = settings.source_settings();
            std::fs::create_dir_all(&state_dir)
                .with_context(|| format!("creating state dir {}", state_dir.display()))?;

            for job in gwsync_registry::all_jobs() {
                if !toggles.is_enabled(job.name) {
                    tracing::debug!(job = job.name, "disabled, skipping");
                    continue;
                }
                let source = source_for_spec(&job.source, &source_settings)?;
                let state_path = state_dir.join(format!("{}.json", job.name));
                let mut state = load_state(&state_path)?.unwrap_or_default();
                if let Some(limit) = toggles.limit_override(job.name) {
                    state.0.insert("limit".to_string(), limit.into());
                }

                let summary = JobRunner::new(source.as_ref(), &sink)
                    .render(&job, &state, dry)
                    .await?;
                println!(
                    "{:<42} extracted={} staged={} inserted={} duplicates={} created={} skipped={}",
                    summary.job,
                    summary.extracted,
                    summary.staged,
                    summary.inserted,
                    summary.duplicates,
                    summary.created,
                    summary.skipped
                );
                if !dry {
                    save_state(&state_path, &summary.state)?;
                }
            }
        }
        Commands::Provision { job, dry } => {
            let job = lookup(&job)?;
            if job.provision.is_empty() {
                println!("{} provisions nothing", job.name);
                return Ok(());
            }
            let settings = SyncSettings::from_env();
            let sink = StaClient::new(settings.sta_client_config())?;
            let created = provision_shared(&sink, &job.provision, dry).await?;
            println!("{}: {created} shared entities created", job.name);
        }
    }

    Ok(())
}

fn lookup(name: &str) -> Result<SyncJob> {
    gwsync_registry::job_for_name(name)
        .with_context(|| format!("unknown job {name}; `gwsync jobs` lists the registry"))
}

fn initial_state(inline: Option<&str>, file: Option<&Path>) -> Result<JobState> {
    if let Some(raw) = inline {
        return serde_json::from_str(raw).context("parsing --state JSON");
    }
    if let Some(path) = file {
        if let Some(state) = load_state(path)? {
            return Ok(state);
        }
    }
    Ok(JobState::empty())
}

fn load_state(path: &Path) -> Result<Option<JobState>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading state file {}", path.display()))?;
    let state = serde_json::from_str(&text)
        .with_context(|| format!("parsing state file {}", path.display()))?;
    Ok(Some(state))
}

fn save_state(path: &Path, state: &JobState) -> Result<()> {
    let text = serde_json::to_string_pretty(state)?;
    std::fs::write(path, text).with_context(|| format!("writing state file {}", path.display()))
}
