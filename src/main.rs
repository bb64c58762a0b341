use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use cloud_offload::attachments::{register_local_files, LocalFiles};
use cloud_offload::config;
use cloud_offload::db;
use cloud_offload::error::SweepError;
use cloud_offload::model::{SweepKind, SweepOptions};
use cloud_offload::optimizer::{CommandOptimizer, ImageOptimizer};
use cloud_offload::orchestrator::{ClientOrchestrator, OrchestratorEvent, RetryPolicy};
use cloud_offload::reconcile::ReconciliationReport;
use cloud_offload::service::{ServiceDeps, SweepApi, SweepService};
use cloud_offload::storage::{HttpObjectStorage, ObjectStorage};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register files under the uploads directory as attachments
    Register,
    /// Summarise local vs. remote state
    Analyze {
        /// List the bucket and classify every attachment
        #[arg(long)]
        deep: bool,
        #[arg(long)]
        json: bool,
    },
    /// Start a sweep (migration, optimization, reconciliation, cloudsync)
    Start {
        kind: SweepKind,
        #[command(flatten)]
        opts: StartOpts,
    },
    /// Process one batch
    Batch { kind: SweepKind },
    Pause { kind: SweepKind },
    Resume { kind: SweepKind },
    Stop { kind: SweepKind },
    Status { kind: SweepKind },
    /// Retry the items in the error log
    Retry { kind: SweepKind },
    /// Start (or re-attach to) a sweep and drive it until done; Ctrl-C pauses
    Run {
        kind: SweepKind,
        #[command(flatten)]
        opts: StartOpts,
    },
    /// Delete remote objects no attachment refers to
    CleanOrphans {
        #[arg(long)]
        yes: bool,
    },
    /// Print an example configuration
    ExampleConfig,
}

#[derive(Debug, Clone, clap::Args)]
struct StartOpts {
    #[arg(long)]
    batch_size: Option<u32>,
    /// Delete local copies once uploaded
    #[arg(long)]
    remove_local: bool,
    /// Repair integrity problems instead of only reporting them
    #[arg(long)]
    auto_fix: bool,
}

impl StartOpts {
    fn apply(&self, defaults: &SweepOptions) -> SweepOptions {
        let mut options = defaults.clone();
        if let Some(batch_size) = self.batch_size {
            options.batch_size = batch_size;
        }
        options.remove_local |= self.remove_local;
        options.auto_fix |= self.auto_fix;
        options
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_report(report: &ReconciliationReport) {
    let s = &report.stats;
    println!(
        "attachments: {} ({} migrated, {}% synced)",
        s.total_attachments, s.migrated, s.percent_synced
    );
    println!("pending sync: {}, pending optimization: {}", s.pending_sync, s.pending_optimization);
    println!("remote objects: {} ({} bytes)", s.remote_objects, s.remote_bytes);
    let estimate = if s.estimated { " (from last deep scan)" } else { "" };
    println!(
        "integrity issues: {}{} [not on remote: {}, not marked migrated: {}, orphans: {}]",
        s.integrity_issues, estimate, s.not_on_remote, s.not_marked_migrated, s.orphan_remote
    );
    match report.scanned_at {
        Some(at) => println!("last deep scan: {}", at.to_rfc3339()),
        None => println!("last deep scan: never"),
    }
    for action in &report.actions {
        let auto = if action.auto_apply { "auto" } else { "manual" };
        println!("  - {:?} x{} [{}]: {}", action.kind, action.count, auto, action.description);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    cloud_offload::init_tracing();

    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let files = LocalFiles::new(cfg.app.resolved_uploads_dir());
    let storage: Option<Arc<dyn ObjectStorage>> = match HttpObjectStorage::from_config(&cfg.storage)
    {
        Ok(client) => Some(Arc::new(client)),
        Err(err) => {
            warn!(%err, "object storage unavailable");
            None
        }
    };
    let optimizer: Option<Arc<dyn ImageOptimizer>> = match CommandOptimizer::from_config(&cfg.optimizer) {
        Some(opt) => {
            if let Err(err) = opt.ensure_available().await {
                warn!(?err, "optimizer binary not usable");
            }
            Some(Arc::new(opt))
        }
        None => None,
    };
    let service = Arc::new(SweepService::new(
        &cfg,
        ServiceDeps::sqlite(pool.clone(), files.clone(), storage, optimizer),
    ));

    match args.command {
        Command::ExampleConfig => {}
        Command::Register => {
            let report = register_local_files(&pool, &files).await?;
            println!(
                "registered {} new attachments ({} variants, {} thumbnails without original)",
                report.registered, report.variants, report.orphan_thumbnails
            );
        }
        Command::Analyze { deep, json } => {
            let report = if deep {
                service.engine().analyze_deep().await?
            } else {
                service.engine().analyze().await?
            };
            if json {
                print_json(&report)?;
            } else {
                print_report(&report);
            }
        }
        Command::Start { kind, opts } => {
            let options = opts.apply(service.controller(kind).default_options());
            print_json(&service.start(kind, Some(options)).await?)?;
        }
        Command::Batch { kind } => print_json(&service.process_batch(kind).await?)?,
        Command::Pause { kind } => print_json(&service.pause(kind).await?)?,
        Command::Resume { kind } => print_json(&service.resume(kind).await?)?,
        Command::Stop { kind } => print_json(&service.stop(kind).await?)?,
        Command::Status { kind } => print_json(&service.status(kind).await?)?,
        Command::Retry { kind } => print_json(&service.retry_failed(kind).await?)?,
        Command::Run { kind, opts } => {
            let options = opts.apply(service.controller(kind).default_options());
            run_sweep(&cfg, service.clone(), kind, options).await?;
        }
        Command::CleanOrphans { yes } => {
            if !yes {
                bail!("clean-orphans deletes remote objects; pass --yes to confirm");
            }
            let report = service.engine().analyze_deep().await?;
            let outcome = service.engine().clean_orphans(&report).await?;
            print_json(&outcome)?;
        }
    }

    Ok(())
}

async fn run_sweep(
    cfg: &config::Config,
    service: Arc<SweepService>,
    kind: SweepKind,
    options: SweepOptions,
) -> Result<()> {
    let retry = RetryPolicy::new(cfg.app.max_retries, cfg.app.retry_base_delay());
    let (orchestrator, mut events) =
        ClientOrchestrator::new(service, kind, cfg.app.poll_interval(), retry);

    match orchestrator.start(Some(options)).await {
        Ok(response) => print_json(&response)?,
        Err(SweepError::AlreadyRunning(_)) => {
            info!(%kind, "sweep already active; re-attaching");
            print_json(&orchestrator.resume().await?)?;
        }
        Err(err) => return Err(err.into()),
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(OrchestratorEvent::BatchApplied(r)) => info!(
                    %kind,
                    processed = r.state.processed,
                    failed = r.state.failed,
                    total = r.state.total,
                    "progress"
                ),
                Some(OrchestratorEvent::RetryScheduled { .. }) => {}
                Some(OrchestratorEvent::Completed(r)) | Some(OrchestratorEvent::Halted(r)) => {
                    print_json(&r)?;
                    break;
                }
                Some(OrchestratorEvent::Failed { error }) => {
                    return Err(anyhow!("{} sweep stopped locally: {}", kind, error));
                }
                Some(OrchestratorEvent::Discarded) | None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!(%kind, "interrupt received; pausing sweep");
                print_json(&orchestrator.pause().await?)?;
                break;
            }
        }
    }
    orchestrator.wait().await;
    Ok(())
}
