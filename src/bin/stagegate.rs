//! Stagegate CLI: completion tracking, monitoring and self-heal for one stage.
//!
//! Usage:
//!   stagegate [--config path] [--db path] [-v] <subcommand>
//!
//! Every subcommand exits 0 (healthy), 1 (warning/partial) or 2
//! (critical/failure).

use clap::{Parser, Subcommand};
use stagegate::clock::checked_before;
use stagegate::config::StagegateConfig;
use stagegate::heal::{HealAction, ShellCommand};
use stagegate::monitor::StallMonitor;
use stagegate::validation::CompletionDataSource;
use stagegate::{
    BatchKey, Clock, CoordinationError, CoordinationResult, Coordinator, CompletionOutcome, CycleOptions,
    DistributedLock, ExitStatus, HandoffState, HandoffValidator, ItemStatus, LogPublisher, ReadinessCheck,
    RetryableWorkItem,
    SelfHealAgent, SqliteStore, StageCompletionTracker, StartRequest, SystemClock, WorkerId,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Lock serializing self-heal cycles across `serve` instances.
const HEAL_CYCLE_LOCK: &str = "self-heal-cycle";

#[derive(Parser)]
#[command(
    name = "stagegate",
    version,
    about = "Completion tracking and exactly-once stage transitions"
)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Path to SQLite database file
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a batch and its expected worker count
    Register {
        #[arg(long)]
        batch: String,
        /// Expected completions; defaults to the number of --worker values
        #[arg(long)]
        expected: Option<usize>,
        /// Worker roster (repeatable)
        #[arg(long = "worker")]
        workers: Vec<String>,
    },
    /// Report a worker completion
    Report {
        #[arg(long)]
        batch: String,
        #[arg(long)]
        worker: String,
        #[arg(long, default_value_t = 0)]
        items: u64,
        /// Quality score for one output table (table=score, repeatable)
        #[arg(long = "quality", value_parser = parse_quality)]
        quality: Vec<(String, f64)>,
    },
    /// Report a worker failure
    Fail {
        #[arg(long)]
        batch: String,
        #[arg(long)]
        worker: String,
        #[arg(long)]
        reason: String,
    },
    /// Show the persisted state of a batch
    Status {
        #[arg(long)]
        batch: String,
    },
    /// Publish the transition of a triggered batch whose handoff was
    /// blocked or lost
    Publish {
        #[arg(long)]
        batch: String,
        #[arg(long, default_value = "released by operator")]
        reason: String,
    },
    /// Scan the stage for stuck, quiet or unpublished batches
    Monitor,
    /// Run handoff validation for a batch
    Validate {
        #[arg(long)]
        batch: String,
    },
    /// Run one self-heal cycle
    Heal {
        /// Evaluate readiness without writing or re-running anything
        #[arg(long)]
        dry_run: bool,
        /// Only consider items created within this many hours
        #[arg(long)]
        lookback_hours: Option<u64>,
    },
    /// Queue a work item for self-heal
    Enqueue {
        #[arg(long)]
        item: String,
        #[arg(long)]
        max_checks: Option<u32>,
        /// Context label passed to checks and steps (key=value, repeatable)
        #[arg(long = "context", value_parser = parse_label)]
        context: Vec<(String, String)>,
    },
    /// Purge old triggered batches and terminal work items
    Cleanup,
    /// Inspect or manage distributed locks
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
    /// Run monitor, self-heal and cleanup on their intervals until Ctrl-C
    Serve,
}

#[derive(Subcommand)]
enum LockAction {
    /// Take a lock until its TTL expires or it is released
    Acquire {
        key: String,
        #[arg(long)]
        holder: String,
        /// Defaults to the configured lock TTL
        #[arg(long)]
        ttl_secs: Option<u64>,
        /// Retry with backoff (lock.acquire_attempts) while the lock is held
        #[arg(long)]
        wait: bool,
    },
    /// Release a lock held by --holder
    Release {
        key: String,
        #[arg(long)]
        holder: String,
    },
    /// Show the current lock record
    Show { key: String },
    /// Delete a lock regardless of holder
    Break { key: String },
}

fn parse_label(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

fn parse_quality(raw: &str) -> Result<(String, f64), String> {
    let (table, score) = parse_label(raw)?;
    let score: f64 = score
        .parse()
        .map_err(|_| format!("expected a numeric score in '{}'", raw))?;
    Ok((table, score))
}

/// Get the default database path (~/.local/share/stagegate/stagegate.db)
fn default_db_path() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"));
    let dir = data_dir.join("stagegate");
    std::fs::create_dir_all(&dir).ok();
    dir.join("stagegate.db")
}

fn holder_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "stagegate".to_string());
    format!("{}-{}", host, std::process::id())
}

/// Shared handles for one invocation.
struct App {
    config: StagegateConfig,
    store: Arc<SqliteStore>,
    clock: Arc<dyn Clock>,
}

impl App {
    fn open(config_path: Option<&Path>, db: Option<PathBuf>) -> CoordinationResult<Self> {
        let config = StagegateConfig::load(config_path)?;
        let db_path = db
            .or_else(|| config.store.path.clone())
            .unwrap_or_else(default_db_path);
        let store = SqliteStore::open_with_timeout(&db_path, config.store.busy_timeout())?;
        tracing::debug!(db = %db_path.display(), stage = %config.stage.name, "store opened");
        Ok(Self {
            config,
            store: Arc::new(store),
            clock: Arc::new(SystemClock),
        })
    }

    fn tracker(&self) -> StageCompletionTracker<SqliteStore> {
        StageCompletionTracker::new(
            Arc::clone(&self.store),
            &self.config.stage.name,
            Arc::clone(&self.clock),
            self.config.transaction.retry_policy(),
        )
    }

    fn validator(&self) -> HandoffValidator {
        HandoffValidator::new(self.config.handoff.mode).with_block_on(self.config.handoff.block_on)
    }

    fn coordinator(&self) -> CoordinationResult<Coordinator<SqliteStore>> {
        Ok(Coordinator::new(
            self.tracker(),
            Arc::new(LogPublisher),
            Arc::clone(&self.clock),
            self.config.coordinator_settings(),
        )
        .with_validator(self.validator(), self.config.handoff.checks()?))
    }

    fn lock(&self) -> DistributedLock<SqliteStore> {
        DistributedLock::new(Arc::clone(&self.store), Arc::clone(&self.clock))
    }

    fn monitor(&self) -> StallMonitor {
        StallMonitor::new(Arc::clone(&self.clock), self.config.monitor.thresholds())
    }

    fn agent(&self) -> SelfHealAgent<SqliteStore> {
        let heal = &self.config.self_heal;
        let readiness: Arc<dyn ReadinessCheck> = match heal.readiness() {
            Some(cmd) => Arc::new(cmd),
            None => Arc::new(Unconfigured),
        };
        heal.steps().into_iter().fold(
            SelfHealAgent::new(Arc::clone(&self.store), Arc::clone(&self.clock), readiness, heal.settings()),
            |agent, step: ShellCommand| agent.with_step(Arc::new(step)),
        )
    }
}

/// Readiness used when no command is configured: every check errors, so
/// items count down instead of silently passing.
struct Unconfigured;

impl ReadinessCheck for Unconfigured {
    fn is_ready(&self, _item: &RetryableWorkItem) -> CoordinationResult<bool> {
        Err(CoordinationError::Config("self_heal.readiness_command is not set".to_string()))
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> CoordinationResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_register(app: &App, batch: &str, expected: Option<usize>, workers: &[String]) -> CoordinationResult<ExitStatus> {
    let batch_key = BatchKey::parse(batch)?;
    let workers = workers
        .iter()
        .map(|w| WorkerId::parse(w))
        .collect::<CoordinationResult<Vec<_>>>()?;
    let request = StartRequest {
        batch_key: batch_key.clone(),
        expected,
        workers: (!workers.is_empty()).then_some(workers),
    };
    let context = app.coordinator()?.start_stage(request)?;
    println!("Registered batch '{}' expecting {} workers", batch_key, context.progress.expected());
    Ok(ExitStatus::Healthy)
}

fn cmd_report(
    app: &App,
    batch: &str,
    worker: &str,
    items: u64,
    quality: &[(String, f64)],
) -> CoordinationResult<ExitStatus> {
    let batch_key = BatchKey::parse(batch)?;
    let worker_id = WorkerId::parse(worker)?;
    let coordinator = app.coordinator()?;
    // Scores land before the completion so the handoff validation sees them.
    for (table, score) in quality {
        coordinator.record_quality(&batch_key, &worker_id, table, *score)?;
    }
    let outcome = coordinator.handle_completion(&batch_key, &worker_id, items)?;
    let status = match outcome {
        CompletionOutcome::Recorded { completed, expected } => {
            println!("Recorded {} ({}/{})", worker_id, completed, expected);
            ExitStatus::Healthy
        }
        CompletionOutcome::Duplicate => {
            println!("Duplicate completion for {} ignored", worker_id);
            ExitStatus::Healthy
        }
        CompletionOutcome::Triggered(event) => {
            println!("Batch '{}' complete; transition {} published", batch_key, event.correlation_id);
            ExitStatus::Healthy
        }
        CompletionOutcome::Blocked(report) => {
            print_json(&report)?;
            ExitStatus::Critical
        }
    };
    Ok(status)
}

fn cmd_fail(app: &App, batch: &str, worker: &str, reason: &str) -> CoordinationResult<ExitStatus> {
    let batch_key = BatchKey::parse(batch)?;
    let worker_id = WorkerId::parse(worker)?;
    if app.coordinator()?.handle_failure(&batch_key, &worker_id, reason)? {
        println!("Recorded failure of {}", worker_id);
    } else {
        println!("No change for {}", worker_id);
    }
    Ok(ExitStatus::Healthy)
}

fn cmd_status(app: &App, batch: &str) -> CoordinationResult<ExitStatus> {
    let batch_key = BatchKey::parse(batch)?;
    let doc = app.tracker().require(&batch_key)?;

    let roster = app.config.handoff.checks()?.workers.unwrap_or_default();
    let missing: Vec<&WorkerId> = roster
        .iter()
        .filter(|w| !doc.completed_worker_ids.contains(*w) && !doc.failed_worker_ids.contains(*w))
        .collect();
    let quality: BTreeMap<&String, Option<f64>> = doc
        .quality_scores
        .keys()
        .map(|table| (table, doc.quality_score(table)))
        .collect();

    print_json(&serde_json::json!({
        "batch_key": doc.batch_key,
        "expected": doc.expected_count,
        "completed": doc.completed_count(),
        "failed": doc.failed_count(),
        "remaining": doc.remaining(),
        "triggered": doc.triggered,
        "triggered_at": doc.triggered_at,
        "handoff": doc.handoff,
        "published_at": doc.published_at,
        "handoff_error": doc.handoff_error,
        "total_items": doc.total_items(),
        "quality": quality,
        "created_at": doc.created_at,
        "last_completion_at": doc.last_completion_at,
        "missing_workers": missing,
        "failure_reasons": doc.failure_reasons,
    }))?;

    Ok(match (doc.triggered, doc.handoff) {
        (false, _) => ExitStatus::Warning,
        (true, HandoffState::Published) => ExitStatus::Healthy,
        (true, _) => ExitStatus::Critical,
    })
}

fn cmd_publish(app: &App, batch: &str, reason: &str) -> CoordinationResult<ExitStatus> {
    let batch_key = BatchKey::parse(batch)?;
    let coordinator = app.coordinator()?;
    let doc = coordinator.tracker().require(&batch_key)?;
    if !doc.triggered {
        return Err(CoordinationError::InvalidInput(format!(
            "batch {} has not triggered ({}/{} completed)",
            batch_key,
            doc.completed_count(),
            doc.expected_count
        )));
    }
    if doc.handoff == HandoffState::Published {
        println!("Batch '{}' was already published", batch_key);
        return Ok(ExitStatus::Warning);
    }
    let event = coordinator.publish_transition(&batch_key, reason)?;
    println!("Batch '{}' transition {} published", batch_key, event.correlation_id);
    Ok(ExitStatus::Healthy)
}

fn cmd_monitor(app: &App) -> CoordinationResult<ExitStatus> {
    let report = app.monitor().scan_stage(&app.tracker())?;
    print_json(&report)?;
    Ok(report.exit_status())
}

fn cmd_validate(app: &App, batch: &str) -> CoordinationResult<ExitStatus> {
    let batch_key = BatchKey::parse(batch)?;
    let tracker = app.tracker();
    let report = app.validator().validate(
        &CompletionDataSource::new(&tracker),
        &batch_key,
        &app.config.handoff.checks()?,
    )?;
    print_json(&report)?;
    Ok(report.exit_status())
}

fn cmd_heal(app: &App, dry_run: bool, lookback_hours: Option<u64>) -> CoordinationResult<ExitStatus> {
    if app.config.self_heal.readiness_command.is_none() {
        return Err(CoordinationError::Config("self_heal.readiness_command is not set".to_string()));
    }
    let options = CycleOptions {
        dry_run,
        lookback: lookback_hours
            .map(|h| {
                h.checked_mul(3600)
                    .map(Duration::from_secs)
                    .ok_or_else(|| CoordinationError::InvalidInput(format!("lookback of {} hours is out of range", h)))
            })
            .transpose()?,
    };
    let report = app.agent().run_cycle(options)?;
    for alert in report.alerts() {
        tracing::error!("{}", alert);
    }
    print_json(&report)?;
    Ok(report.exit_status())
}

fn cmd_enqueue(
    app: &App,
    item: &str,
    max_checks: Option<u32>,
    context: Vec<(String, String)>,
) -> CoordinationResult<ExitStatus> {
    let context: BTreeMap<String, String> = context.into_iter().collect();
    let item = app.agent().enqueue(item, max_checks, context)?;
    println!(
        "Item '{}' is {} ({}/{} checks)",
        item.item_id, item.status, item.check_count, item.max_checks
    );
    Ok(ExitStatus::Healthy)
}

fn cmd_cleanup(app: &App) -> CoordinationResult<ExitStatus> {
    let cutoff = checked_before(app.clock.now(), app.config.coordinator.retention())?;
    let batches = app.tracker().purge_triggered_before(cutoff)?;
    let items = app.agent().purge_terminal(None)?;
    println!("Purged {} batches and {} work items", batches, items);
    Ok(ExitStatus::Healthy)
}

fn cmd_lock(app: &App, action: LockAction) -> CoordinationResult<ExitStatus> {
    let lock = app.lock();
    match action {
        LockAction::Acquire { key, holder, ttl_secs, wait } => {
            let ttl = ttl_secs.map(Duration::from_secs).unwrap_or_else(|| app.config.lock.ttl());
            let guard = if wait {
                lock.acquire_with_retry(&key, &holder, ttl, app.config.lock.retry_policy())?
            } else {
                lock.acquire_guard(&key, &holder, ttl)?
            };
            match guard {
                // The lock outlives this process; it ends at its TTL or on release.
                Some(guard) => {
                    print_json(&guard.persist())?;
                    Ok(ExitStatus::Healthy)
                }
                None => {
                    println!("'{}' is held by someone else", key);
                    Ok(ExitStatus::Warning)
                }
            }
        }
        LockAction::Release { key, holder } => {
            if lock.release(&key, &holder)? {
                println!("Released '{}'", key);
                Ok(ExitStatus::Healthy)
            } else {
                println!("'{}' is not held by {}", key, holder);
                Ok(ExitStatus::Warning)
            }
        }
        LockAction::Show { key } => match lock.read(&key)? {
            Some(info) => {
                print_json(&info)?;
                Ok(if info.is_expired_at(app.clock.now()) {
                    ExitStatus::Warning
                } else {
                    ExitStatus::Healthy
                })
            }
            None => {
                println!("'{}' is not locked", key);
                Ok(ExitStatus::Healthy)
            }
        },
        LockAction::Break { key } => {
            if lock.force_break(&key)? {
                println!("Broke '{}'", key);
            } else {
                println!("'{}' was not locked", key);
            }
            Ok(ExitStatus::Healthy)
        }
    }
}

/// One self-heal cycle under the cross-instance lock.
///
/// The lock TTL covers every pending item running all of its commands to
/// the timeout, so it cannot lapse while this instance is still working.
fn heal_cycle(app: &App, holder: &str) -> CoordinationResult<()> {
    let agent = app.agent();
    let pending = agent
        .list()?
        .iter()
        .filter(|item| item.status == ItemStatus::Pending)
        .count();
    let ttl = app.config.self_heal.cycle_lock_ttl(app.config.lock.ttl(), pending);
    let ran = app.lock().with_lock(HEAL_CYCLE_LOCK, holder, ttl, |_| {
        agent.run_cycle(CycleOptions::default())
    })?;
    match ran {
        Some(report) => {
            for alert in report.alerts() {
                tracing::error!("{}", alert);
            }
            if report.count(HealAction::Completed) > 0 {
                tracing::info!(completed = report.count(HealAction::Completed), "self-heal re-ran items");
            }
        }
        None => tracing::debug!("another instance is running self-heal"),
    }
    Ok(())
}

fn cmd_serve(app: App) -> CoordinationResult<ExitStatus> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CoordinationError::Config(format!("cannot start runtime: {}", e)))?;

    let app = Arc::new(app);
    let holder = holder_id();
    tracing::info!(stage = %app.config.stage.name, holder = %holder, "serving");

    runtime.block_on(async move {
        let monitor_every = Duration::from_secs(app.config.monitor.interval_secs.max(1));
        let heal_every = Duration::from_secs(app.config.self_heal.poll_interval_secs);
        let cleanup_every = Duration::from_secs(3600);

        let monitor_app = Arc::clone(&app);
        let monitor = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor_every);
            loop {
                ticker.tick().await;
                let app = Arc::clone(&monitor_app);
                let result = tokio::task::spawn_blocking(move || app.monitor().scan_stage(&app.tracker())).await;
                match result {
                    Ok(Ok(report)) => tracing::debug!(status = %report.exit_status(), "monitor pass"),
                    Ok(Err(e)) => tracing::error!(error = %e, "monitor pass failed"),
                    Err(e) => tracing::error!(error = %e, "monitor task panicked"),
                }
            }
        });

        let heal_enabled = app.config.self_heal.readiness_command.is_some();
        let heal_app = Arc::clone(&app);
        let heal = tokio::spawn(async move {
            if !heal_enabled {
                tracing::info!("self-heal disabled: no readiness command configured");
                return;
            }
            let mut ticker = tokio::time::interval(heal_every);
            loop {
                ticker.tick().await;
                let app = Arc::clone(&heal_app);
                let holder = holder.clone();
                match tokio::task::spawn_blocking(move || heal_cycle(&app, &holder)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!(error = %e, "self-heal cycle failed"),
                    Err(e) => tracing::error!(error = %e, "self-heal task panicked"),
                }
            }
        });

        let cleanup_app = Arc::clone(&app);
        let cleanup = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_every);
            loop {
                ticker.tick().await;
                let app = Arc::clone(&cleanup_app);
                match tokio::task::spawn_blocking(move || cmd_cleanup(&app)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::error!(error = %e, "cleanup failed"),
                    Err(e) => tracing::error!(error = %e, "cleanup task panicked"),
                }
            }
        });

        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for shutdown signal");
        }
        tracing::info!("shutting down");
        monitor.abort();
        heal.abort();
        cleanup.abort();
    });
    Ok(ExitStatus::Healthy)
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let app = match App::open(cli.config.as_deref(), cli.db) {
        Ok(app) => app,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(ExitStatus::Critical.code());
        }
    };

    let result = match cli.command {
        Commands::Register { batch, expected, workers } => cmd_register(&app, &batch, expected, &workers),
        Commands::Report { batch, worker, items, quality } => cmd_report(&app, &batch, &worker, items, &quality),
        Commands::Publish { batch, reason } => cmd_publish(&app, &batch, &reason),
        Commands::Fail { batch, worker, reason } => cmd_fail(&app, &batch, &worker, &reason),
        Commands::Status { batch } => cmd_status(&app, &batch),
        Commands::Monitor => cmd_monitor(&app),
        Commands::Validate { batch } => cmd_validate(&app, &batch),
        Commands::Heal { dry_run, lookback_hours } => cmd_heal(&app, dry_run, lookback_hours),
        Commands::Enqueue { item, max_checks, context } => cmd_enqueue(&app, &item, max_checks, context),
        Commands::Cleanup => cmd_cleanup(&app),
        Commands::Lock { action } => cmd_lock(&app, action),
        Commands::Serve => cmd_serve(app),
    };

    let status = match result {
        Ok(status) => status,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitStatus::Critical
        }
    };
    std::process::exit(status.code());
}
