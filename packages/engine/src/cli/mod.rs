//! Operational command surface for the sync engine.
//!
//! Thin layer over the engine facade: every verb builds the kernel, runs
//! one operation and renders the result in the requested format. Exit
//! code 0 on success, 1 on error.

pub mod render;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use crate::config::Config;
use crate::kernel::SyncKernel;
use crate::queue::JobStatus;
use crate::sync::resolver_from;
use self::render::{render, OutputFormat, Rows};

#[derive(Parser)]
#[command(name = "wp4odoo")]
#[command(about = "Operational CLI for the wp4odoo sync engine")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format for command results
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Override the site this invocation operates on
    #[arg(long, global = true)]
    site_id: Option<i64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Engine status: queue counters, breaker phases, health digest
    Status,

    /// Verify connectivity to the database and the remote system
    Test,

    /// Scheduler operations
    Sync {
        #[command(subcommand)]
        action: SyncCommands,
    },

    /// Queue maintenance
    Queue {
        #[command(subcommand)]
        action: QueueCommands,
    },

    /// Detect (and optionally remove) mappings whose remote record is gone
    Reconcile {
        module: String,
        entity_type: String,
        #[arg(long)]
        fix: bool,
    },

    /// Remove mappings whose local record is gone
    CleanupOrphans {
        #[arg(long)]
        module: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },

    /// Cache operations
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },

    /// Module administration
    Module {
        #[command(subcommand)]
        action: ModuleCommands,
    },
}

#[derive(Subcommand)]
enum SyncCommands {
    /// Run one scheduler tick
    Run {
        /// Report eligible work without driving it
        #[arg(long)]
        dry_run: bool,
        /// Restrict the tick to one module
        #[arg(long)]
        module: Option<String>,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Queue counters and health digest
    Stats,
    /// List jobs, newest first
    List {
        /// Filter by status (pending, processing, completed, failed)
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Reset all failed jobs to pending
    Retry,
    /// Delete terminal jobs older than the cutoff
    Cleanup {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    /// Cancel a pending job
    Cancel { id: i64 },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Drop cached settings and health metrics
    Flush,
}

#[derive(Subcommand)]
enum ModuleCommands {
    /// Modules known to the engine with their enabled flag
    List,
    /// Enable a module
    Enable { id: String },
    /// Disable a module
    Disable { id: String },
}

/// Entry point for the binary. Returns the process exit code.
pub async fn run() -> i32 {
    let cli = Cli::parse();
    match execute(cli).await {
        Ok(output) => {
            println!("{output}");
            0
        }
        Err(error) => {
            eprintln!("error: {error:#}");
            1
        }
    }
}

async fn execute(cli: Cli) -> Result<String> {
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(site_id) = cli.site_id {
        config.site_id = site_id;
    }

    // The operational binary links no domain modules; commands that need
    // one fail with a clear message.
    let kernel = SyncKernel::connect(config, resolver_from(Vec::new())).await?;
    kernel.migrate().await?;

    let format = cli.format;
    match cli.command {
        Commands::Status => status(&kernel, format).await,
        Commands::Test => test(&kernel, format).await,
        Commands::Sync { action } => match action {
            SyncCommands::Run { dry_run, module } => {
                sync_run(&kernel, format, dry_run, module.as_deref()).await
            }
        },
        Commands::Queue { action } => match action {
            QueueCommands::Stats => queue_stats(&kernel, format).await,
            QueueCommands::List { status, limit } => {
                queue_list(&kernel, format, status.as_deref(), limit).await
            }
            QueueCommands::Retry => {
                let reset = kernel.queue.retry_failed().await?;
                Ok(format!("{reset} failed jobs reset to pending"))
            }
            QueueCommands::Cleanup { days } => {
                let removed = kernel.queue.cleanup(days).await?;
                Ok(format!("{removed} terminal jobs removed"))
            }
            QueueCommands::Cancel { id } => {
                if kernel.queue.cancel(id).await? {
                    Ok(format!("job {id} cancelled"))
                } else {
                    bail!("job {id} not found or not pending")
                }
            }
        },
        Commands::Reconcile {
            module,
            entity_type,
            fix,
        } => reconcile(&kernel, format, &module, &entity_type, fix).await,
        Commands::CleanupOrphans { module, dry_run } => {
            let report = kernel
                .mapping_store
                .cleanup_orphans(&kernel.resolver, module.as_deref(), dry_run)
                .await?;
            let mut rows = Rows::new(&["module", "entity_type", "local_id", "remote_id"]);
            for orphan in &report.orphans {
                rows.push(vec![
                    orphan.module.clone(),
                    orphan.entity_type.clone(),
                    orphan.local_id.to_string(),
                    orphan.remote_id.to_string(),
                ]);
            }
            render(format, &report, &rows)
        }
        Commands::Cache { action } => match action {
            CacheCommands::Flush => {
                kernel.settings.flush_cache().await;
                kernel.queue.invalidate_health_cache().await;
                kernel.global_breaker.invalidate_cache().await;
                Ok("caches flushed".to_string())
            }
        },
        Commands::Module { action } => match action {
            ModuleCommands::List => module_list(&kernel, format).await,
            ModuleCommands::Enable { id } => {
                kernel.settings.set_module_enabled(&id, true).await?;
                Ok(format!("module {id} enabled"))
            }
            ModuleCommands::Disable { id } => {
                kernel.settings.set_module_enabled(&id, false).await?;
                Ok(format!("module {id} disabled"))
            }
        },
    }
}

#[derive(Serialize)]
struct StatusReport {
    site_id: i64,
    global_breaker: String,
    open_modules: Vec<String>,
    pending: i64,
    processing: i64,
    completed: i64,
    failed: i64,
    success_rate_24h: f64,
}

async fn status(kernel: &SyncKernel, format: OutputFormat) -> Result<String> {
    let stats = kernel.queue.get_stats().await?;
    let health = kernel.queue.get_health_metrics().await?;
    let phase = kernel.global_breaker.phase().await?;
    let open_modules: Vec<String> = kernel
        .module_breakers
        .snapshot()
        .await?
        .into_iter()
        .map(|(module, _)| module)
        .collect();

    let report = StatusReport {
        site_id: kernel.config.site_id,
        global_breaker: format!("{phase:?}"),
        open_modules,
        pending: stats.pending,
        processing: stats.processing,
        completed: stats.completed,
        failed: stats.failed,
        success_rate_24h: health.success_rate,
    };

    let mut rows = Rows::new(&["field", "value"]);
    rows.push(vec!["site_id".into(), report.site_id.to_string()]);
    rows.push(vec!["global_breaker".into(), report.global_breaker.clone()]);
    rows.push(vec!["open_modules".into(), report.open_modules.join(",")]);
    rows.push(vec!["pending".into(), report.pending.to_string()]);
    rows.push(vec!["processing".into(), report.processing.to_string()]);
    rows.push(vec!["completed".into(), report.completed.to_string()]);
    rows.push(vec!["failed".into(), report.failed.to_string()]);
    rows.push(vec![
        "success_rate_24h".into(),
        format!("{:.3}", report.success_rate_24h),
    ]);
    render(format, &report, &rows)
}

async fn test(kernel: &SyncKernel, format: OutputFormat) -> Result<String> {
    // Database: a trivial round trip.
    sqlx::query("SELECT 1").execute(&kernel.pool).await?;
    // Remote: authenticates on first use.
    let users = kernel.transport.search_count("res.users", json!([])).await?;

    #[derive(Serialize)]
    struct TestReport {
        database: bool,
        remote: bool,
        remote_users: i64,
    }
    let report = TestReport {
        database: true,
        remote: true,
        remote_users: users,
    };

    let mut rows = Rows::new(&["check", "result"]);
    rows.push(vec!["database".into(), "ok".into()]);
    rows.push(vec!["remote".into(), format!("ok ({users} users)")]);
    render(format, &report, &rows)
}

async fn sync_run(
    kernel: &SyncKernel,
    format: OutputFormat,
    dry_run: bool,
    module: Option<&str>,
) -> Result<String> {
    if dry_run {
        let now = chrono::Utc::now();
        let batch_size = kernel.settings.batch_size().await?;
        let eligible = match module {
            Some(module) => {
                kernel
                    .queue
                    .fetch_pending_for_module(module, batch_size, now)
                    .await?
            }
            None => kernel.queue.fetch_pending(batch_size, now).await?,
        };

        #[derive(Serialize)]
        struct DryRunReport {
            eligible: usize,
            batch_size: i64,
        }
        let report = DryRunReport {
            eligible: eligible.len(),
            batch_size,
        };
        let mut rows = Rows::new(&["id", "module", "entity_type", "action"]);
        for job in &eligible {
            rows.push(vec![
                job.id.to_string(),
                job.module.clone(),
                job.entity_type.clone(),
                format!("{:?}", job.action).to_lowercase(),
            ]);
        }
        return render(format, &report, &rows);
    }

    let report = kernel.scheduler().run(module).await?;
    let mut rows = Rows::new(&["processed", "iterations", "module"]);
    rows.push(vec![
        report.processed.to_string(),
        report.iterations.to_string(),
        report.module.clone().unwrap_or_else(|| "*".to_string()),
    ]);
    render(format, &report, &rows)
}

async fn queue_stats(kernel: &SyncKernel, format: OutputFormat) -> Result<String> {
    let stats = kernel.queue.get_stats().await?;
    let health = kernel.queue.get_health_metrics().await?;

    #[derive(Serialize)]
    struct QueueReport {
        pending: i64,
        processing: i64,
        completed: i64,
        failed: i64,
        completed_24h: i64,
        failed_24h: i64,
        success_rate_24h: f64,
        avg_latency_secs: Option<f64>,
    }
    let report = QueueReport {
        pending: stats.pending,
        processing: stats.processing,
        completed: stats.completed,
        failed: stats.failed,
        completed_24h: health.completed_24h,
        failed_24h: health.failed_24h,
        success_rate_24h: health.success_rate,
        avg_latency_secs: health.avg_latency_secs,
    };

    let mut rows = Rows::new(&["metric", "value"]);
    rows.push(vec!["pending".into(), report.pending.to_string()]);
    rows.push(vec!["processing".into(), report.processing.to_string()]);
    rows.push(vec!["completed".into(), report.completed.to_string()]);
    rows.push(vec!["failed".into(), report.failed.to_string()]);
    rows.push(vec![
        "success_rate_24h".into(),
        format!("{:.3}", report.success_rate_24h),
    ]);
    render(format, &report, &rows)
}

fn parse_status(status: &str) -> Result<JobStatus> {
    match status {
        "pending" => Ok(JobStatus::Pending),
        "processing" => Ok(JobStatus::Processing),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        other => bail!("unknown status: {other}"),
    }
}

async fn queue_list(
    kernel: &SyncKernel,
    format: OutputFormat,
    status: Option<&str>,
    limit: i64,
) -> Result<String> {
    let status = status.map(parse_status).transpose()?;
    let jobs = kernel.queue.list_jobs(status, limit).await?;

    let mut rows = Rows::new(&[
        "id",
        "module",
        "entity_type",
        "direction",
        "action",
        "local_id",
        "remote_id",
        "status",
        "attempts",
        "error",
    ]);
    for job in &jobs {
        rows.push(vec![
            job.id.to_string(),
            job.module.clone(),
            job.entity_type.clone(),
            format!("{:?}", job.direction).to_lowercase(),
            format!("{:?}", job.action).to_lowercase(),
            job.local_id.to_string(),
            job.remote_id.to_string(),
            format!("{:?}", job.status).to_lowercase(),
            job.attempts.to_string(),
            job.error_message.clone().unwrap_or_default(),
        ]);
    }
    render(format, &jobs, &rows)
}

async fn reconcile(
    kernel: &SyncKernel,
    format: OutputFormat,
    module: &str,
    entity_type: &str,
    fix: bool,
) -> Result<String> {
    let Some(module_impl) = kernel.resolver.as_ref()(module) else {
        bail!("module not registered: {module}");
    };
    let Some(remote_model) = module_impl.remote_model(entity_type) else {
        bail!("entity type not registered: {entity_type}");
    };

    let report = kernel
        .reconciler()
        .run(module, entity_type, &remote_model, fix)
        .await?;

    let mut rows = Rows::new(&["orphaned_remote_id"]);
    for id in &report.orphaned_remote_ids {
        rows.push(vec![id.to_string()]);
    }
    render(format, &report, &rows)
}

async fn module_list(kernel: &SyncKernel, format: OutputFormat) -> Result<String> {
    // Modules observed in durable state, whether or not an implementation
    // is linked into this binary.
    let known: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT module FROM (
            SELECT module FROM sync_jobs
            UNION
            SELECT module FROM sync_mappings
        ) modules
        ORDER BY module
        "#,
    )
    .fetch_all(&kernel.pool)
    .await?;

    #[derive(Serialize)]
    struct ModuleRow {
        module: String,
        enabled: bool,
    }

    let mut entries = Vec::new();
    let mut rows = Rows::new(&["module", "enabled"]);
    for (module,) in known {
        let enabled = kernel.settings.module_enabled(&module).await?;
        rows.push(vec![module.clone(), enabled.to_string()]);
        entries.push(ModuleRow { module, enabled });
    }
    render(format, &entries, &rows)
}
