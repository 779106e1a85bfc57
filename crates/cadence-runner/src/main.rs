use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use cadence_core::CadenceConfig;
use cadence_scheduler::TaskExecutionCoordinator;
use cadence_store::{Allocator, IdAllocator, PoolStats, SqlitePool, Store};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

mod tasks;

use tasks::SqlTask;

/// Run recurring batch tasks at most once per configured number of days.
#[derive(Debug, Parser)]
#[command(name = "cadence", version)]
struct Cli {
    /// Config file (default: $CADENCE_CONFIG, then ~/.cadence/cadence.toml).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute every due task, each on its own worker thread.
    Run {
        /// Run even when the task is not yet due.
        #[arg(long)]
        force: bool,

        /// Invoke task bodies without executing statements or recording completion.
        #[arg(long)]
        dry_run: bool,

        /// Limit the run to these tasks (repeatable).
        #[arg(long = "task", value_name = "NAME")]
        tasks: Vec<String>,
    },

    /// Show each task's last run date, whether it is due, and pool stats.
    Status {
        /// Print machine-readable JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Serialize)]
struct TaskStatus {
    name: String,
    frequency_days: u32,
    last_run_date: Option<NaiveDate>,
    due: bool,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    today: NaiveDate,
    tasks: Vec<TaskStatus>,
    pool: PoolStats,
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cadence=info,cadence_scheduler=info,cadence_store=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // config: --config flag > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("CADENCE_CONFIG").ok());
    let config = CadenceConfig::load(config_path.as_deref())
        .with_context(|| format!("loading config ({})", config_path.as_deref().unwrap_or("default path")))?;

    config.database.ensure_parent_dir()?;
    info!(path = %config.database.path, max_connections = config.pool.max_connections, "opening SQLite pool");
    let pool = SqlitePool::open(&config);

    let result = match cli.cmd {
        Command::Run {
            force,
            dry_run,
            tasks,
        } => run(&config, &pool, force, dry_run, &tasks)
            .map(|code| ExitCode::from(u8::try_from(code).unwrap_or(1))),
        Command::Status { json } => status(&config, &pool, json).map(|()| ExitCode::SUCCESS),
    };

    pool.close();
    info!("pool closed");
    result
}

fn run(
    config: &CadenceConfig,
    pool: &SqlitePool,
    force: bool,
    dry_run: bool,
    only: &[String],
) -> anyhow::Result<i32> {
    cadence_scheduler::init_db(pool)?;
    info!("scheduler schema ready");

    for name in only {
        if config.task(name).is_none() {
            bail!("unknown task: {name}");
        }
    }

    let store: Arc<dyn Store> = Arc::new(pool.clone());
    let allocator: Arc<dyn Allocator> = Arc::new(IdAllocator::new(pool.clone(), &config.allocator));
    let coordinators: Vec<Arc<TaskExecutionCoordinator>> = config
        .tasks
        .iter()
        .filter(|t| only.is_empty() || only.contains(&t.name))
        .map(|t| {
            Arc::new(TaskExecutionCoordinator::from_config(
                t,
                SqlTask::new(t.statements.clone()),
                Arc::clone(&store),
                Arc::clone(&allocator),
            ))
        })
        .collect();

    if coordinators.is_empty() {
        info!("no tasks configured");
        return Ok(0);
    }

    let results = cadence_scheduler::run_all(&coordinators, force, dry_run);
    for (name, outcome) in &results {
        println!("{name:<24} {outcome}");
    }

    let code = results
        .iter()
        .map(|(_, o)| o.exit_code())
        .max()
        .unwrap_or(0);
    let stats = pool.stats();
    info!(
        created = stats.total_connections_created,
        reused = stats.connections_reused,
        failed_ops = stats.operations_failed,
        peak = stats.max_concurrent_observed,
        "run finished"
    );
    Ok(code)
}

fn status(config: &CadenceConfig, pool: &SqlitePool, json: bool) -> anyhow::Result<()> {
    cadence_scheduler::init_db(pool)?;
    let today = Local::now().date_naive();
    let records = cadence_scheduler::list_records(pool)?;

    let tasks = config
        .tasks
        .iter()
        .map(|t| {
            let record = records.iter().find(|r| r.task_name == t.name);
            TaskStatus {
                name: t.name.clone(),
                frequency_days: t.frequency_days,
                last_run_date: record.map(|r| r.last_run_date),
                due: record.map_or(true, |r| r.is_due(today, t.frequency_days)),
            }
        })
        .collect();
    let report = StatusReport {
        today,
        tasks,
        pool: pool.stats(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{:<24} {:>9} {:<12} due", "task", "every", "last run");
    for t in &report.tasks {
        let last = t
            .last_run_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<24} {:>8}d {:<12} {}",
            t.name,
            t.frequency_days,
            last,
            if t.due { "yes" } else { "no" }
        );
    }
    let p = &report.pool;
    println!();
    println!(
        "pool: {}/{} connections ({} idle), created {}, reused {}, ops {} ok / {} failed",
        p.pool_size,
        p.max_connections,
        p.idle_connections,
        p.total_connections_created,
        p.connections_reused,
        p.operations_completed,
        p.operations_failed
    );
    Ok(())
}
