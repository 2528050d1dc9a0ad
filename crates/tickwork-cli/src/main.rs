use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};

use tickwork_core::TickworkConfig;
use tickwork_scheduler::{
    clock, schedule, HandlerRegistry, Job, JobMirror, JobStore, Millis, Scheduler,
    SchedulerConfig, SqliteMirror,
};

mod handlers;

#[derive(Parser)]
#[command(name = "tickwork")]
#[command(about = "Tick-driven job scheduler with a durable SQLite mirror", long_about = None)]
struct Cli {
    /// Config file (falls back to ~/.tickwork/tickwork.toml)
    #[arg(long, global = true, env = "TICKWORK_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recover persisted jobs and run the tick loop until Ctrl-C
    Run,

    /// Queue a one-shot job
    Add {
        /// Handler name, e.g. consoleHandler
        handler: String,

        /// Delay before the job is due
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,

        /// JSON payload passed to the handler
        #[arg(long, default_value = "{}")]
        data: String,
    },

    /// Queue a cron-driven recurring job
    AddRecurring {
        handler: String,

        /// Six-field cron expression, seconds first
        cron: String,

        #[arg(long, default_value = "{}")]
        data: String,
    },

    /// Queue a job that repeats at a fixed interval
    AddInterval {
        handler: String,

        interval_ms: u64,

        #[arg(long, default_value = "{}")]
        data: String,
    },

    /// Show persisted jobs
    List {
        /// Only pending jobs that are already due
        #[arg(long)]
        due: bool,
    },

    /// Preview the next occurrences of a cron expression
    Next {
        expression: String,

        #[arg(long, default_value_t = 5)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tickwork=info,tickwork_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // Pure computation; no database needed.
    if let Commands::Next { expression, count } = &cli.command {
        return print_next(expression, *count);
    }

    // load config: --config / TICKWORK_CONFIG > ~/.tickwork/tickwork.toml
    let config = TickworkConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        TickworkConfig::default()
    });

    config.database.ensure_parent_dir()?;
    info!(path = %config.database.path, "opening job database");
    let mirror = Arc::new(SqliteMirror::open(&config.database.path)?);

    let registry = Arc::new(HandlerRegistry::new());
    handlers::register_builtins(&registry)?;

    let store = Arc::new(JobStore::new(registry, mirror.clone()));
    store.init()?;

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        SchedulerConfig::from(&config.scheduler),
    ));

    let outcome = dispatch(cli.command, &scheduler, mirror.as_ref()).await;

    mirror.close()?;
    outcome
}

async fn dispatch(
    command: Commands,
    scheduler: &Arc<Scheduler>,
    mirror: &dyn JobMirror,
) -> anyhow::Result<()> {
    match command {
        Commands::Run => {
            scheduler.start().await;
            info!(
                pending = scheduler.store().pending_count(),
                "tickwork running, press Ctrl-C to stop"
            );
            tokio::signal::ctrl_c().await?;
            info!("shutdown requested");
            scheduler.shutdown().await;
        }
        Commands::Add {
            handler,
            delay_ms,
            data,
        } => {
            warn_if_unknown(&handler);
            let id = scheduler.schedule_job(&handler, delay_ms, parse_data(&data)?)?;
            println!("{id}");
        }
        Commands::AddRecurring {
            handler,
            cron,
            data,
        } => {
            warn_if_unknown(&handler);
            let id = scheduler.schedule_recurring_job(&handler, &cron, parse_data(&data)?)?;
            println!("{id}");
            println!("{}", schedule::describe(&cron));
        }
        Commands::AddInterval {
            handler,
            interval_ms,
            data,
        } => {
            warn_if_unknown(&handler);
            let id = scheduler.schedule_interval_job(&handler, interval_ms, parse_data(&data)?)?;
            println!("{id}");
        }
        Commands::List { due } => {
            let jobs: Vec<Job> = if due {
                mirror
                    .get_due(clock::now_ms())?
                    .into_iter()
                    .filter_map(|record| Job::from_record(record).ok())
                    .collect()
            } else {
                scheduler.store().list_jobs()
            };
            if jobs.is_empty() {
                println!("no jobs");
            }
            for job in &jobs {
                print_job(job);
            }
        }
        // Handled before the database is opened.
        Commands::Next { .. } => {}
    }
    Ok(())
}

fn print_next(expression: &str, count: usize) -> anyhow::Result<()> {
    let times = schedule::next_occurrences(expression, count, clock::now_ms())?;
    for at in times {
        println!("{}", format_time(at));
    }
    Ok(())
}

fn print_job(job: &Job) {
    println!(
        "{:<28} {:<10} {:<26} {:<16} {}",
        job.id,
        job.status,
        format_time(job.schedule_time),
        job.handler_name,
        job.schedule_description()
    );
    if let Some(err) = &job.last_error {
        println!("    last error (attempt {}): {err}", job.retry_count);
    }
}

fn format_time(at: Millis) -> String {
    DateTime::<Utc>::from_timestamp_millis(at)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| at.to_string())
}

fn parse_data(raw: &str) -> anyhow::Result<Value> {
    serde_json::from_str(raw).map_err(|e| anyhow::anyhow!("--data is not valid JSON: {e}"))
}

fn warn_if_unknown(handler: &str) {
    if !handlers::is_builtin(handler) {
        warn!(
            %handler,
            "no built-in handler has this name; the job will fail unless the running process registers it"
        );
    }
}
