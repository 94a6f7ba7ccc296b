use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tourq::config::{Config, StorageConfig};
use tourq::network::{setup_auto_retry, ConnectivityMonitor};
use tourq::queue::{CommandHandler, OfflineQueue, TourOperation};
use tourq::storage::{OperationId, Payload, PendingOperation};

fn init_logging() {
    let _ = LogTracer::init();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

#[derive(Parser)]
#[command(name = "tourq")]
#[command(about = "Inspect and replay the offline operation queue of the ski-touring client")]
struct Cli {
    /// JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory of the queue database (overrides config and TOURQ_DATA_DIR)
    #[arg(short, long, global = true)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Queue an operation for later delivery
    Enqueue {
        /// Operation kind (add_report, update_report, delete_report, sync_favorites)
        #[arg(short, long)]
        kind: TourOperation,
        /// Payload passed verbatim to the handler
        #[arg(short, long)]
        payload: String,
    },
    /// List pending operations
    List {
        /// Print JSON instead of a table
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print the number of pending operations
    Count,
    /// List operations that used up their retry budget
    Stuck {
        /// Attempt ceiling (defaults to the configured max_attempts)
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Remove one pending operation
    Remove {
        #[arg(long)]
        id: OperationId,
    },
    /// Remove every pending operation
    Clear {
        /// Required to confirm
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Attempt every pending operation once through a shell command
    Flush {
        /// Command run per operation; payload on stdin, kind in TOURQ_OPERATION_KIND
        #[arg(short, long)]
        exec: String,
        #[command(flatten)]
        delivery: DeliveryArgs,
    },
    /// Replay the queue through a shell command whenever the probe target becomes reachable
    Watch {
        /// host:port probed for connectivity (defaults to the configured probe_target)
        #[arg(long)]
        probe: Option<String>,
        /// Command run per operation; payload on stdin, kind in TOURQ_OPERATION_KIND
        #[arg(short, long)]
        exec: String,
        #[command(flatten)]
        delivery: DeliveryArgs,
    },
}

#[derive(clap::Args)]
struct DeliveryArgs {
    /// Attempt ceiling (defaults to the configured max_attempts)
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Kill the command and count a failed attempt after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.data_dir {
        match &mut config.storage {
            StorageConfig::Sled { data_dir, .. } => *data_dir = dir.clone(),
        }
    }
    Ok(config)
}

fn print_table(ops: &[PendingOperation]) {
    println!(
        "{:>8}  {:<15}  {:>13}  {:>8}  ERROR",
        "ID", "KIND", "CREATED_MS", "ATTEMPTS"
    );
    for op in ops {
        println!(
            "{:>8}  {:<15}  {:>13}  {:>8}  {}",
            op.id,
            op.kind,
            op.created_at,
            op.attempts,
            op.error.as_deref().unwrap_or("-")
        );
    }
}

fn print_json(ops: &[PendingOperation]) -> anyhow::Result<()> {
    let rows: Vec<serde_json::Value> = ops
        .iter()
        .map(|op| {
            serde_json::json!({
                "id": op.id.to_string(),
                "kind": op.kind,
                "payload": String::from_utf8_lossy(op.payload.as_bytes()),
                "created_at": op.created_at,
                "attempts": op.attempts,
                "last_attempt": op.last_attempt,
                "error": op.error,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let queue: OfflineQueue<TourOperation> =
        OfflineQueue::open(&config.storage).context("failed to open the operation store")?;

    match cli.command {
        Command::Enqueue { kind, payload } => {
            let id = queue.enqueue(kind, Payload::from(payload)).await?;
            println!("{id}");
        }
        Command::List { json } => {
            let ops = queue.list_pending().await?;
            if json {
                print_json(&ops)?;
            } else {
                print_table(&ops);
            }
        }
        Command::Count => {
            println!("{}", queue.count().await?);
        }
        Command::Stuck { max_attempts } => {
            let ceiling = max_attempts.unwrap_or(config.retry.max_attempts);
            print_table(&queue.stuck(ceiling).await?);
        }
        Command::Remove { id } => {
            queue.remove(id).await?;
            info!("Removed operation {id}");
        }
        Command::Clear { yes } => {
            anyhow::ensure!(yes, "refusing to clear the queue without --yes");
            queue.clear().await?;
        }
        Command::Flush { exec, delivery } => {
            let handlers = CommandHandler::table(
                &exec,
                &TourOperation::ALL,
                delivery.timeout_secs.map(Duration::from_secs),
            );
            let mut options = config.retry.process_options();
            if let Some(max_attempts) = delivery.max_attempts {
                options = options.with_max_attempts(max_attempts);
            }

            let summary = queue.process(&handlers, &options).await?;
            println!("success={} failed={}", summary.success, summary.failed);
        }
        Command::Watch {
            probe,
            exec,
            delivery,
        } => {
            let target = probe
                .or_else(|| config.connectivity.probe_target.clone())
                .context("no probe target: pass --probe or set connectivity.probe_target")?;

            let handlers = Arc::new(CommandHandler::table(
                &exec,
                &TourOperation::ALL,
                delivery.timeout_secs.map(Duration::from_secs),
            ));
            let mut options = config.retry.process_options();
            if let Some(max_attempts) = delivery.max_attempts {
                options = options.with_max_attempts(max_attempts);
            }

            let monitor = ConnectivityMonitor::new(&target, config.connectivity.probe_interval())
                .with_probe_timeout(config.connectivity.probe_timeout());
            let signal = monitor.signal();
            let probe_task = tokio::spawn(monitor.run());

            info!("Watching connectivity to {target}; pending operations replay when it is reachable");
            let handle = setup_auto_retry(queue.clone(), handlers, &signal, options);

            tokio::signal::ctrl_c().await?;
            handle.cancel();
            probe_task.abort();

            let status = handle.status().await;
            info!(
                "Stopped after {} runs ({} triggers ignored while busy); {} operations pending",
                status.runs_completed,
                status.ignored_triggers,
                queue.count().await?
            );
        }
    }

    Ok(())
}
