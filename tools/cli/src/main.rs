//! txqueue CLI - Command line interface for the transaction sync queue.
//!
//! This tool inspects and drives a durable transaction queue: enqueue
//! transactions, look at their status, sync them to a remote endpoint, and
//! run a long-lived worker that keeps syncing until interrupted.

mod endpoint;
mod lock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use txqueue_common::{Error, TransactionId};
use txqueue_storage::{open_store, SnapshotStore, STORE_KINDS};
use txqueue_sync::{
    AcceptAll, EventKind, NewTransaction, PaymentPayloadValidator, PayloadValidator, Priority,
    QueueBuilder, QueueConfig, RemoteEndpoint, SubmitResponse, Transaction, TransactionFilter,
    TransactionKind, TransactionQueue, TransactionStatus,
};

use endpoint::HttpEndpoint;
use lock::QueueLock;

/// Sync interval of `run` when neither the flag nor the config sets one.
const DEFAULT_RUN_INTERVAL_MS: u64 = 30_000;

#[derive(Parser)]
#[command(name = "txqueue")]
#[command(about = "txqueue - Offline-durable transaction sync queue")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Snapshot backend: "memory", "file" or "sqlite".
    #[arg(long, global = true, default_value = "file")]
    store: String,

    /// Snapshot location (default: the user data directory).
    #[arg(long, global = true)]
    path: Option<PathBuf>,

    /// Queue configuration file (JSON). Missing fields take defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a transaction to the queue.
    Enqueue {
        /// Transaction kind: payment, refund, void or capture.
        #[arg(short, long)]
        kind: TransactionKind,

        /// Payload as a JSON object.
        #[arg(short = 'd', long)]
        payload: String,

        /// Priority: low, normal, high or critical.
        #[arg(short, long, default_value = "normal")]
        priority: Priority,

        /// Retry budget (default from configuration).
        #[arg(long)]
        max_retries: Option<u32>,

        /// ID of a transaction that must complete first. Repeatable.
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,

        /// Free-form label. Repeatable.
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Accept the payload without the payment checks.
        #[arg(long)]
        skip_validation: bool,
    },

    /// Show one transaction.
    Get {
        /// Transaction ID.
        id: String,
    },

    /// List transactions, newest first.
    List {
        #[arg(short, long)]
        status: Option<TransactionStatus>,

        #[arg(short, long)]
        kind: Option<TransactionKind>,

        #[arg(short, long)]
        priority: Option<Priority>,

        /// Match transactions carrying any of these tags. Repeatable.
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Remove a transaction and cancel its retries.
    Remove {
        /// Transaction ID.
        id: String,
    },

    /// Run one sync cycle against the endpoint.
    Process {
        /// Endpoint URL transactions are POSTed to.
        #[arg(short, long)]
        endpoint: String,

        /// Request timeout in seconds.
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Show queue metrics.
    Metrics,

    /// Remove completed transactions past the retention window.
    Cleanup {
        /// Retention in days (default from configuration).
        #[arg(short, long)]
        days: Option<u32>,
    },

    /// Keep syncing in the background until Ctrl-C.
    Run {
        /// Endpoint URL transactions are POSTed to.
        #[arg(short, long)]
        endpoint: String,

        /// Request timeout in seconds.
        #[arg(long, default_value_t = 30)]
        timeout: u64,

        /// Sync interval in seconds (overrides configuration, default 30).
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let config = load_config(cli.config.as_deref())?;
    let location = snapshot_location(&cli.store, cli.path.as_deref())?;
    let store = open_backend(&cli.store, location.as_deref())?;

    match cli.command {
        Commands::Enqueue {
            kind,
            payload,
            priority,
            max_retries,
            depends_on,
            tags,
            skip_validation,
        } => {
            let validator: Arc<dyn PayloadValidator> = if skip_validation {
                Arc::new(AcceptAll)
            } else {
                Arc::new(PaymentPayloadValidator)
            };
            let _lock = lock_queue(location.as_deref())?;
            let queue = open_queue(store, Arc::new(NoEndpoint), one_shot(config), validator).await?;

            let payload = serde_json::from_str(&payload).context("Payload is not valid JSON")?;
            let mut request = NewTransaction::new(kind, payload).with_priority(priority);
            if let Some(max_retries) = max_retries {
                request = request.with_max_retries(max_retries);
            }
            for dep in depends_on {
                request = request.depends_on(parse_id(&dep)?);
            }
            for tag in tags {
                request = request.with_tag(tag);
            }

            cmd_enqueue(&queue, request).await
        }

        Commands::Get { id } => {
            let queue = open_inspector(store, config).await?;
            cmd_get(&queue, &parse_id(&id)?).await
        }

        Commands::List {
            status,
            kind,
            priority,
            tags,
            json,
        } => {
            let queue = open_inspector(store, config).await?;
            let filter = TransactionFilter {
                status,
                kind,
                priority,
                tags,
            };
            cmd_list(&queue, &filter, json).await
        }

        Commands::Remove { id } => {
            let _lock = lock_queue(location.as_deref())?;
            let queue = open_writer(store, config).await?;
            cmd_remove(&queue, &parse_id(&id)?).await
        }

        Commands::Process { endpoint, timeout } => {
            let endpoint = http_endpoint(&endpoint, timeout)?;
            let _lock = lock_queue(location.as_deref())?;
            let queue =
                open_queue(store, endpoint, one_shot(config), Arc::new(AcceptAll)).await?;
            cmd_process(&queue).await
        }

        Commands::Metrics => {
            let queue = open_inspector(store, config).await?;
            cmd_metrics(&queue).await
        }

        Commands::Cleanup { days } => {
            let days = days.unwrap_or(config.retention_days);
            let _lock = lock_queue(location.as_deref())?;
            let queue = open_writer(store, config).await?;
            cmd_cleanup(&queue, days).await
        }

        Commands::Run {
            endpoint,
            timeout,
            interval,
        } => {
            let mut config = config;
            if let Some(secs) = interval {
                config.sync_interval_ms = Some(secs.saturating_mul(1000));
            } else if config.sync_interval_ms.is_none() {
                config.sync_interval_ms = Some(DEFAULT_RUN_INTERVAL_MS);
            }
            config.validate().context("Invalid configuration")?;

            let endpoint = http_endpoint(&endpoint, timeout)?;
            let _lock = lock_queue(location.as_deref())?;
            let queue = open_queue(store, endpoint, config, Arc::new(AcceptAll)).await?;
            cmd_run(&queue).await
        }

        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "txqueue", &mut std::io::stdout());
            Ok(())
        }
    }
}

/// Endpoint for commands that never sync.
struct NoEndpoint;

#[async_trait]
impl RemoteEndpoint for NoEndpoint {
    async fn submit(&self, _transaction: &Transaction) -> txqueue_common::Result<SubmitResponse> {
        Err(Error::Network("no endpoint configured".to_string()))
    }
}

fn load_config(path: Option<&Path>) -> Result<QueueConfig> {
    let Some(path) = path else {
        return Ok(QueueConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    QueueConfig::from_json(&json).with_context(|| format!("Invalid config {}", path.display()))
}

/// Commands that exit right away must not start background syncs.
fn one_shot(config: QueueConfig) -> QueueConfig {
    QueueConfig {
        auto_sync: false,
        cleanup_interval_ms: None,
        sync_interval_ms: None,
        ..config
    }
}

fn default_path(store: &str) -> Result<PathBuf> {
    let dir = dirs::data_dir()
        .context("No data directory on this platform; pass --path")?
        .join("txqueue");
    let file = match store {
        "sqlite" => "queue.db",
        _ => "queue.snapshot",
    };
    Ok(dir.join(file))
}

/// Where the snapshot lives, or `None` for the memory store.
fn snapshot_location(store: &str, path: Option<&Path>) -> Result<Option<PathBuf>> {
    if !STORE_KINDS.contains(&store) {
        anyhow::bail!(
            "Unknown store '{}'. Available: {}",
            store,
            STORE_KINDS.join(", ")
        );
    }
    if store == "memory" {
        warn!("Memory store selected; nothing will be kept after exit");
        return Ok(None);
    }
    match path {
        Some(path) => Ok(Some(path.to_path_buf())),
        None => default_path(store).map(Some),
    }
}

fn open_backend(store: &str, location: Option<&Path>) -> Result<Arc<dyn SnapshotStore>> {
    let store_config = match location {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            serde_json::json!({ "path": path.to_string_lossy() })
        }
        None => serde_json::Value::Null,
    };
    open_store(store, &store_config).with_context(|| format!("Failed to open {} store", store))
}

/// Commands that change the queue hold this for their whole run.
fn lock_queue(location: Option<&Path>) -> Result<Option<QueueLock>> {
    location.map(QueueLock::acquire).transpose()
}

fn http_endpoint(url: &str, timeout_secs: u64) -> Result<Arc<dyn RemoteEndpoint>> {
    let endpoint = HttpEndpoint::new(url, Duration::from_secs(timeout_secs))
        .context("Failed to set up endpoint")?;
    Ok(Arc::new(endpoint))
}

async fn open_queue(
    store: Arc<dyn SnapshotStore>,
    endpoint: Arc<dyn RemoteEndpoint>,
    config: QueueConfig,
    validator: Arc<dyn PayloadValidator>,
) -> Result<TransactionQueue> {
    QueueBuilder::new(store, endpoint)
        .with_config(config)
        .with_validator(validator)
        .build()
        .await
        .context("Failed to open queue")
}

/// Queue for one-shot changes that never sync.
async fn open_writer(store: Arc<dyn SnapshotStore>, config: QueueConfig) -> Result<TransactionQueue> {
    open_queue(store, Arc::new(NoEndpoint), one_shot(config), Arc::new(AcceptAll)).await
}

/// Queue for looking only. It never writes, so it needs no lock and is
/// safe next to a running worker.
async fn open_inspector(
    store: Arc<dyn SnapshotStore>,
    config: QueueConfig,
) -> Result<TransactionQueue> {
    QueueBuilder::new(store, Arc::new(NoEndpoint))
        .with_config(one_shot(config))
        .read_only()
        .build()
        .await
        .context("Failed to open queue")
}

fn parse_id(id: &str) -> Result<TransactionId> {
    TransactionId::new(id).with_context(|| format!("Invalid transaction ID '{}'", id))
}

/// Add a transaction.
async fn cmd_enqueue(queue: &TransactionQueue, request: NewTransaction) -> Result<()> {
    let id = queue
        .enqueue(request)
        .await
        .context("Failed to enqueue transaction")?;
    println!("{}", id);
    Ok(())
}

/// Print a transaction as JSON.
async fn cmd_get(queue: &TransactionQueue, id: &TransactionId) -> Result<()> {
    let tx = queue
        .get(id)
        .await
        .with_context(|| format!("Transaction {} not found", id))?;
    println!("{}", serde_json::to_string_pretty(&tx)?);
    Ok(())
}

/// List transactions.
async fn cmd_list(queue: &TransactionQueue, filter: &TransactionFilter, json: bool) -> Result<()> {
    let transactions = queue.list(filter).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&transactions)?);
        return Ok(());
    }

    if transactions.is_empty() {
        println!("No transactions.");
        return Ok(());
    }
    for tx in transactions {
        let retries = format!("{}/{}", tx.retry_count(), tx.max_retries);
        println!(
            "  {}  {:<8} {:<10} {:<8} retries {:<5} {}",
            tx.id,
            tx.kind.as_str(),
            tx.status().as_str(),
            tx.priority.as_str(),
            retries,
            tx.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(error) = &tx.last_error {
            println!("      last error: {}", error);
        }
    }
    Ok(())
}

/// Remove a transaction.
async fn cmd_remove(queue: &TransactionQueue, id: &TransactionId) -> Result<()> {
    if queue.remove(id).await.context("Failed to remove transaction")? {
        println!("Removed {}", id);
    } else {
        println!("No transaction {}", id);
    }
    Ok(())
}

/// Run a single sync cycle.
async fn cmd_process(queue: &TransactionQueue) -> Result<()> {
    let result = queue.process_queue().await.context("Sync failed")?;

    println!("Sync finished in {:?}:", result.duration);
    println!("  Successful: {}", result.successful.len());
    for id in &result.successful {
        println!("    {}", id);
    }
    println!("  Failed: {}", result.failed.len());
    for id in &result.failed {
        println!("    {}", id);
    }
    println!("  Retrying: {}", result.retried);
    println!("  Conflicts: {}", result.conflicts.len());
    for conflict in &result.conflicts {
        println!(
            "    {} {:?} -> {:?}{}",
            conflict.transaction_id,
            conflict.conflict_type,
            conflict.resolution,
            conflict
                .details
                .as_deref()
                .map(|d| format!(" ({})", d))
                .unwrap_or_default()
        );
    }
    Ok(())
}

/// Show metrics.
async fn cmd_metrics(queue: &TransactionQueue) -> Result<()> {
    let metrics = queue.metrics().await;

    println!("Queue metrics:");
    println!("  Total: {}", metrics.total);
    println!("  Pending: {}", metrics.pending);
    println!("  Processing: {}", metrics.processing);
    println!("  Retrying: {}", metrics.retrying);
    println!("  Completed: {}", metrics.completed);
    println!("  Failed: {}", metrics.failed);
    println!("  Stalled: {}", metrics.stalled);
    println!("  Success rate: {:.1}%", metrics.success_rate * 100.0);
    match metrics.last_sync_time {
        Some(at) => println!("  Last sync: {}", at),
        None => println!("  Last sync: never"),
    }
    Ok(())
}

/// Remove old completed transactions.
async fn cmd_cleanup(queue: &TransactionQueue, days: u32) -> Result<()> {
    let count = queue.cleanup(days).await.context("Cleanup failed")?;
    println!("Removed {} completed transactions older than {} days", count, days);
    Ok(())
}

/// Sync until interrupted.
async fn cmd_run(queue: &TransactionQueue) -> Result<()> {
    for kind in [
        EventKind::TransactionFailed,
        EventKind::TransactionStalled,
        EventKind::SyncFailed,
    ] {
        queue.on(kind, |event| warn!("{}", describe(event)));
    }

    info!("Worker started, press Ctrl-C to stop");
    if let Err(e) = queue.process_queue().await {
        warn!("Initial sync failed: {}", e);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    queue.shutdown();
    Ok(())
}

fn describe(event: &txqueue_sync::QueueEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|_| format!("{:?}", event))
}
