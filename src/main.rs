//! Clustra Demo Client
//!
//! Opens a cache in either mode and runs a short session against it: writes,
//! a bulk read, a query, a merged reader and a lock round-trip. The cluster
//! mode runs against the in-memory mock cluster.
//!
//! ```text
//!   Args ──▶ ClientConfig ──▶ CacheRegistry::open ──▶ session ──▶ close
//!                                  │
//!                    inproc: InMemoryEngine │ cluster: MockCluster(N)
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use clustra::domain::options::{GetOptions, WriteOptions};
use clustra::domain::query::QueryParams;
use clustra::domain::LockAccessType;
use clustra::{CacheInitParams, CacheRegistry, ClientConfig, InMemoryEngine, MockCluster};

// =============================================================================
// CLI Arguments
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Inproc,
    Cluster,
}

/// Clustra - run a demo session against an in-process or clustered cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache name
    #[arg(long, env = "CLUSTRA_CACHE", default_value = "demo")]
    cache: String,

    /// Cache topology
    #[arg(long, env = "CLUSTRA_MODE", value_enum, default_value = "cluster")]
    mode: Mode,

    /// Number of mock servers in cluster mode
    #[arg(long, env = "CLUSTRA_SERVERS", default_value = "3")]
    servers: usize,

    /// Number of items written by the session
    #[arg(long, env = "CLUSTRA_ITEMS", default_value = "20")]
    items: usize,

    /// YAML client configuration
    #[arg(long, env = "CLUSTRA_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    id: usize,
    region: String,
    total: f64,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let config = match &args.config {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("loading client configuration from {}", path.display()))?,
        None => ClientConfig::default(),
    };

    info!("Starting Clustra demo session");
    info!("  Cache: {}", args.cache);
    info!("  Mode: {:?}", args.mode);
    info!("  Operation timeout: {:?}", config.operation_timeout());

    let params = match args.mode {
        Mode::Inproc => CacheInitParams::in_proc(Arc::new(InMemoryEngine::new(&args.cache))),
        Mode::Cluster => {
            let cluster = MockCluster::new(args.servers);
            info!("  Servers: {:?}", cluster.servers());
            CacheInitParams::out_proc(cluster)
        }
    }
    .with_config(config);

    let registry = CacheRegistry::new();
    let cache = registry.open(&args.cache, params)?;

    // Writes
    let mut entries = Vec::with_capacity(args.items);
    for id in 0..args.items {
        let order = Order {
            id,
            region: if id % 2 == 0 { "eu" } else { "us" }.to_string(),
            total: 10.0 * id as f64,
        };
        let item = cache
            .item(&order)?
            .with_named_tag("region", serde_json::json!(order.region))
            .with_named_tag("total", serde_json::json!(order.total));
        entries.push((format!("order:{}", id), item));
    }
    let written = cache.insert_bulk(entries, WriteOptions::default()).await?;
    info!(
        written = written.versions.len(),
        failed = written.failures.len(),
        "Bulk insert finished"
    );

    // Reads
    let keys: Vec<String> = (0..args.items).map(|id| format!("order:{}", id)).collect();
    let orders = cache.get_bulk::<Order>(&keys).await?;
    info!(found = orders.len(), count = cache.count().await?, "Bulk read finished");

    // Query and reader
    let mut params = QueryParams::new();
    params.insert("region".into(), serde_json::json!("eu"));
    let matched = cache
        .search("SELECT * WHERE region = ?region", &params)
        .await?;
    info!(matched = matched.len(), "Search finished");

    let mut reader = cache
        .execute_reader("SELECT region, total ORDER BY total DESC", &QueryParams::new(), true, 0)
        .await?;
    let mut rows = 0;
    while reader.read().await? {
        rows += 1;
    }
    reader.close().await;
    info!(rows, partitions = reader.partition_count(), "Reader drained");

    // Lock round-trip
    let (acquired, lock) = cache.lock("order:0", Duration::from_secs(5)).await?;
    if acquired {
        let fetched = cache
            .get_with("order:0", &GetOptions::with_lock(lock.clone(), LockAccessType::UseLock))
            .await?;
        info!(lock = %fetched.lock, "Read under lock");
        cache.unlock("order:0", &lock).await?;
    } else {
        warn!(holder = %lock, "Could not lock order:0");
    }

    registry.close(&args.cache).await?;
    info!("Demo session complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()?;
    }
    Ok(())
}
