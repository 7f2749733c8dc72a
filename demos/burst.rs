//! Replays a fill-down burst against a slow in-process ledger service and reports how many remote calls it took.
//!
//! ```text
//! RUST_LOG=ledger_cache=debug cargo run --example burst --features simulation -- --cells 500 --spacing-ms 5
//! ```

use anyhow::Result;
use clap::Parser;
use fieldx::fxstruct;
use ledger_cache::prelude::*;
use ledger_cache::test::MockRemote;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::info;

#[derive(Debug, Clone, clap::Parser)]
#[fxstruct(no_new, get(copy))]
#[clap(about, version, name = "burst")]
struct Cli {
    /// Number of formula cells in the filled range.
    #[clap(long, default_value_t = 200)]
    cells: usize,

    /// Delay between two consecutive cell evaluations.
    #[clap(long, default_value_t = 2)]
    spacing_ms: u64,

    /// Latency of the simulated ledger service.
    #[clap(long, default_value_t = 1500)]
    latency_ms: u64,

    /// Accounting month of the filled column.
    #[clap(long, default_value = "Jan 2025")]
    #[fieldx(get(clone))]
    period: String,

    /// Collection window of a pending query.
    #[clap(long, default_value_t = 150)]
    collection_ms: u64,

    /// Force build mode for the whole burst instead of relying on detection.
    #[clap(long)]
    build_mode: bool,

    /// Keep the persistent tier in this JSON file instead of memory.
    #[clap(long)]
    #[fieldx(get(clone))]
    store: Option<PathBuf>,
}

fn setup_tracing() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}

async fn recalc(coordinator: &Arc<Coordinator<MockRemote>>, cli: &Cli) -> Result<Duration> {
    let started = Instant::now();
    let mut tasks = JoinSet::new();
    for cell in 0..cli.cells() {
        let coordinator = coordinator.clone();
        let params = EvalParams::new(format!("{}", 1000 + cell), cli.period());
        tasks.spawn(async move { coordinator.evaluate(&params).await });
        if cli.spacing_ms() > 0 {
            tokio::time::sleep(Duration::from_millis(cli.spacing_ms())).await;
        }
    }

    let mut total = 0.0;
    while let Some(result) = tasks.join_next().await {
        total += result??;
    }
    info!(total, "recalculation finished");
    Ok(started.elapsed())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing()?;

    let remote = Arc::new(MockRemote::new(Duration::from_millis(cli.latency_ms())));
    for cell in (0..cli.cells()).step_by(3) {
        remote.set_value(&format!("{}", 1000 + cell), &cli.period(), (cell as f64) * 10.0);
    }

    let store: Arc<dyn PersistentStore> = match cli.store() {
        Some(path) => Arc::new(JsonFileStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    };

    let coordinator = Coordinator::builder()
        .remote(remote.clone())
        .store(store)
        .collection_delay(Duration::from_millis(cli.collection_ms()))
        .build()?;

    if cli.build_mode() {
        coordinator.enter_build_mode();
    }
    let cold = recalc(&coordinator, &cli).await?;
    coordinator.exit_build_mode();
    let warm = recalc(&coordinator, &cli).await?;

    println!("cells:          {}", cli.cells());
    println!("remote calls:   {}", remote.call_count());
    println!("cold recalc:    {cold:?}");
    println!("warm recalc:    {warm:?}");
    println!("{}", serde_json::to_string_pretty(&coordinator.stats())?);

    Ok(())
}
