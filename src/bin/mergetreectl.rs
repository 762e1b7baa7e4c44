//! mergetreectl - drive and inspect merge tree tables from the command line

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{bounded, select, tick};
use tracing::info;

use mergetree::background_pool::BackgroundPool;
use mergetree::disk_space::DiskSpaceMonitor;
use mergetree::merge_tree::{Row, TableMergeController};
use mergetree::resource::HostProfile;
use mergetree::settings::EngineConfig;
use mergetree::MergeOutcome;

#[derive(Parser)]
#[command(name = "mergetreectl")]
#[command(version, about = "Run and inspect background merging of merge tree tables")]
struct Cli {
    /// Directory holding engine.json and one subdirectory per table
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert synthetic blocks into demo tables while background merges run
    Run {
        /// Number of tables sharing the pool
        #[arg(long, default_value = "2")]
        tables: usize,

        /// Blocks inserted into each table
        #[arg(long, default_value = "50")]
        blocks: usize,

        /// Rows per block
        #[arg(long, default_value = "1000")]
        rows: usize,

        /// Delay between insert rounds
        #[arg(long, default_value = "100")]
        interval_ms: u64,

        /// Worker threads (defaults to engine.json, else auto-tuned)
        #[arg(long)]
        pool_size: Option<usize>,
    },

    /// Force merges of a table
    Optimize {
        table: String,

        /// Keep merging until nothing is left to merge
        #[arg(long)]
        until_done: bool,
    },

    /// List the active parts of a table
    Parts { table: String },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.data_dir)
        .with_context(|| format!("creating data directory {:?}", cli.data_dir))?;
    let config = load_config(&cli.data_dir)?;

    match cli.command {
        Commands::Run {
            tables,
            blocks,
            rows,
            interval_ms,
            pool_size,
        } => run(
            &cli.data_dir,
            config,
            tables,
            blocks,
            rows,
            Duration::from_millis(interval_ms),
            pool_size,
        ),
        Commands::Optimize { table, until_done } => optimize(&cli.data_dir, config, &table, until_done),
        Commands::Parts { table } => parts(&cli.data_dir, config, &table),
    }
}

fn load_config(data_dir: &Path) -> Result<EngineConfig> {
    match EngineConfig::read_from(data_dir).context("reading engine.json")? {
        Some(config) => Ok(config),
        None => Ok(EngineConfig {
            pool: HostProfile::probe().pool_config(),
            ..EngineConfig::default()
        }),
    }
}

fn open_table(data_dir: &Path, config: &EngineConfig, name: &str) -> Result<TableMergeController> {
    let disk = DiskSpaceMonitor::system(config.keep_free_bytes);
    TableMergeController::open(name, data_dir.join(name), config.table.clone(), disk)
        .with_context(|| format!("opening table {name}"))
}

/// Deterministic pseudo-random key for row `i` of block `block`.
fn synthetic_key(table: &str, block: usize, i: usize) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(table.as_bytes());
    hasher.update(&(block as u64).to_le_bytes());
    hasher.update(&(i as u64).to_le_bytes());
    let hash = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

fn run(
    data_dir: &Path,
    mut config: EngineConfig,
    table_count: usize,
    blocks: usize,
    rows: usize,
    interval: Duration,
    pool_size: Option<usize>,
) -> Result<()> {
    if let Some(size) = pool_size {
        config.pool.background_pool_size = size;
    }
    let pool = BackgroundPool::new(&config.pool).context("starting background pool")?;
    let disk = DiskSpaceMonitor::system(config.keep_free_bytes);

    let mut tables = Vec::with_capacity(table_count);
    for i in 0..table_count {
        let name = format!("table_{i}");
        let table = TableMergeController::open(
            name.as_str(),
            data_dir.join(&name),
            config.table.clone(),
            Arc::clone(&disk),
        )
        .with_context(|| format!("opening table {name}"))?;
        table.attach_to(&pool)?;
        tables.push(table);
    }
    info!(tables = tables.len(), workers = pool.size(), "running");

    let (stop_tx, stop_rx) = bounded::<i32>(1);
    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])
    .context("registering signal handlers")?;
    let signal_handle = signals.handle();
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            let _ = stop_tx.send(sig);
        }
    });

    let ticker = tick(interval);
    let mut round = 0;
    while round < blocks {
        select! {
            recv(stop_rx) -> sig => {
                info!(signal = ?sig.ok(), "received signal, stopping inserts");
                break;
            }
            recv(ticker) -> _ => {
                for table in &tables {
                    let block: Vec<Row> = (0..rows)
                        .map(|i| Row::new(synthetic_key(table.name(), round, i), i as i64))
                        .collect();
                    table.insert(block)?;
                }
                round += 1;
            }
        }
    }

    // Give the pool a moment to catch up before reporting.
    thread::sleep(config.pool.sleep_after_work.max(Duration::from_millis(200)));

    for table in &tables {
        table.shutdown();
        let report = serde_json::json!({
            "table": table.name(),
            "parts": table.parts().len(),
            "metrics": table.metrics(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "pool": pool.stats() }))?);

    signal_handle.close();
    Ok(())
}

fn optimize(data_dir: &Path, config: EngineConfig, name: &str, until_done: bool) -> Result<()> {
    let table = open_table(data_dir, &config, name)?;
    loop {
        match table.optimize()? {
            MergeOutcome::Merged {
                new_part,
                inputs,
                bytes,
                duration,
                ..
            } => {
                println!(
                    "merged {inputs} parts ({bytes} bytes) into {new_part} in {} ms",
                    duration.as_millis()
                );
                if !until_done {
                    break;
                }
            }
            MergeOutcome::NoCandidate => {
                println!("nothing to merge");
                break;
            }
        }
    }
    table.shutdown();
    Ok(())
}

fn parts(data_dir: &Path, config: EngineConfig, name: &str) -> Result<()> {
    let table = open_table(data_dir, &config, name)?;
    println!("{:<32} {:>6} {:>12} {:>14}", "part", "level", "rows", "bytes");
    for part in table.parts() {
        println!(
            "{:<32} {:>6} {:>12} {:>14}",
            part.name().to_string(),
            part.level(),
            part.rows(),
            part.bytes()
        );
    }
    table.shutdown();
    Ok(())
}
