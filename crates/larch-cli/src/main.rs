//! LarchDB workload driver.
//!
//! Runs random or scripted operation streams against a tree, reporting the
//! recent write ratio so the adaptive shape mechanism can react, and prints
//! a summary of the tree's tuning state at the end. Also hosts two simple
//! benchmark loops.

use clap::{Parser, ValueEnum};
use larch_common::{Result, StorageConfig, TreeConfig};
use larch_tree::Betree;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::time::Instant;

/// How many operations between write-ratio reports to the tree.
const WORKLOAD_REPORT_GRANULARITY: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Random or scripted mixed workload.
    Test,
    /// Timed update batches.
    BenchUpserts,
    /// Timed point queries over preloaded data.
    BenchQueries,
}

#[derive(Debug, Parser)]
#[command(name = "larchdb", version, about = "LarchDB B^ε-tree workload driver")]
struct Cli {
    /// Backing store directory.
    #[arg(short = 'd', long)]
    store_dir: PathBuf,

    /// Run mode.
    #[arg(short = 'm', long, value_enum, default_value = "test")]
    mode: Mode,

    /// Max node size, in elements.
    #[arg(short = 'N', long, default_value_t = 64)]
    max_node_size: u64,

    /// Min flush size, in elements. Defaults to max_node_size / 16.
    #[arg(short = 'f', long)]
    min_flush_size: Option<u64>,

    /// Cache size, in tree nodes.
    #[arg(short = 'C', long, default_value_t = 4)]
    cache_size: u64,

    /// Number of distinct keys.
    #[arg(short = 'k', long, default_value_t = 1024)]
    distinct_keys: u64,

    /// Number of operations.
    #[arg(short = 't', long, default_value_t = 4096)]
    operations: u64,

    /// Random seed. Defaults to entropy.
    #[arg(short = 's', long)]
    seed: Option<u64>,

    /// Persistence granularity, in log appends.
    #[arg(short = 'p', long)]
    persist_every: u64,

    /// Checkpoint granularity, in log appends.
    #[arg(short = 'c', long)]
    checkpoint_every: u64,

    /// Log file path. Defaults to larch.logg next to the store directory.
    #[arg(short = 'l', long)]
    log_file: Option<PathBuf>,

    /// Initial epsilon.
    #[arg(short = 'e', long, default_value_t = 0.5)]
    epsilon: f64,

    /// Initial workload state: 0-3, or 7 for fixed.
    #[arg(short = 'a', long, default_value_t = 0)]
    initial_state: u8,

    /// Epsilon adopted under write-heavy workloads.
    #[arg(short = 'w', long, default_value_t = 0.5)]
    write_heavy_epsilon: f64,

    /// Epsilon adopted under read-heavy workloads.
    #[arg(short = 'r', long, default_value_t = 0.6)]
    read_heavy_epsilon: f64,

    /// Shorten the tree when the workload crosses into read-heavy.
    #[arg(short = 'S', long)]
    shorten: bool,

    /// Script file to replay instead of random operations.
    #[arg(short = 'i', long)]
    script_in: Option<PathBuf>,

    /// Record the executed operations to a script file.
    #[arg(short = 'o', long)]
    script_out: Option<PathBuf>,
}

#[derive(Debug, Clone)]
enum Command {
    Insert(u64),
    Update(u64),
    Delete(u64),
    Query(u64),
}

fn parse_script(path: &PathBuf) -> std::io::Result<Vec<Command>> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut commands = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        let (Some(verb), Some(arg)) = (parts.next(), parts.next()) else {
            continue;
        };
        let key: u64 = arg.parse().map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("bad key: {}", e))
        })?;
        let command = match verb {
            "Inserting" => Command::Insert(key),
            "Updating" => Command::Update(key),
            "Deleting" => Command::Delete(key),
            "Query" => Command::Query(key),
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown command: {}", verb),
                ))
            }
        };
        commands.push(command);
    }
    Ok(commands)
}

fn run_test(cli: &Cli, tree: &mut Betree<u64, String>) -> Result<()> {
    let seed = cli.seed.unwrap_or_else(rand::random);
    let mut rng = StdRng::seed_from_u64(seed);
    tracing::info!(seed, "running test workload");

    let script: Option<Vec<Command>> = match &cli.script_in {
        Some(path) => Some(parse_script(path)?),
        None => None,
    };
    let mut script_out = match &cli.script_out {
        Some(path) => Some(std::fs::File::create(path)?),
        None => None,
    };

    let mut write_counter = 0u64;
    let mut read_counter = 0u64;

    for i in 0..cli.operations {
        if i != 0 && i % WORKLOAD_REPORT_GRANULARITY == 0 {
            let write_ratio = write_counter as f64 / (write_counter + read_counter) as f64;
            tree.observe_write_ratio(write_ratio)?;
            write_counter = 0;
            read_counter = 0;
        }

        let command = match &script {
            Some(commands) => match commands.get(i as usize) {
                Some(c) => c.clone(),
                None => break,
            },
            None => {
                let key = rng.gen_range(0..cli.distinct_keys);
                match rng.gen_range(0..4u32) {
                    0 => Command::Insert(key),
                    1 => Command::Update(key),
                    2 => Command::Delete(key),
                    _ => Command::Query(key),
                }
            }
        };

        match command {
            Command::Insert(key) => {
                if let Some(out) = &mut script_out {
                    writeln!(out, "Inserting {}", key)?;
                }
                tree.insert(key, format!("{}:", key))?;
                write_counter += 1;
            }
            Command::Update(key) => {
                if let Some(out) = &mut script_out {
                    writeln!(out, "Updating {}", key)?;
                }
                tree.update(key, format!("{}:", key))?;
                write_counter += 1;
            }
            Command::Delete(key) => {
                if let Some(out) = &mut script_out {
                    writeln!(out, "Deleting {}", key)?;
                }
                tree.delete(key)?;
                write_counter += 1;
            }
            Command::Query(key) => {
                let found = tree.query(&key)?;
                if let Some(out) = &mut script_out {
                    match found {
                        Some(value) => writeln!(out, "Query {} -> {}", key, value)?,
                        None => writeln!(out, "Query {} -> DNE", key)?,
                    }
                }
                read_counter += 1;
            }
        }
    }

    println!("operations:           {}", cli.operations);
    println!("split count:          {}", tree.split_count());
    println!("epsilon:              {}", tree.epsilon());
    println!("state:                {:?}", tree.state());
    println!("pivot upper bound:    {}", tree.pivot_upper_bound());
    println!("message upper bound:  {}", tree.message_upper_bound());
    println!("max node size:        {}", tree.max_node_size());
    println!("min flush size:       {}", tree.min_flush_size());
    println!("average leaf depth:   {:.3}", tree.average_leaf_depth()?);
    Ok(())
}

fn run_bench_upserts(cli: &Cli, tree: &mut Betree<u64, String>) -> Result<()> {
    let seed = cli.seed.unwrap_or_else(rand::random);
    let mut rng = StdRng::seed_from_u64(seed);
    let rounds = 100u64;
    let per_round = cli.operations / rounds;

    let mut overall = 0u128;
    for round in 0..rounds {
        let start = Instant::now();
        for _ in 0..per_round {
            let key = rng.gen_range(0..cli.distinct_keys);
            tree.update(key, format!("{}:", key))?;
        }
        let micros = start.elapsed().as_micros();
        println!("{} {} {}", round, per_round, micros);
        overall += micros;
    }
    println!("# overall: {} {}", rounds * per_round, overall);
    Ok(())
}

fn run_bench_queries(cli: &Cli, tree: &mut Betree<u64, String>) -> Result<()> {
    let seed = cli.seed.unwrap_or_else(rand::random);

    // Preload, then re-query the same key sequence.
    let mut rng = StdRng::seed_from_u64(seed);
    for _ in 0..cli.operations {
        let key = rng.gen_range(0..cli.distinct_keys);
        tree.update(key, format!("{}:", key))?;
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let start = Instant::now();
    for _ in 0..cli.operations {
        let key = rng.gen_range(0..cli.distinct_keys);
        tree.query(&key)?;
    }
    println!(
        "# overall: {} {}",
        cli.operations,
        start.elapsed().as_micros()
    );
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let tree_config = TreeConfig {
        max_node_size: cli.max_node_size,
        min_flush_size: cli.min_flush_size.unwrap_or((cli.max_node_size / 16).max(1)),
        min_node_size: (cli.max_node_size / 4).max(1),
        epsilon: cli.epsilon,
        write_heavy_epsilon: cli.write_heavy_epsilon,
        read_heavy_epsilon: cli.read_heavy_epsilon,
        shorten_on_read_heavy: cli.shorten,
        initial_state: cli.initial_state,
    };
    let mut storage = StorageConfig::rooted_at(&cli.store_dir);
    storage.cache_size = cli.cache_size;
    storage.persist_every = cli.persist_every;
    storage.checkpoint_every = cli.checkpoint_every;
    if let Some(log_file) = &cli.log_file {
        storage.log_file = log_file.clone();
    }

    let mut tree = Betree::open(tree_config, storage, String::new())?;

    match cli.mode {
        Mode::Test => run_test(&cli, &mut tree),
        Mode::BenchUpserts => run_bench_upserts(&cli, &mut tree),
        Mode::BenchQueries => run_bench_queries(&cli, &mut tree),
    }
}
