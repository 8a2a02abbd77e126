//! cidr-pool demo driver
//!
//! Seeds a pool in a SQLite database, allocates blocks from many threads at
//! once, frees them all again and prints the pool before and after.

use anyhow::{bail, Context as _};
use cidr_pool::{AddressBlock, AllocatorBuilder, AllocatorConfig, Context, PoolError, Record, SqliteStore};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(name = "cidr-pool")]
#[command(about = "Allocate and free CIDR blocks from a pool under contention")]
struct Args {
    /// SQLite database file (created if missing)
    #[arg(short = 'd', long, default_value = "cidr-pool.db")]
    database: PathBuf,

    /// Pool to work on
    #[arg(long, default_value_t = 1)]
    pool: u32,

    /// Block the pool is seeded with if it has no records yet
    #[arg(short = 's', long, default_value = "0.0.0.0/16")]
    seed: String,

    /// Prefix length of every allocation
    #[arg(short = 'p', long, default_value_t = 26)]
    prefix_len: u8,

    /// Number of concurrent workers
    #[arg(short = 'w', long, default_value_t = 10)]
    workers: usize,

    /// Allocations per worker
    #[arg(short = 'n', long, default_value_t = 10)]
    allocations: usize,

    /// Allocator configuration file (TOML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Abort everything after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Print pool dumps as JSON
    #[arg(long)]
    json: bool,
}

fn owner_name(worker: usize, n: usize) -> String {
    format!("worker{}_user{}", worker, n)
}

fn dump(label: &str, records: &[Record], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(records)?);
        return Ok(());
    }

    println!("{} ({} records)", label, records.len());
    for record in records {
        if record.is_free() {
            println!("  {}", record.block);
        } else {
            println!("  {}\t{}", record.block, record.owner_str());
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => AllocatorConfig::load(path)?,
        None => AllocatorConfig::default(),
    };
    let store = SqliteStore::open(&args.database)
        .with_context(|| format!("opening database {:?}", args.database))?;
    let alloc = Arc::new(AllocatorBuilder::new().config(config).build(store)?);

    let ctx = match args.timeout_secs {
        Some(secs) => Context::background().with_timeout(Duration::from_secs(secs)),
        None => Context::background(),
    };

    if alloc.records(&ctx, args.pool)?.is_empty() {
        let root: AddressBlock = args
            .seed
            .parse()
            .with_context(|| format!("parsing seed block {:?}", args.seed))?;
        alloc.seed(&ctx, args.pool, root)?;
    }
    dump("before", &alloc.records(&ctx, args.pool)?, args.json)?;

    let started = Instant::now();
    let handles: Vec<_> = (1..=args.workers)
        .map(|worker| {
            let alloc = Arc::clone(&alloc);
            let ctx = ctx.clone();
            let (pool, prefix_len, count) = (args.pool, args.prefix_len, args.allocations);

            thread::spawn(move || {
                for n in 1..=count {
                    let owner = owner_name(worker, n);
                    match alloc.allocate(&ctx, pool, prefix_len, &owner) {
                        Ok(block) => info!(worker, owner = %owner, "allocated {}", block),
                        Err(e) => {
                            error!(worker, owner = %owner, "unexpected error: {}", e);
                            return;
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        if handle.join().is_err() {
            bail!("worker thread panicked");
        }
    }

    for worker in 1..=args.workers {
        for n in 1..=args.allocations {
            let owner = owner_name(worker, n);
            match alloc.deallocate(&ctx, args.pool, &owner) {
                Ok(block) => info!(owner = %owner, "deallocated {}", block),
                Err(PoolError::NotAllocated { .. }) => {
                    debug!(owner = %owner, "ignoring \"not allocated\" error");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    info!(
        elapsed = ?started.elapsed(),
        "finished allocating and deallocating {} /{} CIDRs",
        args.workers * args.allocations,
        args.prefix_len
    );

    dump("after", &alloc.records(&ctx, args.pool)?, args.json)?;
    Ok(())
}
