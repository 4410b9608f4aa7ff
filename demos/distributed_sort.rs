//! Distributed external sort across in-process ranks
//!
//! Usage: `cargo run --example distributed_sort -- [ranks] [records-per-rank]`

use flowgraph::dsort::{self, DsortConfig};
use flowgraph::record::{self, KeyDistribution, RECORD_LEN};
use flowgraph::{LocalCluster, Result, Transport};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let ranks: usize = args.next().and_then(|a| a.parse().ok()).unwrap_or(4);
    let per_rank: usize = args.next().and_then(|a| a.parse().ok()).unwrap_or(50_000);

    let dir = tempfile::tempdir()?;
    let cfg = DsortConfig::new()
        .with_work_dir(dir.path())
        .with_os_ratio(64)
        .with_pass1_buffers(1024 * RECORD_LEN, 4)
        .with_read_buffers(256 * RECORD_LEN, 2)
        .with_merge_buffers(1024 * RECORD_LEN, 4)
        .with_seed(1);
    cfg.validate()?;

    let mut rng = StdRng::seed_from_u64(99);
    for rank in 0..ranks {
        let data = record::generate(&mut rng, KeyDistribution::Uniform, per_rank);
        record::write_records(cfg.input_path(rank), &data)?;
    }
    println!("Sorting {} records on {} ranks in {}", ranks * per_rank, ranks, dir.path().display());

    let start = Instant::now();
    let handles: Vec<_> = LocalCluster::new(ranks)
        .into_endpoints()
        .into_iter()
        .map(|ep| {
            let cfg = cfg.clone();
            thread::Builder::new()
                .name(format!("rank-{}", ep.rank()))
                .spawn(move || dsort::sort_node(Arc::new(ep), &cfg))
        })
        .collect::<std::io::Result<_>>()?;

    let mut outputs = Vec::with_capacity(ranks);
    for handle in handles {
        match handle.join() {
            Ok(result) => outputs.push(result?),
            Err(_) => {
                eprintln!("a rank panicked");
                std::process::exit(1);
            }
        }
    }
    let elapsed = start.elapsed();

    for (rank, path) in outputs.iter().enumerate() {
        let len = std::fs::metadata(path)?.len();
        println!("  rank {}: {} records", rank, len / RECORD_LEN as u64);
    }
    let total = record::verify_sorted(&outputs)?;
    println!("Verified {} records in global order ({:?})", total, elapsed);

    Ok(())
}
