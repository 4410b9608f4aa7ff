//! End-to-end distributed sort over an in-process cluster

use flowgraph::dsort::{self, DsortConfig};
use flowgraph::record::{self, KeyDistribution, RECORD_LEN};
use flowgraph::{splitter, Error, LocalCluster, Transport};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

fn write_inputs(cfg: &DsortConfig, ranks: usize, per_rank: usize, dist: KeyDistribution) -> Vec<i64> {
    let mut rng = StdRng::seed_from_u64(42);
    let mut keys = Vec::new();
    for rank in 0..ranks {
        let data = record::generate(&mut rng, dist, per_rank);
        keys.extend(record::keys(&data));
        record::write_records(cfg.input_path(rank), &data).unwrap();
    }
    keys.sort();
    keys
}

fn run_cluster(cfg: &DsortConfig, ranks: usize) -> Vec<PathBuf> {
    let handles: Vec<_> = LocalCluster::new(ranks)
        .into_endpoints()
        .into_iter()
        .map(|ep| {
            let cfg = cfg.clone();
            thread::spawn(move || dsort::sort_node(Arc::new(ep), &cfg))
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect()
}

fn small_buffers(dir: &std::path::Path) -> DsortConfig {
    DsortConfig::new()
        .with_work_dir(dir)
        .with_os_ratio(16)
        .with_pass1_buffers(32 * RECORD_LEN, 4)
        .with_read_buffers(16 * RECORD_LEN, 2)
        .with_merge_buffers(24 * RECORD_LEN, 3)
        .with_seed(3)
}

#[test]
fn test_four_ranks_match_full_sort() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = small_buffers(dir.path());
    let expected = write_inputs(&cfg, 4, 1000, KeyDistribution::Uniform);

    let outputs = run_cluster(&cfg, 4);
    assert_eq!(outputs, dsort::output_paths(&cfg, 4));
    assert_eq!(record::verify_sorted(&outputs).unwrap(), 4000);

    let sorted: Vec<i64> = outputs
        .iter()
        .flat_map(|p| record::read_keys(p).unwrap())
        .collect();
    assert_eq!(sorted, expected);
}

#[test]
fn test_duplicate_heavy_keys() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = small_buffers(dir.path());
    let expected = write_inputs(&cfg, 3, 500, KeyDistribution::Poisson { lambda: 4.0 });

    let outputs = run_cluster(&cfg, 3);
    let sorted: Vec<i64> = outputs
        .iter()
        .flat_map(|p| record::read_keys(p).unwrap())
        .collect();
    assert_eq!(sorted, expected);
}

#[test]
fn test_record_payload_survives() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = small_buffers(dir.path());
    write_inputs(&cfg, 2, 300, KeyDistribution::Normal { mean: 0.0, stddev: 1000.0 });

    let mut before: Vec<Vec<u8>> = (0..2)
        .flat_map(|rank| {
            let data = std::fs::read(cfg.input_path(rank)).unwrap();
            data.chunks_exact(RECORD_LEN).map(<[u8]>::to_vec).collect::<Vec<_>>()
        })
        .collect();
    let outputs = run_cluster(&cfg, 2);
    let mut after: Vec<Vec<u8>> = outputs
        .iter()
        .flat_map(|p| {
            let data = std::fs::read(p).unwrap();
            data.chunks_exact(RECORD_LEN).map(<[u8]>::to_vec).collect::<Vec<_>>()
        })
        .collect();

    before.sort();
    after.sort();
    assert_eq!(before, after);
}

#[test]
fn test_rank_with_empty_input() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = small_buffers(dir.path());
    let mut rng = StdRng::seed_from_u64(9);
    let data = record::generate(&mut rng, KeyDistribution::Uniform, 400);
    record::write_records(cfg.input_path(0), &data).unwrap();
    record::write_records(cfg.input_path(1), &[]).unwrap();

    let outputs = run_cluster(&cfg, 2);
    let mut expected = record::keys(&data);
    expected.sort();
    let sorted: Vec<i64> = outputs
        .iter()
        .flat_map(|p| record::read_keys(p).unwrap())
        .collect();
    assert_eq!(sorted, expected);
}

#[test]
fn test_splitter_files_agree() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = small_buffers(dir.path());
    write_inputs(&cfg, 3, 200, KeyDistribution::Uniform);
    run_cluster(&cfg, 3);

    let first = splitter::read_file(cfg.splitter_path(0)).unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(first.last(), Some(&splitter::Splitter::SENTINEL));
    assert!(first.windows(2).all(|w| w[0] <= w[1]));
    for rank in 1..3 {
        assert_eq!(splitter::read_file(cfg.splitter_path(rank)).unwrap(), first);
    }
}

#[test]
fn test_invalid_config_fails_before_messaging() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = small_buffers(dir.path()).with_merge_buffers(100, 2);
    let transport: Arc<dyn Transport> = Arc::new(LocalCluster::new(1).into_endpoints().remove(0));
    assert!(matches!(
        dsort::sort_node(transport, &cfg),
        Err(Error::InvalidConfig(_))
    ));
}
