//! Distributed external sort driver
//!
//! Each rank sorts its own input file `<work_dir>/<rank>.in` of 64-byte
//! records in three passes; concatenating the per-rank outputs in rank
//! order gives the globally sorted data.
//!
//! 1. [`pass0`] samples the input, pools the samples at rank 0 and
//!    distributes one splitter per rank, persisted as
//!    `<work_dir>/splitters-<rank>`.
//! 2. [`pass1`] runs `read-file -> sort -> dsort-scatter` next to
//!    `dsort-gather -> sort -> multiwrite-file`, leaving the key range this
//!    rank owns as sorted runs `<work_dir>/<rank>-<i>.out`.
//! 3. [`pass2`] merges the runs into `<work_dir>/<rank>.out`. Its network
//!    is generated as description text ([`pass2_description`]) and loaded
//!    through [`config`](crate::config).

use crate::config;
use crate::error::{Error, Result};
use crate::network::{Network, ThreadConfig};
use crate::record::RECORD_LEN;
use crate::registry::Registry;
use crate::splitter::{self, Splitter};
use crate::transport::Transport;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::sync::Arc;

/// Settings for one rank's distributed sort
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct DsortConfig {
    /// Directory holding inputs, splitters, runs and outputs
    pub work_dir: PathBuf,

    /// Samples drawn per rank in pass 0
    pub os_ratio: usize,

    /// Buffer size for pass 1 (bytes)
    pub pass1_bufsize: usize,

    /// Buffers per source pin in pass 1
    pub pass1_bufcount: usize,

    /// Buffer size for reading runs in pass 2 (bytes)
    pub read_bufsize: usize,

    /// Buffers per run reader in pass 2
    pub read_bufcount: usize,

    /// Merge output buffer size (bytes)
    pub merge_bufsize: usize,

    /// Merge output buffer count
    pub merge_bufcount: usize,

    /// RNG seed for sampling; each rank uses `seed + rank`. None = entropy.
    pub seed: Option<u64>,

    /// Stage thread settings for every pass
    pub threads: ThreadConfig,
}

impl Default for DsortConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            os_ratio: 16,
            pass1_bufsize: 64 * RECORD_LEN,
            pass1_bufcount: 4,
            read_bufsize: 64 * RECORD_LEN,
            read_bufcount: 2,
            merge_bufsize: 64 * RECORD_LEN,
            merge_bufcount: 4,
            seed: None,
            threads: ThreadConfig::default(),
        }
    }
}

impl DsortConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the working directory
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Set the oversampling ratio
    pub fn with_os_ratio(mut self, ratio: usize) -> Self {
        self.os_ratio = ratio;
        self
    }

    /// Set pass 1 buffer size and count
    pub fn with_pass1_buffers(mut self, size: usize, count: usize) -> Self {
        self.pass1_bufsize = size;
        self.pass1_bufcount = count;
        self
    }

    /// Set pass 2 run reader buffer size and count
    pub fn with_read_buffers(mut self, size: usize, count: usize) -> Self {
        self.read_bufsize = size;
        self.read_bufcount = count;
        self
    }

    /// Set merge output buffer size and count
    pub fn with_merge_buffers(mut self, size: usize, count: usize) -> Self {
        self.merge_bufsize = size;
        self.merge_bufcount = count;
        self
    }

    /// Set the sampling seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the stage thread settings
    pub fn with_threads(mut self, threads: ThreadConfig) -> Self {
        self.threads = threads;
        self
    }

    /// Check that every buffer holds a positive whole number of records,
    /// that at least one sample is drawn per rank and that `work_dir`
    /// survives being written into a pipeline description.
    pub fn validate(&self) -> Result<()> {
        let dir = self.work_dir.display().to_string();
        // Run paths go through `%d` formatting and the pass 2 description
        // through `$` substitution and line splitting.
        if let Some(bad) = ["$", "%d", "\n", "\r"].into_iter().find(|p| dir.contains(p)) {
            return Err(Error::InvalidConfig(format!(
                "work_dir {:?} must not contain {:?}",
                dir, bad
            )));
        }
        if self.os_ratio == 0 {
            return Err(Error::InvalidConfig("os_ratio must be positive".to_string()));
        }
        for (what, size, count) in [
            ("pass 1", self.pass1_bufsize, self.pass1_bufcount),
            ("read", self.read_bufsize, self.read_bufcount),
            ("merge", self.merge_bufsize, self.merge_bufcount),
        ] {
            if size == 0 || size % RECORD_LEN != 0 {
                return Err(Error::InvalidConfig(format!(
                    "{} buffer size {} is not a positive multiple of {}",
                    what, size, RECORD_LEN
                )));
            }
            if count == 0 {
                return Err(Error::InvalidConfig(format!("{} buffer count must be positive", what)));
            }
        }
        Ok(())
    }

    /// Input file of `rank`
    pub fn input_path(&self, rank: usize) -> PathBuf {
        self.work_dir.join(format!("{}.in", rank))
    }

    /// Splitter file of `rank`
    pub fn splitter_path(&self, rank: usize) -> PathBuf {
        self.work_dir.join(format!("splitters-{}", rank))
    }

    /// Run file `index` of `rank`
    pub fn run_path(&self, rank: usize, index: usize) -> PathBuf {
        self.work_dir.join(format!("{}-{}.out", rank, index))
    }

    /// Final output file of `rank`
    pub fn output_path(&self, rank: usize) -> PathBuf {
        self.work_dir.join(format!("{}.out", rank))
    }

    fn run_format(&self, rank: usize) -> PathBuf {
        self.work_dir.join(format!("{}-%d.out", rank))
    }
}

fn rng_for(cfg: &DsortConfig, rank: usize) -> StdRng {
    match cfg.seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(rank as u64)),
        None => StdRng::from_entropy(),
    }
}

/// Pass 0: elect splitters and persist them in this rank's splitter file
pub fn pass0(transport: &dyn Transport, cfg: &DsortConfig) -> Result<Vec<Splitter>> {
    let rank = transport.rank();
    let mut rng = rng_for(cfg, rank);
    let samples = splitter::sample_file(cfg.input_path(rank), rank, cfg.os_ratio, &mut rng)?;
    let splitters = splitter::exchange(transport, samples)?;
    splitter::write_file(cfg.splitter_path(rank), &splitters)?;
    tracing::info!(rank, splitters = splitters.len(), "pass 0 complete");
    Ok(splitters)
}

/// Network for pass 1 of `rank`
pub fn pass1_network(registry: &Registry, rank: usize, cfg: &DsortConfig) -> Result<Network> {
    cfg.validate()?;
    let mut nw = Network::new(format!("pass1-{}", rank), cfg.pass1_bufcount, cfg.pass1_bufsize)
        .with_thread_config(cfg.threads.clone());
    for (kind, name) in [
        ("read-file", "reader"),
        ("sort", "local-sort"),
        ("dsort-scatter", "scatter"),
        ("dsort-gather", "gather"),
        ("sort", "run-sort"),
        ("multiwrite-file", "writer"),
    ] {
        nw.add_stage(registry, kind, name)?;
    }
    nw.set_param("reader.filename", cfg.input_path(rank).display().to_string())?;
    nw.set_param("scatter.splitter_filename", cfg.splitter_path(rank).display().to_string())?;
    nw.set_param("writer.filename_fmt", cfg.run_format(rank).display().to_string())?;
    nw.connect("reader", "data_out", "local-sort", "data_in")?;
    nw.connect("local-sort", "data_out", "scatter", "data_in")?;
    nw.connect("gather", "data_out", "run-sort", "data_in")?;
    nw.connect("run-sort", "data_out", "writer", "data_in")?;
    Ok(nw)
}

/// Existing run files of `rank`, in sequence order
fn existing_runs(cfg: &DsortConfig, rank: usize) -> Vec<PathBuf> {
    (0..)
        .map(|i| cfg.run_path(rank, i))
        .take_while(|path| path.exists())
        .collect()
}

/// Pass 1: scatter the local input by splitter range and gather this
/// rank's range into sorted runs. Returns the run files.
pub fn pass1(transport: Arc<dyn Transport>, cfg: &DsortConfig) -> Result<Vec<PathBuf>> {
    let rank = transport.rank();
    for stale in existing_runs(cfg, rank) {
        std::fs::remove_file(&stale).map_err(|e| Error::file(&stale, e))?;
    }

    let registry = Registry::with_transport(transport);
    let mut nw = pass1_network(&registry, rank, cfg)?;
    nw.fix()?;
    nw.run()?;

    let runs = existing_runs(cfg, rank);
    tracing::info!(rank, runs = runs.len(), "pass 1 complete");
    Ok(runs)
}

/// Description text of the pass 2 network merging `runs` run files of
/// `rank` into its output file
pub fn pass2_description(rank: usize, runs: usize, cfg: &DsortConfig) -> String {
    let mut text = String::new();
    text.push_str(&format!("# pass 2 for rank {}: merge {} runs\n", rank, runs));
    text.push_str("stage merge merge\n");
    text.push_str("stage write-file writer\n");
    text.push_str(&format!("set writer.filename {}\n", cfg.output_path(rank).display()));
    text.push_str("connect merge.data_out writer.data_in\n");
    text.push_str(&format!("set_bufsize default {}\n", cfg.read_bufsize));
    text.push_str(&format!("set_bufcount default {}\n", cfg.read_bufcount));
    text.push_str(&format!("set_bufsize merge.buf_in {}\n", cfg.merge_bufsize));
    text.push_str(&format!("set_bufcount merge.buf_in {}\n", cfg.merge_bufcount));
    if runs > 0 {
        let run_pattern = cfg.run_format(rank).display().to_string().replacen("%d", "$", 1);
        text.push_str(&format!("loop {} stage read-file read$\n", runs));
        text.push_str(&format!("loop {} stage sort sort$\n", runs));
        text.push_str(&format!("loop {} set read$.filename {}\n", runs, run_pattern));
        text.push_str(&format!("loop {} connect read$.data_out sort$.data_in\n", runs));
        text.push_str(&format!("loop {} connect sort$.data_out merge.data_in\n", runs));
    }
    text
}

/// Pass 2: merge the run files of `rank` into its output file
pub fn pass2(rank: usize, runs: usize, cfg: &DsortConfig) -> Result<PathBuf> {
    cfg.validate()?;
    let text = pass2_description(rank, runs, cfg);
    tracing::debug!(rank, description = %text, "pass 2 network");
    let mut nw = config::load_str(&Registry::builtin(), &format!("pass2-{}", rank), &text)?
        .with_thread_config(cfg.threads.clone());
    nw.fix()?;
    nw.run()?;

    let output = cfg.output_path(rank);
    tracing::info!(rank, output = %output.display(), "pass 2 complete");
    Ok(output)
}

/// Run all three passes on this rank. Returns the rank's output file.
pub fn sort_node(transport: Arc<dyn Transport>, cfg: &DsortConfig) -> Result<PathBuf> {
    cfg.validate()?;
    let rank = transport.rank();
    let _span = tracing::info_span!("dsort", rank).entered();

    pass0(transport.as_ref(), cfg)?;
    let runs = pass1(transport, cfg)?;
    pass2(rank, runs.len(), cfg)
}

/// Output files of ranks `0..size`, in rank order
pub fn output_paths(cfg: &DsortConfig, size: usize) -> Vec<PathBuf> {
    (0..size).map(|rank| cfg.output_path(rank)).collect()
}
