//! Fixed-length sort records
//!
//! A record is [`RECORD_LEN`] bytes; its first [`KEY_LEN`] bytes hold a
//! little-endian `i64` key. Everything after the key is opaque payload.

use crate::error::{Error, Result};
use rand::Rng;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Record length in bytes, key included
pub const RECORD_LEN: usize = 64;

/// Key length in bytes
pub const KEY_LEN: usize = 8;

/// Key of the record starting at byte `offset`
pub fn key_at(data: &[u8], offset: usize) -> i64 {
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&data[offset..offset + KEY_LEN]);
    i64::from_le_bytes(key)
}

/// Key of the `index`th record
pub fn key(data: &[u8], index: usize) -> i64 {
    key_at(data, index * RECORD_LEN)
}

/// Number of whole records in `data`
pub fn count(data: &[u8]) -> usize {
    data.len() / RECORD_LEN
}

/// Keys of every whole record in `data`
pub fn keys(data: &[u8]) -> Vec<i64> {
    data.chunks_exact(RECORD_LEN).map(|r| key_at(r, 0)).collect()
}

/// Sort the whole records in `data` by key, in place. Trailing bytes that
/// do not form a whole record are left where they are.
pub fn sort_records(data: &mut [u8]) {
    let whole = count(data) * RECORD_LEN;
    let data = &mut data[..whole];

    let mut order: Vec<(i64, usize)> = data
        .chunks_exact(RECORD_LEN)
        .enumerate()
        .map(|(i, r)| (key_at(r, 0), i))
        .collect();
    if order.windows(2).all(|w| w[0].0 <= w[1].0) {
        return;
    }
    order.sort_unstable();

    let mut sorted = Vec::with_capacity(whole);
    for &(_, i) in &order {
        sorted.extend_from_slice(&data[i * RECORD_LEN..(i + 1) * RECORD_LEN]);
    }
    data.copy_from_slice(&sorted);
}

/// Key distribution for generated records
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum KeyDistribution {
    /// Uniform over all of `i64`
    Uniform,
    /// Normal, truncated to an integer
    Normal {
        /// Mean
        mean: f64,
        /// Standard deviation
        stddev: f64,
    },
    /// Poisson
    Poisson {
        /// Rate
        lambda: f64,
    },
}

/// Draws keys from a [`KeyDistribution`]
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    dist: KeyDistribution,
    spare: Option<f64>,
}

impl KeyGenerator {
    /// Create a generator
    pub fn new(dist: KeyDistribution) -> Self {
        Self { dist, spare: None }
    }

    /// Draw the next key
    pub fn next_key<R: Rng + ?Sized>(&mut self, rng: &mut R) -> i64 {
        match self.dist {
            KeyDistribution::Uniform => rng.gen(),
            KeyDistribution::Normal { mean, stddev } => {
                (self.standard_normal(rng) * stddev + mean) as i64
            }
            KeyDistribution::Poisson { lambda } => poisson(rng, lambda),
        }
    }

    /// Marsaglia polar method; each accepted pair yields two deviates
    fn standard_normal<R: Rng + ?Sized>(&mut self, rng: &mut R) -> f64 {
        if let Some(x) = self.spare.take() {
            return x;
        }
        loop {
            let v1 = 2.0 * rng.gen::<f64>() - 1.0;
            let v2 = 2.0 * rng.gen::<f64>() - 1.0;
            let s = v1 * v1 + v2 * v2;
            if s > 0.0 && s < 1.0 {
                let scale = (-2.0 * s.ln() / s).sqrt();
                self.spare = Some(v2 * scale);
                return v1 * scale;
            }
        }
    }
}

/// Knuth's multiplication method
fn poisson<R: Rng + ?Sized>(rng: &mut R, lambda: f64) -> i64 {
    let limit = (-lambda).exp();
    let mut k = 0;
    let mut p = 1.0;
    loop {
        k += 1;
        p *= rng.gen::<f64>();
        if p <= limit {
            return k - 1;
        }
    }
}

/// Generate `n` records. Each record carries its key and, right after it,
/// its sequence number; the rest is zero.
pub fn generate<R: Rng + ?Sized>(rng: &mut R, dist: KeyDistribution, n: usize) -> Vec<u8> {
    let mut keys = KeyGenerator::new(dist);
    let mut data = vec![0u8; n * RECORD_LEN];
    for (i, record) in data.chunks_exact_mut(RECORD_LEN).enumerate() {
        record[..KEY_LEN].copy_from_slice(&keys.next_key(rng).to_le_bytes());
        record[KEY_LEN..KEY_LEN + 8].copy_from_slice(&(i as u64).to_le_bytes());
    }
    data
}

/// Write raw record bytes to `path`
pub fn write_records(path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| Error::file(path, e))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(data)
        .and_then(|_| writer.flush())
        .map_err(|e| Error::file(path, e))
}

/// Read every key in a record file
pub fn read_keys(path: impl AsRef<Path>) -> Result<Vec<i64>> {
    let path = path.as_ref();
    let mut data = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut data))
        .map_err(|e| Error::file(path, e))?;
    Ok(keys(&data))
}

/// Check that the records of `paths`, taken in order, have non-decreasing
/// keys. Returns the number of records checked; the first violation is
/// reported as [`Error::Unsorted`].
pub fn verify_sorted<P: AsRef<Path>>(paths: &[P]) -> Result<u64> {
    let mut prev = i64::MIN;
    let mut total = 0u64;
    let mut record = [0u8; RECORD_LEN];

    for path in paths {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::file(path, e))?;
        let mut reader = BufReader::with_capacity(RECORD_LEN * 1024, file);
        let mut index = 0u64;
        loop {
            match reader.read_exact(&mut record) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(Error::file(path, e)),
            }
            let key = key_at(&record, 0);
            if key < prev {
                return Err(Error::Unsorted {
                    path: PathBuf::from(path),
                    index,
                    prev,
                    key,
                });
            }
            prev = key;
            index += 1;
        }
        total += index;
    }

    tracing::debug!(files = paths.len(), records = total, "verified sort order");
    Ok(total)
}
