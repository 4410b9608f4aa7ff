//! Splitters: global partition boundaries for the distributed sort
//!
//! A splitter is a `(key, rank, index)` triple ordered lexicographically, so
//! records that share a boundary key are still split deterministically: by
//! the rank that holds them, then by their position on that rank.

use crate::error::{Error, Result};
use crate::message::Tag;
use crate::record::{self, KEY_LEN, RECORD_LEN};
use crate::transport::Transport;
use rand::Rng;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::Path;

/// Encoded size of one splitter
pub const SPLITTER_LEN: usize = 24;

/// A `(key, rank, index)` partition boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct Splitter {
    /// Record key
    pub key: i64,
    /// Rank holding the record
    pub rank: i64,
    /// Record index on that rank
    pub index: i64,
}

impl Splitter {
    /// Upper bound of the last range; compares greater than every record
    pub const SENTINEL: Splitter = Splitter {
        key: i64::MAX,
        rank: i64::MAX,
        index: i64::MAX,
    };

    /// Create a splitter
    pub fn new(key: i64, rank: i64, index: i64) -> Self {
        Self { key, rank, index }
    }

    /// Little-endian `key, rank, index`
    pub fn to_bytes(&self) -> [u8; SPLITTER_LEN] {
        let mut out = [0u8; SPLITTER_LEN];
        out[0..8].copy_from_slice(&self.key.to_le_bytes());
        out[8..16].copy_from_slice(&self.rank.to_le_bytes());
        out[16..24].copy_from_slice(&self.index.to_le_bytes());
        out
    }

    fn from_chunk(chunk: &[u8]) -> Self {
        let field = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&chunk[at..at + 8]);
            i64::from_le_bytes(b)
        };
        Self::new(field(0), field(8), field(16))
    }
}

/// Encode a splitter array
pub fn encode(splitters: &[Splitter]) -> Vec<u8> {
    splitters.iter().flat_map(|s| s.to_bytes()).collect()
}

/// Decode a splitter array
pub fn decode(bytes: &[u8]) -> Result<Vec<Splitter>> {
    if bytes.len() % SPLITTER_LEN != 0 {
        return Err(Error::InvalidConfig(format!(
            "splitter data length {} is not a multiple of {}",
            bytes.len(),
            SPLITTER_LEN
        )));
    }
    Ok(bytes.chunks_exact(SPLITTER_LEN).map(Splitter::from_chunk).collect())
}

/// Persist a splitter array
pub fn write_file(path: impl AsRef<Path>, splitters: &[Splitter]) -> Result<()> {
    let path = path.as_ref();
    std::fs::write(path, encode(splitters)).map_err(|e| Error::file(path, e))
}

/// Load a splitter array
pub fn read_file(path: impl AsRef<Path>) -> Result<Vec<Splitter>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| Error::file(path, e))?;
    decode(&bytes)
}

/// Draw `count` random records from a record file and tag each with
/// `rank` and its record index. An empty file yields no samples.
pub fn sample_file<R: Rng + ?Sized>(
    path: impl AsRef<Path>,
    rank: usize,
    count: usize,
    rng: &mut R,
) -> Result<Vec<Splitter>> {
    let path = path.as_ref();
    let mut file = File::open(path).map_err(|e| Error::file(path, e))?;
    let len = file.metadata().map_err(|e| Error::file(path, e))?.len();
    let nrecs = len / RECORD_LEN as u64;
    if nrecs == 0 {
        tracing::warn!(path = %path.display(), "no records to sample");
        return Ok(Vec::new());
    }

    let mut key = [0u8; KEY_LEN];
    let mut samples = Vec::with_capacity(count);
    for _ in 0..count {
        let index = rng.gen_range(0..nrecs);
        file.seek(SeekFrom::Start(index * RECORD_LEN as u64))
            .and_then(|_| file.read_exact(&mut key))
            .map_err(|e| Error::file(path, e))?;
        samples.push(Splitter::new(record::key_at(&key, 0), rank as i64, index as i64));
    }
    tracing::debug!(rank, samples = samples.len(), records = nrecs, "sampled input");
    Ok(samples)
}

/// Pick `nprocs - 1` evenly spaced boundaries from the pooled samples and
/// append the sentinel. With `os_ratio` samples per rank this selects every
/// `os_ratio`-th sample.
pub fn elect(mut samples: Vec<Splitter>, nprocs: usize) -> Vec<Splitter> {
    samples.sort_unstable();
    let mut splitters = Vec::with_capacity(nprocs);
    for i in 1..nprocs {
        let at = samples.len() * i / nprocs;
        splitters.push(samples.get(at).copied().unwrap_or(Splitter::SENTINEL));
    }
    splitters.push(Splitter::SENTINEL);
    splitters
}

/// Pool every rank's samples at rank 0, elect there and hand the result
/// back to every rank. Every rank calls this; each gets the same array.
pub fn exchange(transport: &dyn Transport, samples: Vec<Splitter>) -> Result<Vec<Splitter>> {
    let (rank, size) = (transport.rank(), transport.size());

    if rank != 0 {
        transport.send(0, Tag::Samples, &encode(&samples))?;
        let msg = transport.recv(&[Tag::Splitters])?;
        return decode(&msg.payload);
    }

    let mut pooled = samples;
    for _ in 1..size {
        let msg = transport.recv(&[Tag::Samples])?;
        pooled.extend(decode(&msg.payload)?);
    }
    let splitters = elect(pooled, size);
    let bytes = encode(&splitters);
    for dest in 1..size {
        transport.send(dest, Tag::Splitters, &bytes)?;
    }
    tracing::info!(ranks = size, "distributed splitters");
    Ok(splitters)
}

/// Split a sorted run of records into contiguous per-destination ranges.
///
/// Record `i` of `data` is identified as `(key, rank, next_index + i)`; it
/// goes to the first destination `d` with that triple `<= splitters[d]`.
/// `next_index` advances past every record in `data`. Empty ranges are
/// omitted; anything above the last splitter goes to the last destination.
pub fn partition(
    data: &[u8],
    rank: usize,
    next_index: &mut i64,
    splitters: &[Splitter],
) -> Vec<(usize, Range<usize>)> {
    let nrecs = record::count(data);
    let mut runs = Vec::new();
    let mut pos = 0;

    for (dest, bound) in splitters.iter().enumerate() {
        let start = pos;
        while pos < nrecs {
            let id = Splitter::new(record::key(data, pos), rank as i64, *next_index);
            if id > *bound {
                break;
            }
            pos += 1;
            *next_index += 1;
        }
        if pos > start {
            runs.push((dest, start * RECORD_LEN..pos * RECORD_LEN));
        }
    }

    if pos < nrecs {
        let last = splitters.len().saturating_sub(1);
        *next_index += (nrecs - pos) as i64;
        match runs.last_mut() {
            Some((dest, range)) if *dest == last => range.end = nrecs * RECORD_LEN,
            _ => runs.push((last, pos * RECORD_LEN..nrecs * RECORD_LEN)),
        }
    }
    runs
}
