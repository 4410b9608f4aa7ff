//! In-buffer sort and k-way merge stages

use super::boxed;
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::heap::MinHeap;
use crate::pin::{FanInPin, OutputPin, PinDecl};
use crate::record::{self, RECORD_LEN};
use crate::stage::{StageDef, StageIo, StageLogic, Step};

/// Stage types defined here
pub fn definitions() -> Vec<StageDef> {
    vec![
        StageDef::new("sort", |_| Ok(boxed(Sort)))
            .with_doc("sorts the records of each buffer by key")
            .with_pins(&[PinDecl::input("data_in"), PinDecl::output("data_out")]),
        StageDef::new("merge", |_| Ok(boxed(Merge)))
            .with_doc("merges sorted buffer streams from data_in into buffers taken from buf_in")
            .with_pins(&[
                PinDecl::input("buf_in"),
                PinDecl::array_input("data_in"),
                PinDecl::output("data_out"),
                PinDecl::output("buf_out"),
            ]),
    ]
}

struct Sort;

impl StageLogic for Sort {
    fn step(&mut self, io: &StageIo<'_>) -> Result<Step> {
        let Some(mut buf) = io.input("data_in")?.accept() else {
            return Ok(Step::Terminate);
        };
        record::sort_records(buf.filled_mut());
        tracing::debug!(buffer = buf.id(), records = record::count(buf.filled()), "sorted");
        io.output("data_out")?.convey(buf)?;
        Ok(Step::Continue)
    }
}

/// One merge input: the buffer being consumed and the read offset in it
struct Cursor {
    buf: Buffer,
    offset: usize,
}

struct Merge;

impl Merge {
    /// Next non-empty buffer from input `n`, recycling empty ones
    fn next_buffer(data_in: &FanInPin, buf_out: &OutputPin, n: usize) -> Result<Option<Cursor>> {
        while let Some(buf) = data_in.accept(n) {
            if buf.len() >= RECORD_LEN {
                return Ok(Some(Cursor { buf, offset: 0 }));
            }
            buf_out.convey(buf)?;
        }
        Ok(None)
    }
}

impl StageLogic for Merge {
    fn step(&mut self, io: &StageIo<'_>) -> Result<Step> {
        let buf_in = io.input("buf_in")?;
        let data_in = io.fan_in("data_in")?;
        let data_out = io.output("data_out")?;
        let buf_out = io.output("buf_out")?;

        let width = data_in.width();
        tracing::debug!(inputs = width, "merging");

        let mut cursors: Vec<Option<Cursor>> = Vec::with_capacity(width);
        let mut heap = MinHeap::with_capacity(width);
        for n in 0..width {
            let cursor = Self::next_buffer(data_in, buf_out, n)?;
            if let Some(c) = &cursor {
                heap.insert(record::key_at(c.buf.filled(), 0), n)?;
            } else {
                tracing::debug!(input = n, "no initial buffer");
            }
            cursors.push(cursor);
        }

        let mut merged: Option<Buffer> = None;
        let mut records = 0u64;
        while let Some((_, n)) = heap.pop() {
            let Some(cursor) = cursors[n].as_mut() else {
                continue;
            };

            if merged.is_none() {
                let Some(mut fresh) = buf_in.accept() else {
                    return Err(Error::QueueDeactivated);
                };
                if fresh.capacity() < RECORD_LEN {
                    return Err(Error::InvalidConfig(format!(
                        "{}: output buffer of {} bytes cannot hold a record",
                        io.name(),
                        fresh.capacity()
                    )));
                }
                fresh.clear();
                merged = Some(fresh);
            }
            let Some(out) = merged.as_mut() else {
                continue;
            };

            let record = &cursor.buf.filled()[cursor.offset..cursor.offset + RECORD_LEN];
            out.extend_from_slice(record);
            cursor.offset += RECORD_LEN;
            records += 1;
            let out_full = out.remaining() < RECORD_LEN;

            if cursor.offset + RECORD_LEN > cursor.buf.len() {
                if let Some(done) = cursors[n].take() {
                    buf_out.convey(done.buf)?;
                }
                cursors[n] = Self::next_buffer(data_in, buf_out, n)?;
                if cursors[n].is_none() {
                    tracing::debug!(input = n, "input exhausted");
                }
            }
            if let Some(c) = &cursors[n] {
                heap.insert(record::key_at(c.buf.filled(), c.offset), n)?;
            }

            if out_full {
                if let Some(full) = merged.take() {
                    data_out.convey(full)?;
                }
            }
        }

        if let Some(rest) = merged.take() {
            data_out.convey(rest)?;
        }
        tracing::debug!(records, "merge complete");
        Ok(Step::Terminate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::record::KEY_LEN;
    use crate::registry::Registry;

    fn records(keys: &[i64]) -> Vec<u8> {
        let mut data = vec![0u8; keys.len() * RECORD_LEN];
        for (record, key) in data.chunks_exact_mut(RECORD_LEN).zip(keys) {
            record[..KEY_LEN].copy_from_slice(&key.to_le_bytes());
            record[RECORD_LEN - 1] = 0xAB;
        }
        data
    }

    #[test]
    fn test_sort_stage_sorts_each_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in");
        let dst = dir.path().join("out");
        record::write_records(&src, &records(&[5, 1, 3, 3, 2])).unwrap();

        let text = format!(
            "stage read-file r\nstage sort s\nstage write-file w\n\
             set r.filename {}\nset w.filename {}\n\
             connect r.data_out s.data_in\nconnect s.data_out w.data_in\n\
             set_bufsize default 320\n",
            src.display(),
            dst.display()
        );
        let mut nw = config::load_str(&Registry::builtin(), "sort", &text).unwrap();
        nw.fix().unwrap();
        nw.run().unwrap();

        let out = std::fs::read(&dst).unwrap();
        assert_eq!(record::keys(&out), vec![1, 2, 3, 3, 5]);
        assert!(out.chunks_exact(RECORD_LEN).all(|r| r[RECORD_LEN - 1] == 0xAB));
    }

    #[test]
    fn test_merge_sorted_files() {
        let dir = tempfile::tempdir().unwrap();
        let inputs: [&[i64]; 3] = [&[1, 4, 7, 10, 13], &[2, 3, 9], &[]];
        for (i, keys) in inputs.iter().enumerate() {
            record::write_records(dir.path().join(format!("run-{}", i)), &records(keys)).unwrap();
        }
        let out = dir.path().join("merged");

        let text = format!(
            "stage merge m\n\
             stage write-file w\n\
             set w.filename {out}\n\
             connect m.data_out w.data_in\n\
             loop 3 stage read-file r$\n\
             loop 3 set r$.filename {dir}/run-$\n\
             loop 3 connect r$.data_out m.data_in\n\
             set_bufsize default 128\n\
             set_bufsize m.buf_in 192\n",
            out = out.display(),
            dir = dir.path().display()
        );
        let mut nw = config::load_str(&Registry::builtin(), "merge", &text).unwrap();
        nw.fix().unwrap();
        nw.run().unwrap();

        let merged = std::fs::read(&out).unwrap();
        assert_eq!(record::keys(&merged), vec![1, 2, 3, 4, 7, 9, 10, 13]);
    }
}
