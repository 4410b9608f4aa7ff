//! Distributed-sort scatter and gather stages
//!
//! `dsort-scatter` range-partitions each sorted buffer against the
//! splitters and sends every run to the rank that owns its range.
//! `dsort-gather` packs whatever arrives from all ranks into buffers taken
//! from `buf_in`, until every rank has reported that it is done.

use super::boxed;
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::message::Tag;
use crate::pin::{InputPin, OutputPin, PinDecl};
use crate::splitter::{self, Splitter};
use crate::stage::{StageDef, StageIo, StageLogic, StageParams, Step};
use crate::transport::Transport;
use std::sync::Arc;

/// Stage types defined here, bound to `transport`
pub fn definitions(transport: &Arc<dyn Transport>) -> Vec<StageDef> {
    let scatter_transport = Arc::clone(transport);
    let gather_transport = Arc::clone(transport);
    vec![
        StageDef::new("dsort-scatter", move |params| {
            Scatter::new(params, Arc::clone(&scatter_transport)).map(boxed)
        })
        .with_doc("sends key ranges of sorted buffers to the ranks that own them")
        .with_pins(&[PinDecl::input("data_in"), PinDecl::output("buf_out")])
        .with_params(&["splitter_filename"]),
        StageDef::new("dsort-gather", move |_| {
            Ok(boxed(Gather {
                transport: Arc::clone(&gather_transport),
                current: None,
                done: 0,
            }))
        })
        .with_doc("collects records sent by every rank's scatter stage into buffers")
        .with_pins(&[PinDecl::input("buf_in"), PinDecl::output("data_out")]),
    ]
}

struct Scatter {
    transport: Arc<dyn Transport>,
    splitters: Vec<Splitter>,
    next_index: i64,
}

impl Scatter {
    fn new(params: &StageParams<'_>, transport: Arc<dyn Transport>) -> Result<Self> {
        let splitters = splitter::read_file(params.require("splitter_filename")?)?;
        if splitters.len() != transport.size() {
            return Err(Error::InvalidConfig(format!(
                "{} splitters for {} ranks",
                splitters.len(),
                transport.size()
            )));
        }
        for (i, s) in splitters.iter().enumerate() {
            tracing::debug!(stage = params.stage(), i, key = s.key, rank = s.rank, index = s.index, "splitter");
        }
        Ok(Self {
            transport,
            splitters,
            next_index: 0,
        })
    }
}

impl StageLogic for Scatter {
    fn step(&mut self, io: &StageIo<'_>) -> Result<Step> {
        let Some(buf) = io.input("data_in")?.accept() else {
            for dest in 0..self.transport.size() {
                self.transport.send(dest, Tag::ScatterDone, &[])?;
            }
            tracing::debug!(rank = self.transport.rank(), "scatter done");
            return Ok(Step::Terminate);
        };

        let rank = self.transport.rank();
        let runs = splitter::partition(buf.filled(), rank, &mut self.next_index, &self.splitters);
        for (dest, range) in runs {
            tracing::trace!(dest, bytes = range.len(), "sending run");
            self.transport.send(dest, Tag::Payload, &buf.filled()[range])?;
        }
        tracing::debug!(bytes = buf.len(), "scattered buffer");

        io.output("buf_out")?.convey(buf)?;
        Ok(Step::Continue)
    }
}

struct Gather {
    transport: Arc<dyn Transport>,
    current: Option<Buffer>,
    done: usize,
}

impl Gather {
    fn fresh(buf_in: &InputPin) -> Result<Buffer> {
        let mut buf = buf_in.accept().ok_or(Error::QueueDeactivated)?;
        buf.clear();
        Ok(buf)
    }

    /// Copy `data` into the current buffer, passing full buffers on and
    /// taking fresh ones as needed
    fn pack(&mut self, mut data: &[u8], buf_in: &InputPin, data_out: &OutputPin) -> Result<()> {
        while !data.is_empty() {
            if self.current.is_none() {
                self.current = Some(Self::fresh(buf_in)?);
            }
            let Some(buf) = self.current.as_mut() else {
                continue;
            };
            let n = buf.extend_from_slice(data);
            data = &data[n..];
            if buf.is_full() {
                if let Some(full) = self.current.take() {
                    data_out.convey(full)?;
                }
            }
        }
        Ok(())
    }
}

impl StageLogic for Gather {
    fn step(&mut self, io: &StageIo<'_>) -> Result<Step> {
        let buf_in = io.input("buf_in")?;
        let data_out = io.output("data_out")?;
        if self.current.is_none() {
            self.current = Some(Self::fresh(buf_in)?);
        }

        let msg = self.transport.recv(&[Tag::Payload, Tag::ScatterDone])?;
        match msg.tag {
            Tag::ScatterDone => {
                self.done += 1;
                tracing::debug!(from = msg.source, done = self.done, "scatter done received");
            }
            _ => {
                tracing::trace!(from = msg.source, bytes = msg.len(), "received data");
                self.pack(&msg.payload, buf_in, data_out)?;
            }
        }

        if self.done < self.transport.size() {
            return Ok(Step::Continue);
        }
        // The last buffer always goes out, even if nothing landed in it
        if let Some(last) = self.current.take() {
            data_out.convey(last)?;
        }
        Ok(Step::Terminate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Network;
    use crate::record::{self, KEY_LEN, RECORD_LEN};
    use crate::registry::Registry;
    use crate::transport::LocalCluster;

    fn records(keys: &[i64]) -> Vec<u8> {
        let mut data = vec![0u8; keys.len() * RECORD_LEN];
        for (record, key) in data.chunks_exact_mut(RECORD_LEN).zip(keys) {
            record[..KEY_LEN].copy_from_slice(&key.to_le_bytes());
        }
        data
    }

    #[test]
    fn test_scatter_gather_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let splitters = [Splitter::new(10, 9, 0), Splitter::new(20, 9, 0), Splitter::SENTINEL];
        let transports: Vec<Arc<dyn Transport>> = LocalCluster::new(3)
            .into_endpoints()
            .into_iter()
            .map(|ep| Arc::new(ep) as Arc<dyn Transport>)
            .collect();

        let handles: Vec<_> = transports
            .into_iter()
            .enumerate()
            .map(|(rank, transport)| {
                let base = dir.path().to_path_buf();
                std::thread::spawn(move || {
                    let input = base.join(format!("{}.in", rank));
                    let split = base.join(format!("splitters-{}", rank));
                    let keys: Vec<i64> = (0..30).map(|k| k + rank as i64).collect();
                    record::write_records(&input, &records(&keys)).unwrap();
                    splitter::write_file(&split, &splitters).unwrap();

                    let registry = Registry::with_transport(transport);
                    let mut nw = Network::new(format!("pass1-{}", rank), 2, 256);
                    for (kind, name) in [
                        ("read-file", "read"),
                        ("sort", "sort"),
                        ("dsort-scatter", "scatter"),
                        ("dsort-gather", "gather"),
                        ("multiwrite-file", "write"),
                    ] {
                        nw.add_stage(&registry, kind, name).unwrap();
                    }
                    nw.set_param("read.filename", input.display().to_string()).unwrap();
                    nw.set_param("scatter.splitter_filename", split.display().to_string()).unwrap();
                    nw.set_param("write.filename_fmt", base.join(format!("{}-%d.out", rank)).display().to_string())
                        .unwrap();
                    nw.connect("read", "data_out", "sort", "data_in").unwrap();
                    nw.connect("sort", "data_out", "scatter", "data_in").unwrap();
                    nw.connect("gather", "data_out", "write", "data_in").unwrap();
                    nw.fix().unwrap();
                    nw.run().unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for rank in 0..3 {
            let mut keys = Vec::new();
            let mut i = 0;
            loop {
                let path = dir.path().join(format!("{}-{}.out", rank, i));
                if !path.exists() {
                    break;
                }
                keys.extend(record::read_keys(&path).unwrap());
                i += 1;
            }
            keys.sort();
            let expected: Vec<i64> = (0..3)
                .flat_map(|r| (0..30).map(move |k| k + r))
                .filter(|k| match rank {
                    0 => *k <= 10,
                    1 => *k > 10 && *k <= 20,
                    _ => *k > 20,
                })
                .collect::<Vec<_>>();
            let mut expected = expected;
            expected.sort();
            assert_eq!(keys, expected, "rank {}", rank);
        }
    }

    #[test]
    fn test_scatter_rejects_wrong_splitter_count() {
        let dir = tempfile::tempdir().unwrap();
        let split = dir.path().join("splitters");
        splitter::write_file(&split, &[Splitter::SENTINEL]).unwrap();

        let transport: Arc<dyn Transport> =
            Arc::new(LocalCluster::new(2).into_endpoints().remove(0));
        let registry = Registry::with_transport(transport);
        let mut nw = Network::new("bad", 2, 256);
        nw.add_stage(&registry, "dsort-scatter", "scatter").unwrap();
        nw.set_param("scatter.splitter_filename", split.display().to_string()).unwrap();
        match nw.fix() {
            Err(Error::InitFailed { source, .. }) => {
                assert!(matches!(*source, Error::InvalidConfig(_)))
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
