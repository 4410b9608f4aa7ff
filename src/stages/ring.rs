//! Ring transfer stages: every rank sends to `rank + 1` and receives from
//! `rank - 1`, modulo the number of ranks.

use super::boxed;
use crate::error::{Error, Result};
use crate::message::Tag;
use crate::pin::PinDecl;
use crate::stage::{StageDef, StageIo, StageLogic, Step};
use crate::transport::Transport;
use std::sync::Arc;

/// Stage types defined here, bound to `transport`
pub fn definitions(transport: &Arc<dyn Transport>) -> Vec<StageDef> {
    let send_transport = Arc::clone(transport);
    let recv_transport = Arc::clone(transport);
    vec![
        StageDef::new("send-next", move |_| {
            Ok(boxed(SendNext {
                transport: Arc::clone(&send_transport),
                sent: 0,
            }))
        })
        .with_doc("sends every buffer from data_in to the next rank")
        .with_pins(&[PinDecl::input("data_in"), PinDecl::output("buf_out")]),
        StageDef::new("recv-prev", move |_| {
            Ok(boxed(RecvPrev {
                transport: Arc::clone(&recv_transport),
                pending: Vec::new(),
                ended: false,
            }))
        })
        .with_doc("conveys data received from the previous rank on data_out")
        .with_pins(&[PinDecl::input("buf_in"), PinDecl::output("data_out")]),
    ]
}

struct SendNext {
    transport: Arc<dyn Transport>,
    sent: u64,
}

impl SendNext {
    fn next_rank(&self) -> usize {
        (self.transport.rank() + 1) % self.transport.size()
    }
}

impl StageLogic for SendNext {
    fn step(&mut self, io: &StageIo<'_>) -> Result<Step> {
        let dest = self.next_rank();
        let Some(buf) = io.input("data_in")?.accept() else {
            self.transport.send(dest, Tag::RingEnd, &[])?;
            tracing::debug!(dest, bytes = self.sent, "ring end sent");
            return Ok(Step::Terminate);
        };
        self.transport.send(dest, Tag::RingData, buf.filled())?;
        self.sent += buf.len() as u64;
        io.output("buf_out")?.convey(buf)?;
        Ok(Step::Continue)
    }
}

struct RecvPrev {
    transport: Arc<dyn Transport>,
    /// Bytes received but not yet conveyed
    pending: Vec<u8>,
    ended: bool,
}

impl StageLogic for RecvPrev {
    fn step(&mut self, io: &StageIo<'_>) -> Result<Step> {
        if self.pending.is_empty() && !self.ended {
            let msg = self.transport.recv(&[Tag::RingData, Tag::RingEnd])?;
            tracing::trace!(from = msg.source, tag = ?msg.tag, bytes = msg.len(), "ring message");
            match msg.tag {
                Tag::RingEnd => self.ended = true,
                _ => self.pending = msg.payload,
            }
            if self.pending.is_empty() && !self.ended {
                return Ok(Step::Continue);
            }
        }

        let mut buf = io.input("buf_in")?.accept().ok_or(Error::QueueDeactivated)?;
        buf.clear();
        let n = buf.extend_from_slice(&self.pending);
        self.pending.drain(..n);
        io.output("data_out")?.convey(buf)?;

        if self.ended && self.pending.is_empty() {
            tracing::debug!("ring end received");
            return Ok(Step::Terminate);
        }
        Ok(Step::Continue)
    }
}
