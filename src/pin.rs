//! Named, directioned stage ports
//!
//! A stage type declares its pins statically with [`PinDecl`]; every stage
//! instance then owns one [`Pin`] per declaration. The variant is chosen by
//! the declared direction, so a step function asks for the flavour it
//! expects ([`StageIo::input`](crate::stage::StageIo::input),
//! [`StageIo::fan_in`](crate::stage::StageIo::fan_in), ...) and gets a type
//! that only offers the operations that make sense for it.

use crate::buffer::Buffer;
use crate::error::Result;
use crate::queue::Queue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Direction of a pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum PinDirection {
    /// One upstream producer
    Input,
    /// Any number of upstream producers, one queue each
    ArrayInput,
    /// One downstream consumer, or none (buffers go back to their origin)
    Output,
    /// Any number of downstream consumers
    ArrayOutput,
}

impl PinDirection {
    /// True for `Input` and `ArrayInput`
    pub fn is_input(self) -> bool {
        matches!(self, PinDirection::Input | PinDirection::ArrayInput)
    }

    /// True for `Output` and `ArrayOutput`
    pub fn is_output(self) -> bool {
        matches!(self, PinDirection::Output | PinDirection::ArrayOutput)
    }
}

/// Static declaration of a pin on a stage type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinDecl {
    /// Pin name, unique within the stage type
    pub name: &'static str,
    /// Pin direction
    pub direction: PinDirection,
}

impl PinDecl {
    /// Single input pin
    pub const fn input(name: &'static str) -> Self {
        Self {
            name,
            direction: PinDirection::Input,
        }
    }

    /// Fan-in array pin
    pub const fn array_input(name: &'static str) -> Self {
        Self {
            name,
            direction: PinDirection::ArrayInput,
        }
    }

    /// Single output pin
    pub const fn output(name: &'static str) -> Self {
        Self {
            name,
            direction: PinDirection::Output,
        }
    }

    /// Fan-out array pin
    pub const fn array_output(name: &'static str) -> Self {
        Self {
            name,
            direction: PinDirection::ArrayOutput,
        }
    }
}

/// Single input pin. Reads from exactly one queue: either the one created
/// by a connection, or the buffer pool installed when the network is fixed.
pub struct InputPin {
    name: &'static str,
    queue: Option<Queue>,
    round: Arc<AtomicU64>,
    bufsize: Option<usize>,
    bufcount: Option<usize>,
}

impl InputPin {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            queue: None,
            round: Arc::new(AtomicU64::new(0)),
            bufsize: None,
            bufcount: None,
        }
    }

    /// Pin name
    pub fn name(&self) -> &str {
        self.name
    }

    /// Blocking read of the next buffer; `None` at end of stream.
    pub fn accept(&self) -> Option<Buffer> {
        self.queue.as_ref().and_then(Queue::read)
    }

    /// True once a queue is attached (by a connection or by fixing)
    pub fn is_connected(&self) -> bool {
        self.queue.is_some()
    }

    /// Next round number this pin will stamp on a source buffer
    pub fn round(&self) -> u64 {
        self.round.load(Ordering::Relaxed)
    }

    /// Per-pin buffer size override
    pub fn bufsize(&self) -> Option<usize> {
        self.bufsize
    }

    /// Per-pin buffer count override
    pub fn bufcount(&self) -> Option<usize> {
        self.bufcount
    }

    pub(crate) fn set_bufsize(&mut self, size: usize) {
        self.bufsize = Some(size);
    }

    pub(crate) fn set_bufcount(&mut self, count: usize) {
        self.bufcount = Some(count);
    }

    #[cfg(test)]
    pub(crate) fn queue(&self) -> Option<&Queue> {
        self.queue.as_ref()
    }

    pub(crate) fn attach(&mut self, queue: Queue) {
        self.queue = Some(queue);
    }

    pub(crate) fn round_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.round)
    }
}

/// Fan-in pin: one queue per connected producer, in connection order
pub struct FanInPin {
    name: &'static str,
    queues: Vec<Queue>,
}

impl FanInPin {
    /// Pin name
    pub fn name(&self) -> &str {
        self.name
    }

    /// Number of connected producers
    pub fn width(&self) -> usize {
        self.queues.len()
    }

    /// Blocking read from the `n`th producer's queue; `None` at end of that
    /// stream or if there is no such producer.
    pub fn accept(&self, n: usize) -> Option<Buffer> {
        self.queues.get(n).and_then(Queue::read)
    }
}

/// Single output pin
pub struct OutputPin {
    name: &'static str,
    queue: Option<Queue>,
}

impl OutputPin {
    /// Pin name
    pub fn name(&self) -> &str {
        self.name
    }

    /// True if a downstream consumer is connected
    pub fn is_connected(&self) -> bool {
        self.queue.is_some()
    }

    /// Pass a buffer on. With a downstream consumer the buffer goes to it;
    /// an unconnected output returns the buffer to the pin that allocated it.
    pub fn convey(&self, buf: Buffer) -> Result<()> {
        match &self.queue {
            Some(queue) => {
                tracing::trace!(buffer = buf.id(), pin = self.name, "conveyed buffer");
                queue.write(buf)
            }
            None => {
                tracing::trace!(
                    buffer = buf.id(),
                    pin = self.name,
                    origin = buf.origin_pin().unwrap_or("-"),
                    "returned buffer to origin"
                );
                buf.recycle()
            }
        }
    }
}

/// Fan-out pin: one queue per connected consumer, in connection order
pub struct FanOutPin {
    name: &'static str,
    queues: Vec<Queue>,
}

impl FanOutPin {
    /// Pin name
    pub fn name(&self) -> &str {
        self.name
    }

    /// Number of connected consumers
    pub fn width(&self) -> usize {
        self.queues.len()
    }

    /// Pass a buffer to the `n`th consumer; with no such consumer the
    /// buffer goes back to its origin.
    pub fn convey(&self, n: usize, buf: Buffer) -> Result<()> {
        match self.queues.get(n) {
            Some(queue) => queue.write(buf),
            None => buf.recycle(),
        }
    }
}

/// A pin owned by a stage instance
pub enum Pin {
    /// Single input
    Input(InputPin),
    /// Fan-in array
    FanIn(FanInPin),
    /// Single output
    Output(OutputPin),
    /// Fan-out array
    FanOut(FanOutPin),
}

impl Pin {
    /// Instantiate a pin from its declaration
    pub fn from_decl(decl: &PinDecl) -> Self {
        match decl.direction {
            PinDirection::Input => Pin::Input(InputPin::new(decl.name)),
            PinDirection::ArrayInput => Pin::FanIn(FanInPin {
                name: decl.name,
                queues: Vec::new(),
            }),
            PinDirection::Output => Pin::Output(OutputPin {
                name: decl.name,
                queue: None,
            }),
            PinDirection::ArrayOutput => Pin::FanOut(FanOutPin {
                name: decl.name,
                queues: Vec::new(),
            }),
        }
    }

    /// Pin name
    pub fn name(&self) -> &str {
        match self {
            Pin::Input(p) => p.name,
            Pin::FanIn(p) => p.name,
            Pin::Output(p) => p.name,
            Pin::FanOut(p) => p.name,
        }
    }

    /// Declared direction
    pub fn direction(&self) -> PinDirection {
        match self {
            Pin::Input(_) => PinDirection::Input,
            Pin::FanIn(_) => PinDirection::ArrayInput,
            Pin::Output(_) => PinDirection::Output,
            Pin::FanOut(_) => PinDirection::ArrayOutput,
        }
    }

    /// True if a further producer connection would be refused
    pub(crate) fn producer_taken(&self) -> bool {
        matches!(self, Pin::Output(p) if p.queue.is_some())
    }

    /// True if a further consumer connection would be refused
    pub(crate) fn consumer_taken(&self) -> bool {
        matches!(self, Pin::Input(p) if p.queue.is_some())
    }

    /// Bind `queue` as this pin's downstream queue
    pub(crate) fn attach_producer(&mut self, queue: Queue) {
        match self {
            Pin::Output(p) => p.queue = Some(queue),
            Pin::FanOut(p) => p.queues.push(queue),
            Pin::Input(_) | Pin::FanIn(_) => {}
        }
    }

    /// Bind `queue` as this pin's upstream queue
    pub(crate) fn attach_consumer(&mut self, queue: Queue) {
        match self {
            Pin::Input(p) => p.attach(queue),
            Pin::FanIn(p) => p.queues.push(queue),
            Pin::Output(_) | Pin::FanOut(_) => {}
        }
    }

    /// Every queue this pin writes to
    pub(crate) fn output_queues(&self) -> &[Queue] {
        match self {
            Pin::Output(p) => p.queue.as_slice(),
            Pin::FanOut(p) => &p.queues,
            Pin::Input(_) | Pin::FanIn(_) => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Origin;

    #[test]
    fn test_from_decl_picks_variant() {
        assert!(matches!(Pin::from_decl(&PinDecl::input("a")), Pin::Input(_)));
        assert!(matches!(Pin::from_decl(&PinDecl::array_input("b")), Pin::FanIn(_)));
        assert!(matches!(Pin::from_decl(&PinDecl::output("c")), Pin::Output(_)));
        assert!(matches!(Pin::from_decl(&PinDecl::array_output("d")), Pin::FanOut(_)));
        assert_eq!(Pin::from_decl(&PinDecl::array_input("b")).name(), "b");
    }

    #[test]
    fn test_fan_in_reads_each_producer() {
        let mut pin = Pin::from_decl(&PinDecl::array_input("data_in"));
        let (q0, q1) = (Queue::new(), Queue::new());
        pin.attach_consumer(q0.clone());
        pin.attach_consumer(q1.clone());

        let mut buf = Buffer::new(4);
        buf.set_len(1);
        q1.write(buf).unwrap();
        q0.deactivate();

        let Pin::FanIn(fan_in) = &pin else {
            panic!("expected fan-in pin");
        };
        assert_eq!(fan_in.width(), 2);
        assert!(fan_in.accept(0).is_none());
        assert_eq!(fan_in.accept(1).map(|b| b.len()), Some(1));
        assert!(fan_in.accept(2).is_none());
    }

    #[test]
    fn test_unconnected_output_recycles_to_origin() {
        let round = Arc::new(AtomicU64::new(0));
        let source = Queue::source(Arc::clone(&round));
        let buf = Buffer::with_origin(
            8,
            Origin {
                queue: source.downgrade(),
                pin: Arc::from("reader.buf_in"),
            },
        );

        let Pin::Output(out) = Pin::from_decl(&PinDecl::output("buf_out")) else {
            panic!("expected output pin");
        };
        assert!(!out.is_connected());
        out.convey(buf).unwrap();

        let back = source.read().unwrap();
        assert_eq!(back.origin_pin(), Some("reader.buf_in"));
        assert_eq!(round.load(Ordering::Relaxed), 1);
    }
}
