//! Stage types and stage instances
//!
//! A [`StageDef`] describes a stage type: its pins, the parameters it
//! recognizes and an init hook that builds the per-instance
//! [`StageLogic`]. A [`Stage`] is one named instance of a type inside a
//! network. When the network runs, each stage gets its own thread which
//! calls [`StageLogic::step`] until it returns [`Step::Terminate`].
//!
//! ```text
//! Created ──fix──> Initialized ──run──> Running ──> Terminated ──> Finalized
//! ```

use crate::error::{Error, Result};
use crate::network::HaltHandle;
use crate::pin::{FanInPin, FanOutPin, InputPin, OutputPin, Pin, PinDecl};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Outcome of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Call the step function again
    Continue,
    /// Leave the step loop; outputs are deactivated
    Terminate,
}

/// Per-instance behaviour of a stage, built by the stage type's init hook
pub trait StageLogic: Send {
    /// Do one unit of work
    fn step(&mut self, io: &StageIo<'_>) -> Result<Step>;

    /// Release per-instance state once every stage in the network has
    /// terminated
    fn fini(&mut self, _io: &StageIo<'_>) -> Result<()> {
        Ok(())
    }
}

/// Init hook: builds a stage's logic from its parameters
pub type InitFn = dyn Fn(&StageParams<'_>) -> Result<Box<dyn StageLogic>> + Send + Sync;

/// Immutable description of a stage type, shared by all of its instances
pub struct StageDef {
    name: String,
    doc: String,
    pins: Vec<PinDecl>,
    params: Vec<&'static str>,
    init: Arc<InitFn>,
}

impl StageDef {
    /// Create a definition with no pins and no parameters
    pub fn new<F>(name: impl Into<String>, init: F) -> Self
    where
        F: Fn(&StageParams<'_>) -> Result<Box<dyn StageLogic>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            doc: String::new(),
            pins: Vec::new(),
            params: Vec::new(),
            init: Arc::new(init),
        }
    }

    /// Set the documentation string
    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }

    /// Set the pin declarations
    pub fn with_pins(mut self, pins: &[PinDecl]) -> Self {
        self.pins = pins.to_vec();
        self
    }

    /// Set the recognized parameter names
    pub fn with_params(mut self, params: &[&'static str]) -> Self {
        self.params = params.to_vec();
        self
    }

    /// Type name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Documentation string
    pub fn doc(&self) -> &str {
        &self.doc
    }

    /// Pin declarations, in declaration order
    pub fn pins(&self) -> &[PinDecl] {
        &self.pins
    }

    /// Recognized parameter names
    pub fn params(&self) -> &[&'static str] {
        &self.params
    }

    fn param_index(&self, param: &str) -> Option<usize> {
        self.params.iter().position(|p| *p == param)
    }
}

impl fmt::Debug for StageDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDef")
            .field("name", &self.name)
            .field("pins", &self.pins)
            .field("params", &self.params)
            .finish()
    }
}

/// Read-only view of a stage's parameter values, handed to the init hook
pub struct StageParams<'a> {
    stage: &'a str,
    names: &'a [&'static str],
    values: &'a [Option<String>],
}

impl<'a> StageParams<'a> {
    /// Name of the stage being initialized
    pub fn stage(&self) -> &str {
        self.stage
    }

    /// Value of `param`, if set
    pub fn get(&self, param: &str) -> Option<&'a str> {
        self.names
            .iter()
            .position(|p| *p == param)
            .and_then(|i| self.values[i].as_deref())
    }

    /// Value of `param`, failing if it was never set
    pub fn require(&self, param: &str) -> Result<&'a str> {
        self.get(param).ok_or_else(|| Error::MissingParam {
            stage: self.stage.to_string(),
            param: param.to_string(),
        })
    }

    /// Parse the value of `param`, if set
    pub fn parse<T: FromStr>(&self, param: &str) -> Result<Option<T>> {
        match self.get(param) {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|_| Error::InvalidParam {
                stage: self.stage.to_string(),
                param: param.to_string(),
                value: value.to_string(),
            }),
        }
    }
}

/// A stage's pins, as seen by its step function
pub struct StageIo<'a> {
    stage: &'a str,
    pins: &'a [Pin],
}

impl<'a> StageIo<'a> {
    /// Stage instance name
    pub fn name(&self) -> &'a str {
        self.stage
    }

    /// Look up a pin of any direction
    pub fn pin(&self, name: &str) -> Result<&'a Pin> {
        self.pins
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| Error::PinNotFound {
                stage: self.stage.to_string(),
                pin: name.to_string(),
            })
    }

    fn wrong_direction(&self, name: &str, expected: &'static str) -> Error {
        Error::PinDirection {
            stage: self.stage.to_string(),
            pin: name.to_string(),
            expected,
        }
    }

    /// Look up a single input pin
    pub fn input(&self, name: &str) -> Result<&'a InputPin> {
        match self.pin(name)? {
            Pin::Input(p) => Ok(p),
            _ => Err(self.wrong_direction(name, "a single input pin")),
        }
    }

    /// Look up a fan-in array pin
    pub fn fan_in(&self, name: &str) -> Result<&'a FanInPin> {
        match self.pin(name)? {
            Pin::FanIn(p) => Ok(p),
            _ => Err(self.wrong_direction(name, "an array input pin")),
        }
    }

    /// Look up a single output pin
    pub fn output(&self, name: &str) -> Result<&'a OutputPin> {
        match self.pin(name)? {
            Pin::Output(p) => Ok(p),
            _ => Err(self.wrong_direction(name, "a single output pin")),
        }
    }

    /// Look up a fan-out array pin
    pub fn fan_out(&self, name: &str) -> Result<&'a FanOutPin> {
        match self.pin(name)? {
            Pin::FanOut(p) => Ok(p),
            _ => Err(self.wrong_direction(name, "an array output pin")),
        }
    }
}

/// Lifecycle state of a stage instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Constructed, init hook not yet run
    Created,
    /// Init hook succeeded
    Initialized,
    /// Step loop in progress
    Running,
    /// Step loop finished, outputs deactivated
    Terminated,
    /// Fini hook ran
    Finalized,
}

/// A named instance of a stage type inside a network
pub struct Stage {
    name: String,
    def: Arc<StageDef>,
    params: Vec<Option<String>>,
    pins: Vec<Pin>,
    logic: Option<Box<dyn StageLogic>>,
    state: StageState,
}

impl Stage {
    pub(crate) fn new(def: Arc<StageDef>, name: impl Into<String>) -> Self {
        let name = name.into();
        let pins: Vec<Pin> = def.pins().iter().map(Pin::from_decl).collect();

        tracing::debug!(stage = %name, kind = def.name(), pins = pins.len(), "new stage");

        Self {
            name,
            params: vec![None; def.params().len()],
            def,
            pins,
            logic: None,
            state: StageState::Created,
        }
    }

    /// Instance name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn rename(&mut self, name: String) {
        self.name = name;
    }

    /// Stage type name
    pub fn kind(&self) -> &str {
        self.def.name()
    }

    /// Stage type definition
    pub fn definition(&self) -> &Arc<StageDef> {
        &self.def
    }

    /// Current lifecycle state
    pub fn state(&self) -> StageState {
        self.state
    }

    /// Set a parameter recognized by the stage type
    pub fn set_param(&mut self, param: &str, value: impl Into<String>) -> Result<()> {
        let index = self.param_index(param)?;
        self.params[index] = Some(value.into());
        Ok(())
    }

    /// Value of a parameter recognized by the stage type, if set
    pub fn param(&self, param: &str) -> Result<Option<&str>> {
        let index = self.param_index(param)?;
        Ok(self.params[index].as_deref())
    }

    /// Every recognized parameter with its value, in declaration order
    pub fn params(&self) -> impl Iterator<Item = (&'static str, Option<&str>)> + '_ {
        self.def
            .params()
            .iter()
            .copied()
            .zip(self.params.iter().map(Option::as_deref))
    }

    fn param_index(&self, param: &str) -> Result<usize> {
        self.def.param_index(param).ok_or_else(|| Error::UnknownParam {
            stage: self.name.clone(),
            param: param.to_string(),
        })
    }

    /// This stage's pins, in declaration order
    pub fn pins(&self) -> &[Pin] {
        &self.pins
    }

    /// Look up a pin by name
    pub fn pin(&self, name: &str) -> Result<&Pin> {
        self.pins
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| self.no_such_pin(name))
    }

    pub(crate) fn pin_mut(&mut self, name: &str) -> Result<&mut Pin> {
        let err = self.no_such_pin(name);
        self.pins.iter_mut().find(|p| p.name() == name).ok_or(err)
    }

    pub(crate) fn pins_mut(&mut self) -> &mut [Pin] {
        &mut self.pins
    }

    fn no_such_pin(&self, name: &str) -> Error {
        Error::PinNotFound {
            stage: self.name.clone(),
            pin: name.to_string(),
        }
    }

    fn io(&self) -> StageIo<'_> {
        StageIo {
            stage: &self.name,
            pins: &self.pins,
        }
    }

    /// Run the type's init hook
    pub(crate) fn init(&mut self) -> Result<()> {
        for (param, value) in self.params() {
            tracing::debug!(stage = %self.name, param, value = value.unwrap_or("(unset)"), "parameter");
        }

        let params = StageParams {
            stage: &self.name,
            names: self.def.params(),
            values: &self.params,
        };
        let logic = (self.def.init)(&params).map_err(|e| Error::InitFailed {
            stage: self.name.clone(),
            source: Box::new(e),
        })?;

        self.logic = Some(logic);
        self.state = StageState::Initialized;
        Ok(())
    }

    /// Drop per-instance state built by a successful init
    pub(crate) fn reset(&mut self) {
        self.logic = None;
        self.state = StageState::Created;
    }

    /// Thread body: step until told to terminate, then deactivate every
    /// output queue so downstream stages see end-of-stream. A stage that
    /// fails or panics halts the whole network.
    pub(crate) fn run(&mut self, halt: &HaltHandle) -> Result<()> {
        let _span = tracing::debug_span!("stage", name = %self.name).entered();
        tracing::debug!("handler starting");

        self.state = StageState::Running;
        let mut result = Ok(());
        let mut guard = RunGuard {
            pins: &self.pins,
            halt,
            failed: false,
        };

        if let Some(logic) = self.logic.as_mut() {
            let io = StageIo {
                stage: &self.name,
                pins: &self.pins,
            };
            let mut steps: u64 = 0;
            loop {
                if halt.is_halted() {
                    tracing::debug!("network halted");
                    break;
                }
                match logic.step(&io) {
                    Ok(Step::Continue) => steps += 1,
                    Ok(Step::Terminate) => break,
                    Err(e) if halt.is_halted() => {
                        tracing::debug!(error = %e, "step interrupted by halt");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "step failed");
                        guard.failed = true;
                        result = Err(Error::StageFailed {
                            stage: self.name.clone(),
                            source: Box::new(e),
                        });
                        break;
                    }
                }
            }
            tracing::debug!(steps, "stage complete");
        }
        drop(guard);

        self.state = StageState::Terminated;
        result
    }

    /// Run the fini hook, if the stage was initialized
    pub(crate) fn finalize(&mut self) -> Result<()> {
        let result = match self.logic.take() {
            Some(mut logic) => {
                tracing::debug!(stage = %self.name, "finalizing stage");
                let io = self.io();
                logic.fini(&io)
            }
            None => Ok(()),
        };
        self.state = StageState::Finalized;
        result
    }
}

/// Runs when a stage's step loop ends, however it ends.
///
/// Output queues are always deactivated. After a failure or a panic the
/// network is halted as well: that deactivates the stage's input queues and
/// every buffer pool, so producers waiting on buffers stranded in this stage
/// wake up and terminate instead of blocking forever.
struct RunGuard<'a> {
    pins: &'a [Pin],
    halt: &'a HaltHandle,
    failed: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.failed || std::thread::panicking() {
            tracing::warn!(panicked = !self.failed, "stage did not finish cleanly");
            self.halt.halt();
        }
        for pin in self.pins {
            for queue in pin.output_queues() {
                queue.deactivate();
            }
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("kind", &self.def.name())
            .field("state", &self.state)
            .finish()
    }
}
