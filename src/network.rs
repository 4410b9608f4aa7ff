//! Network: the stage graph and its lifecycle
//!
//! A network is built single-threaded (stages, connections, parameters),
//! fixed once (stage init hooks run, buffer pools are injected into every
//! true-source input pin) and then run once: one thread per stage, started
//! and joined in registration order, followed by every stage's fini hook.

use crate::buffer::{Buffer, Origin};
use crate::error::{Error, Result};
use crate::pin::{InputPin, Pin};
use crate::queue::Queue;
use crate::registry::Registry;
use crate::stage::{Stage, StageDef};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Settings for the threads that run a network's stages
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct ThreadConfig {
    /// Prefix for stage thread names (the stage name follows it)
    pub name_prefix: String,

    /// Stack size for stage threads (None = platform default)
    pub stack_size: Option<usize>,

    /// Pin the `i`th stage's thread to core `i mod ncpus`
    pub pin_cores: bool,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            name_prefix: "fg-".to_string(),
            stack_size: None,
            pin_cores: false,
        }
    }
}

impl ThreadConfig {
    /// Create a thread configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread name prefix
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Set the stack size
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Enable or disable core pinning
    pub fn with_pin_cores(mut self, pin: bool) -> Self {
        self.pin_cores = pin;
        self
    }

    fn builder(&self, stage: &str) -> thread::Builder {
        let mut builder = thread::Builder::new().name(format!("{}{}", self.name_prefix, stage));
        if let Some(stack_size) = self.stack_size {
            builder = builder.stack_size(stack_size);
        }
        builder
    }

    fn pin_current(&self, index: usize) {
        if !self.pin_cores {
            return;
        }
        if let Some(core_ids) = core_affinity::get_core_ids() {
            let ncpus = num_cpus::get().max(1);
            if let Some(core) = core_ids.get(index % ncpus) {
                if !core_affinity::set_for_current(*core) {
                    tracing::warn!(core = core.id, "could not pin stage thread");
                }
            }
        }
    }
}

struct HaltState {
    halted: AtomicBool,
    queues: Mutex<Vec<Queue>>,
}

/// Handle for stopping a running network from another thread.
///
/// Halting marks the network halted and deactivates every queue in it, so
/// stages blocked on a read wake up, see end-of-stream and terminate.
/// Stage loops also stop between steps once the network is halted.
#[derive(Clone)]
pub struct HaltHandle {
    state: Arc<HaltState>,
}

impl HaltHandle {
    fn new() -> Self {
        Self {
            state: Arc::new(HaltState {
                halted: AtomicBool::new(false),
                queues: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Stop the network
    pub fn halt(&self) {
        if self.state.halted.swap(true, Ordering::AcqRel) {
            return;
        }
        let queues = self.state.queues.lock();
        tracing::info!(queues = queues.len(), "halting network");
        for queue in queues.iter() {
            queue.deactivate();
        }
    }

    /// True once [`halt`](Self::halt) has been called
    pub fn is_halted(&self) -> bool {
        self.state.halted.load(Ordering::Acquire)
    }

    fn watch(&self, queue: Queue) {
        self.state.queues.lock().push(queue);
    }

    fn absorb(&self, other: &HaltHandle) {
        let moved = std::mem::take(&mut *other.state.queues.lock());
        self.state.queues.lock().extend(moved);
    }
}

impl fmt::Debug for HaltHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HaltHandle")
            .field("halted", &self.is_halted())
            .finish()
    }
}

/// `stage.pin` address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinAddr {
    /// Stage name
    pub stage: String,
    /// Pin name
    pub pin: String,
}

impl PinAddr {
    fn new(stage: &str, pin: &str) -> Self {
        Self {
            stage: stage.to_string(),
            pin: pin.to_string(),
        }
    }
}

impl fmt::Display for PinAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stage, self.pin)
    }
}

/// A producer pin connected to a consumer pin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Producer side
    pub from: PinAddr,
    /// Consumer side
    pub to: PinAddr,
}

/// Network-level name for a stage parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamAlias {
    /// External name
    pub name: String,
    /// Target stage
    pub stage: String,
    /// Parameter name local to the stage
    pub param: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Building,
    Fixed,
    Finished,
}

/// A graph of stages
pub struct Network {
    name: String,
    stages: Vec<Stage>,
    connections: Vec<Connection>,
    aliases: Vec<ParamAlias>,
    default_bufcount: usize,
    default_bufsize: usize,
    threads: ThreadConfig,
    halt: HaltHandle,
    phase: Phase,
}

impl Network {
    /// Create an empty network with the given default buffer pool shape
    pub fn new(name: impl Into<String>, default_bufcount: usize, default_bufsize: usize) -> Self {
        let name = name.into();
        tracing::debug!(network = %name, default_bufcount, default_bufsize, "created network");
        Self {
            name,
            stages: Vec::new(),
            connections: Vec::new(),
            aliases: Vec::new(),
            default_bufcount,
            default_bufsize,
            threads: ThreadConfig::default(),
            halt: HaltHandle::new(),
            phase: Phase::Building,
        }
    }

    /// Set the stage thread configuration
    pub fn with_thread_config(mut self, threads: ThreadConfig) -> Self {
        self.threads = threads;
        self
    }

    /// Network name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Default buffer count for true-source pins without an override
    pub fn default_bufcount(&self) -> usize {
        self.default_bufcount
    }

    /// Default buffer size for true-source pins without an override
    pub fn default_bufsize(&self) -> usize {
        self.default_bufsize
    }

    /// Change the default buffer count
    pub fn set_default_bufcount(&mut self, count: usize) -> Result<()> {
        self.ensure_building()?;
        self.default_bufcount = count;
        Ok(())
    }

    /// Change the default buffer size
    pub fn set_default_bufsize(&mut self, size: usize) -> Result<()> {
        self.ensure_building()?;
        self.default_bufsize = size;
        Ok(())
    }

    /// Stages in registration order
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Connections in the order they were made
    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Parameter aliases
    pub fn aliases(&self) -> &[ParamAlias] {
        &self.aliases
    }

    /// True once [`fix`](Self::fix) has succeeded
    pub fn is_fixed(&self) -> bool {
        self.phase != Phase::Building
    }

    /// Handle that can halt this network while it runs
    pub fn halt_handle(&self) -> HaltHandle {
        self.halt.clone()
    }

    fn ensure_building(&self) -> Result<()> {
        match self.phase {
            Phase::Building => Ok(()),
            Phase::Fixed => Err(Error::AlreadyFixed(self.name.clone())),
            Phase::Finished => Err(Error::AlreadyRan(self.name.clone())),
        }
    }

    fn stage_index(&self, name: &str) -> Result<usize> {
        self.stages
            .iter()
            .position(|s| s.name() == name)
            .ok_or_else(|| Error::StageNotFound(name.to_string()))
    }

    /// Look a stage up by name
    pub fn stage(&self, name: &str) -> Result<&Stage> {
        self.stage_index(name).map(|i| &self.stages[i])
    }

    /// Look a stage up by name, mutably
    pub fn stage_mut(&mut self, name: &str) -> Result<&mut Stage> {
        let index = self.stage_index(name)?;
        Ok(&mut self.stages[index])
    }

    /// Instantiate a stage of type `kind`, looked up in `registry`
    pub fn add_stage(&mut self, registry: &Registry, kind: &str, name: &str) -> Result<&mut Stage> {
        let def = registry.get(kind)?;
        self.add_stage_def(def, name)
    }

    /// Instantiate a stage from a definition
    pub fn add_stage_def(&mut self, def: Arc<StageDef>, name: &str) -> Result<&mut Stage> {
        self.ensure_building()?;
        if self.stage_index(name).is_ok() {
            return Err(Error::DuplicateStage(name.to_string()));
        }
        self.stages.push(Stage::new(def, name));
        let last = self.stages.len() - 1;
        Ok(&mut self.stages[last])
    }

    /// Connect a producer pin to a consumer pin through a new queue.
    ///
    /// The producer must be an output or array-output pin and the consumer
    /// an input or array-input pin. Single pins take one connection; array
    /// pins take any number, in connection order.
    pub fn connect(&mut self, from_stage: &str, from_pin: &str, to_stage: &str, to_pin: &str) -> Result<()> {
        self.ensure_building()?;
        let from = self.stage_index(from_stage)?;
        let to = self.stage_index(to_stage)?;

        let producer = self.stages[from].pin(from_pin)?;
        if !producer.direction().is_output() {
            return Err(Error::PinDirection {
                stage: from_stage.to_string(),
                pin: from_pin.to_string(),
                expected: "an output pin",
            });
        }
        if producer.producer_taken() {
            return Err(Error::AlreadyConnected {
                stage: from_stage.to_string(),
                pin: from_pin.to_string(),
            });
        }

        let consumer = self.stages[to].pin(to_pin)?;
        if !consumer.direction().is_input() {
            return Err(Error::PinDirection {
                stage: to_stage.to_string(),
                pin: to_pin.to_string(),
                expected: "an input pin",
            });
        }
        if consumer.consumer_taken() {
            return Err(Error::AlreadyConnected {
                stage: to_stage.to_string(),
                pin: to_pin.to_string(),
            });
        }

        let queue = Queue::new();
        self.stages[from].pin_mut(from_pin)?.attach_producer(queue.clone());
        self.stages[to].pin_mut(to_pin)?.attach_consumer(queue.clone());
        self.halt.watch(queue);

        let connection = Connection {
            from: PinAddr::new(from_stage, from_pin),
            to: PinAddr::new(to_stage, to_pin),
        };
        tracing::debug!(from = %connection.from, to = %connection.to, "connected");
        self.connections.push(connection);
        Ok(())
    }

    fn single_input_mut(&mut self, stage: &str, pin: &str) -> Result<&mut InputPin> {
        self.ensure_building()?;
        match self.stage_mut(stage)?.pin_mut(pin)? {
            Pin::Input(p) => Ok(p),
            _ => Err(Error::PinDirection {
                stage: stage.to_string(),
                pin: pin.to_string(),
                expected: "a single input pin",
            }),
        }
    }

    /// Override the buffer size injected into `stage.pin` if it ends up a
    /// true source
    pub fn set_pin_bufsize(&mut self, stage: &str, pin: &str, size: usize) -> Result<()> {
        self.single_input_mut(stage, pin)?.set_bufsize(size);
        Ok(())
    }

    /// Override the buffer count injected into `stage.pin` if it ends up a
    /// true source
    pub fn set_pin_bufcount(&mut self, stage: &str, pin: &str, count: usize) -> Result<()> {
        self.single_input_mut(stage, pin)?.set_bufcount(count);
        Ok(())
    }

    /// Expose `stage.param` under the network-level name `alias`
    pub fn alias_param(&mut self, stage: &str, param: &str, alias: &str) -> Result<()> {
        // Validates both names
        self.stage(stage)?.param(param)?;
        if self.aliases.iter().any(|a| a.name == alias) {
            return Err(Error::DuplicateAlias(alias.to_string()));
        }
        self.aliases.push(ParamAlias {
            name: alias.to_string(),
            stage: stage.to_string(),
            param: param.to_string(),
        });
        Ok(())
    }

    /// Resolve an alias, or else a `stage.param` path split at its last `.`
    fn resolve_param<'a>(&'a self, name: &'a str) -> Result<(&'a str, &'a str)> {
        if let Some(alias) = self.aliases.iter().find(|a| a.name == name) {
            return Ok((&alias.stage, &alias.param));
        }
        name.rsplit_once('.').ok_or_else(|| Error::UnknownParam {
            stage: self.name.clone(),
            param: name.to_string(),
        })
    }

    /// Set a parameter by alias or `stage.param` path
    pub fn set_param(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        self.ensure_building()?;
        let (stage, param) = self.resolve_param(name)?;
        let (stage, param) = (stage.to_string(), param.to_string());
        self.stage_mut(&stage)?.set_param(&param, value)
    }

    /// Read a parameter by alias or `stage.param` path
    pub fn param(&self, name: &str) -> Result<Option<&str>> {
        let (stage, param) = self.resolve_param(name)?;
        self.stage(stage)?.param(param)
    }

    /// Deep copy of the graph under a new name: stages with their
    /// parameters and pin overrides, connections and aliases. The copy is
    /// unfixed and shares nothing with `self`.
    pub fn duplicate(&self, name: impl Into<String>) -> Result<Network> {
        let mut copy = Network::new(name, self.default_bufcount, self.default_bufsize)
            .with_thread_config(self.threads.clone());

        for stage in &self.stages {
            let new_stage = copy.add_stage_def(Arc::clone(stage.definition()), stage.name())?;
            for (param, value) in stage.params() {
                if let Some(value) = value {
                    new_stage.set_param(param, value)?;
                }
            }
            for pin in stage.pins() {
                if let Pin::Input(input) = pin {
                    if let Some(size) = input.bufsize() {
                        copy.set_pin_bufsize(stage.name(), input.name(), size)?;
                    }
                    if let Some(count) = input.bufcount() {
                        copy.set_pin_bufcount(stage.name(), input.name(), count)?;
                    }
                }
            }
        }

        for c in &self.connections {
            copy.connect(&c.from.stage, &c.from.pin, &c.to.stage, &c.to.pin)?;
        }
        for a in &self.aliases {
            copy.alias_param(&a.stage, &a.param, &a.name)?;
        }

        tracing::debug!(from = %self.name, to = %copy.name, stages = copy.stages.len(), "duplicated network");
        Ok(copy)
    }

    /// Move every stage of `other` into this network. Stage names and
    /// aliases are prefixed with `other`'s name and a `.`; existing
    /// connections and queues move along with their stages.
    pub fn merge(&mut self, mut other: Network) -> Result<()> {
        self.ensure_building()?;
        other.ensure_building()?;

        let prefix = other.name.clone();
        let renamed = |name: &str| format!("{}.{}", prefix, name);

        for stage in &other.stages {
            let name = renamed(stage.name());
            if self.stage_index(&name).is_ok() {
                return Err(Error::DuplicateStage(name));
            }
        }
        for alias in &other.aliases {
            let name = renamed(&alias.name);
            if self.aliases.iter().any(|a| a.name == name) {
                return Err(Error::DuplicateAlias(name));
            }
        }

        for mut stage in other.stages.drain(..) {
            let name = renamed(stage.name());
            stage.rename(name);
            self.stages.push(stage);
        }
        for mut c in other.connections.drain(..) {
            c.from.stage = renamed(&c.from.stage);
            c.to.stage = renamed(&c.to.stage);
            self.connections.push(c);
        }
        for a in other.aliases.drain(..) {
            self.aliases.push(ParamAlias {
                name: renamed(&a.name),
                stage: renamed(&a.stage),
                param: a.param,
            });
        }
        self.halt.absorb(&other.halt);

        tracing::debug!(into = %self.name, from = %prefix, stages = self.stages.len(), "merged network");
        Ok(())
    }

    /// Initialize every stage, then inject a buffer pool into every input
    /// pin that was never connected.
    ///
    /// If any init hook fails, every stage is reset and the network stays
    /// unfixed.
    pub fn fix(&mut self) -> Result<()> {
        self.ensure_building()?;
        tracing::info!(network = %self.name, stages = self.stages.len(), "fixing network");

        // Check pool shapes before anything runs
        for stage in &self.stages {
            for pin in stage.pins() {
                if let Pin::Input(input) = pin {
                    if !input.is_connected() {
                        let (count, size) = self.pool_shape(input);
                        if count == 0 || size == 0 {
                            return Err(Error::InvalidConfig(format!(
                                "{}.{}: {} x {}b buffer pool",
                                stage.name(),
                                input.name(),
                                count,
                                size
                            )));
                        }
                    }
                }
            }
        }

        for i in 0..self.stages.len() {
            if let Err(e) = self.stages[i].init() {
                tracing::error!(error = %e, "stage initialization failed");
                for stage in &mut self.stages {
                    stage.reset();
                }
                return Err(e);
            }
        }

        let (default_count, default_size) = (self.default_bufcount, self.default_bufsize);
        for stage in &mut self.stages {
            let stage_name = stage.name().to_string();
            for pin in stage.pins_mut() {
                let Pin::Input(input) = pin else {
                    continue;
                };
                if input.is_connected() {
                    continue;
                }
                let count = input.bufcount().unwrap_or(default_count);
                let size = input.bufsize().unwrap_or(default_size);

                let queue = Queue::source(input.round_counter());
                let origin = Origin {
                    queue: queue.downgrade(),
                    pin: Arc::from(format!("{}.{}", stage_name, input.name())),
                };
                for _ in 0..count {
                    queue.write(Buffer::with_origin(size, origin.clone()))?;
                }
                tracing::debug!(pin = %origin.pin, count, size, "injected buffer pool");

                input.attach(queue.clone());
                self.halt.watch(queue);
            }
        }

        self.phase = Phase::Fixed;
        Ok(())
    }

    fn pool_shape(&self, input: &InputPin) -> (usize, usize) {
        (
            input.bufcount().unwrap_or(self.default_bufcount),
            input.bufsize().unwrap_or(self.default_bufsize),
        )
    }

    /// Run the fixed network to completion.
    ///
    /// Starts one thread per stage in registration order, joins them in the
    /// same order and then runs every fini hook. A stage that fails or
    /// panics halts the network, so the remaining stages wind down instead
    /// of waiting on it. Returns the first failure, if any, once everything
    /// has been joined and finalized.
    pub fn run(&mut self) -> Result<()> {
        match self.phase {
            Phase::Building => return Err(Error::NotFixed(self.name.clone())),
            Phase::Finished => return Err(Error::AlreadyRan(self.name.clone())),
            Phase::Fixed => {}
        }
        tracing::info!(network = %self.name, stages = self.stages.len(), "running network");

        let stages = &mut self.stages;
        let threads = &self.threads;
        let halt = &self.halt;

        let mut first_error: Option<Error> = None;

        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(stages.len());
            for (index, stage) in stages.iter_mut().enumerate() {
                let name = stage.name().to_string();
                let spawned = threads.builder(&name).spawn_scoped(scope, move || {
                    threads.pin_current(index);
                    stage.run(halt)
                });
                match spawned {
                    Ok(handle) => handles.push((name, handle)),
                    Err(source) => {
                        tracing::error!(stage = %name, error = %source, "failed to spawn stage thread");
                        first_error = Some(Error::Spawn { stage: name, source });
                        halt.halt();
                        break;
                    }
                }
            }

            for (name, handle) in handles {
                let outcome = handle.join().unwrap_or_else(|panic| {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    Err(Error::StagePanicked(format!("{}: {}", name, message)))
                });
                tracing::debug!(stage = %name, ok = outcome.is_ok(), "joined stage thread");
                if let Err(e) = outcome {
                    first_error.get_or_insert(e);
                }
            }
        });

        for stage in stages.iter_mut() {
            if let Err(e) = stage.finalize() {
                tracing::warn!(stage = stage.name(), error = %e, "stage fini failed");
                first_error.get_or_insert(e);
            }
        }

        self.phase = Phase::Finished;
        tracing::info!(network = %self.name, ok = first_error.is_none(), "network complete");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "network {} ({} x {}b default buffers)",
            self.name, self.default_bufcount, self.default_bufsize
        )?;
        for stage in &self.stages {
            writeln!(f, "  stage {} : {}", stage.name(), stage.kind())?;
            for (param, value) in stage.params() {
                if let Some(value) = value {
                    writeln!(f, "    {} = {}", param, value)?;
                }
            }
        }
        for c in &self.connections {
            writeln!(f, "  connect {} -> {}", c.from, c.to)?;
        }
        for a in &self.aliases {
            writeln!(f, "  alias {} -> {}.{}", a.name, a.stage, a.param)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("name", &self.name)
            .field("stages", &self.stages)
            .field("phase", &self.phase)
            .finish()
    }
}
