use std::{
    collections::HashSet,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use thiserror::Error;
use tracing::{error, warn};

use crate::{
    EventKind, EventRecord, ExceptionRecord, FrameRecord, FunctionRecord, LineRecord,
    ModuleRecord, context::TraceContext, store::StoreError,
};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UsageError {
    #[error("start_tracing called while profiling is active")]
    TracingWhileProfiling,
    #[error("start_profiling called while tracing is active")]
    ProfilingWhileTracing,
    #[error("start called while already started")]
    AlreadyStarted,
    #[error("the bridge was stopped and cannot be restarted")]
    StartAfterStop,
    #[error("function {0:#x} is already registered")]
    DuplicateFunction(u64),
    #[error("add_function called after the bridge was stopped")]
    AddFunctionAfterStop,
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error("failed to write a trace record")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum BridgeInitError {
    #[error("the context's store set was already closed")]
    StoresClosed,
}

/// An owned byte region whose internals this crate never parses: only its
/// size and pointer are exposed. Used for the host runtime's internal
/// representation, whose exact native layout is not ours to know.
pub struct OpaqueRegion(Box<[u8]>);

impl OpaqueRegion {
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn empty() -> Self {
        Self(Box::default())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }
}

/// A unit of code registered for call/line events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FunctionTarget {
    pub function_id: u64,
    pub module_id: u64,
    pub name_hash: u64,
    pub first_line: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ModuleTarget {
    pub module_id: u64,
    pub name_hash: u64,
    pub path_hash: u64,
}

/// One occurrence reported by the host runtime's hook.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RuntimeEvent {
    Call { function_id: u64 },
    Return { function_id: u64 },
    Line { function_id: u64, line: u32 },
    Exception { function_id: u64, line: u32, name_hash: u64 },
}

impl RuntimeEvent {
    pub fn function_id(&self) -> u64 {
        match *self {
            RuntimeEvent::Call { function_id }
            | RuntimeEvent::Return { function_id }
            | RuntimeEvent::Line { function_id, .. }
            | RuntimeEvent::Exception { function_id, .. } => function_id,
        }
    }
}

/// The raw hook the host runtime installs; handed in at bridge
/// initialization and stored, not interpreted.
pub type RuntimeCallback = fn(&TracingBridge<'_>, &RuntimeEvent);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BridgeMode {
    Idle,
    Tracing,
    Profiling,
    /// Terminal: reached by stopping an active mode. The tracking set is
    /// cleared on entry and further registration is a usage error.
    Stopped,
}

/// The tracing capability as seen by call sites. Call sites that trace
/// nothing take a [NullBridge] instead of checking a sentinel global.
pub trait Trace {
    fn add_function(&mut self, target: FunctionTarget) -> Result<(), BridgeError>;
    fn start(&mut self) -> Result<(), BridgeError>;
    fn stop(&mut self) -> Result<(), BridgeError>;
    fn start_profiling(&mut self) -> Result<(), BridgeError>;
    fn stop_profiling(&mut self) -> Result<(), BridgeError>;
}

/// No-op implementation of [Trace]: every control succeeds, nothing records.
pub struct NullBridge;

impl Trace for NullBridge {
    fn add_function(&mut self, _target: FunctionTarget) -> Result<(), BridgeError> {
        Ok(())
    }
    fn start(&mut self) -> Result<(), BridgeError> {
        Ok(())
    }
    fn stop(&mut self) -> Result<(), BridgeError> {
        Ok(())
    }
    fn start_profiling(&mut self) -> Result<(), BridgeError> {
        Ok(())
    }
    fn stop_profiling(&mut self) -> Result<(), BridgeError> {
        Ok(())
    }
}

/// Boundary object between the host runtime's event hook and the trace
/// context. Forwards qualifying events into the category stores and exposes
/// the start/stop/add-function controls.
///
/// Tracing and profiling are mutually exclusive modes sharing the same
/// context; starting one while the other is active is a [UsageError].
pub struct TracingBridge<'a> {
    runtime: OpaqueRegion,
    context: &'a TraceContext<'a>,
    callback: Option<RuntimeCallback>,
    user_data: u64,
    functions: HashSet<u64>,
    modules: HashSet<u64>,
    mode: BridgeMode,
    /// Checked before every write, so stop() is safe while a dispatch is in
    /// flight: the writer observes the flag instead of being aborted
    /// mid-record.
    active: AtomicBool,
    depth: AtomicU32,
}

impl<'a> TracingBridge<'a> {
    pub const fn required_size() -> u32 {
        std::mem::size_of::<Self>() as u32
    }

    pub(crate) fn new(
        runtime: OpaqueRegion, context: &'a TraceContext<'a>, callback: Option<RuntimeCallback>,
        user_data: u64,
    ) -> Self {
        Self {
            runtime,
            context,
            callback,
            user_data,
            functions: HashSet::new(),
            modules: HashSet::new(),
            mode: BridgeMode::Idle,
            active: AtomicBool::new(false),
            depth: AtomicU32::new(0),
        }
    }

    pub fn mode(&self) -> BridgeMode {
        self.mode
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn runtime(&self) -> &OpaqueRegion {
        &self.runtime
    }

    pub fn callback(&self) -> Option<RuntimeCallback> {
        self.callback
    }

    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    pub fn context(&self) -> &TraceContext<'a> {
        self.context
    }

    /// Register a module so its identity appears in the Modules store.
    /// Re-registration is a silent no-op; modules are shared between
    /// functions.
    pub fn add_module(&mut self, target: ModuleTarget) -> Result<(), BridgeError> {
        if self.mode == BridgeMode::Stopped {
            return Err(UsageError::AddFunctionAfterStop.into());
        }
        if !self.modules.insert(target.module_id) {
            return Ok(());
        }
        self.context.write(&ModuleRecord {
            timestamp: self.context.timer().now_ticks(),
            sequence: self.context.next_sequence(),
            module_id: target.module_id,
            name_hash: target.name_hash,
            path_hash: target.path_hash,
        })?;
        Ok(())
    }

    /// Forward one runtime event. Events for unregistered functions, or
    /// arriving while tracing is not active, record nothing and succeed.
    ///
    /// Every qualifying event produces exactly one [EventRecord] plus one
    /// record in its category-specific store.
    pub fn dispatch(&self, event: &RuntimeEvent) -> Result<bool, BridgeError> {
        if !self.active.load(Ordering::Acquire) {
            return Ok(false);
        }
        let function_id = event.function_id();
        if !self.functions.contains(&function_id) {
            return Ok(false);
        }

        let timer = self.context.timer();
        let (kind, line) = match *event {
            RuntimeEvent::Call { .. } => (EventKind::Call, 0),
            RuntimeEvent::Return { .. } => (EventKind::Return, 0),
            RuntimeEvent::Line { line, .. } => (EventKind::Line, line),
            RuntimeEvent::Exception { line, .. } => (EventKind::Exception, line),
        };
        self.write_degraded(&EventRecord {
            timestamp: timer.now_ticks(),
            sequence: self.context.next_sequence(),
            function_id,
            kind,
            line,
        })?;

        match *event {
            RuntimeEvent::Call { .. } => {
                let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
                self.write_degraded(&FrameRecord {
                    timestamp: timer.now_ticks(),
                    sequence: self.context.next_sequence(),
                    function_id,
                    depth,
                    kind: EventKind::Call,
                })?;
            }
            RuntimeEvent::Return { .. } => {
                let before = self.depth.load(Ordering::Relaxed);
                let depth = before.saturating_sub(1);
                self.depth.store(depth, Ordering::Relaxed);
                self.write_degraded(&FrameRecord {
                    timestamp: timer.now_ticks(),
                    sequence: self.context.next_sequence(),
                    function_id,
                    depth,
                    kind: EventKind::Return,
                })?;
            }
            RuntimeEvent::Line { line, .. } => {
                self.write_degraded(&LineRecord {
                    timestamp: timer.now_ticks(),
                    sequence: self.context.next_sequence(),
                    function_id,
                    line,
                    flags: 0,
                })?;
            }
            RuntimeEvent::Exception { line, name_hash, .. } => {
                self.write_degraded(&ExceptionRecord {
                    timestamp: timer.now_ticks(),
                    sequence: self.context.next_sequence(),
                    function_id,
                    name_hash,
                    line,
                    depth: self.depth.load(Ordering::Relaxed),
                })?;
            }
        }
        Ok(true)
    }

    /// Write a record, degrading a full store to a warning instead of an
    /// error: the store counts the drop and keeps serving.
    fn write_degraded<R: crate::TraceRecord>(&self, record: &R) -> Result<(), BridgeError> {
        match self.context.write(record) {
            Ok(_) => Ok(()),
            Err(StoreError::Exhausted { kind }) => {
                warn!(%kind, "record dropped, store at maximum size");
                Ok(())
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Scoped acquisition: start on entry, guaranteed stop on every exit
    /// path of the scope.
    pub fn scope(&mut self) -> Result<TraceScope<'_, 'a>, BridgeError> {
        self.start()?;
        Ok(TraceScope(self))
    }
}

impl Trace for TracingBridge<'_> {
    /// Register a unit of code to be watched; writes its [FunctionRecord].
    fn add_function(&mut self, target: FunctionTarget) -> Result<(), BridgeError> {
        if self.mode == BridgeMode::Stopped {
            return Err(UsageError::AddFunctionAfterStop.into());
        }
        if !self.functions.insert(target.function_id) {
            return Err(UsageError::DuplicateFunction(target.function_id).into());
        }
        self.context.write(&FunctionRecord {
            timestamp: self.context.timer().now_ticks(),
            sequence: self.context.next_sequence(),
            function_id: target.function_id,
            module_id: target.module_id,
            name_hash: target.name_hash,
            first_line: target.first_line,
            flags: 0,
        })?;
        Ok(())
    }

    fn start(&mut self) -> Result<(), BridgeError> {
        match self.mode {
            BridgeMode::Profiling => Err(UsageError::TracingWhileProfiling.into()),
            BridgeMode::Tracing => Err(UsageError::AlreadyStarted.into()),
            BridgeMode::Stopped => Err(UsageError::StartAfterStop.into()),
            BridgeMode::Idle => {
                self.mode = BridgeMode::Tracing;
                self.active.store(true, Ordering::Release);
                Ok(())
            }
        }
    }

    /// Stop tracing. A stop without a matching start is a no-op success.
    fn stop(&mut self) -> Result<(), BridgeError> {
        match self.mode {
            BridgeMode::Tracing => {
                self.active.store(false, Ordering::Release);
                self.mode = BridgeMode::Stopped;
                self.functions.clear();
                self.modules.clear();
                Ok(())
            }
            BridgeMode::Idle | BridgeMode::Stopped | BridgeMode::Profiling => Ok(()),
        }
    }

    fn start_profiling(&mut self) -> Result<(), BridgeError> {
        match self.mode {
            BridgeMode::Tracing => Err(UsageError::ProfilingWhileTracing.into()),
            BridgeMode::Profiling => Err(UsageError::AlreadyStarted.into()),
            BridgeMode::Stopped => Err(UsageError::StartAfterStop.into()),
            BridgeMode::Idle => {
                self.mode = BridgeMode::Profiling;
                Ok(())
            }
        }
    }

    /// Mirrors [Trace::stop]: stopping profiling that never started is a
    /// no-op success.
    fn stop_profiling(&mut self) -> Result<(), BridgeError> {
        match self.mode {
            BridgeMode::Profiling => {
                self.mode = BridgeMode::Stopped;
                self.functions.clear();
                self.modules.clear();
                Ok(())
            }
            BridgeMode::Idle | BridgeMode::Stopped | BridgeMode::Tracing => Ok(()),
        }
    }
}

/// Guard returned by [TracingBridge::scope]; stops the bridge when dropped,
/// on normal return, early return and failure alike.
pub struct TraceScope<'b, 'a>(&'b mut TracingBridge<'a>);

impl<'a> std::ops::Deref for TraceScope<'_, 'a> {
    type Target = TracingBridge<'a>;

    fn deref(&self) -> &Self::Target {
        self.0
    }
}

impl Drop for TraceScope<'_, '_> {
    fn drop(&mut self) {
        if let Err(stop_error) = self.0.stop() {
            error!(error = %stop_error, "failed to stop tracing at scope exit");
        }
    }
}
