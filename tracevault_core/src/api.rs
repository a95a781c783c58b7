//! The native-style entry points: one function per engine operation, with a
//! two-phase size negotiation that keeps structure layouts
//! version-compatible across the boundary.
//!
//! The protocol: call once with a [SizeNegotiation] probe (any value that is
//! not the required size, typically zero). The call fails with
//! [InitError::NegotiationMismatch] and writes the required size back into
//! the negotiation. Re-call once with the corrected value; a second mismatch
//! signals a layout incompatibility, not a transient condition.

use std::path::Path;

use thiserror::Error;

use crate::{
    bridge::{
        BridgeError, BridgeInitError, FunctionTarget, OpaqueRegion, RuntimeCallback, Trace,
        TracingBridge,
    },
    context::{ContextInitError, TraceContext},
    extension::ExtensionCoordinator,
    session::{SessionError, TraceSession},
    store::{GrowthPolicy, StoreError, StoreFlags, TraceStoreSet},
};

/// The in/out size value of the negotiation protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SizeNegotiation {
    pub value: u32,
}

impl SizeNegotiation {
    /// A probe that learns the required size on the first call.
    pub fn probe() -> Self {
        Self { value: 0 }
    }

    pub fn with_size(value: u32) -> Self {
        Self { value }
    }
}

#[derive(Error, Debug)]
pub enum InitError {
    #[error("size negotiation mismatch: required {required} bytes, caller supplied {supplied}")]
    NegotiationMismatch { required: u32, supplied: u32 },
    #[error("trace store initialization failed")]
    Stores(#[source] StoreError),
    #[error("trace session initialization failed")]
    Session(#[source] SessionError),
    #[error("trace context initialization failed")]
    Context(#[source] ContextInitError),
    #[error("tracing bridge initialization failed")]
    Bridge(#[source] BridgeInitError),
}

fn negotiate(size: &mut SizeNegotiation, required: u32) -> Result<(), InitError> {
    if size.value != required {
        let supplied = size.value;
        size.value = required;
        return Err(InitError::NegotiationMismatch { required, supplied });
    }
    Ok(())
}

/// InitializeTraceStores: create the per-run store directory and the twelve
/// category stores under `base_path`. Negotiates size.
pub fn initialize_trace_stores(
    base_path: &Path, size: &mut SizeNegotiation, policy: GrowthPolicy, flags: StoreFlags,
) -> Result<TraceStoreSet, InitError> {
    negotiate(size, TraceStoreSet::required_size())?;
    TraceStoreSet::initialize(base_path, policy, flags).map_err(InitError::Stores)
}

/// InitializeTraceSession: capture the identity of this recording run.
/// Negotiates size.
pub fn initialize_trace_session(size: &mut SizeNegotiation) -> Result<TraceSession, InitError> {
    negotiate(size, TraceSession::required_size())?;
    TraceSession::create().map_err(InitError::Session)
}

/// InitializeTraceContext: bind a session, a store set and the coordinator.
/// Negotiates size. The context borrows all three; they must outlive it.
pub fn initialize_trace_context<'a>(
    size: &mut SizeNegotiation, session: &'a TraceSession, stores: &'a TraceStoreSet,
    coordinator: &'a ExtensionCoordinator, user_data: u64,
) -> Result<TraceContext<'a>, InitError> {
    negotiate(size, TraceContext::required_size())?;
    if stores.is_closed() {
        return Err(InitError::Context(ContextInitError::StoresClosed));
    }
    Ok(TraceContext::new(session, stores, coordinator, user_data))
}

/// InitializePythonTraceContext's counterpart: bind the host runtime's
/// opaque state and callback to a trace context. Negotiates size.
pub fn initialize_bridge<'a>(
    size: &mut SizeNegotiation, runtime: OpaqueRegion, context: &'a TraceContext<'a>,
    callback: Option<RuntimeCallback>, user_data: u64,
) -> Result<TracingBridge<'a>, InitError> {
    negotiate(size, TracingBridge::required_size())?;
    if context.stores().is_closed() {
        return Err(InitError::Bridge(BridgeInitError::StoresClosed));
    }
    Ok(TracingBridge::new(runtime, context, callback, user_data))
}

pub fn add_function(
    bridge: &mut TracingBridge<'_>, target: FunctionTarget,
) -> Result<(), BridgeError> {
    bridge.add_function(target)
}

pub fn start_tracing(bridge: &mut TracingBridge<'_>) -> Result<(), BridgeError> {
    bridge.start()
}

pub fn stop_tracing(bridge: &mut TracingBridge<'_>) -> Result<(), BridgeError> {
    bridge.stop()
}

pub fn start_profiling(bridge: &mut TracingBridge<'_>) -> Result<(), BridgeError> {
    bridge.start_profiling()
}

pub fn stop_profiling(bridge: &mut TracingBridge<'_>) -> Result<(), BridgeError> {
    bridge.stop_profiling()
}

/// CloseTraceStores: close every store; data stores first, metadata twins
/// flushed last. Idempotent.
pub fn close_trace_stores(stores: &mut TraceStoreSet) -> Result<(), StoreError> {
    stores.close()
}
