use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use thiserror::Error;

use crate::{
    MAX_RECORD_SIZE, TraceRecord, encode_record,
    extension::ExtensionCoordinator,
    session::TraceSession,
    store::{StoreError, TraceStoreSet},
};

#[derive(Error, Debug)]
pub enum ContextInitError {
    #[error("the store set was already closed")]
    StoresClosed,
}

/// Monotonic tick source for record timestamps. Ticks are nanoseconds since
/// the context was initialized; `frequency` is ticks per second.
pub struct TimerSource {
    origin: Instant,
    frequency: u64,
}

impl TimerSource {
    pub fn new() -> Self {
        Self { origin: Instant::now(), frequency: 1_000_000_000 }
    }

    pub fn now_ticks(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    pub fn frequency(&self) -> u64 {
        self.frequency
    }
}

impl Default for TimerSource {
    fn default() -> Self {
        Self::new()
    }
}

/// The live binding of a session, a store set and the extension coordinator.
/// Owns none of them — they are supplied by, and outlive, the caller — which
/// also means the set cannot be closed while a context borrows it.
///
/// Every record write goes through [TraceContext::write], which resolves the
/// record's category to its store. Sequence ids are context-wide, so records
/// within one category are strictly ordered by sequence.
pub struct TraceContext<'a> {
    size: u32,
    sequence_id: AtomicU64,
    session: &'a TraceSession,
    stores: &'a TraceStoreSet,
    coordinator: &'a ExtensionCoordinator,
    timer: TimerSource,
    user_data: u64,
}

impl<'a> TraceContext<'a> {
    pub const fn required_size() -> u32 {
        std::mem::size_of::<Self>() as u32
    }

    pub(crate) fn new(
        session: &'a TraceSession, stores: &'a TraceStoreSet,
        coordinator: &'a ExtensionCoordinator, user_data: u64,
    ) -> Self {
        Self {
            size: Self::required_size(),
            sequence_id: AtomicU64::new(0),
            session,
            stores,
            coordinator,
            timer: TimerSource::new(),
            user_data,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn session(&self) -> &TraceSession {
        self.session
    }

    pub fn stores(&self) -> &TraceStoreSet {
        self.stores
    }

    pub fn timer(&self) -> &TimerSource {
        &self.timer
    }

    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    /// Next context-wide sequence id; starts at 1.
    pub fn next_sequence(&self) -> u64 {
        self.sequence_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Encode `record` and append it to the store of its category.
    pub fn write<R: TraceRecord>(&self, record: &R) -> Result<u64, StoreError> {
        let mut buf = [0u8; MAX_RECORD_SIZE];
        let written = encode_record(record, &mut buf)?;
        debug_assert_eq!(written as u64, R::ENCODED_SIZE);
        self.stores.store(R::KIND).append(R::ENCODED_SIZE, &buf[..written], self.coordinator)
    }
}
