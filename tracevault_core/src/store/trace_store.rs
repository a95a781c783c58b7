use std::{
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use memmap2::MmapOptions;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    RECORD_CONFIG, TraceStoreKind,
    extension::ExtensionCoordinator,
    store::{
        GrowthPolicy, METADATA_POLICY, MemoryMappedLog, PAGE_SIZE, PendingMapping, StoreError,
        prefault_range,
    },
};

/// Logical shape of a store: how many records it holds and how wide each one
/// is. Persisted in the store's metadata twin so the shape survives process
/// restarts.
///
/// Invariant: `number_of_records * record_size` never exceeds the data file's
/// size. The append path writes record bytes first and bumps the count after.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TraceStoreMetadata {
    pub number_of_records: u64,
    pub record_size: u64,
}

/// Fixed-int encoding of [TraceStoreMetadata]: two u64s.
pub const METADATA_RECORD_SIZE: u64 = 16;

/// How long a writer will wait for the coordinator to deliver an extended
/// mapping before the record is counted as dropped.
const EXTEND_WAIT: Duration = Duration::from_secs(5);

/// Outcome of one extension work item.
enum Extend {
    Grew,
    /// The previous swap (or a concurrent close) already made the request
    /// moot.
    Unneeded,
    AtMaximum,
}

/// One growable, memory-mapped, append-only log for a single event category,
/// together with its growth policy and bookkeeping.
///
/// Cheap to clone; clones share the underlying store. The extension
/// coordinator holds clones while extend/prefault work is in flight.
#[derive(Clone)]
pub struct TraceStore(Arc<StoreInner>);

pub(crate) struct StoreInner {
    kind: TraceStoreKind,
    is_metadata: bool,
    log: MemoryMappedLog,
    policy: GrowthPolicy,
    prefault: bool,
    dropped_records: AtomicU64,
    extensions: AtomicU64,
    extend_in_flight: AtomicBool,
    extension_failed: AtomicBool,
    metadata: Mutex<TraceStoreMetadata>,
    twin: Option<TraceStore>,
}

impl TraceStore {
    fn new(
        path: &Path, kind: TraceStoreKind, is_metadata: bool, policy: GrowthPolicy, prefault: bool,
        twin: Option<TraceStore>,
    ) -> Result<Self, StoreError> {
        let log = MemoryMappedLog::create(path, kind, policy.initial_size)?;
        Ok(Self(Arc::new(StoreInner {
            kind,
            is_metadata,
            log,
            policy,
            prefault,
            dropped_records: AtomicU64::new(0),
            extensions: AtomicU64::new(0),
            extend_in_flight: AtomicBool::new(false),
            extension_failed: AtomicBool::new(false),
            metadata: Mutex::new(TraceStoreMetadata::default()),
            twin,
        })))
    }

    /// Open the `<stem>.store` / `<stem>.metadata` pair for one category
    /// under `dir`. The returned store is the data store; its metadata twin
    /// is reachable through [TraceStore::metadata_store].
    pub(crate) fn create_pair(
        dir: &Path, kind: TraceStoreKind, policy: GrowthPolicy, prefault: bool,
    ) -> Result<TraceStore, StoreError> {
        let stem = kind.file_stem();
        let twin = TraceStore::new(
            &dir.join(format!("{stem}.metadata")),
            kind,
            true,
            METADATA_POLICY,
            false,
            None,
        )?;
        TraceStore::new(
            &dir.join(format!("{stem}.store")),
            kind,
            false,
            policy,
            prefault,
            Some(twin),
        )
    }

    pub fn kind(&self) -> TraceStoreKind {
        self.0.kind
    }

    pub fn is_metadata_store(&self) -> bool {
        self.0.is_metadata
    }

    pub fn metadata_store(&self) -> Option<&TraceStore> {
        self.0.twin.as_ref()
    }

    pub fn metadata(&self) -> TraceStoreMetadata {
        self.0.metadata.lock().map(|x| *x).unwrap_or_default()
    }

    pub fn dropped_records(&self) -> u64 {
        self.0.dropped_records.load(Ordering::Relaxed)
    }

    /// Number of completed extensions since the store was created.
    pub fn extension_count(&self) -> u64 {
        self.0.extensions.load(Ordering::Relaxed)
    }

    pub fn mapping_size(&self) -> Result<u64, StoreError> {
        self.0.log.mapping_size()
    }

    pub fn is_closed(&self) -> bool {
        self.0.log.is_closed()
    }

    /// Append one record of `record_size` bytes. On success the persisted
    /// metadata reflects the new count; the record bytes are fully in place
    /// before the count advances, so no partial record is ever observable.
    ///
    /// When the store is at `maximum_size` (or extension failed for this
    /// watermark crossing) the record is counted in
    /// [TraceStore::dropped_records] and [StoreError::Exhausted] is returned;
    /// this is a warning-level condition, the store keeps serving its
    /// existing capacity.
    pub fn append(
        &self, record_size: u64, bytes: &[u8], coordinator: &ExtensionCoordinator,
    ) -> Result<u64, StoreError> {
        debug_assert_eq!(bytes.len() as u64, record_size);
        if !self.ensure_capacity(bytes.len() as u64, coordinator)? {
            self.0.dropped_records.fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::Exhausted { kind: self.0.kind });
        }
        let offset = self.0.log.write(bytes)?;
        if self.0.prefault
            && offset / PAGE_SIZE as u64 != (offset + record_size) / PAGE_SIZE as u64
        {
            // Crossed into a new page; warm the pages ahead off-thread.
            coordinator.schedule_prefault(self.clone());
        }
        let snapshot = {
            let mut metadata = self.0.metadata.lock().map_err(|_| StoreError::Poisoned)?;
            metadata.number_of_records += 1;
            metadata.record_size = record_size;
            *metadata
        };
        self.store_metadata(&snapshot)?;
        Ok(offset)
    }

    /// Watermark check. Returns true once `needed` bytes fit in the active
    /// mapping, scheduling extension work as required; returns false when the
    /// store cannot grow any further and the record should be dropped. The
    /// OS-level grow never happens on the calling thread.
    fn ensure_capacity(
        &self, needed: u64, coordinator: &ExtensionCoordinator,
    ) -> Result<bool, StoreError> {
        let (remaining, file_length) = self.0.log.capacity()?;
        let at_maximum = file_length >= self.0.policy.maximum_size;
        if remaining >= needed {
            // Schedule ahead of exhaustion so the blocking wait below stays
            // the exception, not the rule.
            let watermark = self.0.policy.extension_size / 4;
            if remaining - needed < watermark && !at_maximum {
                coordinator.schedule_extend(self.clone());
            }
            return Ok(true);
        }
        if at_maximum {
            return Ok(false);
        }
        if self.0.extension_failed.load(Ordering::Acquire) {
            // The previous attempt failed. Retry in the background, but drop
            // this record rather than stalling the producer on a store that
            // may still be failing; a successful retry clears the flag.
            coordinator.schedule_extend(self.clone());
            return Ok(false);
        }
        coordinator.schedule_extend(self.clone());
        match self.0.log.wait_for_capacity(needed, &self.0.extension_failed, EXTEND_WAIT) {
            Ok(true) => Ok(true),
            Ok(false) => {
                warn!(kind = %self.0.kind, "no extended mapping became available");
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    /// Claim the per-store extension slot. At most one extend is outstanding
    /// per store, so swaps cannot race each other.
    pub(crate) fn begin_extend(&self) -> bool {
        self.0
            .extend_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_extend(&self) {
        self.0.extend_in_flight.store(false, Ordering::Release);
    }

    /// Extension work item body; runs on a coordinator worker.
    pub(crate) fn perform_extend(&self) {
        let outcome = self.extend_once();
        self.end_extend();
        match outcome {
            Ok(Extend::Grew) => {}
            Ok(Extend::Unneeded) => {
                self.0.log.notify_waiters();
            }
            Ok(Extend::AtMaximum) => {
                // Writers fall back to dropping records; this is the one
                // permanent state, guarded again by the capacity check.
                self.0.extension_failed.store(true, Ordering::Release);
                self.0.log.notify_waiters();
            }
            Err(error) => {
                warn!(kind = %self.0.kind, error = %error, "store extension failed");
                self.0.extension_failed.store(true, Ordering::Release);
                self.0.log.notify_waiters();
            }
        }
    }

    fn extend_once(&self) -> Result<Extend, StoreError> {
        // A writer can observe pre-swap capacity and schedule an extend that
        // the previous swap already satisfied; growing again here would
        // overshoot the watermark. Re-check under the current mapping.
        let (remaining, file_length) = self.0.log.capacity()?;
        if file_length >= self.0.policy.maximum_size {
            return Ok(Extend::AtMaximum);
        }
        if remaining >= self.0.policy.extension_size {
            return Ok(Extend::Unneeded);
        }
        let (file, file_length) = self.0.log.extend_snapshot()?;
        let new_length = (file_length + self.0.policy.extension_size).min(self.0.policy.maximum_size);
        file.set_len(new_length)?;
        // SAFETY: the cloned handle refers to the store's own file; the new
        // mapping aliases the active one over the same offsets, which is
        // coherent for shared file mappings.
        let mapping = unsafe { MmapOptions::new().len(new_length as usize).map_mut(&file) }?;
        if self.0.prefault {
            // Warm the grown tail only; everything below file_length is live.
            prefault_range(&mapping, file_length as usize, new_length as usize);
        }
        if !self.0.log.install_pending(PendingMapping { mapping, size: new_length })? {
            return Ok(Extend::Unneeded);
        }
        // Count (and end any transient-failure state) before the swap wakes
        // waiters, so neither is behind an observable capacity change.
        self.0.extensions.fetch_add(1, Ordering::Release);
        self.0.extension_failed.store(false, Ordering::Release);
        self.0.log.retire_and_swap()?;
        Ok(Extend::Grew)
    }

    /// Prefault work item body; touches the next unwritten pages of the
    /// active mapping. Purely opportunistic.
    pub(crate) fn perform_prefault(&self) {
        const PREFAULT_PAGES: usize = 16;
        if let Err(error) = self.0.log.prefault_ahead(PREFAULT_PAGES) {
            warn!(kind = %self.0.kind, error = %error, "prefault failed");
        }
    }

    /// Write-through of the metadata record into the twin store.
    fn store_metadata(&self, snapshot: &TraceStoreMetadata) -> Result<(), StoreError> {
        let Some(twin) = self.0.twin.as_ref() else {
            return Ok(());
        };
        let mut buf = [0u8; METADATA_RECORD_SIZE as usize];
        bincode::serde::encode_into_slice(snapshot, &mut buf, RECORD_CONFIG)?;
        twin.0.log.overwrite_at(0, &buf)?;
        let mut twin_metadata = twin.0.metadata.lock().map_err(|_| StoreError::Poisoned)?;
        twin_metadata.number_of_records = 1;
        twin_metadata.record_size = METADATA_RECORD_SIZE;
        Ok(())
    }

    pub(crate) fn close(&self) -> Result<(), StoreError> {
        self.0.log.close()
    }
}
