use std::{
    fs::{File, OpenOptions},
    path::Path,
    sync::{Condvar, Mutex, MutexGuard, atomic::AtomicBool},
    time::{Duration, Instant},
};

use memmap2::{MmapMut, MmapOptions};
use tracing::debug;

use crate::{TraceStoreKind, store::StoreError};

pub(crate) const PAGE_SIZE: usize = 4096;

/// A mapping the coordinator has prepared over a grown file, not yet active.
pub struct PendingMapping {
    pub mapping: MmapMut,
    pub size: u64,
}

/// One growable file-backed memory mapping with a sliding window of at most
/// three live mappings: retiring (`prev`), active, and pre-extended (`next`).
///
/// Every mapping covers the file from offset zero, so record offsets stay
/// valid across swaps. The writer appends through the active mapping under
/// the state mutex; the coordinator installs a pre-extended mapping with
/// [MemoryMappedLog::install_pending] and slides the window with
/// [MemoryMappedLog::retire_and_swap], which wakes any writer blocked in
/// [MemoryMappedLog::wait_for_capacity].
pub struct MemoryMappedLog {
    kind: TraceStoreKind,
    state: Mutex<LogState>,
    swapped: Condvar,
}

struct LogState {
    file: File,
    file_length: u64,
    file_pointer: u64,
    mapping_size: u64,
    active: Option<MmapMut>,
    prev: Option<MmapMut>,
    next: Option<PendingMapping>,
    closed: bool,
}

impl MemoryMappedLog {
    pub fn create(path: &Path, kind: TraceStoreKind, initial_size: u64) -> Result<Self, StoreError> {
        let file =
            OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        file.set_len(initial_size)?;
        // SAFETY: the file was created by us and stays open for the lifetime
        // of the log; mmap is inherently unsafe beyond that.
        let mapping = unsafe { MmapOptions::new().len(initial_size as usize).map_mut(&file) }?;
        Ok(Self {
            kind,
            state: Mutex::new(LogState {
                file,
                file_length: initial_size,
                file_pointer: 0,
                mapping_size: initial_size,
                active: Some(mapping),
                prev: None,
                next: None,
                closed: false,
            }),
            swapped: Condvar::new(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, LogState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Append `bytes` at the current file pointer. Callers must have reserved
    /// the space already; capacity only ever grows, so a successful
    /// reservation cannot be invalidated by a concurrent swap.
    pub fn write(&self, bytes: &[u8]) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(StoreError::Closed { kind: self.kind });
        }
        let offset = state.file_pointer;
        let end = offset + bytes.len() as u64;
        debug_assert!(end <= state.mapping_size, "write past the reserved capacity");
        let active = state.active.as_mut().ok_or(StoreError::Closed { kind: self.kind })?;
        active[offset as usize..end as usize].copy_from_slice(bytes);
        state.file_pointer = end;
        Ok(offset)
    }

    /// Write `bytes` at a fixed offset without advancing past existing data.
    /// Used by metadata twins, which keep a single record in place.
    pub fn overwrite_at(&self, offset: u64, bytes: &[u8]) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(StoreError::Closed { kind: self.kind });
        }
        let end = offset + bytes.len() as u64;
        debug_assert!(end <= state.mapping_size);
        let active = state.active.as_mut().ok_or(StoreError::Closed { kind: self.kind })?;
        active[offset as usize..end as usize].copy_from_slice(bytes);
        state.file_pointer = state.file_pointer.max(end);
        Ok(())
    }

    /// `(mapping_size - file_pointer, file_length)` in one lock acquisition.
    pub fn capacity(&self) -> Result<(u64, u64), StoreError> {
        let state = self.lock()?;
        Ok((state.mapping_size - state.file_pointer, state.file_length))
    }

    pub fn file_pointer(&self) -> Result<u64, StoreError> {
        Ok(self.lock()?.file_pointer)
    }

    pub fn mapping_size(&self) -> Result<u64, StoreError> {
        Ok(self.lock()?.mapping_size)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|x| x.closed).unwrap_or(true)
    }

    /// Clone of the file handle plus the current file length, for the
    /// coordinator to grow the file without holding the state lock.
    pub fn extend_snapshot(&self) -> Result<(File, u64), StoreError> {
        let state = self.lock()?;
        Ok((state.file.try_clone()?, state.file_length))
    }

    /// Park the pre-extended mapping in the `next` slot. Returns false if the
    /// log was closed while the mapping was being prepared.
    pub fn install_pending(&self, pending: PendingMapping) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        if state.closed {
            return Ok(false);
        }
        state.next = Some(pending);
        Ok(true)
    }

    /// Slide the three-slot window: the old active mapping is retired into
    /// `prev` (kept briefly for in-flight readers), the pre-extended mapping
    /// becomes active, `next` empties. No-op when nothing is pending.
    pub fn retire_and_swap(&self) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let Some(pending) = state.next.take() else {
            return Ok(());
        };
        state.prev = state.active.take();
        state.active = Some(pending.mapping);
        state.mapping_size = pending.size;
        state.file_length = state.file_length.max(pending.size);
        debug!(kind = %self.kind, size = pending.size, "mapping swapped");
        self.swapped.notify_all();
        Ok(())
    }

    /// Block until `needed` bytes fit in the active mapping. Returns false on
    /// timeout or when `abort` is raised (extension failed for this
    /// watermark crossing); the caller falls back to dropping the record.
    pub fn wait_for_capacity(
        &self, needed: u64, abort: &AtomicBool, timeout: Duration,
    ) -> Result<bool, StoreError> {
        use std::sync::atomic::Ordering::Acquire;
        let deadline = Instant::now() + timeout;
        let mut state = self.lock()?;
        while state.mapping_size - state.file_pointer < needed {
            if state.closed {
                return Err(StoreError::Closed { kind: self.kind });
            }
            if abort.load(Acquire) {
                return Ok(false);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let (guard, _) = self
                .swapped
                .wait_timeout(state, deadline - now)
                .map_err(|_| StoreError::Poisoned)?;
            state = guard;
        }
        Ok(true)
    }

    /// Wake writers parked in [MemoryMappedLog::wait_for_capacity] so they
    /// can observe an abort flag.
    pub fn notify_waiters(&self) {
        self.swapped.notify_all();
    }

    /// Touch up to `pages` not-yet-written pages of the active mapping so
    /// the next writes do not fault. Opportunistic; takes the lock briefly.
    pub fn prefault_ahead(&self, pages: usize) -> Result<(), StoreError> {
        let state = self.lock()?;
        let Some(active) = state.active.as_ref() else {
            return Ok(());
        };
        let from = state.file_pointer as usize;
        let to = state.mapping_size.min((from + pages * PAGE_SIZE) as u64) as usize;
        prefault_range(active, from, to);
        Ok(())
    }

    /// Flush, drop all live mappings, truncate the file to the written
    /// length. Idempotent.
    pub fn close(&self) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.closed {
            return Ok(());
        }
        if let Some(active) = state.active.as_ref() {
            active.flush()?;
        }
        state.prev = None;
        state.next = None;
        state.active = None;
        state.file.set_len(state.file_pointer)?;
        state.file.sync_all()?;
        state.closed = true;
        self.swapped.notify_all();
        Ok(())
    }
}

/// Fault in `[from, to)` of a mapping, one volatile read per page. Reads
/// only, so live data below the grow point is never clobbered.
pub(crate) fn prefault_range(mapping: &MmapMut, from: usize, to: usize) {
    let to = to.min(mapping.len());
    let mut offset = from;
    while offset < to {
        // SAFETY: offset < to <= mapping.len(), and the mapping is alive for
        // the duration of the borrow.
        unsafe {
            std::ptr::read_volatile(mapping.as_ptr().add(offset));
        }
        offset += PAGE_SIZE;
    }
}
