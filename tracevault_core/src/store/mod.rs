// growable memory-mapped store files
// structure:
// - one <category>.store data file per category, fixed-width records
// - one <category>.metadata twin persisting {number_of_records, record_size}
// - one stores.manifest (magic + layout version) describing the whole set
// writing:
// - the producer appends through the active mapping and never performs the
//   OS-level file grow itself
// - crossing the watermark schedules extension work on the coordinator; the
//   producer blocks, at most, until a pre-extended mapping is swapped in
// - at maximum_size a store stops growing and counts dropped records instead
//   of blocking
mod memory_map;
pub use memory_map::*;
mod trace_store;
pub use trace_store::*;
mod store_set;
pub use store_set::*;
mod reader;
pub use reader::*;

use crate::TraceStoreKind;

/// How a store's backing file grows: created at `initial_size`, extended in
/// `extension_size` increments, never past `maximum_size`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GrowthPolicy {
    pub initial_size: u64,
    pub extension_size: u64,
    pub maximum_size: u64,
}

impl Default for GrowthPolicy {
    fn default() -> Self {
        Self { initial_size: 1 << 20, extension_size: 1 << 22, maximum_size: 1 << 30 }
    }
}

impl GrowthPolicy {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.initial_size == 0
            || self.extension_size == 0
            || self.maximum_size < self.initial_size
        {
            return Err(StoreError::BadPolicy(*self));
        }
        Ok(())
    }
}

/// Metadata twins hold a single 16-byte record; they never need to grow.
pub(crate) const METADATA_POLICY: GrowthPolicy =
    GrowthPolicy { initial_size: 4096, extension_size: 4096, maximum_size: 4096 };

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreFlags {
    /// Skip the page-touch warmup of freshly extended mappings.
    pub no_prefault: bool,
}

impl StoreFlags {
    pub(crate) fn bits(self) -> u32 {
        self.no_prefault as u32
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("store {kind} reached its maximum size, record dropped")]
    Exhausted { kind: TraceStoreKind },
    #[error("store {kind} was already closed")]
    Closed { kind: TraceStoreKind },
    #[error("invalid growth policy: {0:?}")]
    BadPolicy(GrowthPolicy),
    #[error("a lock guarding a store mapping was poisoned")]
    Poisoned,
    #[error("failed to encode a record")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to write the store-set manifest")]
    Manifest(#[source] ManifestError),
}
