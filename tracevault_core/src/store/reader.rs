use std::{fs, fs::File, path::Path};

use memmap2::{Mmap, MmapOptions};

use crate::{
    RECORD_CONFIG, TraceRecord, TraceStoreKind,
    store::TraceStoreMetadata,
};

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("failed to memory map the store file")]
    MapFileError(#[source] std::io::Error),
    #[error("failed to decode the metadata twin")]
    DecodeMetadata(#[source] bincode::error::DecodeError),
    #[error("failed to decode a record")]
    DecodeRecord(#[source] bincode::error::DecodeError),
    #[error("out of bounds. Tried to access record {idx} from a store of {len} records")]
    OutOfBounds { idx: u64, len: u64 },
    #[error("store holds {kind} records, tried to read {requested}")]
    KindMismatch { kind: TraceStoreKind, requested: TraceStoreKind },
    #[error(
        "metadata claims {number_of_records} records of {record_size} bytes but the data file \
         holds only {actual} bytes"
    )]
    Truncated { number_of_records: u64, record_size: u64, actual: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read-only view over one closed category store: the metadata twin supplies
/// the record count and width, the data file is mapped and decoded record by
/// record.
pub struct StoreReader {
    kind: TraceStoreKind,
    map: Option<Mmap>,
    metadata: TraceStoreMetadata,
}

impl StoreReader {
    /// # Safety
    /// This is marked unsafe to warn you about mmap's inherent unsafety: the
    /// store files must not be written concurrently while the reader is
    /// alive. Open readers only on closed stores.
    pub unsafe fn open(base_path: &Path, kind: TraceStoreKind) -> Result<Self, ReaderError> {
        let stem = kind.file_stem();
        let metadata_bytes = fs::read(base_path.join(format!("{stem}.metadata")))?;
        let metadata = if metadata_bytes.is_empty() {
            // nothing was ever appended; a well-formed empty store
            TraceStoreMetadata::default()
        } else {
            bincode::serde::decode_from_slice(&metadata_bytes, RECORD_CONFIG)
                .map(|x| x.0)
                .map_err(ReaderError::DecodeMetadata)?
        };

        let file = File::open(base_path.join(format!("{stem}.store")))?;
        let data_length = file.metadata()?.len();
        // checked: a hostile twin could pick counts whose product wraps
        // right past the comparison below
        match metadata.number_of_records.checked_mul(metadata.record_size) {
            Some(total) if total <= data_length => {}
            _ => {
                return Err(ReaderError::Truncated {
                    number_of_records: metadata.number_of_records,
                    record_size: metadata.record_size,
                    actual: data_length,
                });
            }
        }
        let map = if data_length == 0 {
            None
        } else {
            // SAFETY: deferred to the caller, see above.
            Some(unsafe { MmapOptions::new().map(&file) }.map_err(ReaderError::MapFileError)?)
        };
        Ok(Self { kind, map, metadata })
    }

    pub fn kind(&self) -> TraceStoreKind {
        self.kind
    }

    pub fn metadata(&self) -> TraceStoreMetadata {
        self.metadata
    }

    pub fn len(&self) -> u64 {
        self.metadata.number_of_records
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.number_of_records == 0
    }

    pub fn record<R: TraceRecord>(&self, idx: u64) -> Result<R, ReaderError> {
        if R::KIND != self.kind {
            return Err(ReaderError::KindMismatch { kind: self.kind, requested: R::KIND });
        }
        if idx >= self.metadata.number_of_records {
            return Err(ReaderError::OutOfBounds { idx, len: self.metadata.number_of_records });
        }
        let Some(map) = self.map.as_ref() else {
            return Err(ReaderError::OutOfBounds { idx, len: 0 });
        };
        let offset = (idx * self.metadata.record_size) as usize;
        let end = offset + self.metadata.record_size as usize;
        bincode::serde::decode_from_slice(&map[offset..end], RECORD_CONFIG)
            .map(|x| x.0)
            .map_err(ReaderError::DecodeRecord)
    }

    pub fn records<R: TraceRecord>(&self) -> impl Iterator<Item = Result<R, ReaderError>> + '_ {
        (0..self.metadata.number_of_records).map(move |idx| self.record(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pair(dir: &Path, metadata: &TraceStoreMetadata, data: &[u8]) {
        let bytes = bincode::serde::encode_to_vec(metadata, RECORD_CONFIG).unwrap();
        fs::write(dir.join("events.metadata"), bytes).unwrap();
        fs::write(dir.join("events.store"), data).unwrap();
    }

    #[test]
    fn hostile_metadata_cannot_wrap_the_bounds_check() {
        let dir = tempfile::tempdir().unwrap();
        // number_of_records * record_size wraps to 0 in u64
        let metadata = TraceStoreMetadata { number_of_records: 1 << 62, record_size: 4 };
        write_pair(dir.path(), &metadata, &[0u8; 8]);

        // SAFETY: plain files written above, nothing maps or writes them.
        let result = unsafe { StoreReader::open(dir.path(), TraceStoreKind::Events) };
        assert!(matches!(result, Err(ReaderError::Truncated { .. })));
    }

    #[test]
    fn short_data_files_are_reported_as_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = TraceStoreMetadata { number_of_records: 4, record_size: 32 };
        write_pair(dir.path(), &metadata, &[0u8; 64]);

        // SAFETY: plain files written above, nothing maps or writes them.
        let result = unsafe { StoreReader::open(dir.path(), TraceStoreKind::Events) };
        assert!(matches!(
            result,
            Err(ReaderError::Truncated { number_of_records: 4, record_size: 32, actual: 64 })
        ));
    }
}
