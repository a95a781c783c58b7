use bincode::config::{Configuration, Fixint, LittleEndian};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Records are encoded with the fixed-int legacy config so that every record
/// of a category occupies exactly [TraceRecord::ENCODED_SIZE] bytes on disk.
/// The metadata bookkeeping (`number_of_records * record_size`) depends on
/// this.
pub const RECORD_CONFIG: Configuration<LittleEndian, Fixint> = bincode::config::legacy();

/// Largest [TraceRecord::ENCODED_SIZE] across all categories. Write paths use
/// this for their stack scratch buffer.
pub const MAX_RECORD_SIZE: usize = 64;

/// The six semantic categories of a store set.
///
/// The order here is the on-disk category order. It is fixed and append-only:
/// new categories append, existing ones are never reordered or removed.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
pub enum TraceStoreKind {
    #[display("Events")]
    Events,
    #[display("Frames")]
    Frames,
    #[display("Modules")]
    Modules,
    #[display("Functions")]
    Functions,
    #[display("Exceptions")]
    Exceptions,
    #[display("Lines")]
    Lines,
}

impl TraceStoreKind {
    pub const ALL: [TraceStoreKind; 6] = [
        TraceStoreKind::Events,
        TraceStoreKind::Frames,
        TraceStoreKind::Modules,
        TraceStoreKind::Functions,
        TraceStoreKind::Exceptions,
        TraceStoreKind::Lines,
    ];

    /// File stem of the `<stem>.store` / `<stem>.metadata` pair.
    pub fn file_stem(self) -> &'static str {
        match self {
            TraceStoreKind::Events => "events",
            TraceStoreKind::Frames => "frames",
            TraceStoreKind::Modules => "modules",
            TraceStoreKind::Functions => "functions",
            TraceStoreKind::Exceptions => "exceptions",
            TraceStoreKind::Lines => "lines",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// A fixed-width record that can be appended to the store of its category.
///
/// `ENCODED_SIZE` must equal the exact [RECORD_CONFIG] encoding length; the
/// unit tests below pin each one.
pub trait TraceRecord: Serialize + DeserializeOwned {
    const KIND: TraceStoreKind;
    const ENCODED_SIZE: u64;
}

pub fn encode_record<R: TraceRecord>(
    record: &R, buf: &mut [u8],
) -> Result<usize, bincode::error::EncodeError> {
    bincode::serde::encode_into_slice(record, buf, RECORD_CONFIG)
}

pub fn decode_record<R: TraceRecord>(bytes: &[u8]) -> Result<R, bincode::error::DecodeError> {
    bincode::serde::decode_from_slice(bytes, RECORD_CONFIG).map(|x| x.0)
}

/// What kind of runtime occurrence a record describes.
///
/// Encoded as a 4-byte discriminant; do not reorder the variants.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[default]
    Call = 0,
    Return = 1,
    Line = 2,
    Exception = 3,
}

// Warning: be extremely careful when changing the fields of the record types
// below, as bincode writes things in the order declared here!

/// One entry in the Events store; every qualifying runtime event produces
/// exactly one of these, whatever its category-specific twin is.
///
/// The canonical order of the fields is
/// `timestamp, sequence, function_id, kind, line`
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq)]
pub struct EventRecord {
    pub timestamp: u64,
    pub sequence: u64,
    pub function_id: u64,
    pub kind: EventKind,
    pub line: u32,
}
impl TraceRecord for EventRecord {
    const KIND: TraceStoreKind = TraceStoreKind::Events;
    const ENCODED_SIZE: u64 = 32;
}

/// Call/return edge in the Frames store. `depth` is the call depth *after*
/// the edge was applied.
///
/// The canonical order of the fields is
/// `timestamp, sequence, function_id, depth, kind`
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq)]
pub struct FrameRecord {
    pub timestamp: u64,
    pub sequence: u64,
    pub function_id: u64,
    pub depth: u32,
    pub kind: EventKind,
}
impl TraceRecord for FrameRecord {
    const KIND: TraceStoreKind = TraceStoreKind::Frames;
    const ENCODED_SIZE: u64 = 32;
}

/// The canonical order of the fields is
/// `timestamp, sequence, module_id, name_hash, path_hash`
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq)]
pub struct ModuleRecord {
    pub timestamp: u64,
    pub sequence: u64,
    pub module_id: u64,
    pub name_hash: u64,
    pub path_hash: u64,
}
impl TraceRecord for ModuleRecord {
    const KIND: TraceStoreKind = TraceStoreKind::Modules;
    const ENCODED_SIZE: u64 = 40;
}

/// Written once per registered function, when the bridge accepts it.
///
/// The canonical order of the fields is
/// `timestamp, sequence, function_id, module_id, name_hash, first_line, flags`
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq)]
pub struct FunctionRecord {
    pub timestamp: u64,
    pub sequence: u64,
    pub function_id: u64,
    pub module_id: u64,
    pub name_hash: u64,
    pub first_line: u32,
    pub flags: u32,
}
impl TraceRecord for FunctionRecord {
    const KIND: TraceStoreKind = TraceStoreKind::Functions;
    const ENCODED_SIZE: u64 = 48;
}

/// The canonical order of the fields is
/// `timestamp, sequence, function_id, name_hash, line, depth`
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq)]
pub struct ExceptionRecord {
    pub timestamp: u64,
    pub sequence: u64,
    pub function_id: u64,
    pub name_hash: u64,
    pub line: u32,
    pub depth: u32,
}
impl TraceRecord for ExceptionRecord {
    const KIND: TraceStoreKind = TraceStoreKind::Exceptions;
    const ENCODED_SIZE: u64 = 40;
}

/// The canonical order of the fields is
/// `timestamp, sequence, function_id, line, flags`
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq)]
pub struct LineRecord {
    pub timestamp: u64,
    pub sequence: u64,
    pub function_id: u64,
    pub line: u32,
    pub flags: u32,
}
impl TraceRecord for LineRecord {
    const KIND: TraceStoreKind = TraceStoreKind::Lines;
    const ENCODED_SIZE: u64 = 32;
}
