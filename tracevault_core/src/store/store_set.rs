use std::{
    fs,
    path::{Path, PathBuf},
};

use bincode::config::Configuration;
use serde::{Deserialize, Serialize};

use crate::{
    MagicParseError, SetLayout, TraceStoreKind, VAULT_DISK_VERSION, parse_vault_magic,
    store::{GrowthPolicy, StoreError, StoreFlags, TraceStore},
    vault_magic_for,
};

pub const NUMBER_OF_TRACE_STORES: u16 = 12;
pub const MANIFEST_FILE_NAME: &str = "stores.manifest";

const MANIFEST_CONFIG: Configuration = bincode::config::standard();

/// Leading header of a store-set description.
///
/// The canonical order of the fields is `size, number_of_stores, reserved`
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub struct StoreSetHeader {
    pub size: u16,
    pub number_of_stores: u16,
    pub reserved: u32,
}

/// One store's slot in the manifest.
///
/// The canonical order of the fields is
/// `kind, metadata, initial_size, extension_size, maximum_size`
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub struct StoreManifestEntry {
    pub kind: TraceStoreKind,
    pub metadata: bool,
    pub initial_size: u64,
    pub extension_size: u64,
    pub maximum_size: u64,
}

impl StoreManifestEntry {
    fn new(kind: TraceStoreKind, metadata: bool, policy: GrowthPolicy) -> Self {
        Self {
            kind,
            metadata,
            initial_size: policy.initial_size,
            extension_size: policy.extension_size,
            maximum_size: policy.maximum_size,
        }
    }
}

/// Current manifest shape: header plus the twelve entries in category order,
/// data stores first, metadata twins second.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StoreSetManifest {
    pub header: StoreSetHeader,
    pub stores: Vec<StoreManifestEntry>,
}

/// The retired manifest shape: the same twelve stores as named fields.
/// Kept only so old manifests can be read; [migrate_legacy_manifest] is the
/// sole consumer and there is never a live `LegacyStoreSetManifest` past
/// loading.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LegacyStoreSetManifest {
    pub header: StoreSetHeader,
    pub events: StoreManifestEntry,
    pub frames: StoreManifestEntry,
    pub modules: StoreManifestEntry,
    pub functions: StoreManifestEntry,
    pub exceptions: StoreManifestEntry,
    pub lines: StoreManifestEntry,
    pub events_metadata: StoreManifestEntry,
    pub frames_metadata: StoreManifestEntry,
    pub modules_metadata: StoreManifestEntry,
    pub functions_metadata: StoreManifestEntry,
    pub exceptions_metadata: StoreManifestEntry,
    pub lines_metadata: StoreManifestEntry,
}

pub fn migrate_legacy_manifest(legacy: LegacyStoreSetManifest) -> StoreSetManifest {
    StoreSetManifest {
        header: legacy.header,
        stores: vec![
            legacy.events,
            legacy.frames,
            legacy.modules,
            legacy.functions,
            legacy.exceptions,
            legacy.lines,
            legacy.events_metadata,
            legacy.frames_metadata,
            legacy.modules_metadata,
            legacy.functions_metadata,
            legacy.exceptions_metadata,
            legacy.lines_metadata,
        ],
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ManifestError {
    #[error("failed to parse the manifest magic")]
    BadMagic(#[from] MagicParseError),
    #[error(
        "cannot parse newer manifest version than known. I have {VAULT_DISK_VERSION}, the file has {0}"
    )]
    InvalidVersion(u8),
    #[error("no magic header, are you sure this is a tracevault manifest?")]
    NoMagic,
    #[error("manifest lists {got} stores, expected {expected}")]
    WrongStoreCount { expected: u16, got: usize },
    #[error("failed to decode the manifest body")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("failed to encode the manifest body")]
    Encode(#[from] bincode::error::EncodeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub fn write_manifest(path: &Path, manifest: &StoreSetManifest) -> Result<(), ManifestError> {
    let mut bytes = vault_magic_for(VAULT_DISK_VERSION, SetLayout::Current).to_vec();
    bytes.extend(bincode::serde::encode_to_vec(manifest, MANIFEST_CONFIG)?);
    fs::write(path, bytes)?;
    Ok(())
}

/// Read a manifest in either layout, migrating the legacy one forward.
pub fn read_manifest(path: &Path) -> Result<StoreSetManifest, ManifestError> {
    let bytes = fs::read(path)?;
    let magic: &[u8; 10] = bytes
        .get(..10)
        .and_then(|x| x.try_into().ok())
        .ok_or(ManifestError::NoMagic)?;
    let (version, layout) = parse_vault_magic(magic)?;
    if version > VAULT_DISK_VERSION {
        return Err(ManifestError::InvalidVersion(version));
    }
    let manifest = match layout {
        SetLayout::Legacy => {
            let (legacy, _): (LegacyStoreSetManifest, usize) =
                bincode::serde::decode_from_slice(&bytes[10..], MANIFEST_CONFIG)?;
            migrate_legacy_manifest(legacy)
        }
        SetLayout::Current => {
            let (manifest, _): (StoreSetManifest, usize) =
                bincode::serde::decode_from_slice(&bytes[10..], MANIFEST_CONFIG)?;
            manifest
        }
    };
    if manifest.stores.len() != NUMBER_OF_TRACE_STORES as usize {
        return Err(ManifestError::WrongStoreCount {
            expected: NUMBER_OF_TRACE_STORES,
            got: manifest.stores.len(),
        });
    }
    Ok(manifest)
}

/// The fixed, ordered collection of all category stores for one recording
/// run: six data stores followed by their six metadata twins. Category order
/// is append-only; new categories append, existing ones never move.
pub struct TraceStoreSet {
    header: StoreSetHeader,
    base_path: PathBuf,
    stores: Vec<TraceStore>,
}

impl TraceStoreSet {
    /// Byte size of the caller-visible description of this structure; the
    /// quantity the size negotiation of the Initialize entry points compares
    /// against.
    pub const fn required_size() -> u32 {
        (std::mem::size_of::<StoreSetHeader>()
            + NUMBER_OF_TRACE_STORES as usize * std::mem::size_of::<StoreManifestEntry>())
            as u32
    }

    /// Create the per-session directory, the twelve store files and the
    /// manifest. All stores share one growth policy.
    pub(crate) fn initialize(
        base_path: &Path, policy: GrowthPolicy, flags: StoreFlags,
    ) -> Result<TraceStoreSet, StoreError> {
        policy.validate()?;
        fs::create_dir_all(base_path)?;
        let prefault = !flags.no_prefault;

        let mut data = Vec::with_capacity(TraceStoreKind::ALL.len());
        for kind in TraceStoreKind::ALL {
            data.push(TraceStore::create_pair(base_path, kind, policy, prefault)?);
        }
        let mut stores = data.clone();
        for store in &data {
            // create_pair always attaches a twin
            let Some(twin) = store.metadata_store() else {
                unreachable!("data store without a metadata twin")
            };
            stores.push(twin.clone());
        }

        let header = StoreSetHeader {
            size: Self::required_size() as u16,
            number_of_stores: NUMBER_OF_TRACE_STORES,
            reserved: flags.bits(),
        };
        let manifest = StoreSetManifest {
            header,
            stores: stores
                .iter()
                .map(|x| StoreManifestEntry::new(
                    x.kind(),
                    x.is_metadata_store(),
                    if x.is_metadata_store() { crate::store::METADATA_POLICY } else { policy },
                ))
                .collect(),
        };
        write_manifest(&base_path.join(MANIFEST_FILE_NAME), &manifest)
            .map_err(StoreError::Manifest)?;

        Ok(TraceStoreSet { header, base_path: base_path.to_path_buf(), stores })
    }

    pub fn header(&self) -> StoreSetHeader {
        self.header
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// The data store for a category.
    pub fn store(&self, kind: TraceStoreKind) -> &TraceStore {
        &self.stores[kind.index()]
    }

    /// The metadata twin for a category.
    pub fn metadata_store(&self, kind: TraceStoreKind) -> &TraceStore {
        &self.stores[TraceStoreKind::ALL.len() + kind.index()]
    }

    /// All twelve stores, data first, metadata twins second.
    pub fn stores(&self) -> &[TraceStore] {
        &self.stores
    }

    pub fn is_closed(&self) -> bool {
        self.stores.iter().any(|x| x.is_closed())
    }

    /// Close every store. Data stores close first, metadata twins flush last,
    /// so the record counts on disk reflect completed writes only.
    /// Idempotent.
    pub fn close(&mut self) -> Result<(), StoreError> {
        let data_stores = TraceStoreKind::ALL.len();
        for store in &self.stores[..data_stores] {
            store.close()?;
        }
        for twin in &self.stores[data_stores..] {
            twin.close()?;
        }
        Ok(())
    }
}
