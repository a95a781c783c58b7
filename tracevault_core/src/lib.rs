#![doc = include_str!("../README.md")]

use std::fmt::Write;

use thiserror::Error;

pub mod api;
pub mod bridge;
pub mod context;
pub mod extension;
mod record;
pub use record::*;
pub mod session;
pub mod store;

pub const VAULT_DISK_VERSION: u8 = 1;

/// On-disk layout of a store-set manifest.
///
/// `Legacy` is the twelve-named-field shape; `Current` is the array shape.
/// Category order is fixed and append-only in both, so a legacy manifest can
/// always be migrated forward (see [store::migrate_legacy_manifest]).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SetLayout {
    Legacy = 0,
    Current = 1,
}

#[derive(Error, Debug)]
pub enum MagicParseError {
    #[error("The first byte is not null. This can't be a tracevault file.")]
    FirstNonNull,
    #[error("The [1,..,8) (0-indexed) bytes of the manifest should be b\"TRVAULT\" but they aren't")]
    AppNameMismatch,
    #[error("The layout byte (9) must be 0 or 1")]
    BadLayout,
    #[error("IO Error while parsing magic. Make sure the file is non-empty.")]
    IoError(#[from] std::io::Error),
}

pub fn parse_vault_magic(magic: &[u8; 10]) -> Result<(u8, SetLayout), MagicParseError> {
    if magic[0] != 0 {
        return Err(MagicParseError::FirstNonNull);
    }
    if &magic[1..8] != b"TRVAULT" {
        return Err(MagicParseError::AppNameMismatch);
    }
    let layout = match magic[9] {
        0 => SetLayout::Legacy,
        1 => SetLayout::Current,
        _ => return Err(MagicParseError::BadLayout),
    };
    Ok((magic[8], layout))
}

pub fn vault_magic_for(version: u8, layout: SetLayout) -> [u8; 10] {
    let mut magic = [0, 84, 82, 86, 65, 85, 76, 84, 0, 0]; // b"\0TRVAULT" and two temporary 0s
    magic[8] = version;
    magic[9] = layout as u8;
    magic
}

pub fn display_error_context(mut err: &dyn std::error::Error) -> String {
    let mut s = format!("{err}");
    if err.source().is_none() {
        return s;
    }
    write!(s, "\n\nCaused by:\n").ok();
    let mut idx = 0;

    while let Some(source) = err.source() {
        writeln!(s, "  {idx}: {source}").ok();
        err = source;
        idx += 1;
    }
    s.pop();
    s
}
