use pretty_assertions::assert_eq;
use tracevault_core::{
    RECORD_CONFIG, TraceStoreKind,
    api::{self, SizeNegotiation},
    extension::{CoordinatorConfig, ExtensionCoordinator},
    store::{GrowthPolicy, StoreError, StoreFlags, TraceStoreMetadata, TraceStoreSet},
};

fn scenario_policy() -> GrowthPolicy {
    GrowthPolicy { initial_size: 4096, extension_size: 4096, maximum_size: 12288 }
}

fn open_set(base: &std::path::Path) -> TraceStoreSet {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();
    let mut size = SizeNegotiation::with_size(TraceStoreSet::required_size());
    api::initialize_trace_stores(base, &mut size, scenario_policy(), StoreFlags::default())
        .unwrap()
}

/// Write `total` bytes in `record_size`-byte records, returning how many
/// records were dropped at the size ceiling.
fn write_records(
    set: &TraceStoreSet, pool: &ExtensionCoordinator, kind: TraceStoreKind, record_size: u64,
    total: u64,
) -> u64 {
    let payload = vec![0x5au8; record_size as usize];
    let mut dropped = 0;
    for _ in 0..total / record_size {
        match set.store(kind).append(record_size, &payload, pool) {
            Ok(_) => {}
            Err(StoreError::Exhausted { .. }) => dropped += 1,
            Err(other) => panic!("unexpected append error: {other}"),
        }
    }
    dropped
}

#[test]
fn extension_scenario_grows_then_hits_the_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let pool = ExtensionCoordinator::new(CoordinatorConfig::default());
    let mut set = open_set(dir.path());
    let store = set.store(TraceStoreKind::Events).clone();

    // 5000 bytes into a 4096-byte store: exactly one extension to 8192.
    let dropped = write_records(&set, &pool, TraceStoreKind::Events, 100, 5000);
    assert_eq!(dropped, 0);
    assert_eq!(store.extension_count(), 1);
    assert_eq!(store.mapping_size().unwrap(), 8192);

    // A further 10000 bytes: a second extension to the 12288 ceiling, then
    // records start dropping.
    let dropped = write_records(&set, &pool, TraceStoreKind::Events, 100, 10000);
    assert!(dropped >= 1, "expected drops at the ceiling");
    assert_eq!(store.extension_count(), 2);
    assert_eq!(store.mapping_size().unwrap(), 12288);
    assert_eq!(store.dropped_records(), dropped);

    api::close_trace_stores(&mut set).unwrap();
}

#[test]
fn dropped_records_only_at_the_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let pool = ExtensionCoordinator::new(CoordinatorConfig::default());
    let mut set = open_set(dir.path());
    let store = set.store(TraceStoreKind::Lines).clone();

    // Everything below maximum_size extends instead of dropping.
    assert_eq!(write_records(&set, &pool, TraceStoreKind::Lines, 64, 12288 - 64), 0);
    assert_eq!(store.dropped_records(), 0);

    // The first write past the ceiling drops.
    let dropped = write_records(&set, &pool, TraceStoreKind::Lines, 64, 128);
    assert!(dropped >= 1);
    assert_eq!(store.dropped_records(), dropped);

    api::close_trace_stores(&mut set).unwrap();
}

#[test]
fn metadata_stays_within_the_file_at_every_observation() {
    let dir = tempfile::tempdir().unwrap();
    let pool = ExtensionCoordinator::new(CoordinatorConfig::default());
    let mut set = open_set(dir.path());
    let store = set.store(TraceStoreKind::Frames).clone();

    let payload = [1u8; 96];
    for _ in 0..80 {
        match store.append(96, &payload, &pool) {
            Ok(_) | Err(StoreError::Exhausted { .. }) => {}
            Err(other) => panic!("unexpected append error: {other}"),
        }
        let metadata = store.metadata();
        assert!(
            metadata.number_of_records * metadata.record_size <= store.mapping_size().unwrap()
        );
    }

    let expected = store.metadata();
    api::close_trace_stores(&mut set).unwrap();

    // The persisted twin agrees with the in-memory bookkeeping, and the
    // truncated data file holds exactly the written records.
    let twin_bytes = std::fs::read(dir.path().join("frames.metadata")).unwrap();
    let (on_disk, _): (TraceStoreMetadata, usize) =
        bincode::serde::decode_from_slice(&twin_bytes, RECORD_CONFIG).unwrap();
    assert_eq!(on_disk, expected);
    let data_length = std::fs::metadata(dir.path().join("frames.store")).unwrap().len();
    assert_eq!(data_length, on_disk.number_of_records * on_disk.record_size);
}
