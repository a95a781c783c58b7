use pretty_assertions::assert_eq;
use tracevault_core::{
    EventKind, EventRecord, ExceptionRecord, FrameRecord, FunctionRecord, LineRecord, TraceRecord,
    TraceStoreKind,
    api::{self, SizeNegotiation},
    bridge::{
        BridgeError, BridgeMode, FunctionTarget, ModuleTarget, NullBridge, OpaqueRegion,
        RuntimeEvent, Trace, TracingBridge, UsageError,
    },
    context::TraceContext,
    extension::{CoordinatorConfig, ExtensionCoordinator},
    session::TraceSession,
    store::{GrowthPolicy, StoreFlags, StoreReader, TraceStoreSet},
};

struct Recording {
    dir: tempfile::TempDir,
    pool: ExtensionCoordinator,
    set: TraceStoreSet,
    session: TraceSession,
}

fn recording() -> Recording {
    // SAFETY: tests in this binary do not read the environment concurrently
    // with this write.
    unsafe { std::env::set_var("LOGNAME", "tester") };
    let dir = tempfile::tempdir().unwrap();
    let pool = ExtensionCoordinator::new(CoordinatorConfig::default());
    let set = api::initialize_trace_stores(
        dir.path(),
        &mut SizeNegotiation::with_size(TraceStoreSet::required_size()),
        GrowthPolicy::default(),
        StoreFlags::default(),
    )
    .unwrap();
    let session =
        api::initialize_trace_session(&mut SizeNegotiation::with_size(TraceSession::required_size()))
            .unwrap();
    Recording { dir, pool, set, session }
}

fn context<'a>(rec: &'a Recording) -> TraceContext<'a> {
    api::initialize_trace_context(
        &mut SizeNegotiation::with_size(TraceContext::required_size()),
        &rec.session,
        &rec.set,
        &rec.pool,
        0,
    )
    .unwrap()
}

fn bridge<'a>(context: &'a TraceContext<'a>) -> TracingBridge<'a> {
    api::initialize_bridge(
        &mut SizeNegotiation::with_size(TracingBridge::required_size()),
        OpaqueRegion::empty(),
        context,
        None,
        0,
    )
    .unwrap()
}

fn function(function_id: u64) -> FunctionTarget {
    FunctionTarget { function_id, module_id: 1, name_hash: function_id * 31, first_line: 10 }
}

#[test]
fn start_stop_without_functions_leaves_well_formed_empty_stores() {
    let mut rec = recording();
    {
        let context = context(&rec);
        let mut bridge = bridge(&context);
        api::start_tracing(&mut bridge).unwrap();
        api::stop_tracing(&mut bridge).unwrap();
        assert_eq!(bridge.mode(), BridgeMode::Stopped);
    }
    api::close_trace_stores(&mut rec.set).unwrap();

    for kind in TraceStoreKind::ALL {
        // SAFETY: the set is closed, nothing writes these files anymore.
        let reader = unsafe { StoreReader::open(rec.dir.path(), kind) }.unwrap();
        assert!(reader.is_empty(), "{kind} store should be empty");
    }
}

#[test]
fn mode_transitions_enforce_the_lifecycle() {
    let mut rec = recording();
    {
        let context = context(&rec);
        let mut bridge = bridge(&context);

        // A stop with no matching start records nothing and succeeds.
        bridge.stop().unwrap();
        assert_eq!(bridge.mode(), BridgeMode::Idle);

        bridge.start().unwrap();
        assert!(matches!(
            bridge.start(),
            Err(BridgeError::Usage(UsageError::AlreadyStarted))
        ));
        assert!(matches!(
            bridge.start_profiling(),
            Err(BridgeError::Usage(UsageError::ProfilingWhileTracing))
        ));

        bridge.stop().unwrap();
        assert_eq!(bridge.mode(), BridgeMode::Stopped);
        bridge.stop().unwrap();
        assert!(matches!(
            bridge.start(),
            Err(BridgeError::Usage(UsageError::StartAfterStop))
        ));
        assert!(matches!(
            bridge.add_function(function(1)),
            Err(BridgeError::Usage(UsageError::AddFunctionAfterStop))
        ));
    }
    api::close_trace_stores(&mut rec.set).unwrap();
}

#[test]
fn profiling_excludes_tracing() {
    let mut rec = recording();
    {
        let context = context(&rec);
        let mut bridge = bridge(&context);
        api::start_profiling(&mut bridge).unwrap();
        assert!(matches!(
            bridge.start(),
            Err(BridgeError::Usage(UsageError::TracingWhileProfiling))
        ));
        // stop() only stops tracing; profiling keeps running
        bridge.stop().unwrap();
        assert_eq!(bridge.mode(), BridgeMode::Profiling);
        api::stop_profiling(&mut bridge).unwrap();
        assert_eq!(bridge.mode(), BridgeMode::Stopped);
    }
    api::close_trace_stores(&mut rec.set).unwrap();
}

#[test]
fn duplicate_function_registration_is_rejected() {
    let mut rec = recording();
    {
        let context = context(&rec);
        let mut bridge = bridge(&context);
        api::add_function(&mut bridge, function(42)).unwrap();
        assert!(matches!(
            api::add_function(&mut bridge, function(42)),
            Err(BridgeError::Usage(UsageError::DuplicateFunction(42)))
        ));
        // modules re-register silently
        let module = ModuleTarget { module_id: 1, name_hash: 2, path_hash: 3 };
        bridge.add_module(module).unwrap();
        bridge.add_module(module).unwrap();
    }
    api::close_trace_stores(&mut rec.set).unwrap();
}

#[test]
fn dispatch_writes_one_event_record_plus_one_category_record() {
    let mut rec = recording();
    {
        let context = context(&rec);
        let mut bridge = bridge(&context);
        bridge.add_module(ModuleTarget { module_id: 1, name_hash: 11, path_hash: 12 }).unwrap();
        bridge.add_function(function(1)).unwrap();
        bridge.add_function(function(2)).unwrap();
        bridge.start().unwrap();

        for event in [
            RuntimeEvent::Call { function_id: 1 },
            RuntimeEvent::Line { function_id: 1, line: 28 },
            RuntimeEvent::Line { function_id: 1, line: 29 },
            RuntimeEvent::Call { function_id: 2 },
            RuntimeEvent::Exception { function_id: 2, line: 30, name_hash: 99 },
            RuntimeEvent::Return { function_id: 2 },
            RuntimeEvent::Return { function_id: 1 },
        ] {
            assert!(bridge.dispatch(&event).unwrap());
        }
        bridge.stop().unwrap();
    }
    api::close_trace_stores(&mut rec.set).unwrap();

    let base = rec.dir.path();
    // SAFETY: the set is closed, nothing writes these files anymore.
    let events = unsafe { StoreReader::open(base, TraceStoreKind::Events) }.unwrap();
    let frames = unsafe { StoreReader::open(base, TraceStoreKind::Frames) }.unwrap();
    let lines = unsafe { StoreReader::open(base, TraceStoreKind::Lines) }.unwrap();
    let exceptions = unsafe { StoreReader::open(base, TraceStoreKind::Exceptions) }.unwrap();
    let functions = unsafe { StoreReader::open(base, TraceStoreKind::Functions) }.unwrap();
    let modules = unsafe { StoreReader::open(base, TraceStoreKind::Modules) }.unwrap();

    assert_eq!(events.len(), 7);
    assert_eq!(frames.len(), 4);
    assert_eq!(lines.len(), 2);
    assert_eq!(exceptions.len(), 1);
    assert_eq!(functions.len(), 2);
    assert_eq!(modules.len(), 1);

    let kinds: Vec<EventKind> =
        events.records::<EventRecord>().map(|x| x.unwrap().kind).collect();
    assert_eq!(kinds, vec![
        EventKind::Call,
        EventKind::Line,
        EventKind::Line,
        EventKind::Call,
        EventKind::Exception,
        EventKind::Return,
        EventKind::Return,
    ]);

    // call depths nest and unwind
    let depths: Vec<u32> = frames.records::<FrameRecord>().map(|x| x.unwrap().depth).collect();
    assert_eq!(depths, vec![1, 2, 1, 0]);

    let exception = exceptions.record::<ExceptionRecord>(0).unwrap();
    assert_eq!(exception.function_id, 2);
    assert_eq!(exception.line, 30);
    assert_eq!(exception.name_hash, 99);

    let lines: Vec<u32> = lines.records::<LineRecord>().map(|x| x.unwrap().line).collect();
    assert_eq!(lines, vec![28, 29]);

    let registered = functions.record::<FunctionRecord>(1).unwrap();
    assert_eq!(registered.function_id, 2);
}

#[test]
fn dispatch_ignores_inactive_and_unregistered_events() {
    let mut rec = recording();
    {
        let context = context(&rec);
        let mut bridge = bridge(&context);
        bridge.add_function(function(1)).unwrap();

        // not started yet
        assert!(!bridge.dispatch(&RuntimeEvent::Call { function_id: 1 }).unwrap());
        bridge.start().unwrap();
        // never registered
        assert!(!bridge.dispatch(&RuntimeEvent::Call { function_id: 999 }).unwrap());
        bridge.stop().unwrap();
        // stopped again
        assert!(!bridge.dispatch(&RuntimeEvent::Call { function_id: 1 }).unwrap());
    }
    api::close_trace_stores(&mut rec.set).unwrap();

    // SAFETY: the set is closed, nothing writes these files anymore.
    let events = unsafe { StoreReader::open(rec.dir.path(), TraceStoreKind::Events) }.unwrap();
    assert!(events.is_empty());
}

#[test]
fn scope_guard_stops_on_every_exit_path() {
    let mut rec = recording();
    {
        let context = context(&rec);
        let mut bridge = bridge(&context);
        bridge.add_function(function(1)).unwrap();
        {
            let scope = bridge.scope().unwrap();
            assert!(scope.is_active());
            assert!(scope.dispatch(&RuntimeEvent::Call { function_id: 1 }).unwrap());
        }
        assert_eq!(bridge.mode(), BridgeMode::Stopped);
        assert!(!bridge.dispatch(&RuntimeEvent::Return { function_id: 1 }).unwrap());
    }
    api::close_trace_stores(&mut rec.set).unwrap();
}

#[test]
fn null_bridge_accepts_every_control() {
    let mut null = NullBridge;
    null.add_function(function(1)).unwrap();
    null.start().unwrap();
    null.stop().unwrap();
    null.start_profiling().unwrap();
    null.stop_profiling().unwrap();
}

#[test]
fn concurrent_category_producers_stay_independent() {
    let mut rec = recording();
    {
        let context = context(&rec);
        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..200u64 {
                    context
                        .write(&FunctionRecord {
                            timestamp: i,
                            sequence: context.next_sequence(),
                            function_id: i,
                            ..Default::default()
                        })
                        .unwrap();
                }
            });
            s.spawn(|| {
                for i in 0..200u64 {
                    context
                        .write(&LineRecord {
                            timestamp: i,
                            sequence: context.next_sequence(),
                            function_id: i,
                            line: i as u32,
                            flags: 0,
                        })
                        .unwrap();
                }
            });
        });
    }
    api::close_trace_stores(&mut rec.set).unwrap();

    let base = rec.dir.path();
    // SAFETY: the set is closed, nothing writes these files anymore.
    let functions = unsafe { StoreReader::open(base, TraceStoreKind::Functions) }.unwrap();
    let lines = unsafe { StoreReader::open(base, TraceStoreKind::Lines) }.unwrap();
    assert_eq!(functions.len(), 200);
    assert_eq!(lines.len(), 200);
    assert_eq!(functions.metadata().record_size, FunctionRecord::ENCODED_SIZE);
    assert_eq!(lines.metadata().record_size, LineRecord::ENCODED_SIZE);

    // per-category order holds under concurrency, and the context-wide
    // sequence never hands out the same id twice
    let function_sequences: Vec<u64> =
        functions.records::<FunctionRecord>().map(|x| x.unwrap().sequence).collect();
    let line_sequences: Vec<u64> =
        lines.records::<LineRecord>().map(|x| x.unwrap().sequence).collect();
    assert!(function_sequences.windows(2).all(|w| w[0] < w[1]));
    assert!(line_sequences.windows(2).all(|w| w[0] < w[1]));
    let distinct: std::collections::HashSet<u64> =
        function_sequences.iter().chain(line_sequences.iter()).copied().collect();
    assert_eq!(distinct.len(), 400);
}

#[test]
fn interleaved_categories_keep_independent_order_and_metadata() {
    let mut rec = recording();
    {
        let context = context(&rec);
        for i in 0..5u64 {
            context
                .write(&FunctionRecord {
                    timestamp: i,
                    sequence: context.next_sequence(),
                    function_id: i,
                    ..Default::default()
                })
                .unwrap();
            context
                .write(&LineRecord {
                    timestamp: i,
                    sequence: context.next_sequence(),
                    function_id: i,
                    line: i as u32,
                    flags: 0,
                })
                .unwrap();
        }
    }
    api::close_trace_stores(&mut rec.set).unwrap();

    let base = rec.dir.path();
    // SAFETY: the set is closed, nothing writes these files anymore.
    let functions = unsafe { StoreReader::open(base, TraceStoreKind::Functions) }.unwrap();
    let lines = unsafe { StoreReader::open(base, TraceStoreKind::Lines) }.unwrap();
    assert_eq!(functions.len(), 5);
    assert_eq!(lines.len(), 5);
    assert_eq!(functions.metadata().record_size, FunctionRecord::ENCODED_SIZE);
    assert_eq!(lines.metadata().record_size, LineRecord::ENCODED_SIZE);

    // context-wide sequences, strictly increasing within each category
    let function_sequences: Vec<u64> =
        functions.records::<FunctionRecord>().map(|x| x.unwrap().sequence).collect();
    let line_sequences: Vec<u64> =
        lines.records::<LineRecord>().map(|x| x.unwrap().sequence).collect();
    assert!(function_sequences.windows(2).all(|w| w[0] < w[1]));
    assert!(line_sequences.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(function_sequences[0], 1);
    assert_eq!(line_sequences[0], 2);
}
