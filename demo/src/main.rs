use std::path::PathBuf;

use clap::Parser;
use tracevault_core::{
    TraceStoreKind, display_error_context,
    api::{self, InitError, SizeNegotiation},
    bridge::{FunctionTarget, ModuleTarget, RuntimeEvent, Trace, TracingBridge},
    extension::{CoordinatorConfig, ExtensionCoordinator},
    store::{GrowthPolicy, StoreFlags, StoreReader},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tracevault_demo")]
pub struct Args {
    /// Directory the store files are created in.
    #[arg(short = 'o', long, default_value = "trace-out")]
    pub out_dir: PathBuf,
    /// Number of top-level synthetic calls to record.
    #[arg(short = 'c', long, default_value_t = 64)]
    pub calls: u64,
    /// Nesting depth of each synthetic call.
    #[arg(short = 'd', long, default_value_t = 4)]
    pub depth: u64,
    #[arg(long, default_value_t = GrowthPolicy::default().initial_size)]
    pub initial_size: u64,
    #[arg(long, default_value_t = GrowthPolicy::default().extension_size)]
    pub extension_size: u64,
    #[arg(long, default_value_t = GrowthPolicy::default().maximum_size)]
    pub maximum_size: u64,
    /// Skip the page-touch warmup of freshly extended mappings.
    #[arg(long)]
    pub no_prefault: bool,
}

/// Run the two-phase size handshake for one entry point: probe, let the call
/// correct the size in place, retry exactly once. A second failure is a real
/// incompatibility and aborts the demo.
fn negotiated<T>(
    what: &str, mut call: impl FnMut(&mut SizeNegotiation) -> Result<T, InitError>,
) -> T {
    let mut size = SizeNegotiation::probe();
    match call(&mut size) {
        Ok(value) => return value,
        Err(InitError::NegotiationMismatch { required, supplied }) => {
            info!(what, supplied, required, "size corrected, retrying");
        }
        Err(other) => fail(what, &other),
    }
    match call(&mut size) {
        Ok(value) => value,
        Err(other) => fail(what, &other),
    }
}

fn fail(what: &str, error: &InitError) -> ! {
    error!(what, error = %display_error_context(error), "initialization failed");
    std::process::exit(1);
}

/// One synthetic traced call: enter, touch a few lines, recurse, raise at the
/// deepest level now and then, return.
fn synthetic_call(bridge: &TracingBridge<'_>, call: u64, depth_left: u64) {
    let function_id = depth_left + 1;
    let dispatch = |event: &RuntimeEvent| {
        if let Err(dispatch_error) = bridge.dispatch(event) {
            warn!(error = %dispatch_error, "event not recorded");
        }
    };
    dispatch(&RuntimeEvent::Call { function_id });
    for line in 0..3 {
        dispatch(&RuntimeEvent::Line { function_id, line: 10 + line });
    }
    if depth_left > 0 {
        synthetic_call(bridge, call, depth_left - 1);
    } else if call % 13 == 0 {
        dispatch(&RuntimeEvent::Exception { function_id, line: 13, name_hash: 0xbad });
    }
    dispatch(&RuntimeEvent::Return { function_id });
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();
    let policy = GrowthPolicy {
        initial_size: args.initial_size,
        extension_size: args.extension_size,
        maximum_size: args.maximum_size,
    };
    let flags = StoreFlags { no_prefault: args.no_prefault };

    let pool = ExtensionCoordinator::new(CoordinatorConfig::default());
    let mut stores = negotiated("trace stores", |size| {
        api::initialize_trace_stores(&args.out_dir, size, policy, flags)
    });
    let session = negotiated("trace session", api::initialize_trace_session);
    info!(user = %session.user_name, host = %session.computer_name, "session created");

    {
        let context = negotiated("trace context", |size| {
            api::initialize_trace_context(size, &session, &stores, &pool, 0)
        });
        let mut bridge = negotiated("tracing bridge", |size| {
            api::initialize_bridge(size, tracevault_core::bridge::OpaqueRegion::empty(), &context, None, 0)
        });

        bridge
            .add_module(ModuleTarget { module_id: 1, name_hash: 0x6d61696e, path_hash: 0x2f })
            .expect("module registration");
        for depth in 0..=args.depth {
            bridge
                .add_function(FunctionTarget {
                    function_id: depth + 1,
                    module_id: 1,
                    name_hash: depth.wrapping_mul(0x9e3779b97f4a7c15),
                    first_line: 1,
                })
                .expect("function registration");
        }

        let scope = bridge.scope().expect("start tracing");
        let start = std::time::Instant::now();
        for call in 0..args.calls {
            synthetic_call(&scope, call, args.depth);
        }
        info!(calls = args.calls, elapsed = ?start.elapsed(), "workload finished");
        // scope drop stops the bridge before the stores are closed
    }

    for kind in TraceStoreKind::ALL {
        let store = stores.store(kind);
        if store.dropped_records() > 0 {
            warn!(%kind, dropped = store.dropped_records(), "records were dropped");
        }
    }
    api::close_trace_stores(&mut stores).expect("close trace stores");

    for kind in TraceStoreKind::ALL {
        // SAFETY: the set was just closed, nothing writes these files anymore.
        let reader = match unsafe { StoreReader::open(&args.out_dir, kind) } {
            Ok(reader) => reader,
            Err(read_error) => {
                error!(%kind, error = %read_error, "could not read store back");
                continue;
            }
        };
        let metadata = reader.metadata();
        info!(
            %kind,
            records = metadata.number_of_records,
            record_size = metadata.record_size,
            "store written"
        );
    }
}
