use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;

use vgpu_scheduler::client::ClientRegistry;
use vgpu_scheduler::clock::Clock;
use vgpu_scheduler::config::{self, DaemonArgs, SchedParams};
use vgpu_scheduler::scheduler::{daemon, Scheduler};
use vgpu_scheduler::{handler, logging, watcher::ConfigWatcher};

/// Route panics from the daemon, watcher, and handler threads into the log
/// before the default hook runs; a panicked handler thread must not die
/// silently while its peer keeps waiting on a reply.
fn setup_panic_logging() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("scheduler thread panicked: {panic_info}");
    }));
}

fn main() -> Result<()> {
    let args = DaemonArgs::parse();
    let _guard = logging::init(&args.log_file, args.verbose);
    setup_panic_logging();

    if args.verbose > 0 {
        tracing::info!(
            default_quota_ms = args.quota,
            min_quota_ms = args.min_quota,
            window_ms = args.window,
            "scheduler settings"
        );
    }

    let params = SchedParams::from(&args);
    let clock = Clock::new();

    // the initial config load is fatal when it fails; later reloads are not
    let limit_path = args.limit_file_path();
    let limits = config::load_resource_config(&limit_path)?;
    tracing::info!("there are {} clients in the system", limits.len());

    let mut registry = ClientRegistry::new();
    registry.apply(&limits, &params);

    let sched = Arc::new(Scheduler::new(clock, params, registry));

    let config_watcher = ConfigWatcher::new(&args.limit_file_dir, &args.limit_file, sched.clone())
        .context("failed to watch resource config directory")?;
    thread::Builder::new()
        .name("config-watcher".into())
        .spawn(move || config_watcher.run())
        .context("failed to spawn config watcher thread")?;

    let daemon_sched = sched.clone();
    thread::Builder::new()
        .name("sched-daemon".into())
        .spawn(move || daemon::run(&daemon_sched))
        .context("failed to spawn scheduler daemon thread")?;

    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, args.port))
        .with_context(|| format!("cannot bind port {}", args.port))?;
    tracing::info!(port = args.port, "waiting for incoming connections");

    handler::serve(listener, sched);
    Ok(())
}
