//! The daemon binary: parses flags, builds the compiler registry, and runs
//! the event loop (spec §6).

use log::error;
use tokio::sync::mpsc;

use plast::config;
use plast::daemon::DaemonContext;
use plast::registry::InMemoryRegistry;

fn main() {
    env_logger::init();

    let matches = config::daemon_app().get_matches();
    let cfg = match config::parse_daemon_config(&matches) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("plastd: {}", e);
            std::process::exit(1);
        }
    };

    #[cfg(unix)]
    if matches.is_present("daemonize") {
        if let Err(e) = daemonize::Daemonize::new().start() {
            eprintln!("plastd: failed to daemonize: {}", e);
            std::process::exit(1);
        }
    }

    let mut registry = InMemoryRegistry::new();
    registry.probe_path();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("plastd: failed to start the async runtime: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(async move {
        let (tx, rx) = mpsc::unbounded_channel();
        let context = DaemonContext::new(cfg, Box::new(registry));

        tokio::select! {
            _ = context.run(tx, rx) => {}
            _ = tokio::signal::ctrl_c() => {
                error!("received ctrl-c, shutting down");
            }
        }
    });
}
