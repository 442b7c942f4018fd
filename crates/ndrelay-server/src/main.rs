mod bootstrap;
mod cli;
mod logging;
mod signals;

use std::process::ExitCode;

use bootstrap::Daemonize as _;
use clap::Parser as _;
use ndrelay_net::RelayServer;
use tracing::{error, info};

/// Exit codes mirror the original process's external interface (§6):
/// 0 normal, 101 init failure, 102 missing port, 103 network-subsystem init
/// failure (Windows-only, unreachable on the POSIX targets this builds
/// for), 104 listen-socket creation failure.
mod exit_code {
    pub const INIT_FAILURE: u8 = 101;
    pub const MISSING_PORT: u8 = 102;
    pub const LISTEN_SOCKET_FAILURE: u8 = 104;
}

fn main() -> ExitCode {
    let args = cli::Args::parse_from(cli::normalize_argv(std::env::args()));

    let Some(port) = args.port else {
        eprintln!("ndrelay: -p/--port is required");
        return ExitCode::from(exit_code::MISSING_PORT);
    };

    let filter_handle = logging::init(args.trace);
    let mut trace_enabled = args.trace;

    if let Some(rootdir) = &args.rootdir {
        let name = "ndrelay";
        match bootstrap::acquire(rootdir, name) {
            Ok(lock) => info!(lockfile = %lock.path().display(), "acquired lockfile"),
            Err(err) => {
                error!(%err, "failed to acquire a lockfile slot");
                return ExitCode::from(exit_code::INIT_FAILURE);
            }
        }
    }

    if !args.debug {
        // Daemonization is out of scope (§1); `Foreground` is the only
        // strategy shipped, so `-D`/`-debug` and its absence currently
        // behave identically. Kept as a real call site so a process
        // supervisor can swap in a real `Daemonize` impl later.
        if let Err(err) = bootstrap::Foreground.daemonize() {
            error!(%err, "daemonize hook failed");
            return ExitCode::from(exit_code::INIT_FAILURE);
        }
    }

    let signals = match signals::install() {
        Ok(signals) => signals,
        Err(err) => {
            error!(%err, "failed to install signal handlers");
            return ExitCode::from(exit_code::INIT_FAILURE);
        }
    };

    let mut server = match RelayServer::bind(port) {
        Ok(server) => server,
        Err(err) => {
            error!(%err, port, "failed to create listen socket");
            return ExitCode::from(exit_code::LISTEN_SOCKET_FAILURE);
        }
    };
    info!(port, "listening");

    let run_result = server.run(|| {
        if signals.take_trace_toggle() {
            trace_enabled = logging::toggle_trace(&filter_handle, trace_enabled);
        }
        let _ = signals.take_reopen_log();
        signals.should_stop()
    });

    if let Err(err) = run_result {
        error!(%err, "event loop exited with an error");
        return ExitCode::from(exit_code::INIT_FAILURE);
    }

    info!("shutdown complete");
    ExitCode::SUCCESS
}
