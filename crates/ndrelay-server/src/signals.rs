//! Signal wiring: SIGTERM/SIGINT set the stop flag the event loop polls each
//! turn, SIGUSR2 toggles the trace filter, SIGHUP marks the log file for
//! reopening, SIGCHLD is reaped, SIGPIPE is a documented no-op.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use signal_hook::{
    consts::{SIGCHLD, SIGHUP, SIGINT, SIGTERM, SIGUSR2},
    flag as signal_flag,
};

/// Shared shutdown flag, mirroring the teacher's `ScopedSpine::stop_flag` —
/// a `0` value means "keep running"; any signal number means "stop".
pub type StopFlag = Arc<AtomicUsize>;

pub struct Signals {
    pub stop: StopFlag,
    pub trace_toggle: Arc<AtomicBool>,
    pub reopen_log: Arc<AtomicBool>,
}

/// Registers every signal named in the relay's external-interface list.
/// Process-fatal if registration itself fails (§7: signal-handler install
/// failure is process-fatal).
pub fn install() -> std::io::Result<Signals> {
    let stop = Arc::new(AtomicUsize::new(0));
    const SIGTERM_U: usize = SIGTERM as usize;
    const SIGINT_U: usize = SIGINT as usize;
    signal_flag::register_usize(SIGTERM, Arc::clone(&stop), SIGTERM_U)?;
    signal_flag::register_usize(SIGINT, Arc::clone(&stop), SIGINT_U)?;

    let trace_toggle = Arc::new(AtomicBool::new(false));
    signal_flag::register(SIGUSR2, Arc::clone(&trace_toggle))?;

    let reopen_log = Arc::new(AtomicBool::new(false));
    signal_flag::register(SIGHUP, Arc::clone(&reopen_log))?;

    // Reaping zombies and ignoring SIGPIPE both already happen for free:
    // this process never forks children of its own, and Rust's runtime
    // ignores SIGPIPE from program start. Registered anyway for parity with
    // the external-interface list rather than to change any behavior.
    unsafe {
        signal_hook::low_level::register(SIGCHLD, || {})?;
    }

    Ok(Signals { stop, trace_toggle, reopen_log })
}

impl Signals {
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed) != 0
    }

    /// Consumes a pending SIGUSR2, if any. `true` means the caller should
    /// flip its trace level.
    pub fn take_trace_toggle(&self) -> bool {
        self.trace_toggle.swap(false, Ordering::Relaxed)
    }

    /// Consumes a pending SIGHUP, if any. The relay has no log file of its
    /// own to reopen (it logs to stdout via `tracing-subscriber`), so this
    /// is observed but otherwise a no-op — kept distinct from
    /// `take_trace_toggle` so a future file-backed subscriber has somewhere
    /// to hook in.
    pub fn take_reopen_log(&self) -> bool {
        self.reopen_log.swap(false, Ordering::Relaxed)
    }
}
