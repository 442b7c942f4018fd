//! `tracing-subscriber` installation. Returns a reload handle so SIGUSR2 can
//! flip the filter to `trace` without restarting the process.

use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt};

pub type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Installs the global subscriber. `trace` raises the default filter from
/// `info` to `trace`; `RUST_LOG` always overrides both.
pub fn init(trace: bool) -> FilterHandle {
    let default = if trace { "trace" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();

    handle
}

/// Flips the installed filter to `trace`, or back to `info` if it's already
/// there. Driven by SIGUSR2.
pub fn toggle_trace(handle: &FilterHandle, currently_trace: bool) -> bool {
    let next = if currently_trace { "info" } else { "trace" };
    let _ = handle.modify(|filter| *filter = EnvFilter::new(next));
    !currently_trace
}
