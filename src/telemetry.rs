//! Telemetry initialization.
//!
//! Controlled by `ESTUARY_LOG`:
//! - unset → compact human-readable events to stderr
//! - `"json"` → JSON events to stderr (machine consumers)
//! - `"off"` → no subscriber installed, zero overhead
//!
//! `RUST_LOG` filters as usual via `EnvFilter`; the default level is
//! `warn` so library consumers are quiet unless asked.

use tracing_subscriber::EnvFilter;

/// Opaque guard returned by [`init`]. Hold it in `main()` until exit.
pub struct TelemetryGuard {
    _private: (),
}

/// Initialize telemetry based on `ESTUARY_LOG`.
///
/// Safe to call once per process; a second call is a no-op because a
/// global subscriber is already installed.
#[must_use]
pub fn init() -> TelemetryGuard {
    let mode = std::env::var("ESTUARY_LOG").unwrap_or_default();

    match mode.as_str() {
        "off" => {}
        "json" => {
            let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
            let _ = tracing_subscriber::fmt()
                .json()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .try_init();
        }
        _ => {
            let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
            let _ = tracing_subscriber::fmt()
                .compact()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .try_init();
        }
    }

    TelemetryGuard { _private: () }
}
