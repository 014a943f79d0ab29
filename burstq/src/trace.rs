//! Tracing infrastructure for burstq.
//!
//! Enable with `--features tracing`. All trace macros become no-ops when
//! the feature is disabled, so the burst loops pay nothing for logging in
//! builds that do not ask for it.

/// Initialize the tracing subscriber with timestamps.
///
/// Call this at the start of tests or the `burstq` binary to enable trace
/// output. The filter defaults to `burstq=info` and honours `RUST_LOG`.
/// Does nothing if the `tracing` feature is not enabled.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("burstq=info"));

    // A second initialisation (e.g. from several tests) is not an error.
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

// When tracing is enabled, re-export macros from the tracing crate.
#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

// When tracing is disabled, provide no-op macro implementations. They expand
// to `()` so they also work as match-arm and closure bodies.
#[cfg(not(feature = "tracing"))]
macro_rules! trace_noop {
    ($($arg:tt)*) => {
        ()
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_noop {
    ($($arg:tt)*) => {
        ()
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! info_noop {
    ($($arg:tt)*) => {
        ()
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn_noop {
    ($($arg:tt)*) => {
        ()
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! error_noop {
    ($($arg:tt)*) => {
        ()
    };
}

#[cfg(not(feature = "tracing"))]
pub(crate) use debug_noop as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use error_noop as error;
#[cfg(not(feature = "tracing"))]
pub(crate) use info_noop as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use trace_noop as trace;
#[cfg(not(feature = "tracing"))]
pub(crate) use warn_noop as warn;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros_work_in_expression_position() {
        init_tracing();

        let offset = 3;
        let logged: Result<u32, &str> =
            Err("no such register").inspect_err(|e| error!(error = %e, offset, "lookup failed"));
        assert!(logged.is_err());

        for value in [None, Some(7u32)] {
            let () = match value {
                Some(value) => debug!(value, "present"),
                None => warn!("missing"),
            };
        }
        let () = trace!("burst");
        let () = info!(queues = 15, "run starting");
    }
}
