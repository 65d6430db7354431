//! Logging for the driver and client agents.
//!
//! Enable with `--features tracing`. Without the feature every macro below
//! expands to `()`, so the duty-cycle loops pay no cost.

/// Installs a subscriber that prints timestamped, thread-tagged events.
///
/// The filter comes from `RUST_LOG`, defaulting to `meridian=info`. Calling
/// this more than once (from several tests, say) keeps the first subscriber.
/// Does nothing if the `tracing` feature is not enabled.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("meridian=info"));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

// Expands to `()` so a call also works as a match arm or tail expression.
#[cfg(not(feature = "tracing"))]
macro_rules! discard {
    ($($arg:tt)*) => {
        ()
    };
}

#[cfg(not(feature = "tracing"))]
pub(crate) use discard as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as error;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as trace;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as warn;

#[cfg(test)]
mod tests {
    use super::{debug, warn};

    fn describe(value: Option<u32>) {
        match value {
            Some(_) => debug!("value present"),
            None => warn!("value missing"),
        }
    }

    #[test]
    fn test_macros_work_in_expression_position() {
        describe(Some(1));
        describe(None);
    }
}
