//! Logger installation
//!
//! The crate only talks to the `log` facade. Hosts that don't install their
//! own logger can call [`init_logging`] to get env_logger output filtered by
//! `RUST_LOG` (default `info`).

use env_logger::Env;

/// Install env_logger as the global logger.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let result = env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();

    match result {
        Ok(()) => log::debug!("State cache logging initialized"),
        Err(_) => log::trace!("Logger already installed, keeping existing one"),
    }
}

/// Install a test-friendly logger that writes through the test harness capture.
pub fn init_test_logging() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_test_logging();
        init_logging();
        init_logging();
        log::info!("logger still usable");
    }
}
