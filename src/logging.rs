//! # Logging
//!
//! `tracing` subscriber setup. Library code only emits events; the binary
//! and the tests decide where they go.
//!
//! The filter comes from `RUST_LOG` when set, otherwise from the level
//! passed in. Task threads run inside a `task` span carrying the process
//! and task names, so every line identifies its emitter.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

use crate::error::{HarnessError, Result};

static INIT_TEST_LOGGING: Once = Once::new();

/// Install the process-wide subscriber. Fails if one is already set.
pub fn init(default_level: tracing::Level) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str().to_ascii_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(false)
        .try_init()
        .map_err(|e| HarnessError::Config(format!("logging: {e}")))
}

/// Initialize test logging with debug-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    INIT_TEST_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_thread_names(true)
            .with_ansi(false)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_test_logging_is_idempotent() {
        init_test_logging();
        init_test_logging();
        tracing::info!("logging initialized");
    }
}
