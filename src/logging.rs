//! Logger initialisation

use std::sync::Once;

/// Logger configuration.
///
/// `env_filter` follows the `env_logger` filter syntax, e.g. "info" or
/// "rndr=trace,wgpu_core=warn". When unset, `RUST_LOG` is consulted before
/// falling back to [`DEFAULT_FILTER`].
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub env_filter: Option<String>,
    /// Capture output through the test harness instead of writing to stderr
    pub is_test: bool,
}

impl LoggingConfig {
    pub fn for_tests() -> Self {
        Self {
            env_filter: None,
            is_test: true,
        }
    }
}

/// wgpu is chatty at info level
pub const DEFAULT_FILTER: &str = "info,wgpu_core=warn,wgpu_hal=warn,naga=warn";

static INIT: Once = Once::new();

/// Initializes the global logger once; later calls are ignored.
#[cfg(not(target_arch = "wasm32"))]
pub fn init_logging(config: LoggingConfig) {
    INIT.call_once(|| {
        let mut builder = env_logger::Builder::new();

        if let Some(filter) = config.env_filter {
            builder.parse_filters(&filter);
        } else if let Ok(filter) = std::env::var("RUST_LOG") {
            builder.parse_filters(&filter);
        } else {
            builder.parse_filters(DEFAULT_FILTER);
        }

        builder.is_test(config.is_test);

        // Another logger may already be installed by the host application
        if builder.try_init().is_ok() {
            log::debug!("logging initialized");
        }
    });
}

#[cfg(target_arch = "wasm32")]
pub fn init_logging(_config: LoggingConfig) {
    INIT.call_once(|| {});
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_logging(LoggingConfig::for_tests());
        init_logging(LoggingConfig::for_tests());
        assert!(INIT.is_completed());
    }
}
