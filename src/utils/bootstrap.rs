//! Process bootstrap.

use std::sync::Once;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

static TRACING_INIT: Once = Once::new();

/// Initialize tracing with the RABBITBUS_LOG environment variable.
///
/// Defaults to "info" level if RABBITBUS_LOG is not set. Only the first call
/// installs the subscriber; later calls are no-ops.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice() {
        init_tracing();
        init_tracing();
        assert!(TRACING_INIT.is_completed());
    }
}
