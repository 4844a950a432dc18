//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;

/// Environment variable holding an `EnvFilter` directive.
pub const ENV_LOG: &str = "DOCKYARD_LOG";

/// Install the global fmt subscriber.
///
/// `DOCKYARD_LOG` wins over `level` when set. Calling this more than once
/// is harmless; later calls leave the first subscriber in place.
pub fn init_tracing(level: LogLevel) {
    let fallback = tracing::Level::from(level).to_string().to_lowercase();
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing(LogLevel::Debug);
        init_tracing(LogLevel::Warn);
        tracing::debug!("subscriber installed");
    }
}
