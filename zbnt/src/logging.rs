//! Subscriber setup for binaries embedding the library

use tracing_subscriber::{
    fmt,
    prelude::*,
    EnvFilter,
};

/// Environment variable that overrides the configured filter
pub const LOG_ENV: &str = "ZBNT_LOG";

/// The filter to log with: `ZBNT_LOG` if it is set and valid, otherwise `level`
#[must_use]
pub fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a formatting subscriber. Does nothing if one is already installed.
pub fn init(level: &str) {
    let subscriber = tracing_subscriber::registry()
        .with(filter(level))
        .with(fmt::layer().with_target(false).with_thread_names(true));
    // Already set by the embedding binary or an earlier call
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_from_level() {
        if std::env::var_os(LOG_ENV).is_none() {
            assert_eq!(filter("debug").to_string(), "debug");
            assert_eq!(filter("zbnt=trace").to_string(), "zbnt=trace");
        }
    }

    #[test]
    fn test_init_twice() {
        init("warn");
        init("debug");
        tracing::warn!("Still logging");
    }
}
