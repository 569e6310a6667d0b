//! Subscriber setup for the binaries.
//!
//! `RUST_LOG` takes precedence over the configured level. Initialising twice is not an
//! error, so tests and embedding applications may call [`init_logging`] freely.

use std::sync::OnceLock;

use rtiocompiler_backend::config::LoggingConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::{Result, RunError};

static INSTALLED: OnceLock<()> = OnceLock::new();

pub fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cfg.level).map_err(|e| RunError::Logging(e.to_string()))?,
    };

    let registry = tracing_subscriber::registry();
    let result = match cfg.format.as_str() {
        "json" => registry
            .with(fmt::layer().json().with_filter(filter))
            .try_init(),
        "compact" => registry
            .with(fmt::layer().compact().with_filter(filter))
            .try_init(),
        _ => registry
            .with(fmt::layer().pretty().with_thread_names(true).with_filter(filter))
            .try_init(),
    };
    // Only fails when a global subscriber is already in place; that one stays.
    if let Err(e) = result {
        tracing::debug!(error = %e, "keeping the installed subscriber");
    }
    let _ = INSTALLED.set(());
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn init_twice() {
        let cfg = LoggingConfig {
            level: "debug".into(),
            format: "compact".into(),
        };
        init_logging(&cfg).unwrap();
        assert!(tracing::dispatcher::has_been_set());
        assert!(INSTALLED.get().is_some());
        init_logging(&cfg).unwrap();
    }

    #[test]
    fn foreign_subscriber_is_kept() {
        // whichever test runs first installs the global subscriber
        let _ = tracing_subscriber::fmt().try_init();
        let cfg = LoggingConfig {
            level: "info".into(),
            format: "json".into(),
        };
        init_logging(&cfg).unwrap();
        assert!(tracing::dispatcher::has_been_set());
    }
}
