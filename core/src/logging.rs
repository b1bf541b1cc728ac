use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingSettings;

/// Install a fmt subscriber writing to stderr.
///
/// `RUST_LOG` wins over `settings.level`. Returns `false` when a global
/// subscriber was already installed.
pub fn init_tracing(settings: &LoggingSettings) -> Result<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&settings.level)
            .with_context(|| format!("Invalid log filter '{}'", settings.level))?,
    };

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(settings.with_target)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok();
    Ok(installed)
}
