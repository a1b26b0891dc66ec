use crate::error::{Result, WearlinkError};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Console logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set, e.g. `wearlink=debug`
    pub default_directive: String,
    /// Print the emitting module
    pub show_target: bool,
    /// Print source file and line
    pub show_file_line: bool,
    /// Print thread ids
    pub show_thread_ids: bool,
    /// Colorize output
    pub ansi_colors: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_directive: "info".to_string(),
            show_target: true,
            show_file_line: false,
            show_thread_ids: false,
            ansi_colors: true,
        }
    }
}

impl LoggingConfig {
    /// Filter from `RUST_LOG`, falling back to [`LoggingConfig::default_directive`]
    ///
    /// # Errors
    ///
    /// Returns [`WearlinkError::InvalidParameters`] if the fallback directive
    /// does not parse.
    pub fn filter(&self) -> Result<EnvFilter> {
        EnvFilter::try_from_default_env().or_else(|_| {
            EnvFilter::try_new(&self.default_directive).map_err(|e| {
                WearlinkError::InvalidParameters(format!(
                    "bad log directive '{}': {e}",
                    self.default_directive
                ))
            })
        })
    }
}

/// Install a console subscriber for the whole process
///
/// # Errors
///
/// Fails if the directive is invalid or a global subscriber is already set.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(config.show_target)
        .with_file(config.show_file_line)
        .with_line_number(config.show_file_line)
        .with_thread_ids(config.show_thread_ids)
        .with_ansi(config.ansi_colors);

    tracing_subscriber::registry()
        .with(config.filter()?)
        .with(console)
        .try_init()
        .map_err(|e| WearlinkError::Other(format!("logging already initialized: {e}")))?;

    tracing::debug!("Logging initialized with '{}'", config.default_directive);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.default_directive, "info");
        assert!(config.show_target);
    }

    #[test]
    fn test_bad_directive_is_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            default_directive: "wearlink=loud".to_string(),
            ..LoggingConfig::default()
        };
        assert!(matches!(
            config.filter(),
            Err(WearlinkError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_second_init_fails() {
        let config = LoggingConfig {
            default_directive: "wearlink=debug".to_string(),
            ansi_colors: false,
            ..LoggingConfig::default()
        };
        let _ = init(&config);
        assert!(init(&config).is_err());
    }
}
