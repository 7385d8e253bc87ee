//! Error types for configuration loading and validation.

use std::path::PathBuf;

/// Errors that can occur when loading or validating a `strata.toml` configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    IoError {
        /// The configuration file path.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// A required field is missing from the configuration.
    #[error("missing required field: {0}")]
    MissingField(String),

    /// The local and shared tiers overlap, so promotion would write into
    /// the shared tier and the consistency check would compare a file with
    /// itself.
    #[error("local tier {} overlaps shared tier {}", local.display(), shared.display())]
    OverlappingTiers {
        /// The configured local tier.
        local: PathBuf,
        /// The configured shared tier.
        shared: PathBuf,
    },

    /// A configuration value failed validation.
    #[error("validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_missing_field() {
        let err = ConfigError::MissingField("local_tier".to_string());
        assert_eq!(format!("{err}"), "missing required field: local_tier");
    }

    #[test]
    fn display_parse_error() {
        let err = ConfigError::ParseError("expected '=' at line 3".to_string());
        assert_eq!(
            format!("{err}"),
            "failed to parse configuration: expected '=' at line 3"
        );
    }

    #[test]
    fn display_overlapping_tiers() {
        let err = ConfigError::OverlappingTiers {
            local: PathBuf::from("/cache"),
            shared: PathBuf::from("/cache/shared"),
        };
        assert_eq!(
            format!("{err}"),
            "local tier /cache overlaps shared tier /cache/shared"
        );
    }

    #[test]
    fn display_io_error_names_file() {
        let err = ConfigError::IoError {
            path: PathBuf::from("/etc/strata/strata.toml"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
        };
        assert_eq!(
            format!("{err}"),
            "failed to read /etc/strata/strata.toml: file not found"
        );
    }
}
