//! Error types for mediad-core.

use std::path::PathBuf;

use thiserror::Error;

/// Configuration failures that abort startup.
///
/// Missing or malformed values never show up here; they are resolved to
/// compiled-in defaults inside [`crate::config::load`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read or created.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why a single configuration value could not be used.
///
/// Both variants are expected conditions and are always recovered by
/// substituting the compiled-in default.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("key '{key}' not found in group '{group}'")]
    NotFound {
        group: &'static str,
        key: &'static str,
    },

    #[error("invalid value for '{group}.{key}': {reason}")]
    Invalid {
        group: &'static str,
        key: &'static str,
        reason: String,
    },
}

/// Errors raised while reading or parsing a resource descriptor.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A line did not match `<type>=<value>`.
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// A mandatory session field is absent.
    #[error("missing mandatory field '{0}='")]
    Missing(char),
}

pub(crate) fn config_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}
