use std::path::{Path, PathBuf};

use {harbor_protocol::error_codes, thiserror::Error};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("plugin host used before setup")]
    NotInitialized,

    #[error("plugin host is already initialized")]
    AlreadyInitialized,

    #[error("plugin '{name}' not found")]
    NotFound { name: String },

    #[error("package '{package}' not found in registry")]
    PackageNotFound { package: String },

    #[error("could not fetch {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install '{package}': {reason}")]
    Install { package: String, reason: String },

    #[error("failed to unpack {path}: {reason}")]
    Unpack { path: PathBuf, reason: String },

    #[error(
        "plugin manifest {path} is corrupt ({reason}); inspect or delete the file and restart"
    )]
    ManifestCorrupt { path: PathBuf, reason: String },

    #[error("another operation is in progress for plugin '{name}'")]
    OperationInProgress { name: String },

    #[error("invalid package specifier '{specifier}': {reason}")]
    InvalidSpecifier { specifier: String, reason: String },

    #[error("cannot activate plugin '{name}': {reason}")]
    Activation { name: String, reason: String },

    #[error("download of {url} was cancelled")]
    Cancelled { url: String },

    #[error("resource '{path}' is not available")]
    ResourceRejected { path: String },

    #[error("plugin host unavailable: {message}")]
    Unavailable { message: String },
}

impl Error {
    #[must_use]
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    #[must_use]
    pub fn package_not_found(package: impl Into<String>) -> Self {
        Self::PackageNotFound {
            package: package.into(),
        }
    }

    #[must_use]
    pub fn network(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Network {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub fn write(path: &Path, source: std::io::Error) -> Self {
        Self::Write {
            path: path.to_path_buf(),
            source,
        }
    }

    #[must_use]
    pub fn install(package: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Install {
            package: package.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn unpack(path: &Path, reason: impl std::fmt::Display) -> Self {
        Self::Unpack {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub fn manifest_corrupt(path: &Path, reason: impl std::fmt::Display) -> Self {
        Self::ManifestCorrupt {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub fn in_progress(name: impl Into<String>) -> Self {
        Self::OperationInProgress { name: name.into() }
    }

    #[must_use]
    pub fn invalid_specifier(specifier: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSpecifier {
            specifier: specifier.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn activation(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Activation {
            name: name.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn resource_rejected(path: impl Into<String>) -> Self {
        Self::ResourceRejected { path: path.into() }
    }

    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Stable wire code used by the command bridge.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized | Self::AlreadyInitialized => error_codes::NOT_INITIALIZED,
            Self::NotFound { .. } | Self::ResourceRejected { .. } => error_codes::NOT_FOUND,
            Self::PackageNotFound { .. } => error_codes::PACKAGE_NOT_FOUND,
            Self::Network { .. } | Self::Cancelled { .. } => error_codes::NETWORK_ERROR,
            Self::Write { .. } | Self::Io(_) => error_codes::WRITE_ERROR,
            Self::Install { .. } | Self::Activation { .. } | Self::InvalidSpecifier { .. } => {
                error_codes::INSTALL_ERROR
            },
            Self::Unpack { .. } => error_codes::UNPACK_ERROR,
            Self::ManifestCorrupt { .. } | Self::Json(_) => error_codes::MANIFEST_CORRUPT,
            Self::OperationInProgress { .. } => error_codes::OPERATION_IN_PROGRESS,
            Self::Unavailable { .. } => error_codes::UNAVAILABLE,
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Cancelled { .. } | Self::OperationInProgress { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
