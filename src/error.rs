//! Error types, one enum per concern.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {key} ({hint})")]
    MissingRequired { key: String, hint: String },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("failed to read settings file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("failed to parse settings file {path}: {reason}")]
    Parse { path: String, reason: String },
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("connection error: {0}")]
    Pool(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: String, id: String },

    #[error("stale write to {entity} '{id}': expected version {expected}, found {found}")]
    VersionConflict {
        entity: String,
        id: String,
        expected: u64,
        found: u64,
    },
}

#[cfg(feature = "libsql")]
impl From<libsql::Error> for DatabaseError {
    fn from(e: libsql::Error) -> Self {
        DatabaseError::Query(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("network error calling {endpoint}: {reason}")]
    Network { endpoint: String, reason: String },

    #[error("not authorized against the CRM: {0}")]
    Unauthorized(String),

    #[error("{endpoint} returned {status}: {body}")]
    Api {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("unexpected response from {endpoint}: {reason}")]
    Parse { endpoint: String, reason: String },
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("network error: {0}")]
    Network(String),

    #[error("directory returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("unexpected directory response: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid address '{address}': {reason}")]
    Address { address: String, reason: String },

    #[error("failed to build message: {0}")]
    Build(String),

    #[error("smtp transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Crm(#[from] CrmError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("opportunity '{0}' has no member deals")]
    MissingGroup(String),

    #[error("phase '{0}' has no configured CRM phase id")]
    UnmappedPhase(String),

    #[error("board state changed while the write was in flight for '{0}'")]
    StaleVersion(String),

    #[error("board coordinator is not running")]
    CoordinatorClosed,
}

impl SyncError {
    /// True for upstream failures that should be reported as a bad gateway.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Self::Crm(CrmError::Network { .. } | CrmError::Api { .. } | CrmError::Parse { .. })
                | Self::Directory(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to start {name}: {reason}")]
    StartupFailed { name: String, reason: String },
}
