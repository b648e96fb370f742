//! Error types for the core hierarchy.

use thiserror::Error;

/// Coarse classification used by callers that route on failure policy
/// rather than on the precise variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected at the boundary; no state was mutated.
    Validation,
    /// The addressed entity does not exist. Reads may map this to an
    /// empty result; writes must fail.
    NotFound,
    /// Retry-advisory: the caller should refresh its view and retry.
    Conflict,
    /// Transient I/O or peer failure; retried with backoff where a retry
    /// loop exists.
    Transient,
    /// Unrecoverable; aborts the component open and fails node start-up.
    Fatal,
    /// Writes refused because too few replicas are live.
    Degraded,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid name '{0}': need 1-64 chars of lowercase ASCII, digits, '_' or '-'")]
    InvalidName(String),

    #[error("unknown field type '{0}'")]
    UnknownFieldType(String),

    #[error("unknown cache policy '{0}'")]
    UnknownCachePolicy(String),

    #[error("unknown time quantum '{0}'")]
    UnknownTimeQuantum(String),

    #[error("invalid value range [{min}, {max}]")]
    InvalidRange { min: i64, max: i64 },

    #[error("value {0} outside the configured field range")]
    ValueOutOfRange(i64),

    #[error("column {column} outside shard {shard}")]
    ColumnOutOfShard { column: u64, shard: u64 },

    #[error("row {0} invalid for a bool field (only 0 and 1)")]
    InvalidBoolRow(u64),

    #[error("operation not supported by field type {0}")]
    FieldTypeMismatch(&'static str),

    #[error("index '{0}' not found")]
    IndexNotFound(String),

    #[error("index '{0}' already exists")]
    IndexExists(String),

    #[error("field '{0}' not found")]
    FieldNotFound(String),

    #[error("field '{0}' already exists")]
    FieldExists(String),

    #[error("view '{0}' not found")]
    ViewNotFound(String),

    #[error("fragment for shard {0} not found")]
    FragmentNotFound(u64),

    #[error("translation key '{0}' unknown and this node is not the translation primary")]
    TranslationNotPrimary(String),

    #[error("writes refused: {live} of {required} required replicas live")]
    Degraded { live: usize, required: usize },

    #[error("batch of {got} writes exceeds the per-request limit of {limit}")]
    BatchTooLarge { got: usize, limit: usize },

    #[error("broadcast failed: {0}")]
    Broadcast(String),

    #[error("corrupted {what} at {path}: {detail}")]
    Corrupt {
        what: &'static str,
        path: String,
        detail: String,
    },

    #[error("storage error at {path}: {source}")]
    Storage {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn storage(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        use CoreError::*;
        match self {
            InvalidName(_)
            | UnknownFieldType(_)
            | UnknownCachePolicy(_)
            | UnknownTimeQuantum(_)
            | InvalidRange { .. }
            | ValueOutOfRange(_)
            | ColumnOutOfShard { .. }
            | InvalidBoolRow(_)
            | FieldTypeMismatch(_)
            | BatchTooLarge { .. } => ErrorKind::Validation,
            IndexNotFound(_) | FieldNotFound(_) | ViewNotFound(_) | FragmentNotFound(_) => {
                ErrorKind::NotFound
            }
            IndexExists(_) | FieldExists(_) | TranslationNotPrimary(_) => ErrorKind::Conflict,
            Degraded { .. } => ErrorKind::Degraded,
            Broadcast(_) | Storage { .. } | Serialization(_) => ErrorKind::Transient,
            Corrupt { .. } => ErrorKind::Fatal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<bincode::Error> for CoreError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
