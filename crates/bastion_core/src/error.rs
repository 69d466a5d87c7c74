//! Repository error taxonomy.
//!
//! # Responsibility
//! - Classify every failure a repository call can surface.
//! - Keep the originating operation name attached for traceability.
//!
//! # Invariants
//! - `code()` looks through `Wrapped` layers, so callers match on the root
//!   classification no matter how much context was added.
//! - Parameter and field-mask errors are produced before any storage I/O.

use crate::context::CancelReason;
use crate::db::{is_transient, DbError};
use crate::kms::KmsError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type RepoResult<T> = Result<T, RepoError>;

/// Stable classification of a [`RepoError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidParameter,
    InvalidFieldMask,
    EmptyFieldMask,
    NotUnique,
    RecordNotFound,
    Cancelled,
    Encryption,
    Encoding,
    InvalidData,
    Storage,
}

#[derive(Debug)]
pub enum RepoError {
    InvalidParameter {
        op: &'static str,
        message: String,
    },
    InvalidFieldMask {
        op: &'static str,
        path: String,
    },
    EmptyFieldMask {
        op: &'static str,
    },
    NotUnique {
        op: &'static str,
        message: String,
    },
    NotFound {
        op: &'static str,
        message: String,
    },
    Cancelled(CancelReason),
    Kms(KmsError),
    Db(DbError),
    Encoding(serde_json::Error),
    /// Persisted state that cannot be mapped back onto the domain model.
    InvalidData(String),
    Wrapped {
        op: &'static str,
        message: String,
        source: Box<RepoError>,
    },
}

impl RepoError {
    pub fn invalid_parameter(op: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            op,
            message: message.into(),
        }
    }

    /// Adds operation context on top of `self`.
    pub fn wrap(self, op: &'static str, message: impl Into<String>) -> Self {
        Self::Wrapped {
            op,
            message: message.into(),
            source: Box::new(self),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidParameter { .. } => ErrorCode::InvalidParameter,
            Self::InvalidFieldMask { .. } => ErrorCode::InvalidFieldMask,
            Self::EmptyFieldMask { .. } => ErrorCode::EmptyFieldMask,
            Self::NotUnique { .. } => ErrorCode::NotUnique,
            Self::NotFound { .. } => ErrorCode::RecordNotFound,
            Self::Cancelled(_) => ErrorCode::Cancelled,
            Self::Kms(_) => ErrorCode::Encryption,
            Self::Encoding(_) => ErrorCode::Encoding,
            Self::InvalidData(_) => ErrorCode::InvalidData,
            Self::Db(err) if err.is_unique_violation() => ErrorCode::NotUnique,
            Self::Db(_) => ErrorCode::Storage,
            Self::Wrapped { source, .. } => source.code(),
        }
    }

    /// Returns whether the root cause is a unique constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::NotUnique { .. } => true,
            Self::Db(err) => err.is_unique_violation(),
            Self::Wrapped { source, .. } => source.is_unique_violation(),
            _ => false,
        }
    }

    /// Returns whether the root cause is lock contention worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Db(DbError::Sqlite(err)) => is_transient(err),
            Self::Wrapped { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidParameter { op, message } => {
                write!(f, "{op}: {message}: parameter violation")
            }
            Self::InvalidFieldMask { op, path } => write!(f, "{op}: invalid field mask: {path}"),
            Self::EmptyFieldMask { op } => write!(f, "{op}: empty field mask"),
            Self::NotUnique { op, message } => write!(f, "{op}: {message}: unique constraint"),
            Self::NotFound { op, message } => write!(f, "{op}: {message}: record not found"),
            Self::Cancelled(reason) => write!(f, "call aborted: {reason}"),
            Self::Kms(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::Encoding(err) => write!(f, "oplog encoding failed: {err}"),
            Self::InvalidData(message) => write!(f, "invalid persisted target data: {message}"),
            Self::Wrapped {
                op,
                message,
                source,
            } => write!(f, "{op}: {message}: {source}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Kms(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::Encoding(err) => Some(err),
            Self::Wrapped { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<KmsError> for RepoError {
    fn from(value: KmsError) -> Self {
        Self::Kms(value)
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(value: serde_json::Error) -> Self {
        Self::Encoding(value)
    }
}
