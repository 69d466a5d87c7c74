//! Key-management collaborator contracts.
//!
//! The repository never owns key material. It asks a [`WrapperProvider`] for a
//! scope-bound [`KeyWrapper`] and hands it to the oplog writer, which wraps the
//! encoded entry payload before it is persisted.

use crate::context::CallContext;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// What a wrapper is allowed to protect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyPurpose {
    Oplog,
}

impl KeyPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Oplog => "oplog",
        }
    }
}

/// Scope-bound encryption wrapper.
pub trait KeyWrapper: Send + Sync {
    /// Identifier persisted next to every blob this wrapper produced.
    fn key_id(&self) -> &str;
    fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>, KmsError>;
}

/// Resolves wrappers by scope and purpose.
pub trait WrapperProvider: Send + Sync {
    fn get_wrapper(
        &self,
        ctx: &CallContext,
        scope_id: &str,
        purpose: KeyPurpose,
    ) -> Result<Arc<dyn KeyWrapper>, KmsError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KmsError {
    MissingScope,
    KeyNotFound {
        scope_id: String,
        purpose: KeyPurpose,
    },
    WrapFailed(String),
}

impl Display for KmsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingScope => write!(f, "kms: missing scope id"),
            Self::KeyNotFound { scope_id, purpose } => write!(
                f,
                "kms: no {} key for scope {scope_id}",
                purpose.as_str()
            ),
            Self::WrapFailed(message) => write!(f, "kms: wrap failed: {message}"),
        }
    }
}

impl Error for KmsError {}
