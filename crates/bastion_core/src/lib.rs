//! Transactional target store.
//! Targets, their associations and the ordered oplog entries describing every
//! change are written together in one SQLite transaction.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod kms;
pub mod logging;
pub mod oplog;
pub mod target;

pub use config::{ConfigError, CoreConfig, DbConfig, LogConfig, TxConfig};
pub use context::{CallContext, CancelHandle, CancelReason};
pub use error::{ErrorCode, RepoError, RepoResult};
pub use kms::{KeyPurpose, KeyWrapper, KmsError, WrapperProvider};
pub use logging::{default_log_level, init_logging, logging_status};
pub use oplog::{list_entries, OplogEntry, OplogMessage};
pub use target::hooks::{SubtypeRegistry, TargetHooks};
pub use target::repository::{CreateOptions, TargetRepository, TargetSnapshot, UpdateOutcome};
pub use target::source::{CredentialSource, HostSource};
pub use target::tcp::{new_tcp_target, TcpHooks};
pub use target::{Target, TargetOptions};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
