//! TCP target subtype.
//!
//! A tcp target is reached on a single default port. Its only subtype column
//! lives in `target_tcp`; everything else is on the aggregate-root row.

use crate::error::{RepoError, RepoResult};
use crate::oplog::{Metadata, OpType};
use crate::target::hooks::TargetHooks;
use crate::target::{new_public_id, Target, TargetOptions};

pub const TCP_TYPE: &str = "tcp";
pub const TARGET_PREFIX: &str = "ttcp";
pub const RESOURCE_TYPE: &str = "tcp target";
pub const EXTENSION_TABLE: &str = "target_tcp";

pub const DEFAULT_SESSION_MAX_SECONDS: u32 = 8 * 60 * 60;
pub const DEFAULT_SESSION_CONNECTION_LIMIT: i32 = 1;

/// Builds an unsaved tcp target in `scope_id`.
///
/// Session limits fall back to their defaults when not supplied.
pub fn new_tcp_target(scope_id: &str, options: TargetOptions) -> RepoResult<Target> {
    if scope_id.is_empty() {
        return Err(RepoError::invalid_parameter(
            "tcp.new_tcp_target",
            "missing scope id",
        ));
    }
    Ok(Target {
        scope_id: scope_id.to_string(),
        type_tag: TCP_TYPE.to_string(),
        name: options.name.unwrap_or_default(),
        description: options.description.unwrap_or_default(),
        default_port: options.default_port.unwrap_or_default(),
        session_max_seconds: options
            .session_max_seconds
            .unwrap_or(DEFAULT_SESSION_MAX_SECONDS),
        session_connection_limit: options
            .session_connection_limit
            .unwrap_or(DEFAULT_SESSION_CONNECTION_LIMIT),
        worker_filter: options.worker_filter.unwrap_or_default(),
        ..Target::default()
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpHooks;

impl TcpHooks {
    fn ensure_tcp(op: &'static str, target: &Target) -> RepoResult<()> {
        if target.type_tag != TCP_TYPE {
            return Err(RepoError::invalid_parameter(
                op,
                format!("target type {} is not a tcp target", target.type_tag),
            ));
        }
        Ok(())
    }
}

impl TargetHooks for TcpHooks {
    fn type_tag(&self) -> &'static str {
        TCP_TYPE
    }

    fn resource_type(&self) -> &'static str {
        RESOURCE_TYPE
    }

    fn extension_table(&self) -> &'static str {
        EXTENSION_TABLE
    }

    fn alloc(&self, public_id: &str, version: u32, op: OpType) -> (Target, Metadata) {
        let target = Target {
            public_id: public_id.to_string(),
            type_tag: TCP_TYPE.to_string(),
            version,
            ..Target::default()
        };
        let metadata = target.oplog(RESOURCE_TYPE, op);
        (target, metadata)
    }

    fn validate_create(&self, target: &Target) -> RepoResult<()> {
        const OP: &str = "tcp.validate_create";
        Self::ensure_tcp(OP, target)?;
        if target.scope_id.is_empty() {
            return Err(RepoError::invalid_parameter(OP, "missing scope id"));
        }
        if target.name.is_empty() {
            return Err(RepoError::invalid_parameter(OP, "missing name"));
        }
        if !target.public_id.is_empty() {
            return Err(RepoError::invalid_parameter(OP, "public id not empty"));
        }
        Ok(())
    }

    fn validate_update(&self, target: &Target) -> RepoResult<()> {
        const OP: &str = "tcp.validate_update";
        Self::ensure_tcp(OP, target)?;
        if target.public_id.is_empty() {
            return Err(RepoError::invalid_parameter(
                OP,
                "missing target public id",
            ));
        }
        Ok(())
    }

    fn new_target_id(&self) -> RepoResult<String> {
        new_public_id(TARGET_PREFIX)
            .map_err(|err| err.wrap("tcp.new_target_id", "unable to mint id"))
    }
}
