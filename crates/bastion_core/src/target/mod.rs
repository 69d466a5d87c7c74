//! Target aggregate: the polymorphic resource sessions connect to.
//!
//! # Responsibility
//! - Define the in-memory `Target` shared by every subtype.
//! - Own the update field-mask allow-list and set/null partitioning.
//! - Derive oplog metadata for a mutated target.
//!
//! # Invariants
//! - `public_id` is immutable once assigned and carries the subtype prefix.
//! - Zero values of nullable attributes are stored as SQL `NULL`.
//! - `version` starts at 1 and grows by exactly one per successful update.

pub mod hooks;
pub mod repository;
pub mod source;
pub mod tcp;

use crate::db::tx::Record;
use crate::error::{RepoError, RepoResult};
use crate::oplog::{
    Metadata, OpType, OP_TYPE_KEY, RESOURCE_PUBLIC_ID_KEY, RESOURCE_TYPE_KEY, SCOPE_ID_KEY,
};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Aggregate name under which target oplog tickets are issued.
pub const TARGET_AGGREGATE: &str = "target";
pub(crate) const TARGET_TABLE: &str = "target";

const PUBLIC_ID_SUFFIX_LEN: usize = 10;
const PUBLIC_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub public_id: String,
    pub scope_id: String,
    /// Registry key of the subtype that owns this target.
    #[serde(rename = "type")]
    pub type_tag: String,
    pub name: String,
    pub description: String,
    pub default_port: u32,
    pub session_max_seconds: u32,
    /// `-1` means unlimited.
    pub session_connection_limit: i32,
    pub worker_filter: String,
    pub version: u32,
    /// Epoch milliseconds, assigned by storage.
    pub create_time: i64,
    /// Epoch milliseconds, assigned by storage.
    pub update_time: i64,
}

impl Target {
    /// Audit tags recorded with every oplog entry about this target.
    pub fn oplog(&self, resource_type: &str, op: OpType) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert(RESOURCE_PUBLIC_ID_KEY, self.public_id.as_str());
        metadata.insert(RESOURCE_TYPE_KEY, resource_type);
        metadata.insert(OP_TYPE_KEY, op.as_str());
        if !self.scope_id.is_empty() {
            metadata.insert(SCOPE_ID_KEY, self.scope_id.as_str());
        }
        metadata
    }
}

/// Optional attributes accepted by subtype constructors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetOptions {
    pub name: Option<String>,
    pub description: Option<String>,
    pub default_port: Option<u32>,
    pub session_max_seconds: Option<u32>,
    pub session_connection_limit: Option<i32>,
    pub worker_filter: Option<String>,
}

/// Where an updatable attribute lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldStorage {
    /// Common column on the aggregate-root table.
    Base,
    /// Column on the subtype's extension table.
    Extension,
}

/// Attributes an update may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TargetField {
    Name,
    Description,
    DefaultPort,
    SessionMaxSeconds,
    SessionConnectionLimit,
    WorkerFilter,
}

impl TargetField {
    /// Parses a field-mask path; case and `-`/`_` separators are ignored.
    pub fn parse(path: &str) -> Option<Self> {
        let normalized: String = path
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "name" => Some(Self::Name),
            "description" => Some(Self::Description),
            "defaultport" => Some(Self::DefaultPort),
            "sessionmaxseconds" => Some(Self::SessionMaxSeconds),
            "sessionconnectionlimit" => Some(Self::SessionConnectionLimit),
            "workerfilter" => Some(Self::WorkerFilter),
            _ => None,
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Description => "description",
            Self::DefaultPort => "default_port",
            Self::SessionMaxSeconds => "session_max_seconds",
            Self::SessionConnectionLimit => "session_connection_limit",
            Self::WorkerFilter => "worker_filter",
        }
    }

    pub fn storage(self) -> FieldStorage {
        match self {
            Self::DefaultPort => FieldStorage::Extension,
            _ => FieldStorage::Base,
        }
    }

    /// Zero is an explicit setting for these fields and is never nulled.
    pub fn zero_is_meaningful(self) -> bool {
        matches!(self, Self::SessionMaxSeconds | Self::SessionConnectionLimit)
    }

    fn is_zero(self, target: &Target) -> bool {
        match self {
            Self::Name => target.name.is_empty(),
            Self::Description => target.description.is_empty(),
            Self::DefaultPort => target.default_port == 0,
            Self::SessionMaxSeconds => target.session_max_seconds == 0,
            Self::SessionConnectionLimit => target.session_connection_limit == 0,
            Self::WorkerFilter => target.worker_filter.is_empty(),
        }
    }

    pub fn value(self, target: &Target) -> Value {
        match self {
            Self::Name => Value::Text(target.name.clone()),
            Self::Description => Value::Text(target.description.clone()),
            Self::DefaultPort => Value::Integer(i64::from(target.default_port)),
            Self::SessionMaxSeconds => Value::Integer(i64::from(target.session_max_seconds)),
            Self::SessionConnectionLimit => {
                Value::Integer(i64::from(target.session_connection_limit))
            }
            Self::WorkerFilter => Value::Text(target.worker_filter.clone()),
        }
    }
}

/// Update plan derived from a field mask.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatePaths {
    pub set: Vec<TargetField>,
    pub null: Vec<TargetField>,
}

impl UpdatePaths {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.null.is_empty()
    }
}

/// Validates `paths` against the allow-list and splits them into fields to
/// set and fields to null.
///
/// Returns the first path outside the allow-list as the error value.
pub fn build_update_paths(target: &Target, paths: &[&str]) -> Result<UpdatePaths, String> {
    let mut plan = UpdatePaths::default();
    for path in paths {
        let field = TargetField::parse(path).ok_or_else(|| path.to_string())?;
        if plan.set.contains(&field) || plan.null.contains(&field) {
            continue;
        }
        if field.is_zero(target) && !field.zero_is_meaningful() {
            plan.null.push(field);
        } else {
            plan.set.push(field);
        }
    }
    Ok(plan)
}

/// Mints `<prefix>_<10 random alphanumerics>`.
pub fn new_public_id(prefix: &str) -> RepoResult<String> {
    if prefix.is_empty() {
        return Err(RepoError::invalid_parameter(
            "target.new_public_id",
            "missing prefix",
        ));
    }
    Ok(format!("{prefix}_{}", encode_suffix(Uuid::new_v4().as_u128())))
}

/// Base62 digits of `random`, least significant first.
fn encode_suffix(mut random: u128) -> String {
    let radix = PUBLIC_ID_ALPHABET.len() as u128;
    let mut suffix = String::with_capacity(PUBLIC_ID_SUFFIX_LEN);
    for _ in 0..PUBLIC_ID_SUFFIX_LEN {
        suffix.push(char::from(PUBLIC_ID_ALPHABET[(random % radix) as usize]));
        random /= radix;
    }
    suffix
}

/// Aggregate-root row of a target.
pub(crate) struct TargetRow<'a>(pub(crate) &'a Target);

impl Record for TargetRow<'_> {
    fn table_name(&self) -> &'static str {
        TARGET_TABLE
    }

    fn columns(&self) -> Vec<(&'static str, Value)> {
        let t = self.0;
        vec![
            ("public_id", Value::Text(t.public_id.clone())),
            ("scope_id", Value::Text(t.scope_id.clone())),
            ("type", Value::Text(t.type_tag.clone())),
            ("name", text_or_null(&t.name)),
            ("description", text_or_null(&t.description)),
            (
                "session_max_seconds",
                Value::Integer(i64::from(t.session_max_seconds)),
            ),
            (
                "session_connection_limit",
                Value::Integer(i64::from(t.session_connection_limit)),
            ),
            ("worker_filter", text_or_null(&t.worker_filter)),
        ]
    }
}

/// Subtype extension row keyed by the target's public id.
pub(crate) struct ExtensionRow<'a> {
    pub(crate) table: &'static str,
    pub(crate) target: &'a Target,
}

impl Record for ExtensionRow<'_> {
    fn table_name(&self) -> &'static str {
        self.table
    }

    fn columns(&self) -> Vec<(&'static str, Value)> {
        let port = match self.target.default_port {
            0 => Value::Null,
            port => Value::Integer(i64::from(port)),
        };
        vec![
            ("public_id", Value::Text(self.target.public_id.clone())),
            ("default_port", port),
        ]
    }
}

fn text_or_null(value: &str) -> Value {
    if value.is_empty() {
        Value::Null
    } else {
        Value::Text(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::{build_update_paths, encode_suffix, new_public_id, Target, TargetField};
    use crate::oplog::OpType;

    #[test]
    fn parses_mask_paths_in_any_spelling() {
        for path in ["DefaultPort", "default_port", "default-port", " defaultport "] {
            assert_eq!(TargetField::parse(path), Some(TargetField::DefaultPort));
        }
        assert_eq!(TargetField::parse("PublicId"), None);
        assert_eq!(TargetField::parse("version"), None);
        assert_eq!(TargetField::parse(""), None);
    }

    #[test]
    fn zero_values_go_to_null_list_except_session_limits() {
        let target = Target {
            name: "renamed".to_string(),
            ..Target::default()
        };
        let plan = build_update_paths(
            &target,
            &[
                "Name",
                "Description",
                "WorkerFilter",
                "SessionMaxSeconds",
                "SessionConnectionLimit",
            ],
        )
        .unwrap();

        assert_eq!(
            plan.set,
            vec![
                TargetField::Name,
                TargetField::SessionMaxSeconds,
                TargetField::SessionConnectionLimit
            ]
        );
        assert_eq!(
            plan.null,
            vec![TargetField::Description, TargetField::WorkerFilter]
        );
    }

    #[test]
    fn rejects_paths_outside_allow_list() {
        let err = build_update_paths(&Target::default(), &["name", "PublicId"]).unwrap_err();
        assert_eq!(err, "PublicId");
    }

    #[test]
    fn repeated_paths_are_applied_once() {
        let target = Target {
            description: "d".to_string(),
            ..Target::default()
        };
        let plan = build_update_paths(&target, &["description", "Description"]).unwrap();
        assert_eq!(plan.set, vec![TargetField::Description]);
        assert!(plan.null.is_empty());
    }

    #[test]
    fn minted_ids_carry_prefix_and_differ() {
        let first = new_public_id("ttcp").unwrap();
        let second = new_public_id("ttcp").unwrap();
        assert!(first.starts_with("ttcp_"));
        assert_eq!(first.len(), "ttcp_".len() + 10);
        assert!(first["ttcp_".len()..]
            .chars()
            .all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(first, second);
        assert!(new_public_id("").is_err());
    }

    #[test]
    fn suffix_encodes_base62_digits_low_first() {
        assert_eq!(encode_suffix(0), "0000000000");
        assert_eq!(encode_suffix(61), "Z000000000");
        assert_eq!(encode_suffix(62), "0100000000");
        assert_eq!(encode_suffix(62 * 62 + 11), "b010000000");
        assert_eq!(encode_suffix(u128::MAX).len(), 10);
    }

    #[test]
    fn oplog_metadata_tags_target() {
        let target = Target {
            public_id: "ttcp_1234567890".to_string(),
            scope_id: "p_1".to_string(),
            ..Target::default()
        };
        let metadata = target.oplog("tcp target", OpType::Create);
        assert_eq!(metadata.first("resource-public-id"), Some("ttcp_1234567890"));
        assert_eq!(metadata.first("resource-type"), Some("tcp target"));
        assert_eq!(metadata.first("op-type"), Some("CREATE"));
        assert_eq!(metadata.first("scope-id"), Some("p_1"));
    }
}
