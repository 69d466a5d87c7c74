//! Subtype hooks and the registry that dispatches on a target's type tag.
//!
//! # Responsibility
//! - Define the capability set every target subtype implements.
//! - Map type tags to hooks for the repository's polymorphic dispatch.
//!
//! # Invariants
//! - At most one hooks implementation per type tag; a second registration is
//!   a wiring bug and panics.
//! - The registry is filled during startup, then shared read-only behind an
//!   `Arc`; lookups never mutate it.

use crate::error::RepoResult;
use crate::oplog::{Metadata, OpType};
use crate::target::Target;
use log::info;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Capabilities the repository needs from one target subtype.
pub trait TargetHooks: Send + Sync {
    /// Registry key, stored in the `type` column.
    fn type_tag(&self) -> &'static str;

    /// Display name recorded as `resource-type` in oplog metadata.
    fn resource_type(&self) -> &'static str;

    /// Table holding this subtype's extension columns.
    fn extension_table(&self) -> &'static str;

    /// Zero-valued instance tagged with identity, plus its oplog metadata.
    fn alloc(&self, public_id: &str, version: u32, op: OpType) -> (Target, Metadata);

    fn validate_create(&self, target: &Target) -> RepoResult<()>;

    fn validate_update(&self, target: &Target) -> RepoResult<()>;

    /// Mints a new subtype-prefixed public id.
    fn new_target_id(&self) -> RepoResult<String>;
}

/// Type tag → hooks lookup table.
#[derive(Default)]
pub struct SubtypeRegistry {
    subtypes: BTreeMap<String, Arc<dyn TargetHooks>>,
}

impl SubtypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every subtype shipped in this crate.
    pub fn with_builtin_subtypes() -> Self {
        let mut registry = Self::new();
        registry.register(crate::target::tcp::TCP_TYPE, Arc::new(crate::target::tcp::TcpHooks));
        registry
    }

    /// Registers `hooks` under `type_tag`.
    ///
    /// # Panics
    /// Panics when `type_tag` is already registered.
    pub fn register(&mut self, type_tag: &str, hooks: Arc<dyn TargetHooks>) {
        if self.subtypes.contains_key(type_tag) {
            panic!("target subtype {type_tag} already registered");
        }
        info!("event=subtype_register module=target status=ok type={type_tag}");
        self.subtypes.insert(type_tag.to_string(), hooks);
    }

    pub fn get(&self, type_tag: &str) -> Option<Arc<dyn TargetHooks>> {
        self.subtypes.get(type_tag).cloned()
    }

    pub fn len(&self) -> usize {
        self.subtypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subtypes.is_empty()
    }

    /// Registered type tags, sorted.
    pub fn type_tags(&self) -> Vec<&str> {
        self.subtypes.keys().map(String::as_str).collect()
    }
}
