//! Oplog model: metadata, messages, tickets and committed entries.
//!
//! # Responsibility
//! - Describe what every mutation records next to its business rows.
//! - Read committed entries back in ticket order for audit consumers.
//!
//! # Invariants
//! - Entries of one aggregate type are totally ordered by `ticket_version`.
//! - Metadata is persisted row-per-value so it stays queryable.

use crate::error::{RepoError, RepoResult};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const RESOURCE_PUBLIC_ID_KEY: &str = "resource-public-id";
pub const RESOURCE_TYPE_KEY: &str = "resource-type";
pub const OP_TYPE_KEY: &str = "op-type";
pub const SCOPE_ID_KEY: &str = "scope-id";

/// Kind of mutation recorded by a message or an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpType {
    Create,
    Update,
}

impl OpType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
        }
    }
}

/// Ordered multimap of audit tags.
///
/// Keys iterate in sorted order; values keep insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata(BTreeMap<String, Vec<String>>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `value` under `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into()).or_default().push(value.into());
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(key).map(Vec::as_slice)
    }

    /// First value recorded under `key`.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().flat_map(|(key, values)| {
            values
                .iter()
                .map(move |value| (key.as_str(), value.as_str()))
        })
    }

    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Row image captured by one write inside a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogMessage {
    pub type_name: String,
    pub op_type: OpType,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_mask: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub null_mask: Vec<String>,
}

/// Serialization token for one aggregate type.
///
/// Obtained inside a transaction and redeemed exactly once by
/// `Writer::write_oplog_entry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    name: String,
    version: i64,
}

impl Ticket {
    pub(crate) fn new(name: impl Into<String>, version: i64) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ticket version observed when the ticket was issued.
    pub fn version(&self) -> i64 {
        self.version
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct EntryPayload {
    pub(crate) messages: Vec<OplogMessage>,
}

/// Committed oplog entry as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct OplogEntry {
    pub id: i64,
    pub aggregate_name: String,
    pub ticket_version: i64,
    pub key_id: String,
    pub metadata: Metadata,
    /// Payload as produced by the scope wrapper.
    pub data: Vec<u8>,
    pub create_time: i64,
}

/// Decodes an unwrapped entry payload back into its messages.
pub fn decode_messages(plaintext: &[u8]) -> RepoResult<Vec<OplogMessage>> {
    let payload: EntryPayload = serde_json::from_slice(plaintext)?;
    Ok(payload.messages)
}

/// Lists committed entries for `aggregate_name` in ticket order.
pub fn list_entries(conn: &Connection, aggregate_name: &str) -> RepoResult<Vec<OplogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, aggregate_name, ticket_version, key_id, data, create_time
         FROM oplog_entry
         WHERE aggregate_name = ?1
         ORDER BY ticket_version ASC;",
    )?;
    let mut rows = stmt.query([aggregate_name])?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        entries.push(OplogEntry {
            id: row.get("id")?,
            aggregate_name: row.get("aggregate_name")?,
            ticket_version: row.get("ticket_version")?,
            key_id: row.get("key_id")?,
            metadata: Metadata::new(),
            data: row.get("data")?,
            create_time: row.get("create_time")?,
        });
    }

    for entry in &mut entries {
        entry.metadata = load_metadata(conn, entry.id)?;
    }
    Ok(entries)
}

/// Lists entries whose metadata carries `key = value`, in ticket order.
pub fn list_entries_tagged(
    conn: &Connection,
    aggregate_name: &str,
    key: &str,
    value: &str,
) -> RepoResult<Vec<OplogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT entry_id
         FROM oplog_metadata
         WHERE key = ?1 AND value = ?2;",
    )?;
    let ids = stmt
        .query_map(params![key, value], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(list_entries(conn, aggregate_name)?
        .into_iter()
        .filter(|entry| ids.contains(&entry.id))
        .collect())
}

fn load_metadata(conn: &Connection, entry_id: i64) -> RepoResult<Metadata> {
    let mut stmt = conn.prepare(
        "SELECT key, value
         FROM oplog_metadata
         WHERE entry_id = ?1
         ORDER BY rowid ASC;",
    )?;
    let mut rows = stmt.query([entry_id])?;
    let mut metadata = Metadata::new();
    while let Some(row) = rows.next()? {
        let key: String = row.get(0)?;
        let value: String = row.get(1)?;
        if key.is_empty() {
            return Err(RepoError::InvalidData(format!(
                "empty metadata key in oplog entry {entry_id}"
            )));
        }
        metadata.insert(key, value);
    }
    Ok(metadata)
}
