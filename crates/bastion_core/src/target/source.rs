//! Host-source and credential-source associations of a target.
//!
//! Builders create unsaved rows without touching storage. Whether the
//! referenced host set or credential library exists is left to storage
//! constraints. After a write, the `fetch_*` functions re-read the committed
//! set inside the same transaction so callers see what is durable.

use crate::db::tx::{Reader, Record};
use crate::error::{RepoError, RepoResult};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub(crate) const HOST_SOURCE_TABLE: &str = "target_host_source";
pub(crate) const CREDENTIAL_SOURCE_TABLE: &str = "target_credential_source";

/// Link between a target and a host set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostSource {
    pub target_id: String,
    pub host_source_id: String,
}

impl HostSource {
    pub fn new(target_id: &str, host_source_id: &str) -> RepoResult<Self> {
        const OP: &str = "target.new_host_source";
        if target_id.is_empty() {
            return Err(RepoError::invalid_parameter(OP, "missing target id"));
        }
        if host_source_id.is_empty() {
            return Err(RepoError::invalid_parameter(OP, "missing host source id"));
        }
        Ok(Self {
            target_id: target_id.to_string(),
            host_source_id: host_source_id.to_string(),
        })
    }
}

impl Record for HostSource {
    fn table_name(&self) -> &'static str {
        HOST_SOURCE_TABLE
    }

    fn columns(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("target_id", Value::Text(self.target_id.clone())),
            ("host_source_id", Value::Text(self.host_source_id.clone())),
        ]
    }
}

/// Link between a target and a credential library.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CredentialSource {
    pub target_id: String,
    pub credential_source_id: String,
}

impl CredentialSource {
    pub fn new(target_id: &str, credential_source_id: &str) -> RepoResult<Self> {
        const OP: &str = "target.new_credential_source";
        if target_id.is_empty() {
            return Err(RepoError::invalid_parameter(OP, "missing target id"));
        }
        if credential_source_id.is_empty() {
            return Err(RepoError::invalid_parameter(
                OP,
                "missing credential source id",
            ));
        }
        Ok(Self {
            target_id: target_id.to_string(),
            credential_source_id: credential_source_id.to_string(),
        })
    }
}

impl Record for CredentialSource {
    fn table_name(&self) -> &'static str {
        CREDENTIAL_SOURCE_TABLE
    }

    fn columns(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("target_id", Value::Text(self.target_id.clone())),
            (
                "credential_source_id",
                Value::Text(self.credential_source_id.clone()),
            ),
        ]
    }
}

/// Builds unsaved host-source rows for `target_id`; repeated ids collapse.
pub fn build_host_sources(target_id: &str, ids: &[String]) -> RepoResult<Vec<HostSource>> {
    distinct(ids)
        .map(|id| HostSource::new(target_id, id))
        .collect()
}

/// Builds unsaved credential-source rows for `target_id`; repeated ids
/// collapse.
pub fn build_credential_sources(
    target_id: &str,
    ids: &[String],
) -> RepoResult<Vec<CredentialSource>> {
    distinct(ids)
        .map(|id| CredentialSource::new(target_id, id))
        .collect()
}

fn distinct(ids: &[String]) -> impl Iterator<Item = &str> {
    let mut seen = BTreeSet::new();
    ids.iter()
        .map(String::as_str)
        .filter(move |id| seen.insert(*id))
}

pub fn fetch_host_sources(reader: &Reader<'_>, target_id: &str) -> RepoResult<Vec<HostSource>> {
    reader.query_rows(
        "SELECT target_id, host_source_id
         FROM target_host_source
         WHERE target_id = ?1
         ORDER BY host_source_id ASC;",
        [target_id],
        |row| {
            Ok(HostSource {
                target_id: row.get("target_id")?,
                host_source_id: row.get("host_source_id")?,
            })
        },
    )
}

pub fn fetch_credential_sources(
    reader: &Reader<'_>,
    target_id: &str,
) -> RepoResult<Vec<CredentialSource>> {
    reader.query_rows(
        "SELECT target_id, credential_source_id
         FROM target_credential_source
         WHERE target_id = ?1
         ORDER BY credential_source_id ASC;",
        [target_id],
        |row| {
            Ok(CredentialSource {
                target_id: row.get("target_id")?,
                credential_source_id: row.get("credential_source_id")?,
            })
        },
    )
}
