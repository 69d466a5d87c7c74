#![allow(dead_code)]

use bastion_core::kms::{KeyPurpose, KeyWrapper, KmsError, WrapperProvider};
use bastion_core::oplog::{decode_messages, OplogEntry, OplogMessage};
use bastion_core::target::tcp::new_tcp_target;
use bastion_core::{CallContext, SubtypeRegistry, Target, TargetOptions, TargetRepository};
use rusqlite::Connection;
use std::sync::Arc;

pub const SCOPE: &str = "p_1234567890";

/// Identity wrapper whose key id names its scope.
pub struct PlainWrapper {
    key_id: String,
}

impl KeyWrapper for PlainWrapper {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
        Ok(plaintext.to_vec())
    }
}

pub struct FakeKms;

impl WrapperProvider for FakeKms {
    fn get_wrapper(
        &self,
        _ctx: &CallContext,
        scope_id: &str,
        purpose: KeyPurpose,
    ) -> Result<Arc<dyn KeyWrapper>, KmsError> {
        if scope_id.is_empty() {
            return Err(KmsError::MissingScope);
        }
        Ok(Arc::new(PlainWrapper {
            key_id: format!("{scope_id}_{}", purpose.as_str()),
        }))
    }
}

/// Provider with no keys at all.
pub struct EmptyKms;

impl WrapperProvider for EmptyKms {
    fn get_wrapper(
        &self,
        _ctx: &CallContext,
        scope_id: &str,
        purpose: KeyPurpose,
    ) -> Result<Arc<dyn KeyWrapper>, KmsError> {
        Err(KmsError::KeyNotFound {
            scope_id: scope_id.to_string(),
            purpose,
        })
    }
}

pub fn repo(conn: &mut Connection) -> TargetRepository<'_> {
    TargetRepository::new(
        conn,
        Arc::new(SubtypeRegistry::with_builtin_subtypes()),
        Arc::new(FakeKms),
    )
}

pub fn tcp_target(name: &str) -> Target {
    new_tcp_target(
        SCOPE,
        TargetOptions {
            name: Some(name.to_string()),
            description: Some("primary database".to_string()),
            default_port: Some(5432),
            ..TargetOptions::default()
        },
    )
    .expect("tcp target should build")
}

pub fn count_rows(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table};"), [], |row| {
        row.get(0)
    })
    .expect("count query should succeed")
}

pub fn messages(entry: &OplogEntry) -> Vec<OplogMessage> {
    decode_messages(&entry.data).expect("entry payload should decode")
}
