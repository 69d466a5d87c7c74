//! Target repository: create and update targets with co-committed oplog
//! entries.
//!
//! # Responsibility
//! - Dispatch validation and id minting to the subtype hooks registered for
//!   the target's type tag.
//! - Enforce the update field-mask allow-list and optimistic versioning.
//! - Write business rows and exactly one oplog entry per mutation in the same
//!   retrying transaction, then re-read what was committed.
//!
//! # Invariants
//! - Parameter and field-mask errors are returned before any storage I/O.
//! - The caller's `Target` is never mutated; the repository works on a clone.
//! - A stale version is reported as `rows_updated == 0`, not as an error.
//! - Logs carry ids and counts only, never names or descriptions.

use crate::context::CallContext;
use crate::db::tx::{run_in_transaction, Reader, RetryPolicy, RowUpdate};
use crate::error::{RepoError, RepoResult};
use crate::kms::{KeyPurpose, KeyWrapper, WrapperProvider};
use crate::oplog::OpType;
use crate::target::hooks::{SubtypeRegistry, TargetHooks};
use crate::target::source::{
    build_credential_sources, build_host_sources, fetch_credential_sources, fetch_host_sources,
    CredentialSource, HostSource,
};
use crate::target::{
    build_update_paths, ExtensionRow, FieldStorage, Target, TargetField, TargetRow,
    TARGET_AGGREGATE, TARGET_TABLE,
};
use log::{info, warn};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};
use std::sync::Arc;
use std::time::Instant;

const TARGET_SELECT_SQL: &str = "SELECT
    public_id,
    scope_id,
    type,
    name,
    description,
    session_max_seconds,
    session_connection_limit,
    worker_filter,
    version,
    create_time,
    update_time
FROM target";

/// Options accepted by [`TargetRepository::create_target`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Used verbatim instead of a minted id when set.
    pub public_id: Option<String>,
    pub host_source_ids: Vec<String>,
    pub credential_source_ids: Vec<String>,
}

/// A persisted target together with its committed associations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSnapshot {
    pub target: Target,
    pub host_sources: Vec<HostSource>,
    pub credential_sources: Vec<CredentialSource>,
}

/// Result of a version-checked mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// `None` when the expected version did not match.
    pub snapshot: Option<TargetSnapshot>,
    pub rows_updated: usize,
}

impl UpdateOutcome {
    fn stale() -> Self {
        Self {
            snapshot: None,
            rows_updated: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SourceKind {
    Host,
    Credential,
}

/// SQLite-backed target repository.
pub struct TargetRepository<'conn> {
    conn: &'conn mut Connection,
    registry: Arc<SubtypeRegistry>,
    kms: Arc<dyn WrapperProvider>,
    retry: RetryPolicy,
}

impl<'conn> TargetRepository<'conn> {
    pub fn new(
        conn: &'conn mut Connection,
        registry: Arc<SubtypeRegistry>,
        kms: Arc<dyn WrapperProvider>,
    ) -> Self {
        Self {
            conn,
            registry,
            kms,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Inserts `target` with its initial associations and one `CREATE` oplog
    /// entry.
    ///
    /// # Errors
    /// - `InvalidParameter` for a missing or unsupported type, failed subtype
    ///   validation or blank association ids.
    /// - `NotUnique` when the name is taken in the scope.
    pub fn create_target(
        &mut self,
        ctx: &CallContext,
        target: &Target,
        options: CreateOptions,
    ) -> RepoResult<TargetSnapshot> {
        const OP: &str = "target.create_target";
        let started_at = Instant::now();
        ctx.check()?;

        let hooks = self.hooks_for(OP, &target.type_tag)?;
        hooks.validate_create(target)?;

        let mut new_target = target.clone();
        new_target.public_id = match options.public_id {
            Some(id) if !id.is_empty() => id,
            _ => hooks
                .new_target_id()
                .map_err(|err| err.wrap(OP, "unable to mint public id"))?,
        };

        let wrapper = self.oplog_wrapper(OP, ctx, &new_target.scope_id)?;

        let host_sources = build_host_sources(&new_target.public_id, &options.host_source_ids)
            .map_err(|err| err.wrap(OP, "unable to create in memory target host source"))?;
        let credential_sources =
            build_credential_sources(&new_target.public_id, &options.credential_source_ids)
                .map_err(|err| {
                    err.wrap(OP, "unable to create in memory target credential source")
                })?;

        let metadata = new_target.oplog(hooks.resource_type(), OpType::Create);
        let registry = &self.registry;
        let result = run_in_transaction(&mut *self.conn, ctx, &self.retry, |reader, w| {
            let ticket = w
                .get_ticket(TARGET_AGGREGATE)
                .map_err(|err| err.wrap(OP, "unable to get ticket"))?;

            let mut messages =
                Vec::with_capacity(2 + host_sources.len() + credential_sources.len());
            messages.push(
                w.create(&TargetRow(&new_target))
                    .map_err(|err| err.wrap(OP, "unable to create target"))?,
            );
            messages.push(
                w.create(&ExtensionRow {
                    table: hooks.extension_table(),
                    target: &new_target,
                })
                .map_err(|err| err.wrap(OP, "unable to create target extension"))?,
            );

            let mut returned_hosts = Vec::new();
            if !host_sources.is_empty() {
                messages.extend(
                    w.create_items(&host_sources)
                        .map_err(|err| err.wrap(OP, "unable to add host sources"))?,
                );
                returned_hosts = fetch_host_sources(reader, &new_target.public_id)
                    .map_err(|err| err.wrap(OP, "unable to read host sources"))?;
            }

            let mut returned_credentials = Vec::new();
            if !credential_sources.is_empty() {
                messages.extend(
                    w.create_items(&credential_sources)
                        .map_err(|err| err.wrap(OP, "unable to add credential sources"))?,
                );
                returned_credentials = fetch_credential_sources(reader, &new_target.public_id)
                    .map_err(|err| err.wrap(OP, "unable to read credential sources"))?;
            }

            let persisted = read_target(reader, registry, &new_target.public_id)?
                .ok_or_else(|| {
                    RepoError::InvalidData("created target is not readable".to_string())
                })?;

            w.write_oplog_entry(wrapper.as_ref(), &ticket, &metadata, messages)
                .map_err(|err| err.wrap(OP, "unable to write oplog"))?;

            Ok(TargetSnapshot {
                target: persisted,
                host_sources: returned_hosts,
                credential_sources: returned_credentials,
            })
        });

        match result {
            Ok(snapshot) => {
                info!(
                    "event=target_create module=target status=ok type={} public_id={} host_sources={} credential_sources={} duration_ms={}",
                    hooks.type_tag(),
                    snapshot.target.public_id,
                    snapshot.host_sources.len(),
                    snapshot.credential_sources.len(),
                    started_at.elapsed().as_millis()
                );
                Ok(snapshot)
            }
            Err(err) => {
                warn!(
                    "event=target_create module=target status=error type={} public_id={} error_code={:?} duration_ms={}",
                    hooks.type_tag(),
                    new_target.public_id,
                    err.code(),
                    started_at.elapsed().as_millis()
                );
                if err.is_unique_violation() {
                    return Err(RepoError::NotUnique {
                        op: OP,
                        message: format!(
                            "target {} already exists in scope {}",
                            target.name, target.scope_id
                        ),
                    });
                }
                Err(err.wrap(OP, format!("failed for {} target id", new_target.public_id)))
            }
        }
    }

    /// Applies the fields named by `field_mask_paths` from `target` to the
    /// stored target, provided it is still at `version`.
    ///
    /// Masked fields holding a zero value are set to `NULL`, except the two
    /// session limits whose zero is a real setting.
    ///
    /// # Errors
    /// - `InvalidParameter` for a missing or unsupported type, failed subtype
    ///   validation or a zero version.
    /// - `InvalidFieldMask` for a path outside the allow-list.
    /// - `EmptyFieldMask` when nothing would change.
    /// - `NotFound` when no target has this public id.
    /// - `NotUnique` when the new name is taken in the scope.
    pub fn update_target(
        &mut self,
        ctx: &CallContext,
        target: &Target,
        version: u32,
        field_mask_paths: &[&str],
    ) -> RepoResult<UpdateOutcome> {
        const OP: &str = "target.update_target";
        let started_at = Instant::now();
        ctx.check()?;

        let hooks = self.hooks_for(OP, &target.type_tag)?;
        hooks.validate_update(target)?;
        if version == 0 {
            return Err(RepoError::invalid_parameter(OP, "missing version"));
        }

        let plan = build_update_paths(target, field_mask_paths)
            .map_err(|path| RepoError::InvalidFieldMask { op: OP, path })?;
        if plan.is_empty() {
            return Err(RepoError::EmptyFieldMask { op: OP });
        }

        let target = target.clone();
        let scope_id = self.stored_scope(OP, &target)?;
        let wrapper = self.oplog_wrapper(OP, ctx, &scope_id)?;

        let base_update = RowUpdate {
            table: TARGET_TABLE,
            key_column: "public_id",
            key: &target.public_id,
            set: columns_for(&plan.set, FieldStorage::Base, &target),
            null: null_columns_for(&plan.null, FieldStorage::Base),
            expected_version: Some(version),
            touch_column: Some("update_time"),
        };
        let extension_update = RowUpdate {
            table: hooks.extension_table(),
            key_column: "public_id",
            key: &target.public_id,
            set: columns_for(&plan.set, FieldStorage::Extension, &target),
            null: null_columns_for(&plan.null, FieldStorage::Extension),
            expected_version: None,
            touch_column: None,
        };

        let registry = &self.registry;
        let result = run_in_transaction(&mut *self.conn, ctx, &self.retry, |reader, w| {
            let ticket = w
                .get_ticket(TARGET_AGGREGATE)
                .map_err(|err| err.wrap(OP, "unable to get ticket"))?;

            let (rows, message) = w
                .update(&base_update)
                .map_err(|err| err.wrap(OP, "unable to update target"))?;
            let Some(message) = message else {
                return Ok(UpdateOutcome::stale());
            };
            let mut messages = vec![message];

            if !extension_update.set.is_empty() || !extension_update.null.is_empty() {
                let (extension_rows, extension_message) = w
                    .update(&extension_update)
                    .map_err(|err| err.wrap(OP, "unable to update target extension"))?;
                match extension_message {
                    Some(message) => messages.push(message),
                    None => {
                        return Err(RepoError::InvalidData(format!(
                            "expected one extension row for {}, updated {extension_rows}",
                            target.public_id
                        )))
                    }
                }
            }

            let snapshot = read_snapshot(reader, registry, &target.public_id)?
                .ok_or_else(|| {
                    RepoError::InvalidData("updated target is not readable".to_string())
                })?;
            let metadata = snapshot
                .target
                .oplog(hooks.resource_type(), OpType::Update);
            w.write_oplog_entry(wrapper.as_ref(), &ticket, &metadata, messages)
                .map_err(|err| err.wrap(OP, "unable to write oplog"))?;

            Ok(UpdateOutcome {
                snapshot: Some(snapshot),
                rows_updated: rows,
            })
        });

        match result {
            Ok(outcome) if outcome.rows_updated == 0 => {
                warn!(
                    "event=target_update module=target status=stale public_id={} expected_version={version} duration_ms={}",
                    target.public_id,
                    started_at.elapsed().as_millis()
                );
                Ok(outcome)
            }
            Ok(outcome) => {
                info!(
                    "event=target_update module=target status=ok public_id={} set_fields={} null_fields={} duration_ms={}",
                    target.public_id,
                    plan.set.len(),
                    plan.null.len(),
                    started_at.elapsed().as_millis()
                );
                Ok(outcome)
            }
            Err(err) => {
                warn!(
                    "event=target_update module=target status=error public_id={} error_code={:?} duration_ms={}",
                    target.public_id,
                    err.code(),
                    started_at.elapsed().as_millis()
                );
                if err.is_unique_violation() {
                    return Err(RepoError::NotUnique {
                        op: OP,
                        message: format!(
                            "target {} already exists in scope {scope_id}",
                            target.name
                        ),
                    });
                }
                Err(err.wrap(OP, format!("failed for {}", target.public_id)))
            }
        }
    }

    /// Associates host sets with an existing target at `version`.
    pub fn add_target_host_sources(
        &mut self,
        ctx: &CallContext,
        public_id: &str,
        version: u32,
        host_source_ids: &[String],
    ) -> RepoResult<UpdateOutcome> {
        self.add_sources(
            "target.add_target_host_sources",
            ctx,
            public_id,
            version,
            SourceKind::Host,
            host_source_ids,
        )
    }

    /// Associates credential libraries with an existing target at `version`.
    pub fn add_target_credential_sources(
        &mut self,
        ctx: &CallContext,
        public_id: &str,
        version: u32,
        credential_source_ids: &[String],
    ) -> RepoResult<UpdateOutcome> {
        self.add_sources(
            "target.add_target_credential_sources",
            ctx,
            public_id,
            version,
            SourceKind::Credential,
            credential_source_ids,
        )
    }

    /// Reads one target and its associations.
    pub fn lookup_target(
        &self,
        ctx: &CallContext,
        public_id: &str,
    ) -> RepoResult<Option<TargetSnapshot>> {
        ctx.check()?;
        if public_id.is_empty() {
            return Err(RepoError::invalid_parameter(
                "target.lookup_target",
                "missing public id",
            ));
        }
        read_snapshot(&Reader::new(&*self.conn), &self.registry, public_id)
    }

    /// Lists targets in any of `scope_ids`, ordered by public id.
    pub fn list_targets(&self, ctx: &CallContext, scope_ids: &[&str]) -> RepoResult<Vec<Target>> {
        ctx.check()?;
        if scope_ids.is_empty() {
            return Err(RepoError::invalid_parameter(
                "target.list_targets",
                "missing scope ids",
            ));
        }

        let placeholders = vec!["?"; scope_ids.len()].join(", ");
        let reader = Reader::new(&*self.conn);
        let ids = reader.query_rows(
            &format!(
                "SELECT public_id FROM target WHERE scope_id IN ({placeholders}) ORDER BY public_id ASC;"
            ),
            params_from_iter(scope_ids.iter()),
            |row| Ok(row.get::<_, String>(0)?),
        )?;

        let mut targets = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(target) = read_target(&reader, &self.registry, &id)? {
                targets.push(target);
            }
        }
        Ok(targets)
    }

    fn add_sources(
        &mut self,
        op: &'static str,
        ctx: &CallContext,
        public_id: &str,
        version: u32,
        kind: SourceKind,
        ids: &[String],
    ) -> RepoResult<UpdateOutcome> {
        let started_at = Instant::now();
        ctx.check()?;
        if public_id.is_empty() {
            return Err(RepoError::invalid_parameter(op, "missing public id"));
        }
        if version == 0 {
            return Err(RepoError::invalid_parameter(op, "missing version"));
        }
        if ids.is_empty() {
            return Err(RepoError::invalid_parameter(op, "missing source ids"));
        }

        let (host_sources, credential_sources) = match kind {
            SourceKind::Host => (build_host_sources(public_id, ids)?, Vec::new()),
            SourceKind::Credential => (Vec::new(), build_credential_sources(public_id, ids)?),
        };

        let (scope_id, type_tag) = load_identity(&Reader::new(&*self.conn), public_id)?.ok_or_else(
            || RepoError::NotFound {
                op,
                message: format!("target {public_id}"),
            },
        )?;
        let hooks = self.hooks_for(op, &type_tag)?;
        let wrapper = self.oplog_wrapper(op, ctx, &scope_id)?;

        let version_bump = RowUpdate {
            table: TARGET_TABLE,
            key_column: "public_id",
            key: public_id,
            set: Vec::new(),
            null: Vec::new(),
            expected_version: Some(version),
            touch_column: Some("update_time"),
        };

        let registry = &self.registry;
        let result = run_in_transaction(&mut *self.conn, ctx, &self.retry, |reader, w| {
            let ticket = w
                .get_ticket(TARGET_AGGREGATE)
                .map_err(|err| err.wrap(op, "unable to get ticket"))?;

            let (rows, message) = w
                .update(&version_bump)
                .map_err(|err| err.wrap(op, "unable to update target version"))?;
            let Some(message) = message else {
                return Ok(UpdateOutcome::stale());
            };
            let mut messages = vec![message];
            messages.extend(
                w.create_items(&host_sources)
                    .map_err(|err| err.wrap(op, "unable to add host sources"))?,
            );
            messages.extend(
                w.create_items(&credential_sources)
                    .map_err(|err| err.wrap(op, "unable to add credential sources"))?,
            );

            let snapshot = read_snapshot(reader, registry, public_id)?
                .ok_or_else(|| {
                    RepoError::InvalidData("updated target is not readable".to_string())
                })?;
            let metadata = snapshot
                .target
                .oplog(hooks.resource_type(), OpType::Update);
            w.write_oplog_entry(wrapper.as_ref(), &ticket, &metadata, messages)
                .map_err(|err| err.wrap(op, "unable to write oplog"))?;

            Ok(UpdateOutcome {
                snapshot: Some(snapshot),
                rows_updated: rows,
            })
        });

        match result {
            Ok(outcome) => {
                info!(
                    "event=target_add_sources module=target status=ok kind={kind:?} public_id={public_id} added={} rows_updated={} duration_ms={}",
                    ids.len(),
                    outcome.rows_updated,
                    started_at.elapsed().as_millis()
                );
                Ok(outcome)
            }
            Err(err) => {
                warn!(
                    "event=target_add_sources module=target status=error kind={kind:?} public_id={public_id} error_code={:?} duration_ms={}",
                    err.code(),
                    started_at.elapsed().as_millis()
                );
                if err.is_unique_violation() {
                    return Err(RepoError::NotUnique {
                        op,
                        message: format!("source already associated with target {public_id}"),
                    });
                }
                Err(err.wrap(op, format!("failed for {public_id}")))
            }
        }
    }

    fn hooks_for(&self, op: &'static str, type_tag: &str) -> RepoResult<Arc<dyn TargetHooks>> {
        if type_tag.is_empty() {
            return Err(RepoError::invalid_parameter(op, "missing target type"));
        }
        self.registry.get(type_tag).ok_or_else(|| {
            RepoError::invalid_parameter(op, format!("unsupported target type {type_tag}"))
        })
    }

    fn oplog_wrapper(
        &self,
        op: &'static str,
        ctx: &CallContext,
        scope_id: &str,
    ) -> RepoResult<Arc<dyn KeyWrapper>> {
        self.kms
            .get_wrapper(ctx, scope_id, KeyPurpose::Oplog)
            .map_err(|err| RepoError::from(err).wrap(op, "unable to get oplog wrapper"))
    }

    /// Scope of the stored target, checking that its type matches `target`.
    fn stored_scope(&self, op: &'static str, target: &Target) -> RepoResult<String> {
        let (scope_id, type_tag) = load_identity(&Reader::new(&*self.conn), &target.public_id)?
            .ok_or_else(|| RepoError::NotFound {
                op,
                message: format!("target {}", target.public_id),
            })?;
        if type_tag != target.type_tag {
            return Err(RepoError::invalid_parameter(
                op,
                format!(
                    "target {} is a {type_tag} target, not {}",
                    target.public_id, target.type_tag
                ),
            ));
        }
        Ok(scope_id)
    }
}

fn columns_for(
    fields: &[TargetField],
    storage: FieldStorage,
    target: &Target,
) -> Vec<(&'static str, Value)> {
    fields
        .iter()
        .filter(|field| field.storage() == storage)
        .map(|field| (field.column(), field.value(target)))
        .collect()
}

fn null_columns_for(fields: &[TargetField], storage: FieldStorage) -> Vec<&'static str> {
    fields
        .iter()
        .filter(|field| field.storage() == storage)
        .map(|field| field.column())
        .collect()
}

fn load_identity(reader: &Reader<'_>, public_id: &str) -> RepoResult<Option<(String, String)>> {
    reader.query_opt(
        "SELECT scope_id, type FROM target WHERE public_id = ?1;",
        [public_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
}

fn read_snapshot(
    reader: &Reader<'_>,
    registry: &SubtypeRegistry,
    public_id: &str,
) -> RepoResult<Option<TargetSnapshot>> {
    let Some(target) = read_target(reader, registry, public_id)? else {
        return Ok(None);
    };
    Ok(Some(TargetSnapshot {
        host_sources: fetch_host_sources(reader, public_id)?,
        credential_sources: fetch_credential_sources(reader, public_id)?,
        target,
    }))
}

/// Reads the aggregate-root row and the owning subtype's extension row.
fn read_target(
    reader: &Reader<'_>,
    registry: &SubtypeRegistry,
    public_id: &str,
) -> RepoResult<Option<Target>> {
    let Some(mut target) = reader.query_opt(
        &format!("{TARGET_SELECT_SQL} WHERE public_id = ?1;"),
        [public_id],
        |row| parse_target_row(row, registry),
    )?
    else {
        return Ok(None);
    };

    let Some(hooks) = registry.get(&target.type_tag) else {
        return Err(RepoError::InvalidData(format!(
            "unsupported target type `{}` in target.type",
            target.type_tag
        )));
    };
    let port = reader.query_opt(
        &format!(
            "SELECT default_port FROM {} WHERE public_id = ?1;",
            hooks.extension_table()
        ),
        [public_id],
        |row| Ok(row.get::<_, Option<i64>>(0)?),
    )?;
    target.default_port = match port.flatten() {
        None => 0,
        Some(value) => u32::try_from(value).map_err(|_| {
            RepoError::InvalidData(format!(
                "invalid default_port `{value}` in {}",
                hooks.extension_table()
            ))
        })?,
    };
    Ok(Some(target))
}

fn parse_target_row(row: &Row<'_>, registry: &SubtypeRegistry) -> RepoResult<Target> {
    let public_id: String = row.get("public_id")?;
    let type_tag: String = row.get("type")?;
    let hooks = registry.get(&type_tag).ok_or_else(|| {
        RepoError::InvalidData(format!("unsupported target type `{type_tag}` in target.type"))
    })?;

    let version = column_u32(row, "version")?;
    let (mut target, _) = hooks.alloc(&public_id, version, OpType::Update);
    target.scope_id = row.get("scope_id")?;
    target.name = row.get::<_, Option<String>>("name")?.unwrap_or_default();
    target.description = row
        .get::<_, Option<String>>("description")?
        .unwrap_or_default();
    target.session_max_seconds = column_u32(row, "session_max_seconds")?;
    let limit: i64 = row.get("session_connection_limit")?;
    target.session_connection_limit = i32::try_from(limit).map_err(|_| {
        RepoError::InvalidData(format!(
            "invalid session_connection_limit `{limit}` in target"
        ))
    })?;
    target.worker_filter = row
        .get::<_, Option<String>>("worker_filter")?
        .unwrap_or_default();
    target.create_time = row.get("create_time")?;
    target.update_time = row.get("update_time")?;
    Ok(target)
}

fn column_u32(row: &Row<'_>, column: &str) -> RepoResult<u32> {
    let value: i64 = row.get(column)?;
    u32::try_from(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid {column} `{value}` in target")))
}
