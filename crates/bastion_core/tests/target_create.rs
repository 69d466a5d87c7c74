mod common;

use bastion_core::db::open_db_in_memory;
use bastion_core::oplog::{list_entries, OpType};
use bastion_core::{
    CallContext, CreateOptions, ErrorCode, SubtypeRegistry, Target, TargetRepository,
};
use common::{count_rows, messages, repo, tcp_target, EmptyKms, SCOPE};
use std::sync::Arc;

fn with_sources(hosts: &[&str], credentials: &[&str]) -> CreateOptions {
    CreateOptions {
        host_source_ids: hosts.iter().map(|id| id.to_string()).collect(),
        credential_source_ids: credentials.iter().map(|id| id.to_string()).collect(),
        ..CreateOptions::default()
    }
}

#[test]
fn create_persists_target_associations_and_one_entry() {
    let mut conn = open_db_in_memory().unwrap();
    let ctx = CallContext::background();
    let target = tcp_target("db-1");

    let snapshot = repo(&mut conn)
        .create_target(&ctx, &target, with_sources(&["hsst_b", "hsst_a"], &["clvlt_1"]))
        .unwrap();

    let created = &snapshot.target;
    assert!(created.public_id.starts_with("ttcp_"));
    assert_eq!(created.version, 1);
    assert_eq!(created.scope_id, SCOPE);
    assert_eq!(created.name, "db-1");
    assert_eq!(created.default_port, 5432);
    assert_eq!(created.session_max_seconds, 28800);
    assert_eq!(created.session_connection_limit, 1);
    assert!(created.create_time > 0);
    assert_eq!(created.create_time, created.update_time);

    let host_ids: Vec<&str> = snapshot
        .host_sources
        .iter()
        .map(|source| source.host_source_id.as_str())
        .collect();
    assert_eq!(host_ids, vec!["hsst_a", "hsst_b"]);
    assert_eq!(snapshot.credential_sources.len(), 1);
    assert_eq!(snapshot.credential_sources[0].target_id, created.public_id);

    let entries = list_entries(&conn, "target").unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.ticket_version, 1);
    assert_eq!(entry.key_id, format!("{SCOPE}_oplog"));
    assert_eq!(
        entry.metadata.first("resource-public-id"),
        Some(created.public_id.as_str())
    );
    assert_eq!(entry.metadata.first("resource-type"), Some("tcp target"));
    assert_eq!(entry.metadata.first("op-type"), Some("CREATE"));
    assert_eq!(entry.metadata.first("scope-id"), Some(SCOPE));

    let recorded = messages(entry);
    let tables: Vec<&str> = recorded.iter().map(|m| m.type_name.as_str()).collect();
    assert_eq!(
        tables,
        vec![
            "target",
            "target_tcp",
            "target_host_source",
            "target_host_source",
            "target_credential_source"
        ]
    );
    assert!(recorded.iter().all(|m| m.op_type == OpType::Create));
    assert_eq!(recorded[0].payload["name"], "db-1");
}

#[test]
fn create_leaves_caller_target_untouched() {
    let mut conn = open_db_in_memory().unwrap();
    let target = tcp_target("db-1");
    let before = target.clone();

    repo(&mut conn)
        .create_target(&CallContext::background(), &target, CreateOptions::default())
        .unwrap();

    assert_eq!(target, before);
    assert!(target.public_id.is_empty());
}

#[test]
fn create_uses_caller_supplied_public_id() {
    let mut conn = open_db_in_memory().unwrap();
    let options = CreateOptions {
        public_id: Some("ttcp_fixed00001".to_string()),
        ..CreateOptions::default()
    };

    let snapshot = repo(&mut conn)
        .create_target(&CallContext::background(), &tcp_target("db-1"), options)
        .unwrap();

    assert_eq!(snapshot.target.public_id, "ttcp_fixed00001");
    assert!(snapshot.host_sources.is_empty());
    assert!(snapshot.credential_sources.is_empty());
}

#[test]
fn zero_port_is_stored_as_null() {
    let mut conn = open_db_in_memory().unwrap();
    let mut target = tcp_target("db-1");
    target.default_port = 0;
    target.description.clear();

    let snapshot = repo(&mut conn)
        .create_target(&CallContext::background(), &target, CreateOptions::default())
        .unwrap();
    assert_eq!(snapshot.target.default_port, 0);

    let (port, description): (Option<i64>, Option<String>) = conn
        .query_row(
            "SELECT t.default_port, b.description
             FROM target_tcp t JOIN target b ON b.public_id = t.public_id
             WHERE t.public_id = ?1;",
            [&snapshot.target.public_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(port, None);
    assert_eq!(description, None);
}

#[test]
fn rejects_missing_or_unknown_type_before_storage() {
    let mut conn = open_db_in_memory().unwrap();
    let ctx = CallContext::background();

    let mut untyped = tcp_target("db-1");
    untyped.type_tag.clear();
    let err = repo(&mut conn)
        .create_target(&ctx, &untyped, CreateOptions::default())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidParameter);
    assert!(err.to_string().contains("missing target type"));

    let mut foreign = tcp_target("db-1");
    foreign.type_tag = "ssh".to_string();
    let err = repo(&mut conn)
        .create_target(&ctx, &foreign, CreateOptions::default())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidParameter);

    assert_eq!(count_rows(&conn, "target"), 0);
    assert_eq!(count_rows(&conn, "oplog_entry"), 0);
}

#[test]
fn subtype_validation_runs_before_storage() {
    let mut conn = open_db_in_memory().unwrap();
    let ctx = CallContext::background();

    let mut preset = tcp_target("db-1");
    preset.public_id = "ttcp_1234567890".to_string();
    let err = repo(&mut conn)
        .create_target(&ctx, &preset, CreateOptions::default())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidParameter);

    let unnamed = Target {
        name: String::new(),
        ..tcp_target("db-1")
    };
    let err = repo(&mut conn)
        .create_target(&ctx, &unnamed, CreateOptions::default())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidParameter);

    assert_eq!(count_rows(&conn, "target"), 0);
}

#[test]
fn duplicate_name_in_scope_is_not_unique() {
    let mut conn = open_db_in_memory().unwrap();
    let ctx = CallContext::background();

    repo(&mut conn)
        .create_target(&ctx, &tcp_target("db-1"), CreateOptions::default())
        .unwrap();
    let err = repo(&mut conn)
        .create_target(&ctx, &tcp_target("db-1"), with_sources(&["hsst_a"], &[]))
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::NotUnique);
    assert!(err
        .to_string()
        .contains(&format!("target db-1 already exists in scope {SCOPE}")));
    assert_eq!(count_rows(&conn, "target"), 1);
    assert_eq!(count_rows(&conn, "target_host_source"), 0);
    assert_eq!(count_rows(&conn, "oplog_entry"), 1);

    let mut elsewhere = tcp_target("db-1");
    elsewhere.scope_id = "p_other00001".to_string();
    repo(&mut conn)
        .create_target(&ctx, &elsewhere, CreateOptions::default())
        .expect("same name in another scope is allowed");
    assert_eq!(count_rows(&conn, "target"), 2);
}

#[test]
fn storage_failure_rolls_back_every_row() {
    let mut conn = open_db_in_memory().unwrap();
    let mut target = tcp_target("db-1");
    target.default_port = 70_000;

    let err = repo(&mut conn)
        .create_target(
            &CallContext::background(),
            &target,
            with_sources(&["hsst_a"], &["clvlt_1"]),
        )
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::Storage);
    assert!(err.to_string().contains("target id"));
    for table in [
        "target",
        "target_tcp",
        "target_host_source",
        "target_credential_source",
        "oplog_entry",
        "oplog_metadata",
    ] {
        assert_eq!(count_rows(&conn, table), 0, "{table} should be empty");
    }
}

#[test]
fn blank_source_id_is_rejected_without_writes() {
    let mut conn = open_db_in_memory().unwrap();

    let err = repo(&mut conn)
        .create_target(
            &CallContext::background(),
            &tcp_target("db-1"),
            with_sources(&["hsst_a", ""], &[]),
        )
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::InvalidParameter);
    assert_eq!(count_rows(&conn, "target"), 0);
}

#[test]
fn missing_oplog_key_fails_with_encryption_error() {
    let mut conn = open_db_in_memory().unwrap();
    let mut store = TargetRepository::new(
        &mut conn,
        Arc::new(SubtypeRegistry::with_builtin_subtypes()),
        Arc::new(EmptyKms),
    );

    let err = store
        .create_target(
            &CallContext::background(),
            &tcp_target("db-1"),
            CreateOptions::default(),
        )
        .unwrap_err();
    drop(store);

    assert_eq!(err.code(), ErrorCode::Encryption);
    assert!(err.to_string().contains("unable to get oplog wrapper"));
    assert_eq!(count_rows(&conn, "target"), 0);
}

#[test]
fn cancelled_call_writes_nothing() {
    let mut conn = open_db_in_memory().unwrap();
    let ctx = CallContext::background();
    ctx.cancel_handle().cancel();

    let err = repo(&mut conn)
        .create_target(&ctx, &tcp_target("db-1"), CreateOptions::default())
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::Cancelled);
    assert_eq!(count_rows(&conn, "target"), 0);
    assert_eq!(count_rows(&conn, "oplog_entry"), 0);
}

#[test]
fn lookup_and_list_return_committed_state() {
    let mut conn = open_db_in_memory().unwrap();
    let ctx = CallContext::background();
    let mut store = repo(&mut conn);

    let first = store
        .create_target(&ctx, &tcp_target("db-1"), with_sources(&["hsst_a"], &[]))
        .unwrap();
    let mut other_scope = tcp_target("db-2");
    other_scope.scope_id = "p_other00001".to_string();
    store
        .create_target(&ctx, &other_scope, CreateOptions::default())
        .unwrap();

    let found = store
        .lookup_target(&ctx, &first.target.public_id)
        .unwrap()
        .expect("target should exist");
    assert_eq!(found, first);
    assert!(store.lookup_target(&ctx, "ttcp_missing000").unwrap().is_none());

    let listed = store.list_targets(&ctx, &[SCOPE]).unwrap();
    assert_eq!(listed, vec![first.target.clone()]);
    assert_eq!(
        store.list_targets(&ctx, &[SCOPE, "p_other00001"]).unwrap().len(),
        2
    );
    assert_eq!(
        store.list_targets(&ctx, &[]).unwrap_err().code(),
        ErrorCode::InvalidParameter
    );
}
