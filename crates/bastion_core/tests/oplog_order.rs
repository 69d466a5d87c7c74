mod common;

use bastion_core::db::{open_db, open_db_in_memory};
use bastion_core::oplog::{list_entries, list_entries_tagged};
use bastion_core::{CallContext, CreateOptions, Target};
use common::{repo, tcp_target};
use std::thread;

const WRITERS: usize = 4;
const CREATES_PER_WRITER: usize = 5;

#[test]
fn concurrent_writers_get_contiguous_ticket_versions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("targets.db");
    drop(open_db(&path).unwrap());

    let handles: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let path = path.clone();
            thread::spawn(move || {
                let mut conn = open_db(&path).unwrap();
                for n in 0..CREATES_PER_WRITER {
                    repo(&mut conn)
                        .create_target(
                            &CallContext::background(),
                            &tcp_target(&format!("db-{writer}-{n}")),
                            CreateOptions::default(),
                        )
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let conn = open_db(&path).unwrap();
    let versions: Vec<i64> = list_entries(&conn, "target")
        .unwrap()
        .iter()
        .map(|entry| entry.ticket_version)
        .collect();
    let expected: Vec<i64> = (1..=(WRITERS * CREATES_PER_WRITER) as i64).collect();
    assert_eq!(versions, expected);

    let ticket: i64 = conn
        .query_row(
            "SELECT version FROM oplog_ticket WHERE name = 'target';",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(ticket, (WRITERS * CREATES_PER_WRITER) as i64);
}

#[test]
fn entries_can_be_filtered_by_resource() {
    let mut conn = open_db_in_memory().unwrap();
    let ctx = CallContext::background();

    let first = repo(&mut conn)
        .create_target(&ctx, &tcp_target("db-1"), CreateOptions::default())
        .unwrap()
        .target;
    repo(&mut conn)
        .create_target(&ctx, &tcp_target("db-2"), CreateOptions::default())
        .unwrap();

    let changes = Target {
        public_id: first.public_id.clone(),
        type_tag: "tcp".to_string(),
        name: "db-1-renamed".to_string(),
        ..Target::default()
    };
    repo(&mut conn)
        .update_target(&ctx, &changes, 1, &["Name"])
        .unwrap();

    let tagged = list_entries_tagged(
        &conn,
        "target",
        "resource-public-id",
        &first.public_id,
    )
    .unwrap();
    let versions: Vec<i64> = tagged.iter().map(|entry| entry.ticket_version).collect();
    assert_eq!(versions, vec![1, 3]);
    assert_eq!(tagged[1].metadata.first("op-type"), Some("UPDATE"));
}

#[test]
fn failed_mutation_does_not_consume_a_ticket() {
    let mut conn = open_db_in_memory().unwrap();
    let ctx = CallContext::background();

    repo(&mut conn)
        .create_target(&ctx, &tcp_target("db-1"), CreateOptions::default())
        .unwrap();
    assert!(repo(&mut conn)
        .create_target(&ctx, &tcp_target("db-1"), CreateOptions::default())
        .is_err());
    repo(&mut conn)
        .create_target(&ctx, &tcp_target("db-2"), CreateOptions::default())
        .unwrap();

    let versions: Vec<i64> = list_entries(&conn, "target")
        .unwrap()
        .iter()
        .map(|entry| entry.ticket_version)
        .collect();
    assert_eq!(versions, vec![1, 2]);
}
