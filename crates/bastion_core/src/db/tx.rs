//! Retrying transactional executor with oplog support.
//!
//! # Responsibility
//! - Run a unit of work inside one `IMMEDIATE` SQLite transaction.
//! - Re-run the whole unit on lock contention with exponential backoff.
//! - Give the unit a [`Reader`] and a [`Writer`]; every write returns the
//!   oplog message describing it, and `Writer::write_oplog_entry` commits
//!   those messages under a ticket.
//!
//! # Invariants
//! - Business rows and the oplog entry commit or roll back together.
//! - A ticket is redeemed at most once; redeeming a stale ticket fails.
//! - The call context is checked before every attempt and before commit.

use crate::context::CallContext;
use crate::error::{RepoError, RepoResult};
use crate::kms::KeyWrapper;
use crate::oplog::{EntryPayload, Metadata, OpType, OplogMessage, Ticket};
use log::{debug, warn};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Params, Row, TransactionBehavior};
use std::time::Duration;

/// Default attempt budget for repository transactions.
pub const STD_RETRY_COUNT: u32 = 20;

const TOUCH_SQL: &str = "CAST(strftime('%s', 'now') AS INTEGER) * 1000";

/// Exponential backoff between transaction attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ExpBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(10),
            max: Duration::from_secs(1),
        }
    }
}

impl ExpBackoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1_u32 << shift).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: ExpBackoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: STD_RETRY_COUNT,
            backoff: ExpBackoff::default(),
        }
    }
}

/// A row that can be inserted generically and described in the oplog.
pub trait Record {
    fn table_name(&self) -> &'static str;
    /// Column/value pairs written on insert, in column order.
    fn columns(&self) -> Vec<(&'static str, Value)>;
}

/// Partial update of one row keyed by a single text column.
#[derive(Debug, Clone)]
pub struct RowUpdate<'a> {
    pub table: &'static str,
    pub key_column: &'static str,
    pub key: &'a str,
    pub set: Vec<(&'static str, Value)>,
    pub null: Vec<&'static str>,
    /// When set, the row must carry this version; it is bumped by one.
    pub expected_version: Option<u32>,
    /// Column refreshed to the current time on every successful update.
    pub touch_column: Option<&'static str>,
}

/// Read access inside (or outside) a transaction.
pub struct Reader<'c> {
    conn: &'c Connection,
}

impl<'c> Reader<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn query_rows<T, P: Params>(
        &self,
        sql: &str,
        params: P,
        mut map: impl FnMut(&Row<'_>) -> RepoResult<T>,
    ) -> RepoResult<Vec<T>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut values = Vec::new();
        while let Some(row) = rows.next()? {
            values.push(map(row)?);
        }
        Ok(values)
    }

    pub fn query_opt<T, P: Params>(
        &self,
        sql: &str,
        params: P,
        map: impl FnMut(&Row<'_>) -> RepoResult<T>,
    ) -> RepoResult<Option<T>> {
        Ok(self.query_rows(sql, params, map)?.into_iter().next())
    }
}

/// Write access inside a transaction.
pub struct Writer<'c> {
    conn: &'c Connection,
}

impl<'c> Writer<'c> {
    fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Issues the serialization ticket for `aggregate_name`.
    pub fn get_ticket(&self, aggregate_name: &str) -> RepoResult<Ticket> {
        if aggregate_name.is_empty() {
            return Err(RepoError::invalid_parameter(
                "db.get_ticket",
                "missing aggregate name",
            ));
        }
        self.conn.execute(
            "INSERT OR IGNORE INTO oplog_ticket (name, version) VALUES (?1, 0);",
            [aggregate_name],
        )?;
        let version: i64 = self.conn.query_row(
            "SELECT version FROM oplog_ticket WHERE name = ?1;",
            [aggregate_name],
            |row| row.get(0),
        )?;
        Ok(Ticket::new(aggregate_name, version))
    }

    /// Inserts `record` and returns its oplog message.
    pub fn create(&self, record: &dyn Record) -> RepoResult<OplogMessage> {
        let columns = record.columns();
        let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders});",
            record.table_name(),
            names.join(", ")
        );
        self.conn
            .execute(&sql, params_from_iter(columns.iter().map(|(_, value)| value)))?;

        Ok(OplogMessage {
            type_name: record.table_name().to_string(),
            op_type: OpType::Create,
            payload: payload_of(&columns),
            field_mask: Vec::new(),
            null_mask: Vec::new(),
        })
    }

    /// Inserts every record and returns their messages in input order.
    pub fn create_items<R: Record>(&self, records: &[R]) -> RepoResult<Vec<OplogMessage>> {
        records
            .iter()
            .map(|record| self.create(record as &dyn Record))
            .collect()
    }

    /// Applies `update`; returns affected rows and, when one row changed, the
    /// oplog message describing it.
    pub fn update(&self, update: &RowUpdate<'_>) -> RepoResult<(usize, Option<OplogMessage>)> {
        let mut assignments: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        for (column, value) in &update.set {
            assignments.push(format!("{column} = ?"));
            values.push(value.clone());
        }
        for column in &update.null {
            assignments.push(format!("{column} = NULL"));
        }
        if update.expected_version.is_some() {
            assignments.push("version = version + 1".to_string());
        }
        if let Some(column) = update.touch_column {
            assignments.push(format!("{column} = {TOUCH_SQL}"));
        }
        if assignments.is_empty() {
            return Err(RepoError::invalid_parameter(
                "db.update",
                "no columns to update",
            ));
        }

        let mut sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            update.table,
            assignments.join(", "),
            update.key_column
        );
        values.push(Value::Text(update.key.to_string()));
        if let Some(version) = update.expected_version {
            sql.push_str(" AND version = ?");
            values.push(Value::Integer(i64::from(version)));
        }
        sql.push(';');

        let rows = self.conn.execute(&sql, params_from_iter(values))?;
        if rows != 1 {
            return Ok((rows, None));
        }

        let mut image = update.set.clone();
        image.push((update.key_column, Value::Text(update.key.to_string())));
        Ok((
            rows,
            Some(OplogMessage {
                type_name: update.table.to_string(),
                op_type: OpType::Update,
                payload: payload_of(&image),
                field_mask: update.set.iter().map(|(name, _)| name.to_string()).collect(),
                null_mask: update.null.iter().map(|name| name.to_string()).collect(),
            }),
        ))
    }

    /// Commits one oplog entry carrying `messages`, redeeming `ticket`.
    pub fn write_oplog_entry(
        &self,
        wrapper: &dyn KeyWrapper,
        ticket: &Ticket,
        metadata: &Metadata,
        messages: Vec<OplogMessage>,
    ) -> RepoResult<i64> {
        const OP: &str = "db.write_oplog_entry";
        if messages.is_empty() {
            return Err(RepoError::invalid_parameter(OP, "missing oplog messages"));
        }
        if metadata.is_empty() {
            return Err(RepoError::invalid_parameter(OP, "missing oplog metadata"));
        }

        let plaintext = serde_json::to_vec(&EntryPayload { messages })?;
        let data = wrapper.wrap(&plaintext)?;

        let redeemed = self.conn.execute(
            "UPDATE oplog_ticket SET version = version + 1 WHERE name = ?1 AND version = ?2;",
            params![ticket.name(), ticket.version()],
        )?;
        if redeemed != 1 {
            return Err(RepoError::InvalidData(format!(
                "ticket {} at version {} is stale",
                ticket.name(),
                ticket.version()
            )));
        }

        self.conn.execute(
            "INSERT INTO oplog_entry (aggregate_name, ticket_version, key_id, data)
             VALUES (?1, ?2, ?3, ?4);",
            params![
                ticket.name(),
                ticket.version() + 1,
                wrapper.key_id(),
                data
            ],
        )?;
        let entry_id = self.conn.last_insert_rowid();

        let mut stmt = self.conn.prepare(
            "INSERT INTO oplog_metadata (entry_id, key, value) VALUES (?1, ?2, ?3);",
        )?;
        for (key, value) in metadata.iter() {
            stmt.execute(params![entry_id, key, value])?;
        }

        debug!(
            "event=oplog_write module=db status=ok aggregate={} ticket_version={} entry_id={entry_id}",
            ticket.name(),
            ticket.version() + 1
        );
        Ok(entry_id)
    }
}

/// Runs `body` in one transaction, retrying on lock contention.
///
/// `body` may run more than once and must not keep side effects outside the
/// transaction between attempts.
pub fn run_in_transaction<T>(
    conn: &mut Connection,
    ctx: &CallContext,
    policy: &RetryPolicy,
    mut body: impl FnMut(&Reader<'_>, &Writer<'_>) -> RepoResult<T>,
) -> RepoResult<T> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        ctx.check()?;
        match run_once(conn, ctx, &mut body) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt <= policy.max_retries => {
                let delay = policy.backoff.delay(attempt);
                warn!(
                    "event=tx_retry module=db status=retry attempt={attempt} delay_ms={} error={err}",
                    delay.as_millis()
                );
                std::thread::sleep(delay);
            }
            Err(err) if err.is_transient() => {
                return Err(err.wrap(
                    "db.run_in_transaction",
                    format!("gave up after {attempt} attempts"),
                ));
            }
            Err(err) => return Err(err),
        }
    }
}

fn run_once<T>(
    conn: &mut Connection,
    ctx: &CallContext,
    body: &mut impl FnMut(&Reader<'_>, &Writer<'_>) -> RepoResult<T>,
) -> RepoResult<T> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = body(&Reader::new(&tx), &Writer::new(&tx))?;
    ctx.check()?;
    tx.commit()?;
    Ok(value)
}

fn payload_of(columns: &[(&'static str, Value)]) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    for (name, value) in columns {
        let json = match value {
            Value::Null => serde_json::Value::Null,
            Value::Integer(number) => serde_json::Value::from(*number),
            Value::Real(number) => serde_json::Value::from(*number),
            Value::Text(text) => serde_json::Value::from(text.as_str()),
            Value::Blob(bytes) => serde_json::Value::from(bytes.clone()),
        };
        object.insert(name.to_string(), json);
    }
    serde_json::Value::Object(object)
}
