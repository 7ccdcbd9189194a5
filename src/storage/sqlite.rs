//! SQLite-backed document store.
//!
//! Every collection lives in one `documents` table as JSON text. The database
//! runs in WAL mode with a busy timeout so separate worker processes can
//! append and update the same collections. Updates touch a single row inside
//! an immediate transaction, so concurrent appends are never rewritten.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, TransactionBehavior};
use serde_json::Value;

use super::{set_field, DocCursor, DocumentStore, Filter, Result, StoreError};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
// Rows fetched per round trip while scanning.
const SCAN_PAGE: i64 = 500;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    doc TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS documents_collection ON documents (collection, id);
";

pub struct SqliteStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file and make sure the schema exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let opened = path.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            if let Some(parent) = opened.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&opened)?;
            configure_connection(&conn)?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(join_error)??;

        Ok(SqliteStore {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        run_blocking(Arc::clone(&self.conn), f).await
    }
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

async fn run_blocking<T, F>(conn: Arc<Mutex<Connection>>, f: F) -> Result<T>
where
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = conn
            .lock()
            .map_err(|_| StoreError::WriteRejected("connection lock poisoned".to_string()))?;
        f(&mut *conn)
    })
    .await
    .map_err(join_error)?
}

fn join_error(e: tokio::task::JoinError) -> StoreError {
    StoreError::Io(io::Error::new(io::ErrorKind::Other, e))
}

fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', "\\\""))
}

/// SQL prefilter for `filter`. It may let through documents the filter
/// rejects but never drops one it accepts; callers re-check with
/// [`Filter::matches`].
fn where_clause(filter: &Filter, params: &mut Vec<SqlValue>) -> String {
    match filter {
        Filter::All => "1".to_string(),
        Filter::Absent(field) => {
            params.push(SqlValue::Text(json_path(field)));
            "json_type(doc, ?) IS NULL".to_string()
        }
        Filter::AtMost(field, bound) => {
            params.push(SqlValue::Text(json_path(field)));
            params.push(SqlValue::Integer(*bound));
            "CAST(json_extract(doc, ?) AS INTEGER) <= ?".to_string()
        }
        Filter::Eq(field, expected) => {
            let literal = match expected {
                Value::String(s) => SqlValue::Text(s.clone()),
                Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => SqlValue::Integer(i),
                    None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
                },
                Value::Null => {
                    params.push(SqlValue::Text(json_path(field)));
                    return "json_type(doc, ?) = 'null'".to_string();
                }
                // compared in Rust
                Value::Array(_) | Value::Object(_) => return "1".to_string(),
            };
            params.push(SqlValue::Text(json_path(field)));
            params.push(literal);
            "json_extract(doc, ?) = ?".to_string()
        }
        Filter::And(filters) if filters.is_empty() => "1".to_string(),
        Filter::And(filters) => filters
            .iter()
            .map(|f| format!("({})", where_clause(f, params)))
            .collect::<Vec<_>>()
            .join(" AND "),
    }
}

/// Cursor state: one page of rows is pulled at a time, resuming after the
/// last row id seen.
struct Scan {
    conn: Arc<Mutex<Connection>>,
    collection: String,
    filter: Filter,
    after: i64,
    buffered: VecDeque<Result<Value>>,
    exhausted: bool,
}

impl Scan {
    async fn next_page(&mut self) -> Result<()> {
        let mut params = vec![SqlValue::Text(self.collection.clone()), SqlValue::Integer(self.after)];
        let clause = where_clause(&self.filter, &mut params);
        params.push(SqlValue::Integer(SCAN_PAGE));
        let sql = format!(
            "SELECT id, doc FROM documents WHERE collection = ? AND id > ? AND ({}) ORDER BY id LIMIT ?",
            clause
        );

        let rows = run_blocking(Arc::clone(&self.conn), move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await?;

        self.exhausted = (rows.len() as i64) < SCAN_PAGE;
        for (id, text) in rows {
            self.after = id;
            match serde_json::from_str::<Value>(&text) {
                Ok(doc) if self.filter.matches(&doc) => self.buffered.push_back(Ok(doc)),
                Ok(_) => {}
                Err(e) => {
                    // documents before the bad row are still delivered
                    self.buffered.push_back(Err(e.into()));
                    self.exhausted = true;
                    break;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn insert_one(&self, collection: &str, doc: Value) -> Result<()> {
        self.insert_many(collection, vec![doc]).await.map(|_| ())
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Value>) -> Result<usize> {
        let collection = collection.to_string();
        let encoded = docs
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            {
                let mut stmt = tx.prepare("INSERT INTO documents (collection, doc) VALUES (?1, ?2)")?;
                for doc in &encoded {
                    stmt.execute(params![collection, doc])?;
                }
            }
            tx.commit()?;
            Ok(encoded.len())
        })
        .await
    }

    async fn find(&self, collection: &str, filter: Filter) -> Result<DocCursor> {
        let scan = Scan {
            conn: Arc::clone(&self.conn),
            collection: collection.to_string(),
            filter,
            after: 0,
            buffered: VecDeque::new(),
            exhausted: false,
        };

        let cursor = stream::unfold(Some(scan), |state| async move {
            let mut scan = state?;
            loop {
                match scan.buffered.pop_front() {
                    Some(Ok(doc)) => return Some((Ok(doc), Some(scan))),
                    Some(Err(e)) => return Some((Err(e), None)),
                    None => {}
                }
                if scan.exhausted {
                    return None;
                }
                if let Err(e) = scan.next_page().await {
                    return Some((Err(StoreError::CursorLost(e.to_string())), None));
                }
            }
        });
        Ok(cursor.boxed())
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Filter,
        field: &str,
        value: Value,
    ) -> Result<bool> {
        let collection = collection.to_string();
        let field = field.to_string();

        self.with_conn(move |conn| {
            // take the write lock up front so the read and the write see the same row
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut params = vec![SqlValue::Text(collection)];
            let clause = where_clause(&filter, &mut params);
            let sql = format!(
                "SELECT id, doc FROM documents WHERE collection = ? AND ({}) ORDER BY id",
                clause
            );

            let mut target = None;
            {
                let mut stmt = tx.prepare(&sql)?;
                let mut rows = stmt.query(params_from_iter(params.iter()))?;
                while let Some(row) = rows.next()? {
                    let doc: Value = serde_json::from_str(&row.get::<_, String>(1)?)?;
                    if filter.matches(&doc) {
                        target = Some((row.get::<_, i64>(0)?, doc));
                        break;
                    }
                }
            }

            let Some((id, mut doc)) = target else {
                return Ok(false);
            };
            set_field(&mut doc, &field, value)?;
            tx.execute(
                "UPDATE documents SET doc = ?1 WHERE id = ?2",
                params![serde_json::to_string(&doc)?, id],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }
}
