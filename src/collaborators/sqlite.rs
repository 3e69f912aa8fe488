//! SQLite-backed schema introspection and query execution.

use super::{QueryRows, SchemaIntrospector, SqlExecutor};
use crate::error::{AgentError, Result};
use crate::state::{DbInfo, Row, TableInfo};
use async_trait::async_trait;
use base64::Engine as _;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// A SQLite database file.
///
/// Every call opens its own connection on the blocking thread pool, so one
/// instance can serve any number of concurrent requests.
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    path: PathBuf,
}

impl SqliteDatabase {
    /// Open an existing database file. Fails if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Self {
            path: path.as_ref().to_path_buf(),
        };
        db.connect()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        Connection::open_with_flags(&self.path, flags).map_err(|e| {
            AgentError::sql(format!("cannot open {}: {e}", self.path.display()))
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Connection) -> Result<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(db.connect()?))
            .await
            .map_err(|e| AgentError::Other(format!("sqlite worker panicked: {e}")))?
    }
}

fn introspect(conn: &Connection) -> rusqlite::Result<DbInfo> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut db_info = DbInfo::new();
    for name in names {
        let pragma = format!("PRAGMA table_info(\"{}\")", name.replace('"', "\"\""));
        let mut stmt = conn.prepare(&pragma)?;
        let columns = stmt
            .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
        db_info.insert(name.clone(), TableInfo::new(name, columns));
    }
    Ok(db_info)
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
    }
}

fn run_query(conn: &Connection, sql: &str) -> rusqlite::Result<QueryRows> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();

    let mut rows = Vec::new();
    let mut cursor = stmt.query([])?;
    while let Some(row) = cursor.next()? {
        let mut out = Row::new();
        for (i, name) in columns.iter().enumerate() {
            out.insert(name.clone(), to_json(row.get_ref(i)?));
        }
        rows.push(out);
    }
    Ok(QueryRows { columns, rows })
}

#[async_trait]
impl SchemaIntrospector for SqliteDatabase {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn list_tables(&self) -> Result<DbInfo> {
        let db_info = self
            .blocking(|conn| introspect(&conn).map_err(|e| AgentError::schema(e.to_string())))
            .await
            .map_err(|e| match e {
                AgentError::Schema { .. } => e,
                other => AgentError::schema(other.to_string()),
            })?;
        debug!(tables = db_info.len(), "schema introspected");
        Ok(db_info)
    }
}

#[async_trait]
impl SqlExecutor for SqliteDatabase {
    #[instrument(skip(self))]
    async fn run(&self, sql: &str) -> Result<QueryRows> {
        let sql = sql.to_string();
        let rows = self
            .blocking(move |conn| run_query(&conn, &sql).map_err(AgentError::from))
            .await?;
        debug!(rows = rows.rows.len(), "statement executed");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, SqliteDatabase) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shop.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE orders (order_id INTEGER PRIMARY KEY, customer TEXT, total REAL, note BLOB);
             CREATE TABLE \"odd\"\"name\" (x INTEGER);
             INSERT INTO orders VALUES (1, 'ada', 12.5, x'0102');
             INSERT INTO orders VALUES (2, 'bob', NULL, NULL);",
        )
        .unwrap();
        let db = SqliteDatabase::open(&path).unwrap();
        (dir, db)
    }

    #[test]
    fn test_open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SqliteDatabase::open(dir.path().join("nope.db")).is_err());
    }

    #[tokio::test]
    async fn test_list_tables() {
        let (_dir, db) = fixture();
        let info = db.list_tables().await.unwrap();
        assert_eq!(info.len(), 2);
        let orders = &info["orders"];
        assert_eq!(orders.schema.columns["order_id"], "INTEGER");
        assert_eq!(orders.schema.columns["total"], "REAL");
        assert!(orders.sample.rows.is_empty());
        assert!(info.contains_key("odd\"name"));
    }

    #[tokio::test]
    async fn test_run_maps_values() {
        let (_dir, db) = fixture();
        let result = db
            .run("SELECT order_id, customer, total, note FROM orders ORDER BY order_id")
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["order_id", "customer", "total", "note"]);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0]["order_id"], 1);
        assert_eq!(result.rows[0]["total"], 12.5);
        assert_eq!(result.rows[0]["note"], "AQI=");
        assert!(result.rows[1]["total"].is_null());
    }

    #[tokio::test]
    async fn test_run_reports_driver_error() {
        let (_dir, db) = fixture();
        let err = db.run("SELECT * FROM missing_table").await.unwrap_err();
        match err {
            AgentError::Sql { message } => assert!(message.contains("no such table")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
