//! SQLite backend for Reclink
//!
//! Runs generated pipelines against an in-memory SQLite database through
//! `rusqlite` (bundled). SQLite lacks a few functions the generated SQL
//! relies on, so `log2`, `pow` and a NULL-skipping variadic `concat` are
//! registered on the connection. `float8` casts work as-is: SQLite gives
//! them REAL affinity, except that `cast('Infinity' as float8)` reads as
//! 0.0, so infinite literals are rewritten to an overflowing `9e999` before
//! execution. Infinite cells come back as the strings `"Infinity"` and
//! `"-Infinity"`, which JSON numbers cannot hold.
//!
//! The connection is shared between the backend and its table handles with
//! `Rc`; the backend is single-threaded like the engine.

use std::cell::Cell;
use std::rc::Rc;

use anyhow::Context as _;
use reclink_engine::{Backend, Record, TableHandle, TableName};
use reclink_sql::SqlDialect;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::Value;

pub struct SqliteBackend {
    conn: Rc<Connection>,
    source_dialect: SqlDialect,
    executions: Cell<usize>,
}

impl SqliteBackend {
    /// A fresh in-memory database.
    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory SQLite database")?;
        Self::from_connection(conn)
    }

    pub fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        register_functions(&conn)?;
        Ok(Self {
            conn: Rc::new(conn),
            source_dialect: SqlDialect::default(),
            executions: Cell::new(0),
        })
    }

    /// Dialect generated SQL is written in when it has to be transpiled.
    pub fn with_source_dialect(mut self, dialect: SqlDialect) -> Self {
        self.source_dialect = dialect;
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Run one or more statements directly, e.g. to load input tables.
    pub fn execute_batch(&self, sql: &str) -> anyhow::Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Number of statements materialised through [`Backend::execute_sql`].
    pub fn execution_count(&self) -> usize {
        self.executions.get()
    }
}

fn register_functions(conn: &Connection) -> anyhow::Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    conn.create_scalar_function("log2", 1, flags, |ctx| {
        Ok(ctx.get::<Option<f64>>(0)?.map(f64::log2))
    })?;

    conn.create_scalar_function("pow", 2, flags, |ctx| {
        let base = ctx.get::<Option<f64>>(0)?;
        let exponent = ctx.get::<Option<f64>>(1)?;
        Ok(base.zip(exponent).map(|(b, e)| b.powf(e)))
    })?;

    conn.create_scalar_function("concat", -1, flags, |ctx| {
        let mut out = String::new();
        for i in 0..ctx.len() {
            match ctx.get_raw(i) {
                ValueRef::Null => {}
                ValueRef::Integer(v) => out.push_str(&v.to_string()),
                ValueRef::Real(v) => out.push_str(&v.to_string()),
                ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                    out.push_str(&String::from_utf8_lossy(bytes))
                }
            }
        }
        Ok(out)
    })?;

    Ok(())
}

/// Spell `cast('Infinity' as float8)` the way SQLite understands it,
/// whatever the case of the cast.
fn rewrite_infinities(sql: &str) -> String {
    const LITERALS: [(&str, &str); 2] = [
        ("cast('infinity' as float8)", "9e999"),
        ("cast('-infinity' as float8)", "-9e999"),
    ];
    let mut sql = sql.to_string();
    for (pattern, replacement) in LITERALS {
        // ASCII lowercasing keeps byte offsets aligned with `sql`.
        let lower = sql.to_ascii_lowercase();
        let mut out = String::with_capacity(sql.len());
        let mut last = 0;
        for (start, _) in lower.match_indices(pattern) {
            out.push_str(&sql[last..start]);
            out.push_str(replacement);
            last = start + pattern.len();
        }
        out.push_str(&sql[last..]);
        sql = out;
    }
    sql
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::from(v),
        ValueRef::Real(v) if v == f64::INFINITY => Value::from("Infinity"),
        ValueRef::Real(v) if v == f64::NEG_INFINITY => Value::from("-Infinity"),
        ValueRef::Real(v) => serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

impl Backend for SqliteBackend {
    type Table = SqliteTable;

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    fn execute_sql(
        &self,
        sql: &str,
        templated_name: &str,
        physical_name: &str,
        transpile: bool,
    ) -> anyhow::Result<SqliteTable> {
        let sql = if transpile {
            reclink_sql::transpile(sql, self.source_dialect, SqlDialect::Sqlite)?
        } else {
            sql.to_string()
        };
        let statement = format!(
            "CREATE TABLE IF NOT EXISTS {physical_name} AS {}",
            rewrite_infinities(&sql)
        );
        self.conn
            .execute_batch(&statement)
            .with_context(|| format!("materialising `{templated_name}` as `{physical_name}`"))?;
        self.executions.set(self.executions.get() + 1);
        tracing::debug!(table = templated_name, physical = physical_name, "materialised");
        Ok(SqliteTable {
            conn: Rc::clone(&self.conn),
            name: TableName::new(templated_name, physical_name),
        })
    }

    fn table_exists(&self, name: &str) -> anyhow::Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn table(&self, templated_name: &str, physical_name: &str) -> anyhow::Result<SqliteTable> {
        if !self.table_exists(physical_name)? {
            anyhow::bail!("no such table: {physical_name}");
        }
        Ok(SqliteTable {
            conn: Rc::clone(&self.conn),
            name: TableName::new(templated_name, physical_name),
        })
    }

    fn random_sample_sql(&self, proportion: f64) -> String {
        if proportion >= 1.0 {
            return String::new();
        }
        let threshold = (proportion.max(0.0) * 1_000_000.0).round() as i64;
        format!("WHERE abs(random()) % 1000000 < {threshold}")
    }
}

pub struct SqliteTable {
    conn: Rc<Connection>,
    name: TableName,
}

impl TableHandle for SqliteTable {
    fn name(&self) -> &TableName {
        &self.name
    }

    fn columns(&self) -> anyhow::Result<Vec<String>> {
        let stmt = self
            .conn
            .prepare(&format!("SELECT * FROM {} LIMIT 0", self.name.physical))?;
        let columns = stmt.column_names().into_iter().map(String::from).collect();
        Ok(columns)
    }

    fn as_records(&self, limit: Option<usize>) -> anyhow::Result<Vec<Record>> {
        let mut sql = format!("SELECT * FROM {}", self.name.physical);
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query([])?;

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Record::new();
            for (i, column) in columns.iter().enumerate() {
                record.insert(column.clone(), to_json(row.get_ref(i)?));
            }
            records.push(record);
        }
        Ok(records)
    }
}
