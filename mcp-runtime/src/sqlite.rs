use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::{Map, Number, Value};
use sqlbridge_core::connection::{
    ColumnDescriptor, ConnectParams, ConnectionProvider, SqlConnection, StatementOutcome,
};
use sqlbridge_core::error::DriverError;

const TABLE_LISTING_QUERY: &str =
    "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens SQLite databases. `ConnectParams::database` is the file path (or
/// `:memory:`); host, port and credentials do not apply and are ignored.
#[derive(Debug, Clone, Default)]
pub struct SqliteProvider {
    create_if_missing: bool,
}

impl SqliteProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }
}

impl ConnectionProvider for SqliteProvider {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn SqlConnection>, DriverError> {
        let path = params.database.trim();
        if path.is_empty() {
            return Err(DriverError::Connect(
                "no database configured (set DB_NAME)".to_string(),
            ));
        }

        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            if self.create_if_missing {
                flags |= OpenFlags::SQLITE_OPEN_CREATE;
            }
            Connection::open_with_flags(path, flags)
        }
        .map_err(|e| DriverError::Connect(format!("cannot open '{path}': {e}")))?;

        conn.busy_timeout(BUSY_TIMEOUT).map_err(connect_error)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(connect_error)?;

        Ok(Box::new(SqliteConnection { conn }))
    }
}

pub struct SqliteConnection {
    conn: Connection,
}

impl SqliteConnection {
    fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }
}

impl SqlConnection for SqliteConnection {
    fn table_listing_query(&self) -> &'static str {
        TABLE_LISTING_QUERY
    }

    fn query(&mut self, sql: &str) -> Result<StatementOutcome, DriverError> {
        let mut stmt = self.conn.prepare(sql).map_err(statement_error)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_owned)
            .collect();

        if columns.is_empty() {
            let affected = stmt.execute([]).map_err(statement_error)?;
            return Ok(StatementOutcome::Affected(affected as u64));
        }

        let mut rows = stmt.query([]).map_err(statement_error)?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().map_err(statement_error)? {
            let mut record = Map::new();
            for (index, column) in columns.iter().enumerate() {
                let value = row.get_ref(index).map_err(statement_error)?;
                record.insert(column.clone(), json_value(value));
            }
            records.push(record);
        }

        Ok(StatementOutcome::Rows {
            columns,
            rows: records,
        })
    }

    fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        if !self.in_transaction() {
            self.conn
                .execute_batch("BEGIN")
                .map_err(transaction_error)?;
        }
        let mut stmt = self.conn.prepare(sql).map_err(statement_error)?;
        if stmt.column_count() == 0 {
            let affected = stmt.execute([]).map_err(statement_error)?;
            return Ok(affected as u64);
        }

        // Row-returning statements (SELECT, DML with RETURNING) run to
        // completion; the count is the number of rows they produced.
        let mut rows = stmt.query([]).map_err(statement_error)?;
        let mut produced = 0_u64;
        while rows.next().map_err(statement_error)?.is_some() {
            produced += 1;
        }
        Ok(produced)
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        if self.in_transaction() {
            self.conn
                .execute_batch("COMMIT")
                .map_err(transaction_error)?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        if self.in_transaction() {
            self.conn
                .execute_batch("ROLLBACK")
                .map_err(transaction_error)?;
        }
        Ok(())
    }

    fn list_tables(&mut self) -> Result<Vec<String>, DriverError> {
        let mut stmt = self
            .conn
            .prepare(TABLE_LISTING_QUERY)
            .map_err(statement_error)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(statement_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(statement_error)?;
        Ok(names)
    }

    fn describe_table(&mut self, table: &str) -> Result<Vec<ColumnDescriptor>, DriverError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
            )
            .map_err(statement_error)?;
        let columns = stmt
            .query_map([table], |row| {
                let name: String = row.get(0)?;
                let declared: String = row.get(1)?;
                let not_null: i64 = row.get(2)?;
                let pk: i64 = row.get(3)?;
                let (data_type, max_length) = split_declared_type(&declared);
                Ok(ColumnDescriptor {
                    name,
                    data_type,
                    max_length,
                    nullable: not_null == 0 && pk == 0,
                    primary_key: pk > 0,
                })
            })
            .map_err(statement_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(statement_error)?;
        Ok(columns)
    }

    fn close(&mut self) -> Result<(), DriverError> {
        // The sqlite handle itself is closed when the connection is dropped.
        self.rollback()?;
        self.conn.flush_prepared_statement_cache();
        Ok(())
    }
}

/// `VARCHAR(120)` -> (`VARCHAR`, Some(120)). Types with non-numeric or
/// multi-part arguments (`DECIMAL(10,2)`) are kept whole.
fn split_declared_type(declared: &str) -> (String, Option<u64>) {
    let declared = declared.trim();
    if let Some((base, rest)) = declared.split_once('(') {
        if let Some(inner) = rest.strip_suffix(')') {
            if let Ok(length) = inner.trim().parse::<u64>() {
                return (base.trim().to_string(), Some(length));
            }
        }
    }
    (declared.to_string(), None)
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::from(v),
        ValueRef::Real(v) => Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(BASE64.encode(bytes)),
    }
}

fn connect_error(err: rusqlite::Error) -> DriverError {
    DriverError::Connect(err.to_string())
}

fn statement_error(err: rusqlite::Error) -> DriverError {
    DriverError::Statement(err.to_string())
}

fn transaction_error(err: rusqlite::Error) -> DriverError {
    DriverError::Transaction(err.to_string())
}
