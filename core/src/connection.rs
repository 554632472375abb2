use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::DriverError;

/// Parameters handed to a [`ConnectionProvider`]. Which fields matter is up to
/// the provider; the SQLite provider only reads `database`.
#[derive(Clone, Default)]
pub struct ConnectParams {
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: String,
}

// Hand-written so credentials never end up in logs.
impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .finish()
    }
}

/// Result of running an arbitrary statement.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementOutcome {
    /// The statement produced a result set. Each row maps column name to
    /// value, in column order.
    Rows {
        columns: Vec<String>,
        rows: Vec<Map<String, Value>>,
    },
    /// The statement produced no result set; carries the affected-row count.
    Affected(u64),
}

/// One column of a described table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u64>,
    pub nullable: bool,
    pub primary_key: bool,
}

impl fmt::Display for ColumnDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max_length {
            Some(len) => write!(f, "{} ({}({}))", self.name, self.data_type, len),
            None => write!(f, "{} ({})", self.name, self.data_type),
        }
    }
}

/// A live, blocking database connection.
///
/// Every method blocks the calling thread. Callers are expected to run them
/// off the async control loop.
pub trait SqlConnection: Send {
    /// Query used when a caller asks for "whatever is in there".
    fn table_listing_query(&self) -> &'static str;

    fn query(&mut self, sql: &str) -> Result<StatementOutcome, DriverError>;

    /// Runs a mutating statement inside a transaction that stays open until
    /// [`commit`](Self::commit) or [`rollback`](Self::rollback).
    fn execute(&mut self, sql: &str) -> Result<u64, DriverError>;

    fn commit(&mut self) -> Result<(), DriverError>;

    fn rollback(&mut self) -> Result<(), DriverError>;

    fn list_tables(&mut self) -> Result<Vec<String>, DriverError>;

    /// Columns of `table` in declaration order. Unknown tables yield an empty list.
    fn describe_table(&mut self, table: &str) -> Result<Vec<ColumnDescriptor>, DriverError>;

    fn close(&mut self) -> Result<(), DriverError>;
}

/// Opens connections. Implementations block and may fail.
pub trait ConnectionProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn SqlConnection>, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_password() {
        let params = ConnectParams {
            host: "db.internal".to_string(),
            port: Some(3306),
            user: Some("report".to_string()),
            password: Some("hunter2".to_string()),
            database: "sales".to_string(),
        };
        let rendered = format!("{params:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains("db.internal"));
    }

    #[test]
    fn column_descriptor_display_includes_length_when_present() {
        let sized = ColumnDescriptor {
            name: "email".to_string(),
            data_type: "VARCHAR".to_string(),
            max_length: Some(120),
            nullable: false,
            primary_key: false,
        };
        assert_eq!(sized.to_string(), "email (VARCHAR(120))");

        let unsized_column = ColumnDescriptor {
            max_length: None,
            data_type: "INTEGER".to_string(),
            name: "id".to_string(),
            ..sized
        };
        assert_eq!(unsized_column.to_string(), "id (INTEGER)");
    }
}
