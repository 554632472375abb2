//! In-memory connection doubles shared by the runtime's unit tests.

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use sqlbridge_core::connection::{
    ColumnDescriptor, ConnectParams, ConnectionProvider, SqlConnection, StatementOutcome,
};
use sqlbridge_core::error::DriverError;

pub const FAKE_TABLE_LISTING: &str = "SELECT name FROM fake_tables";

/// Everything a [`FakeConnection`] was asked to do, in call order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallLog {
    pub calls: Vec<String>,
}

impl CallLog {
    pub fn count(&self, prefix: &str) -> usize {
        self.calls.iter().filter(|call| call.starts_with(prefix)).count()
    }
}

/// Scripted behavior for a fake connection.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub rows: Vec<Map<String, Value>>,
    pub columns: Vec<String>,
    pub tables: Vec<String>,
    pub descriptors: Vec<ColumnDescriptor>,
    /// Statements containing this marker fail with the given message
    pub fail_on: Option<(String, String)>,
    pub fail_close: bool,
    pub affected: u64,
    /// Statements containing this marker sleep for the given number of ms
    pub delay_on: Option<(String, u64)>,
}

pub struct FakeConnection {
    log: Arc<Mutex<CallLog>>,
    script: Script,
}

impl FakeConnection {
    fn record(&self, call: String) {
        self.log.lock().unwrap().calls.push(call);
    }

    fn check(&self, sql: &str) -> Result<(), DriverError> {
        if let Some((marker, millis)) = &self.script.delay_on {
            if sql.contains(marker.as_str()) {
                std::thread::sleep(std::time::Duration::from_millis(*millis));
            }
        }
        match &self.script.fail_on {
            Some((marker, message)) if sql.contains(marker.as_str()) => {
                Err(DriverError::Statement(message.clone()))
            }
            _ => Ok(()),
        }
    }
}

impl SqlConnection for FakeConnection {
    fn table_listing_query(&self) -> &'static str {
        FAKE_TABLE_LISTING
    }

    fn query(&mut self, sql: &str) -> Result<StatementOutcome, DriverError> {
        self.record(format!("query:{sql}"));
        self.check(sql)?;
        if self.script.columns.is_empty() {
            return Ok(StatementOutcome::Affected(self.script.affected));
        }
        Ok(StatementOutcome::Rows {
            columns: self.script.columns.clone(),
            rows: self.script.rows.clone(),
        })
    }

    fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        self.record(format!("execute:{sql}"));
        self.check(sql)?;
        Ok(self.script.affected)
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.record("commit".to_string());
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.record("rollback".to_string());
        Ok(())
    }

    fn list_tables(&mut self) -> Result<Vec<String>, DriverError> {
        self.record("list_tables".to_string());
        Ok(self.script.tables.clone())
    }

    fn describe_table(&mut self, table: &str) -> Result<Vec<ColumnDescriptor>, DriverError> {
        self.record(format!("describe:{table}"));
        Ok(self.script.descriptors.clone())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.record("close".to_string());
        if self.script.fail_close {
            return Err(DriverError::Transaction("close refused".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeProvider {
    pub log: Arc<Mutex<CallLog>>,
    pub script: Script,
    pub refuse: Option<String>,
    pub panic: bool,
}

impl FakeProvider {
    pub fn with_script(script: Script) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    pub fn refusing(message: &str) -> Self {
        Self {
            refuse: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn log(&self) -> CallLog {
        self.log.lock().unwrap().clone()
    }
}

impl ConnectionProvider for FakeProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn connect(&self, _params: &ConnectParams) -> Result<Box<dyn SqlConnection>, DriverError> {
        if self.panic {
            panic!("driver crashed during handshake");
        }
        if let Some(message) = &self.refuse {
            return Err(DriverError::Connect(message.clone()));
        }
        Ok(Box::new(FakeConnection {
            log: self.log.clone(),
            script: self.script.clone(),
        }))
    }
}

pub fn row(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_string(), value.clone()))
        .collect()
}
