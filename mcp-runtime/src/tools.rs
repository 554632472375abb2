use serde_json::{Map, Value, json};
use sqlbridge_core::connection::{SqlConnection, StatementOutcome};
use sqlbridge_core::error::{DriverError, FailureKind};
use sqlbridge_core::result::{ToolFailure, ToolResult};

use crate::offload::OffloadError;
use crate::registry::{ToolContext, ToolDefinition, ToolRegistry};

pub const QUERY_SQL: &str = "query_sql";
pub const LIST_TABLES: &str = "list_tables";
pub const DESCRIBE_TABLE: &str = "describe_table";
pub const EXECUTE_NONQUERY: &str = "execute_nonquery";

pub fn register_database_tools(registry: &mut ToolRegistry) {
    registry.register(ToolDefinition::new(
        QUERY_SQL,
        "Query the SQL database with a custom query. Without a query, lists the available tables.",
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "SQL query to execute. Defaults to a table listing."
                }
            },
            "additionalProperties": false
        }),
        query_sql,
    ));
    registry.register(ToolDefinition::new(
        LIST_TABLES,
        "List all tables in the database that can be queried.",
        json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        }),
        list_tables,
    ));
    registry.register(ToolDefinition::new(
        DESCRIBE_TABLE,
        "Get the column structure of a specific table.",
        json!({
            "type": "object",
            "properties": {
                "table_name": {
                    "type": "string",
                    "description": "Name of the table to describe"
                }
            },
            "required": ["table_name"],
            "additionalProperties": false
        }),
        describe_table,
    ));
    registry.register(ToolDefinition::new(
        EXECUTE_NONQUERY,
        "Execute a non-query SQL statement (INSERT, UPDATE, DELETE, ...). Commits on success, rolls back on failure.",
        json!({
            "type": "object",
            "properties": {
                "sql": {
                    "type": "string",
                    "description": "The SQL statement to execute"
                }
            },
            "required": ["sql"],
            "additionalProperties": false
        }),
        execute_nonquery,
    ));
}

pub async fn query_sql(args: Map<String, Value>, ctx: ToolContext) -> ToolResult {
    let handle = match ctx.resource.resource() {
        Ok(handle) => handle,
        Err(failure) => return failure.into(),
    };
    let query = match arg_optional_string(&args, "query") {
        Ok(query) => query,
        Err(failure) => return failure.into(),
    };

    let outcome = ctx
        .pool
        .run(QUERY_SQL, move || {
            handle.with_connection(|conn| {
                let sql = query.unwrap_or_else(|| conn.table_listing_query().to_string());
                conn.query(&sql)
            })
        })
        .await;

    match settle(outcome) {
        Ok(StatementOutcome::Rows { columns, rows }) => {
            let row_count = rows.len();
            let rendered = Value::Array(rows.iter().cloned().map(Value::Object).collect());
            ToolResult::success(
                json!({
                    "columns": columns,
                    "rows": rows,
                    "row_count": row_count
                }),
                format!("Query results: {rendered}"),
            )
        }
        Ok(StatementOutcome::Affected(count)) => ToolResult::success(
            json!({
                "row_count": count,
                "message": format!("Query affected {count} rows")
            }),
            format!("Query affected {count} rows"),
        ),
        Err(failure) => headlined(failure, "Query error").into(),
    }
}

pub async fn list_tables(_args: Map<String, Value>, ctx: ToolContext) -> ToolResult {
    let handle = match ctx.resource.resource() {
        Ok(handle) => handle,
        Err(failure) => return failure.into(),
    };

    let outcome = ctx
        .pool
        .run(LIST_TABLES, move || handle.with_connection(|conn| conn.list_tables()))
        .await;

    match settle(outcome) {
        Ok(tables) => {
            let text = format!("Available tables: {}", json!(tables));
            ToolResult::success(json!({ "tables": tables, "count": tables.len() }), text)
        }
        Err(failure) => headlined(failure, "Error listing tables").into(),
    }
}

pub async fn describe_table(args: Map<String, Value>, ctx: ToolContext) -> ToolResult {
    let handle = match ctx.resource.resource() {
        Ok(handle) => handle,
        Err(failure) => return failure.into(),
    };
    let table_name = match required_string(&args, "table_name") {
        Ok(table_name) => table_name,
        Err(failure) => return failure.into(),
    };

    let table = table_name.clone();
    let outcome = ctx
        .pool
        .run(DESCRIBE_TABLE, move || {
            handle.with_connection(|conn| conn.describe_table(&table))
        })
        .await;

    match settle(outcome) {
        Ok(columns) if columns.is_empty() => ToolResult::success(
            json!({ "table_name": table_name, "columns": [] }),
            format!("Table '{table_name}' not found or has no columns."),
        ),
        Ok(columns) => {
            let lines: Vec<String> = columns.iter().map(ToString::to_string).collect();
            ToolResult::success(
                json!({ "table_name": table_name, "columns": columns }),
                format!("Structure of table '{table_name}':\n{}", lines.join("\n")),
            )
        }
        Err(failure) => headlined(failure, "Error describing table").into(),
    }
}

pub async fn execute_nonquery(args: Map<String, Value>, ctx: ToolContext) -> ToolResult {
    let handle = match ctx.resource.resource() {
        Ok(handle) => handle,
        Err(failure) => return failure.into(),
    };
    let sql = match required_string(&args, "sql") {
        Ok(sql) => sql,
        Err(failure) => return failure.into(),
    };

    let outcome = ctx
        .pool
        .run(EXECUTE_NONQUERY, move || {
            handle.with_connection(|conn| execute_and_commit(conn, &sql))
        })
        .await;

    match settle(outcome) {
        Ok(count) => ToolResult::success(
            json!({ "row_count": count, "committed": true }),
            format!("Operation successful. Rows affected: {count}"),
        ),
        Err(failure) => headlined(failure, "Operation failed").into(),
    }
}

/// Execute, then commit. Any fault on the way rolls back first and is then
/// returned unchanged.
fn execute_and_commit(conn: &mut dyn SqlConnection, sql: &str) -> Result<u64, DriverError> {
    let result = conn.execute(sql).and_then(|count| conn.commit().map(|()| count));
    if let Err(err) = &result {
        if let Err(rollback_err) = conn.rollback() {
            tracing::warn!(
                event = "rollback_failed",
                error = %rollback_err,
                original_error = %err,
                "Rollback after failed statement also failed"
            );
        }
    }
    result
}

/// Folds the two failure layers of an offloaded call into one.
fn settle<T>(outcome: Result<Result<T, DriverError>, OffloadError>) -> Result<T, ToolFailure> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(ToolFailure::from_driver(&err)),
        Err(err) => Err(ToolFailure::new(FailureKind::WorkerFault, err.to_string())),
    }
}

/// Operation and worker faults get the tool's lead-in; unavailability keeps
/// its own.
fn headlined(failure: ToolFailure, headline: &str) -> ToolFailure {
    match failure.kind {
        FailureKind::OperationFault | FailureKind::WorkerFault => failure.with_headline(headline),
        _ => failure,
    }
}

fn arg_optional_string(args: &Map<String, Value>, key: &str) -> Result<Option<String>, ToolFailure> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(v)) if v.trim().is_empty() => Ok(None),
        Some(Value::String(v)) => Ok(Some(v.clone())),
        Some(_) => Err(ToolFailure::invalid_argument(format!("'{key}' must be a string"))),
    }
}

fn required_string(args: &Map<String, Value>, key: &str) -> Result<String, ToolFailure> {
    match args.get(key) {
        None | Some(Value::Null) => Err(ToolFailure::invalid_argument(format!(
            "Missing required field '{key}'"
        ))),
        Some(Value::String(v)) if v.trim().is_empty() => Err(ToolFailure::invalid_argument(
            format!("'{key}' must not be empty"),
        )),
        Some(Value::String(v)) => Ok(v.clone()),
        Some(_) => Err(ToolFailure::invalid_argument(format!("'{key}' must be a string"))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sqlbridge_core::connection::{ColumnDescriptor, ConnectParams};

    use super::*;
    use crate::offload::BlockingPool;
    use crate::resource::ResourceContext;
    use crate::testing::{FAKE_TABLE_LISTING, FakeProvider, Script, row};

    async fn context_with(provider: FakeProvider) -> ToolContext {
        let pool = BlockingPool::unbounded();
        let resource = ResourceContext::acquire(
            Arc::new(provider),
            ConnectParams {
                database: "sales".to_string(),
                ..ConnectParams::default()
            },
            &pool,
        )
        .await;
        ToolContext { resource, pool }
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn two_buyers() -> Script {
        Script {
            columns: vec!["id".to_string(), "name".to_string()],
            rows: vec![
                row(&[("id", json!(1)), ("name", json!("Ada"))]),
                row(&[("id", json!(2)), ("name", json!("Grace"))]),
            ],
            ..Script::default()
        }
    }

    #[tokio::test]
    async fn query_sql_without_query_runs_the_table_listing() {
        let provider = FakeProvider::with_script(two_buyers());
        let ctx = context_with(provider.clone()).await;

        let result = query_sql(Map::new(), ctx).await;

        assert_eq!(
            provider.log().calls,
            vec![format!("query:{FAKE_TABLE_LISTING}")]
        );
        match result {
            ToolResult::Success { payload, text } => {
                assert_eq!(payload["row_count"], 2);
                let rows = payload["rows"].as_array().unwrap();
                assert_eq!(rows.len(), 2);
                for row in rows {
                    let keys: Vec<_> = row.as_object().unwrap().keys().cloned().collect();
                    assert_eq!(keys, vec!["id", "name"]);
                }
                assert!(text.starts_with("Query results: "));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn query_sql_reports_affected_rows_for_statements_without_results() {
        let provider = FakeProvider::with_script(Script {
            affected: 3,
            ..Script::default()
        });
        let ctx = context_with(provider).await;

        let result = query_sql(args(json!({ "query": "UPDATE buyer SET name = 'x'" })), ctx).await;
        assert_eq!(result.text(), "Query affected 3 rows");
    }

    #[tokio::test]
    async fn query_sql_rejects_non_string_query() {
        let provider = FakeProvider::default();
        let ctx = context_with(provider.clone()).await;
        let dispatched = ctx.pool.dispatched();

        let result = query_sql(args(json!({ "query": 42 })), ctx.clone()).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::InvalidArguments));
        assert_eq!(ctx.pool.dispatched(), dispatched);
        assert!(provider.log().calls.is_empty());
    }

    #[tokio::test]
    async fn operation_fault_message_is_preserved_verbatim() {
        let provider = FakeProvider::with_script(Script {
            fail_on: Some(("FROM nope".to_string(), "no such table: nope".to_string())),
            ..two_buyers()
        });
        let ctx = context_with(provider).await;

        let result = query_sql(args(json!({ "query": "SELECT * FROM nope" })), ctx).await;
        match result {
            ToolResult::Failure(failure) => {
                assert_eq!(failure.kind, FailureKind::OperationFault);
                assert_eq!(failure.message, "no such table: nope");
                assert_eq!(failure.text(), "Query error: no such table: nope");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn degraded_resource_fails_every_tool_without_dispatching() {
        let ctx = context_with(FakeProvider::refusing("Can't connect to server on 'db'")).await;
        let dispatched_after_startup = ctx.pool.dispatched();

        let results = vec![
            list_tables(Map::new(), ctx.clone()).await,
            query_sql(Map::new(), ctx.clone()).await,
            describe_table(args(json!({ "table_name": "buyer" })), ctx.clone()).await,
            execute_nonquery(args(json!({ "sql": "DELETE FROM buyer" })), ctx.clone()).await,
            // Unavailability wins over malformed arguments.
            describe_table(Map::new(), ctx.clone()).await,
            execute_nonquery(args(json!({ "sql": 5 })), ctx.clone()).await,
            query_sql(args(json!({ "query": 42 })), ctx.clone()).await,
        ];

        for result in results {
            assert_eq!(result.failure_kind(), Some(FailureKind::ResourceUnavailable));
            assert!(result.text().contains("Database connection is not available"));
        }
        assert_eq!(ctx.pool.dispatched(), dispatched_after_startup);
    }

    #[tokio::test]
    async fn list_tables_returns_names() {
        let provider = FakeProvider::with_script(Script {
            tables: vec!["buyer".to_string(), "product".to_string()],
            ..Script::default()
        });
        let ctx = context_with(provider).await;
        let result = list_tables(Map::new(), ctx).await;
        assert_eq!(result.text(), "Available tables: [\"buyer\",\"product\"]");
    }

    #[tokio::test]
    async fn describe_table_formats_descriptors_and_handles_unknown_tables() {
        let provider = FakeProvider::with_script(Script {
            descriptors: vec![
                ColumnDescriptor {
                    name: "id".to_string(),
                    data_type: "INTEGER".to_string(),
                    max_length: None,
                    nullable: false,
                    primary_key: true,
                },
                ColumnDescriptor {
                    name: "name".to_string(),
                    data_type: "VARCHAR".to_string(),
                    max_length: Some(80),
                    nullable: false,
                    primary_key: false,
                },
            ],
            ..Script::default()
        });
        let ctx = context_with(provider.clone()).await;

        let result = describe_table(args(json!({ "table_name": "buyer" })), ctx).await;
        assert_eq!(
            result.text(),
            "Structure of table 'buyer':\nid (INTEGER)\nname (VARCHAR(80))"
        );
        assert_eq!(provider.log().calls, vec!["describe:buyer"]);

        let empty = context_with(FakeProvider::default()).await;
        let result = describe_table(args(json!({ "table_name": "ghost" })), empty).await;
        assert!(!result.is_failure());
        assert_eq!(result.text(), "Table 'ghost' not found or has no columns.");
    }

    #[tokio::test]
    async fn describe_table_requires_table_name() {
        let ctx = context_with(FakeProvider::default()).await;
        let result = describe_table(Map::new(), ctx).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::InvalidArguments));
        assert!(result.text().contains("Missing required field 'table_name'"));
    }

    #[tokio::test]
    async fn execute_nonquery_commits_on_success() {
        let provider = FakeProvider::with_script(Script {
            affected: 4,
            ..Script::default()
        });
        let ctx = context_with(provider.clone()).await;

        let result = execute_nonquery(args(json!({ "sql": "UPDATE buyer SET score = 0" })), ctx).await;

        assert_eq!(result.text(), "Operation successful. Rows affected: 4");
        assert_eq!(
            provider.log().calls,
            vec!["execute:UPDATE buyer SET score = 0", "commit"]
        );
    }

    #[tokio::test]
    async fn execute_nonquery_rolls_back_before_reporting_failure() {
        let provider = FakeProvider::with_script(Script {
            fail_on: Some((
                "INSERT".to_string(),
                "Duplicate entry 'ada@example.com' for key 'email'".to_string(),
            )),
            ..Script::default()
        });
        let ctx = context_with(provider.clone()).await;

        let result = execute_nonquery(
            args(json!({ "sql": "INSERT INTO buyer (email) VALUES ('ada@example.com')" })),
            ctx,
        )
        .await;

        assert_eq!(
            result.text(),
            "Operation failed: Duplicate entry 'ada@example.com' for key 'email'"
        );
        let log = provider.log();
        assert_eq!(log.count("rollback"), 1);
        assert_eq!(log.count("commit"), 0);
        assert_eq!(log.calls.last().map(String::as_str), Some("rollback"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_nonqueries_settle_independently() {
        let provider = FakeProvider::with_script(Script {
            affected: 1,
            fail_on: Some(("bad_table".to_string(), "no such table: bad_table".to_string())),
            delay_on: Some(("slow".to_string(), 30)),
            ..Script::default()
        });
        let ctx = context_with(provider.clone()).await;

        let good = tokio::spawn(execute_nonquery(
            args(json!({ "sql": "UPDATE slow SET x = 1" })),
            ctx.clone(),
        ));
        let bad = tokio::spawn(execute_nonquery(
            args(json!({ "sql": "DELETE FROM bad_table" })),
            ctx.clone(),
        ));
        let (good, bad) = (good.await.unwrap(), bad.await.unwrap());

        assert!(!good.is_failure());
        assert_eq!(bad.failure_kind(), Some(FailureKind::OperationFault));

        // The handle serializes access, so each statement is directly
        // followed by its own commit or rollback.
        let calls = provider.log().calls;
        let good_at = calls.iter().position(|c| c.contains("slow")).unwrap();
        let bad_at = calls.iter().position(|c| c.contains("bad_table")).unwrap();
        assert_eq!(calls[good_at + 1], "commit");
        assert_eq!(calls[bad_at + 1], "rollback");
    }

    #[tokio::test]
    async fn register_database_tools_exposes_the_four_tools() {
        let mut registry = ToolRegistry::new();
        register_database_tools(&mut registry);
        let names: Vec<_> = registry
            .definitions()
            .iter()
            .map(|tool| tool.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![DESCRIBE_TABLE, EXECUTE_NONQUERY, LIST_TABLES, QUERY_SQL]
        );
        let schema = registry.schema_of(DESCRIBE_TABLE).unwrap().unwrap();
        assert!(schema.contains("table_name") && schema.len() == 1);
        assert!(registry.schema_of(LIST_TABLES).unwrap().unwrap().is_empty());
    }
}
