use std::sync::Arc;

use clap::{Args, Subcommand};
use serde_json::json;
use sqlbridge_core::connection::{ConnectParams, ConnectionProvider};

pub mod middleware;
pub mod offload;
pub mod registry;
pub mod resource;
pub mod rpc;
pub mod server;
pub mod sqlite;
pub mod strip;
pub mod tools;

#[cfg(test)]
mod testing;

pub use middleware::{CallRequest, CallTracing, ChainBuilder, ChainError, Interceptor, Next, Pipeline};
pub use offload::{BlockingPool, OffloadError, PoolSnapshot};
pub use registry::{ToolContext, ToolDefinition, ToolRegistry};
pub use resource::{DbHandle, LifecyclePhase, ResourceContext, ResourceStatus};
pub use server::{McpServer, ServeError, ServerConfig};
pub use sqlite::SqliteProvider;
pub use strip::{ArgumentPolicy, StripUnknownArguments};

use rpc::to_pretty_json;

#[derive(Subcommand)]
pub enum McpCommands {
    /// Run the MCP server over stdio
    Serve(McpServeArgs),
    /// Connect once, print the resource status and exit (0 when ready, 2 when degraded)
    Diagnose(McpServeArgs),
}

/// Connection and runtime settings shared by every way of running the server.
#[derive(Args, Clone)]
pub struct McpServeArgs {
    /// Database host (not used by the SQLite provider)
    #[arg(long, env = "DB_SERVER", default_value = "localhost")]
    pub db_server: String,
    /// Database port
    #[arg(long, env = "DB_PORT")]
    pub db_port: Option<u16>,
    /// Database user
    #[arg(long, env = "DB_USER")]
    pub db_user: Option<String>,
    /// Database password
    #[arg(long, env = "DB_PASSWORD", hide_env_values = true)]
    pub db_password: Option<String>,
    /// Database name. For SQLite this is the file path or `:memory:`
    #[arg(long, env = "DB_NAME")]
    pub db_name: Option<String>,
    /// Create the database file when it does not exist
    #[arg(long, env = "SQLBRIDGE_CREATE_DB")]
    pub create_db: bool,
    /// How to treat tool calls whose declared parameters cannot be determined
    #[arg(
        long,
        env = "SQLBRIDGE_ARGUMENT_POLICY",
        value_enum,
        default_value_t = ArgumentPolicy::FailOpen
    )]
    pub argument_policy: ArgumentPolicy,
    /// Cap on concurrently running database operations (default: no cap)
    #[arg(long, env = "SQLBRIDGE_MAX_BLOCKING_WORKERS")]
    pub max_blocking_workers: Option<usize>,
}

impl McpServeArgs {
    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            connect: ConnectParams {
                host: self.db_server,
                port: self.db_port,
                user: self.db_user,
                password: self.db_password,
                database: self.db_name.unwrap_or_default(),
            },
            argument_policy: self.argument_policy,
            max_blocking_workers: self.max_blocking_workers,
        }
    }

    pub fn provider(&self) -> Arc<dyn ConnectionProvider> {
        Arc::new(SqliteProvider::new().create_if_missing(self.create_db))
    }
}

pub async fn run(command: McpCommands) -> i32 {
    match command {
        McpCommands::Serve(args) => {
            let provider = args.provider();
            let server = Arc::new(McpServer::start(args.into_config(), provider).await);
            let result = server.clone().serve_stdio().await;
            server.shutdown().await;
            match result {
                Ok(()) => 0,
                Err(err) => {
                    let payload = json!({
                        "error": "mcp_server_error",
                        "message": err.to_string(),
                    });
                    eprintln!("{}", to_pretty_json(&payload));
                    1
                }
            }
        }
        McpCommands::Diagnose(args) => {
            let provider = args.provider();
            let server = McpServer::start(args.into_config(), provider).await;
            let report = server.diagnose();
            server.shutdown().await;
            println!("{}", to_pretty_json(&report));
            if server_is_ready(&report) { 0 } else { 2 }
        }
    }
}

fn server_is_ready(report: &serde_json::Value) -> bool {
    report
        .get("status")
        .and_then(serde_json::Value::as_str)
        .is_some_and(|status| status == "ready")
}
