mod http;

use clap::{Parser, Subcommand};
use serde_json::json;
use sqlbridge_mcp_runtime::rpc::to_pretty_json;
use sqlbridge_mcp_runtime::{McpCommands, run as run_mcp};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "sqlbridge-mcp",
    version,
    about = "sqlbridge MCP server: SQL database tools over stdio or HTTP"
)]
struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, env = "SQLBRIDGE_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Mcp(McpCommands),
    /// Run the MCP server over HTTP (POST /mcp, GET /health)
    ServeHttp(http::HttpServeArgs),
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let code = match cli.command {
        Commands::Mcp(command) => run_mcp(command).await,
        Commands::ServeHttp(args) => match http::serve(args).await {
            Ok(()) => 0,
            Err(err) => {
                let payload = json!({
                    "error": "http_server_error",
                    "message": err.to_string(),
                });
                eprintln!("{}", to_pretty_json(&payload));
                1
            }
        },
    };
    std::process::exit(code);
}

/// Logs always go to stderr; stdout belongs to the stdio transport.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "sqlbridge_mcp=info,sqlbridge_mcp_runtime=info,tower_http=info".into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
