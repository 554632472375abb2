use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Args;
use serde_json::Value;
use sqlbridge_mcp_runtime::rpc::{error_response, parse_message};
use sqlbridge_mcp_runtime::{LifecyclePhase, McpServeArgs, McpServer};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

const MCP_PATH: &str = "/mcp";

#[derive(Args, Clone)]
pub struct HttpServeArgs {
    #[command(flatten)]
    pub mcp: McpServeArgs,
    /// Address to listen on
    #[arg(long, env = "SQLBRIDGE_HTTP_ADDR", default_value = "0.0.0.0:8000")]
    pub addr: SocketAddr,
}

pub fn router(server: Arc<McpServer>) -> Router {
    Router::new()
        .route(MCP_PATH, post(mcp_post).get(mcp_get))
        .route("/health", get(health_check))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(server)
}

/// Serves until ctrl-c, then releases the database connection.
pub async fn serve(args: HttpServeArgs) -> Result<(), std::io::Error> {
    let addr = args.addr;
    let provider = args.mcp.provider();
    let server = Arc::new(McpServer::start(args.mcp.into_config(), provider).await);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(event = "http_listening", addr = %addr, "sqlbridge MCP listening on {}", addr);

    let result = axum::serve(listener, router(server.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await;
    server.shutdown().await;
    result
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!(event = "http_shutdown", "Shutdown signal received"),
        Err(err) => {
            tracing::error!(
                event = "http_signal_failed",
                error = %err,
                "Cannot listen for ctrl-c; serving until the process is killed"
            );
            std::future::pending::<()>().await;
        }
    }
}

async fn mcp_get() -> Response {
    StatusCode::METHOD_NOT_ALLOWED.into_response()
}

async fn mcp_post(State(server): State<Arc<McpServer>>, body: Bytes) -> Response {
    let incoming = match parse_message(&body) {
        Ok(incoming) => incoming,
        Err(err) => return (StatusCode::OK, Json(error_response(Value::Null, err))).into_response(),
    };

    let batch = incoming.as_array().is_some_and(|items| !items.is_empty());
    let mut responses = server.handle_incoming_message(incoming).await;

    if responses.is_empty() {
        return StatusCode::ACCEPTED.into_response();
    }

    if !batch && responses.len() == 1 {
        return (StatusCode::OK, Json(responses.remove(0))).into_response();
    }

    (StatusCode::OK, Json(Value::Array(responses))).into_response()
}

/// `ok` with 200 while the connection is live, `degraded` with 503 otherwise.
async fn health_check(State(server): State<Arc<McpServer>>) -> impl IntoResponse {
    let ready = server.phase() == LifecyclePhase::Ready;
    let mut body = server.status();
    body["status"] = Value::String(if ready { "ok" } else { "degraded" }.to_string());

    let http_status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (http_status, Json(body))
}
