//! MCP server initialization for stdio and Streamable HTTP transports.
//!
//! Provides [`serve_stdio`] and [`serve_http`] entry points that wire up the
//! database, model gateway, metrics registry, and tool handler into a
//! running server.

use crate::config::EngramConfig;
use crate::db;
use crate::metrics::MetricsRegistry;
use crate::model::http::OllamaClient;
use crate::model::ModelGateway;
use crate::tools::EngramTools;
use anyhow::Result;
use rmcp::ServiceExt;
use std::sync::{Arc, Mutex};

/// Shared setup: open DB, build the model gateway, create the metrics
/// registry. Returns everything Arc-wrapped for the tool handler.
fn setup_shared_state(
    config: EngramConfig,
) -> Result<(
    Arc<Mutex<rusqlite::Connection>>,
    Arc<ModelGateway>,
    Arc<MetricsRegistry>,
    Arc<EngramConfig>,
)> {
    let db_path = config.resolved_db_path();
    let conn = db::open_database(&db_path, config.storage.embedding_dim)?;
    tracing::info!(db = %db_path.display(), "database ready");

    // Warn when the configured embedding model differs from the one the
    // stored vectors were produced with.
    if let Ok(Some(stored_model)) = db::migrations::get_embedding_model(&conn) {
        if stored_model != config.model.embedding_model {
            tracing::warn!(
                stored = %stored_model,
                configured = %config.model.embedding_model,
                "embedding model changed — existing vectors must be re-embedded"
            );
        }
    }
    db::migrations::set_embedding_model(&conn, &config.model.embedding_model)?;

    let db = Arc::new(Mutex::new(conn));
    let metrics = Arc::new(MetricsRegistry::new());

    let client = OllamaClient::from_config(&config.model, config.storage.embedding_dim)
        .map_err(|e| anyhow::anyhow!("model gateway init failed: {e}"))?;
    let chat = OllamaClient::from_config(&config.model, config.storage.embedding_dim)
        .map_err(|e| anyhow::anyhow!("model gateway init failed: {e}"))?;
    let model = Arc::new(ModelGateway::new(
        Box::new(client),
        Box::new(chat),
        Arc::clone(&metrics),
    ));
    tracing::info!(host = %config.model.host, "model gateway ready");

    Ok((db, model, metrics, Arc::new(config)))
}

/// Start the MCP server over stdio transport.
pub async fn serve_stdio(config: EngramConfig) -> Result<()> {
    tracing::info!("starting Engram MCP server on stdio");

    // The blocking HTTP client must be built off the async runtime.
    let (db, model, metrics, config) =
        tokio::task::spawn_blocking(move || setup_shared_state(config)).await??;

    let tools = EngramTools::new(db, model, metrics, config);
    let transport = rmcp::transport::stdio();

    let server = tools.serve(transport).await?;
    tracing::info!("MCP server running — waiting for client");

    server.waiting().await?;
    tracing::info!("MCP server shut down");

    Ok(())
}

/// Start the MCP server over Streamable HTTP.
pub async fn serve_http(config: EngramConfig) -> Result<()> {
    let host = config.server.host.clone();
    let port = config.server.port;
    let bind_addr = format!("{host}:{port}");

    tracing::info!(addr = %bind_addr, "starting Engram MCP server on HTTP");

    let (db, model, metrics, config) =
        tokio::task::spawn_blocking(move || setup_shared_state(config)).await??;

    let service = rmcp::transport::streamable_http_server::StreamableHttpService::new(
        move || {
            Ok(EngramTools::new(
                db.clone(),
                model.clone(),
                metrics.clone(),
                config.clone(),
            ))
        },
        rmcp::transport::streamable_http_server::session::local::LocalSessionManager::default()
            .into(),
        Default::default(),
    );

    let router = axum::Router::new().nest_service("/mcp", service);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "MCP server listening at http://{bind_addr}/mcp");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to listen for ctrl-c");
            tracing::info!("shutting down HTTP server");
        })
        .await?;

    Ok(())
}
