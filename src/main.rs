//! ORPflow HFT - Streaming Feed
//!
//! Connects to the configured exchange, reconstructs order books and tails
//! trades for each configured symbol, and serves health and metrics.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use futures_util::StreamExt;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use orp_flow_stream::{Config, FeedClient, SlashPairs, Symbol};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting ORPflow Streaming Feed");

    let config = Config::load()?;
    info!(exchange = ?config.exchange, symbols = ?config.symbols, "Configuration loaded");

    let health_port = config.health_port;
    let depth = config.book_depth;
    let symbols = config.symbols.clone();

    let client = FeedClient::connect(config, Arc::new(SlashPairs)).await?;

    // Start health check server
    let health_client = client.clone();
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_client, health_port).await {
            warn!(error = %e, "Health server error");
        }
    });

    for symbol in symbols {
        tokio::spawn(log_books(client.clone(), symbol.clone(), depth));
        tokio::spawn(log_trades(client.clone(), symbol));
    }

    let summary_client = client.clone();
    client
        .scheduler()
        .schedule_after("subscription-summary", Duration::from_secs(30), async move {
            let confirmed = summary_client.telemetry().confirmed_subscriptions.get();
            info!(
                confirmed,
                open = summary_client.is_open(),
                last_heartbeat = ?summary_client.last_heartbeat(),
                "Subscription summary"
            );
        });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    client.shutdown().await;

    Ok(())
}

async fn log_books(client: FeedClient, symbol: Symbol, depth: u32) {
    let mut books = client.order_book(symbol.clone(), depth);
    while let Some(book) = books.next().await {
        match book {
            Ok(view) => info!(
                symbol = %view.symbol,
                best_bid = ?view.metrics.best_bid,
                best_ask = ?view.metrics.best_ask,
                spread_bps = ?view.metrics.spread_bps,
                imbalance = ?view.metrics.imbalance,
                "Order book status"
            ),
            Err(e) => warn!(symbol = %symbol, error = %e, "Order book update failed"),
        }
    }
    info!(symbol = %symbol, "Order book stream ended");
}

async fn log_trades(client: FeedClient, symbol: Symbol) {
    let trades = client.trades(symbol.clone()).into_stream();
    futures_util::pin_mut!(trades);
    while let Some(trade) = trades.next().await {
        match trade {
            Ok(trade) => tracing::debug!(
                symbol = %trade.symbol,
                price = %trade.price,
                volume = %trade.volume,
                side = ?trade.side,
                "Trade received"
            ),
            Err(e) => warn!(symbol = %symbol, error = %e, "Trade update failed"),
        }
    }
    info!(symbol = %symbol, "Trade stream ended");
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(client: FeedClient, port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(client);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(client): State<FeedClient>) -> (StatusCode, Json<serde_json::Value>) {
    let open = client.is_open();
    let status = if open { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(serde_json::json!({
            "status": if open { "healthy" } else { "disconnected" },
            "component": "streaming-feed",
            "exchange_status": client.system_status().map(|s| s.status),
            "timestamp": chrono::Utc::now().to_rfc3339()
        })),
    )
}

async fn metrics(State(client): State<FeedClient>) -> (StatusCode, String) {
    match client.telemetry().render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
