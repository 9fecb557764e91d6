//! PDF Compression Server
//!
//! HTTP front end for the `pdfshrink-core` pipeline. Provides REST API
//! endpoints for:
//!
//! - Compression level listing
//! - Base64 JSON compression
//! - Multipart upload compression (single PDF, ZIP archive or JSON stats)
//!
//! ## Architecture
//!
//! Each request runs its pipeline on tokio's blocking pool; requests share
//! only read-only configuration. Callers without entitlement are held to
//! the free-tier limits in `[limits]`.
//!
//! - Rate limiting via tower-governor
//! - Request logging via tower-http `TraceLayer`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use clap::Parser;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;
mod config;
mod entitlement;
mod error;
mod restrictions;

use api::{handle_compress, handle_compress_upload, handle_compression_levels, handle_health};
use config::ServiceConfig;
use entitlement::{EntitlementSource, StaticEntitlements};

/// Command-line arguments for the compression server
#[derive(Parser, Debug)]
#[command(name = "pdfshrink-server")]
#[command(about = "PDF compression service")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Host address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Rate limit: requests per second per IP
    #[arg(long, default_value = "10")]
    rate_limit: u32,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub entitlements: Arc<dyn EntitlementSource>,
}

impl AppState {
    pub fn new(config: ServiceConfig) -> Self {
        let entitlements = Arc::new(StaticEntitlements::from_config(&config.entitlements));
        Self {
            config: Arc::new(config),
            entitlements,
        }
    }
}

/// Routes, body limit, CORS and request tracing. Rate limiting is added in
/// `main` since it needs the peer address.
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.limits.max_upload_mb * 1024 * 1024;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(handle_health))
        // API endpoints
        .route("/api/compression-levels", get(handle_compression_levels))
        .route("/api/compress", post(handle_compress))
        .route("/api/compress/upload", post(handle_compress_upload))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            ServiceConfig::from_file(path)?
        }
        None => ServiceConfig::default(),
    };

    info!("Starting pdfshrink server on {}:{}", args.host, args.port);

    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(args.rate_limit.into())
            .burst_size(args.rate_limit * 2)
            .finish()
            .ok_or_else(|| anyhow!("Invalid rate limit: {}", args.rate_limit))?,
    );

    let final_pass_tool = config.compression.final_pass_tool.clone();
    let tool_search_path = config.compression.tool_search_path.clone();
    let app = build_router(AppState::new(config)).layer(GovernorLayer {
        config: governor_conf,
    });

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("Server listening on http://{}", addr);
    info!("Rate limit: {} requests/second per IP", args.rate_limit);
    match pdfshrink_core::find_executable(&final_pass_tool, tool_search_path.as_deref()) {
        Some(path) => info!("Final pass tool: {}", path.display()),
        None => info!(
            "Final pass tool '{}' not found; in-process fallback will be used",
            final_pass_tool
        ),
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
