// ==============================================================================
// main.rs - Varda API Gateway Entry Point
// ==============================================================================
// Description: Axum web server for the Varda variant frequency store API
// Author: Matt Barham
// Created: 2025-12-15
// Modified: 2026-01-24
// Version: 1.2.0
// ==============================================================================

use anyhow::{Context, Result};
use axum::{
    error_handling::HandleErrorLayer,
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::time::Duration;
use tower::timeout::TimeoutLayer;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, Level};
use varda_core::config::Settings;

mod error;
mod handlers;
mod middleware;
mod models;
mod pagination;
mod queue;
mod security;
mod state;

use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let server_port = 8089;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .compact()
        .init();

    info!("Starting Varda API Gateway v1.0.0");

    // Load environment variables
    dotenvy::dotenv().ok();
    let settings = Settings::from_env().context("Failed to load settings")?;

    // Initialize application state
    let state = AppState::new(settings)
        .await
        .context("Failed to initialize application state")?;

    // Build router with all endpoints
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], server_port));
    info!("API Gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .await
        .context("Server error")?;

    Ok(())
}

fn build_router(state: AppState) -> Router {
    let settings = state.settings().clone();

    let api_routes = Router::new()
        // Samples and their state machine
        .route(
            "/samples",
            get(handlers::list_samples).post(handlers::create_sample),
        )
        .route(
            "/samples/{sample_id}",
            get(handlers::get_sample).patch(handlers::patch_sample),
        )
        // Data sources (uploads and generated files)
        .route(
            "/data_sources",
            get(handlers::list_data_sources).post(handlers::create_data_source),
        )
        .route("/data_sources/{data_source_id}", get(handlers::get_data_source))
        .route(
            "/data_sources/{data_source_id}/data",
            get(handlers::get_data_source_data),
        )
        // Variation and coverage imports (tasked resources)
        .route("/variations", post(handlers::create_variation))
        .route(
            "/variations/{variation_id}",
            get(handlers::get_variation).patch(handlers::patch_variation),
        )
        .route("/coverages", post(handlers::create_coverage))
        .route(
            "/coverages/{coverage_id}",
            get(handlers::get_coverage).patch(handlers::patch_coverage),
        )
        // Annotations (tasked resources)
        .route("/annotations", post(handlers::create_annotation))
        .route(
            "/annotations/{annotation_id}",
            get(handlers::get_annotation).patch(handlers::patch_annotation),
        )
        // Variants and frequency queries
        .route("/variants", post(handlers::create_variant))
        .route("/variants/{variant_id}", get(handlers::get_variant_frequency))
        // Users, tokens, groups
        .route("/users", get(handlers::list_users).post(handlers::create_user))
        .route("/users/{user_id}", get(handlers::get_user))
        .route(
            "/tokens",
            get(handlers::list_tokens).post(handlers::create_token),
        )
        .route("/tokens/{token_id}", delete(handlers::delete_token))
        .route(
            "/groups",
            get(handlers::list_groups).post(handlers::create_group),
        )
        .route("/groups/{group_id}/samples", post(handlers::add_group_member))
        // Health checks
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check));

    // CORS per configuration: a single origin or the wildcard.
    let cors = match settings.cors_allow_origin.as_deref() {
        Some("*") => Some(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PATCH,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::RANGE])
                .expose_headers([header::CONTENT_RANGE]),
        ),
        Some(origin) => HeaderValue::from_str(origin).ok().map(|origin| {
            CorsLayer::new()
                .allow_origin(AllowOrigin::exact(origin))
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PATCH,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::RANGE])
                .expose_headers([header::CONTENT_RANGE])
        }),
        None => None,
    };

    let prefix = settings
        .api_url_prefix
        .clone()
        .filter(|p| p.starts_with('/') && p.len() > 1);

    let mut app = match prefix {
        Some(prefix) => Router::new()
            .route("/", get(handlers::root))
            .nest(&prefix, api_routes),
        None => Router::new().route("/", get(handlers::root)).merge(api_routes),
    };

    if let Some(cors) = cors {
        app = app.layer(cors);
    }

    app.layer(
        ServiceBuilder::new()
            // Request tracing
            .layer(TraceLayer::new_for_http())
            // Per-request deadline; an exceeded deadline aborts the
            // in-flight statement and reports a gateway timeout
            .layer(HandleErrorLayer::new(handle_timeout_error))
            .layer(TimeoutLayer::new(Duration::from_secs(30)))
            // Request body size limit from MAX_CONTENT_LENGTH
            .layer(DefaultBodyLimit::max(settings.max_content_length)),
    )
    .with_state(state)
}

// Timeout error handler
async fn handle_timeout_error(err: tower::BoxError) -> impl IntoResponse {
    if err.is::<tower::timeout::error::Elapsed>() {
        (StatusCode::GATEWAY_TIMEOUT, "Request timed out".to_string())
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Unhandled error: {}", err),
        )
    }
}
