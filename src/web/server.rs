use axum::{Router, routing::get_service};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

use super::api::{AppState, create_api_router};
use crate::device_session::DeviceSession;

pub async fn start_web_server(
    session: Arc<DeviceSession>,
    config_path: PathBuf,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState {
        session,
        config_path: Arc::new(config_path),
    };

    // Create API router
    let api_router = create_api_router(state);

    // Create main app router with static file serving
    let app = Router::new()
        .nest("/api", api_router)
        .nest_service("/", get_service(ServeDir::new("static")))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Web server starting on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("Server error: {}", e))?;
    Ok(())
}

/// Resolves when the process receives ctrl-c. If signal registration
/// fails the server simply runs until killed.
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
