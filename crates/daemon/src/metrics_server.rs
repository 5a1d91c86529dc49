//! Activity HTTP server
//!
//! Exposes the activity snapshot for dashboards and monitoring tools.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;
use tracing::info;

use crate::metrics::{ActivitySnapshot, SharedActivity};

/// Errors that can occur when running the activity server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address {0}")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /activity
async fn get_activity(State(activity): State<SharedActivity>) -> Json<ActivitySnapshot> {
    let snapshot = activity.read().await.clone();
    Json(snapshot)
}

/// Creates the axum Router with the activity endpoint
pub fn create_activity_router(activity: SharedActivity) -> Router {
    Router::new()
        .route("/activity", get(get_activity))
        .with_state(activity)
}

/// Serve the activity endpoint on `bind` until the server stops.
pub async fn run_activity_server(activity: SharedActivity, bind: &str) -> Result<(), ServerError> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))?;
    let app = create_activity_router(activity);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "activity server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
