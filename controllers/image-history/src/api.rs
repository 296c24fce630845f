//! HTTP query API over the recorded usage history

use crate::error::ControllerError;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use usage_store::{ImageUsageEvent, StoreError, UsageStoreTrait};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn UsageStoreTrait>,
}

struct ApiError(StoreError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("Failed to read usage history: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

/// All recorded events in insertion order
async fn list_images(State(state): State<AppState>) -> Result<Json<Vec<ImageUsageEvent>>, ApiError> {
    state.store.list().await.map(Json).map_err(ApiError)
}

/// Create the API router
pub fn create_router(store: Arc<dyn UsageStoreTrait>) -> Router {
    Router::new()
        .route("/images", get(list_images))
        .with_state(AppState { store })
}

/// Serve `router` on `listener` until `shutdown` is cancelled
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), ControllerError> {
    info!(addr = %listener.local_addr()?, "Starting query API");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    info!("Query API stopped");
    Ok(())
}
