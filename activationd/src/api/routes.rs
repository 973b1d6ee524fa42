use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use crate::reactor::RegistryHandle;
use shared::types::{EnableRequest, ServiceStatus};

#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/services", get(get_services))
        .route("/v1/services/:service", get(get_service))
        .route("/v1/services/:service/enabled", put(put_enabled))
        .route("/v1/reload", post(post_reload))
        .with_state(state)
}

fn internal_error(e: anyhow::Error) -> StatusCode {
    tracing::error!("Registry request failed: {}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn get_services(
    State(state): State<AppState>,
) -> Result<Json<Vec<ServiceStatus>>, StatusCode> {
    state.registry.services().await.map(Json).map_err(internal_error)
}

/// Unknown services report `installed: false` rather than 404
async fn get_service(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> Result<Json<ServiceStatus>, StatusCode> {
    state.registry.status(service).await.map(Json).map_err(internal_error)
}

async fn put_enabled(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Json(request): Json<EnableRequest>,
) -> Result<Json<ServiceStatus>, StatusCode> {
    let status = match request.expiration {
        Some(expiration) => state.registry.enable_until(service, expiration).await,
        None => state.registry.set_enabled(service, request.enabled).await,
    };

    status.map(Json).map_err(internal_error)
}

async fn post_reload(State(state): State<AppState>) -> Result<Json<Vec<String>>, StatusCode> {
    state.registry.reload().await.map(Json).map_err(internal_error)
}
