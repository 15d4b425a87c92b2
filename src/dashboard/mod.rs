use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::backend::{BoardRecord, SessionRecord};
use crate::error::GridError;
use crate::node::{ControlEvent, ControlPlane};
use crate::scheduler::SessionState;

#[derive(Clone)]
pub struct DashboardState {
    pub control: ControlPlane,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddBoardRequest {
    pub hostname: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SaveSessionRequest {
    pub image_name: String,
}

fn status_code(err: &GridError) -> StatusCode {
    match err {
        GridError::PlatformNotFound(_) | GridError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        GridError::NoRunningJob { .. } | GridError::NoContainer(_) => StatusCode::CONFLICT,
        GridError::Expansion { .. } | GridError::Backend(_) | GridError::Engine(_) => {
            StatusCode::BAD_GATEWAY
        }
        GridError::GridClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
        GridError::PortsExhausted | GridError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn action(result: crate::error::Result<()>) -> Response {
    match result {
        Ok(()) => (
            StatusCode::OK,
            Json(ActionResponse {
                success: true,
                error: None,
            }),
        )
            .into_response(),
        Err(e) => (
            status_code(&e),
            Json(ActionResponse {
                success: false,
                error: Some(e.to_string()),
            }),
        )
            .into_response(),
    }
}

/// Control and status API.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/platforms", get(platforms_handler))
        .route("/api/platforms/:platform/boards", post(add_board_handler))
        .route(
            "/api/platforms/:platform/boards/:hostname",
            delete(remove_board_handler),
        )
        .route("/api/sessions", post(submit_session_handler))
        .route("/api/sessions/:id", delete(cancel_session_handler))
        .route("/api/sessions/:id/save", post(save_session_handler))
        .route("/api/diagnostics", post(diagnostics_handler))
        .route("/api/events", post(event_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting control API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind control API server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        tracing::error!(error = %e, "Control API server failed");
    }
}

async fn platforms_handler(State(state): State<DashboardState>) -> Response {
    match state.control.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => action(Err(e)),
    }
}

async fn add_board_handler(
    State(state): State<DashboardState>,
    Path(platform): Path<String>,
    Json(payload): Json<AddBoardRequest>,
) -> Response {
    let record = BoardRecord {
        id: payload.id,
        hostname: payload.hostname,
        address: payload.address,
        description: String::new(),
    };
    action(
        state
            .control
            .dispatch(ControlEvent::BoardAdded {
                platform,
                board: record,
            })
            .await,
    )
}

async fn remove_board_handler(
    State(state): State<DashboardState>,
    Path((platform, hostname)): Path<(String, String)>,
) -> Response {
    action(
        state
            .control
            .dispatch(ControlEvent::BoardRemoved { platform, hostname })
            .await,
    )
}

async fn submit_session_handler(
    State(state): State<DashboardState>,
    Json(session): Json<SessionRecord>,
) -> Response {
    action(
        state
            .control
            .dispatch(ControlEvent::SessionAdded { session })
            .await,
    )
}

async fn cancel_session_handler(
    State(state): State<DashboardState>,
    Path(session_id): Path<u64>,
) -> Response {
    action(
        state
            .control
            .dispatch(ControlEvent::SessionUpdated {
                session_id,
                state: SessionState::Canceled,
            })
            .await,
    )
}

async fn save_session_handler(
    State(state): State<DashboardState>,
    Path(session_id): Path<u64>,
    Json(payload): Json<SaveSessionRequest>,
) -> Response {
    action(
        state
            .control
            .dispatch(ControlEvent::SessionSaveRequested {
                session_id,
                image_name: payload.image_name,
            })
            .await,
    )
}

async fn diagnostics_handler(State(state): State<DashboardState>) -> Response {
    match state.control.diagnostics().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => action(Err(e)),
    }
}

/// Relay for events produced by an external subscription client.
async fn event_handler(
    State(state): State<DashboardState>,
    Json(event): Json<ControlEvent>,
) -> Response {
    action(state.control.dispatch(event).await)
}
