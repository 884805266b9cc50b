use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use super::super::IPCServer;
use crate::supervisor::SupervisorError;

/// POST /api/instance/:id/auth/login - 디바이스 로그인 시작
pub async fn begin_login_handler(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let snapshot = state.auth.begin_login(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

/// GET /api/instance/:id/auth - 현재 로그인 세션 상태
pub async fn get_auth_handler(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    state.supervisor.get(&id)?;
    Ok((StatusCode::OK, Json(state.auth.snapshot(&id))))
}
