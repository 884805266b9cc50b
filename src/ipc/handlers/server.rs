use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use super::super::{CommandRequest, IPCServer};
use crate::supervisor::SupervisorError;

/// POST /api/instance/:id/start - 서버 시작
pub async fn start_server_handler(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let outcome = state.supervisor.start(&id).await?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "pid": outcome.pid,
            "started_at": outcome.started_at,
        })),
    ))
}

/// POST /api/instance/:id/stop - 서버 중지 (graceful → forced)
pub async fn stop_server_handler(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let outcome = state.supervisor.stop(&id).await?;
    Ok((StatusCode::OK, Json(json!({ "success": true, "outcome": outcome }))))
}

/// POST /api/instance/:id/restart - 서버 재시작
pub async fn restart_server_handler(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let outcome = state.supervisor.restart(&id).await?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "pid": outcome.pid,
            "started_at": outcome.started_at,
        })),
    ))
}

/// POST /api/instance/:id/command - stdin으로 명령어 전송
pub async fn execute_command(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
    Json(req): Json<CommandRequest>,
) -> Result<impl IntoResponse, SupervisorError> {
    state.supervisor.send_command(&id, &req.command).await?;
    Ok((StatusCode::OK, Json(json!({ "success": true }))))
}

/// GET /api/instance/:id/probe - 저장된 PID의 생존 여부
pub async fn probe_server_handler(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let liveness = state.supervisor.probe(&id).await?;
    Ok((StatusCode::OK, Json(liveness)))
}
