use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::super::IPCServer;
use crate::supervisor::SupervisorError;

#[derive(Debug, Deserialize)]
pub struct ConsoleQuery {
    pub since: Option<u64>,
    pub count: Option<usize>,
}

/// GET /api/instance/:id/console?since=0&count=100 - 콘솔 출력 조회
///
/// Without `since` this is treated as a fresh attach and may replay log
/// history for servers this daemon did not launch.
pub async fn get_console_handler(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
    Query(params): Query<ConsoleQuery>,
) -> Result<impl IntoResponse, SupervisorError> {
    let mut lines = match params.since {
        Some(since) => state.supervisor.console_since(&id, since)?,
        None => state.supervisor.open_console(&id)?,
    };
    if let Some(count) = params.count {
        let excess = lines.len().saturating_sub(count);
        lines.drain(..excess);
    }
    let last_seq = lines
        .last()
        .map(|l| l.seq)
        .unwrap_or(params.since.unwrap_or(0));

    Ok((
        StatusCode::OK,
        Json(json!({ "success": true, "lines": lines, "last_seq": last_seq })),
    ))
}

/// DELETE /api/instance/:id/console - 콘솔 비우기
pub async fn clear_console_handler(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    state.supervisor.clear_console(&id)?;
    Ok((StatusCode::OK, Json(json!({ "success": true }))))
}
