use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use super::super::{CreateInstanceRequest, IPCServer, InstanceInfo};
use crate::supervisor::SupervisorError;

/// GET /api/instances - 모든 인스턴스 목록
pub async fn list_instances(
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let mut instances = Vec::new();
    for descriptor in state.supervisor.list()? {
        let phase = state.supervisor.phase(&descriptor.id)?;
        instances.push(InstanceInfo { descriptor, phase });
    }
    Ok((StatusCode::OK, Json(instances)))
}

/// GET /api/instance/:id - 특정 인스턴스 조회
pub async fn get_instance(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let descriptor = state.supervisor.get(&id)?;
    let phase = state.supervisor.phase(&id)?;
    Ok((StatusCode::OK, Json(InstanceInfo { descriptor, phase })))
}

/// POST /api/instances - 새 인스턴스 등록 (서버 파일은 이미 설치되어 있어야 함)
pub async fn create_instance(
    State(state): State<IPCServer>,
    Json(payload): Json<CreateInstanceRequest>,
) -> Result<impl IntoResponse, SupervisorError> {
    let descriptor = payload.into_descriptor();
    descriptor.validate().map_err(SupervisorError::InvalidConfig)?;
    state.supervisor.store().save(&descriptor)?;

    tracing::info!("Registered instance '{}' ({})", descriptor.name, descriptor.id);
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "id": descriptor.id })),
    ))
}

/// DELETE /api/instance/:id - 인스턴스 삭제 (실행 중이면 거부)
pub async fn delete_instance(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    state.supervisor.remove(&id).await?;
    state.auth.forget(&id);
    Ok((StatusCode::OK, Json(json!({ "success": true }))))
}
