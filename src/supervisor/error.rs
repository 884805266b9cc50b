//! Supervisor 전용 에러 타입 - 예상 가능한 상태(이미 실행 중, 실행 중 아님 등)와
//! 환경 오류(OS 실행 실패, 종료 실패)를 구분하여 호출자가 분기할 수 있게 합니다.

use axum::http::StatusCode;

/// Supervisor 작업 중 발생할 수 있는 에러 유형
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("Server '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Server '{0}' is not running")]
    NotRunning(String),

    #[error("Required file is missing: {}", .0.display())]
    MissingArtifact(std::path::PathBuf),

    #[error("Standard input of server '{0}' is not available (process was started by another session)")]
    InputUnavailable(String),

    #[error("Another start/stop operation is in progress for '{0}'")]
    OperationInProgress(String),

    #[error("Server '{0}' is running; stop it first")]
    InstanceRunning(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to launch server: {0}")]
    LaunchFailed(#[source] std::io::Error),

    #[error("Process {pid} is still running after forced termination")]
    TerminationFailed { pid: u32 },

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    /// 예상 가능한(복구 가능한) 상태인지 여부.
    /// 호출자는 이 값들을 결과로 분기하고, 나머지는 환경 오류로 취급합니다.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning(_)
                | Self::NotRunning(_)
                | Self::MissingArtifact(_)
                | Self::InputUnavailable(_)
                | Self::OperationInProgress(_)
                | Self::InstanceRunning(_)
        )
    }

    /// HTTP 상태 코드 매핑
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InstanceNotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyRunning(_) | Self::NotRunning(_) => StatusCode::CONFLICT,
            Self::OperationInProgress(_) | Self::InstanceRunning(_) => StatusCode::CONFLICT,
            Self::InputUnavailable(_) => StatusCode::CONFLICT,
            Self::MissingArtifact(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Self::LaunchFailed(_) | Self::TerminationFailed { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON 에러 응답 생성
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::MissingArtifact(_) => "MISSING_ARTIFACT",
            Self::InputUnavailable(_) => "INPUT_UNAVAILABLE",
            Self::OperationInProgress(_) => "OPERATION_IN_PROGRESS",
            Self::InstanceRunning(_) => "INSTANCE_RUNNING",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::LaunchFailed(_) => "LAUNCH_FAILED",
            Self::TerminationFailed { .. } => "TERMINATION_FAILED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// axum 핸들러에서 SupervisorError를 직접 반환할 수 있도록 IntoResponse 구현
impl axum::response::IntoResponse for SupervisorError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
