// API 错误处理
//
// 所有错误都按统一格式返回：{ code, message }，code 与 HTTP 状态码一致

use crate::server::handlers::ApiResponse;
use crate::storage::StorageError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

/// API 错误
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// 请求参数错误
    #[error("{0}")]
    BadRequest(String),
    /// 资源不存在
    #[error("{0}")]
    NotFound(String),
    /// 服务器内部错误
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::InvalidName(_)
            | StorageError::InvalidChunkName(_)
            | StorageError::InvalidChunkSize(_)
            | StorageError::InvalidOffset { .. } => ApiError::BadRequest(e.to_string()),
            StorageError::ChunkDirMissing(_) | StorageError::NoChunks(_) => {
                ApiError::NotFound(e.to_string())
            }
            other => ApiError::Internal(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let ApiError::Internal(e) = &self {
            error!("内部错误: {:#}", e);
        }

        let body = ApiResponse::<()>::error(status.as_u16() as i32, self.to_string());
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_mapping() {
        let e: ApiError = StorageError::InvalidName("../x".to_string()).into();
        assert_eq!(e.status(), StatusCode::BAD_REQUEST);

        let e: ApiError = StorageError::InvalidOffset {
            start: 10,
            persisted: 4,
        }
        .into();
        assert_eq!(e.status(), StatusCode::BAD_REQUEST);

        let e: ApiError = StorageError::ChunkDirMissing("a.mp4".to_string()).into();
        assert_eq!(e.status(), StatusCode::NOT_FOUND);

        // 缺分片属于服务端数据不完整
        let e: ApiError = StorageError::MissingChunk { index: 3 }.into();
        assert_eq!(e.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
