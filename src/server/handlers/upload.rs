// 上传API处理器

use crate::server::error::ApiResult;
use crate::server::handlers::ApiResponse;
use crate::server::AppState;
use crate::storage::{MergeResult, VerifyResult, WriteOutcome};
use axum::{
    body::Body,
    extract::{Path, State},
    Json,
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::io::{Error as IoError, ErrorKind};
use tracing::info;

/// 分片写入响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPartResponse {
    /// 本次请求写入的字节数
    pub written: u64,
}

/// 请求体读取错误分类
///
/// 客户端断开（连接提前关闭、请求被取消）映射为 `ConnectionAborted`，按暂停处理；
/// 其他错误映射为 `InvalidData`，写入失败并返回错误
pub fn classify_body_error(err: axum::Error) -> IoError {
    let inner = err.into_inner();

    if let Some(e) = inner.downcast_ref::<hyper::Error>() {
        let kind = if e.is_incomplete_message() || e.is_canceled() {
            ErrorKind::ConnectionAborted
        } else {
            ErrorKind::InvalidData
        };
        return IoError::new(kind, inner);
    }

    match inner.downcast::<IoError>() {
        Ok(io) => *io,
        Err(other) => IoError::new(ErrorKind::InvalidData, other),
    }
}

/// 续传协商
///
/// GET /api/v1/verify/:name
pub async fn verify_upload(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ApiResponse<VerifyResult>>> {
    let result = state.store.verify(&name).await?;
    Ok(Json(ApiResponse::success(result)))
}

/// 写入分片
///
/// POST /api/v1/upload/:name/:chunk_name/:start
///
/// 请求体为原始字节。读取请求体出错一律视为客户端断开（暂停），
/// 已写入的字节保留
pub async fn upload_chunk(
    State(state): State<AppState>,
    Path((name, chunk_name, start)): Path<(String, String, u64)>,
    body: Body,
) -> ApiResult<Json<ApiResponse<UploadPartResponse>>> {
    let stream = body.into_data_stream().map_err(classify_body_error);

    let outcome = state
        .store
        .write(&name, &chunk_name, start, stream, &state.shutdown)
        .await?;

    if let WriteOutcome::Aborted { written } = outcome {
        info!(
            "客户端中断上传: {}/{} (start={}, 已写入 {} bytes)",
            name, chunk_name, start, written
        );
    }

    Ok(Json(ApiResponse::success(UploadPartResponse {
        written: outcome.written(),
    })))
}

/// 合并分片
///
/// POST /api/v1/merge/:name/:chunk_size
pub async fn merge_chunks(
    State(state): State<AppState>,
    Path((name, chunk_size)): Path<(String, u64)>,
) -> ApiResult<Json<ApiResponse<MergeResult>>> {
    info!("API: 合并分片 {} (chunk_size={})", name, chunk_size);
    let result = state.merger.merge(&name, chunk_size).await?;
    Ok(Json(ApiResponse::success(result)))
}
