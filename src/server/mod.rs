// Web服务器模块

pub mod error;
pub mod handlers;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::warn;

/// 构建 CORS 层：未配置来源时允许任意来源
fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return cors.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("忽略无效的 CORS 来源: {}, 错误: {}", origin, e);
                None
            }
        })
        .collect();
    cors.allow_origin(parsed)
}

/// 构建完整应用路由
///
/// - /api/v1/verify、/api/v1/upload、/api/v1/merge
/// - /health
/// - 其余路径由 public 目录提供静态文件（合并后的文件）
pub fn build_router(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config.server.cors_origins));

    let api_routes = Router::new()
        .route("/verify/:name", get(handlers::verify_upload))
        .route(
            "/upload/:name/:chunk_name/:start",
            // 分片可能有几十 MB，不限制请求体大小
            post(handlers::upload_chunk).layer(DefaultBodyLimit::disable()),
        )
        .route("/merge/:name/:chunk_size", post(handlers::merge_chunks))
        .with_state(state.clone());

    let static_service = ServeDir::new(state.layout().public_dir());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(handlers::health_check))
        .fallback_service(static_service)
        .layer(middleware)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::storage::{StorageLayout, VerifyResult};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use handlers::{ApiResponse, UploadPartResponse};
    use serde::de::DeserializeOwned;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn setup() -> (TempDir, Router) {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path().join("tmp"), dir.path().join("public"));
        std::fs::create_dir_all(layout.public_dir()).unwrap();
        let state = AppState::with_layout(AppConfig::default(), layout);
        (dir, build_router(state))
    }

    async fn call<T: DeserializeOwned>(
        router: &Router,
        request: Request<Body>,
    ) -> (StatusCode, ApiResponse<T>) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post(uri: &str, body: &'static [u8]) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/octet-stream")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_verify_unknown_file() {
        let (_dir, router) = setup();
        let (status, body) = call::<VerifyResult>(
            &router,
            Request::get("/api/v1/verify/abc.mp4").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.code, 0);
        assert_eq!(body.data.unwrap(), VerifyResult::default());
    }

    #[tokio::test]
    async fn test_upload_resume_merge_and_serve() {
        let (_dir, router) = setup();

        let (status, body) =
            call::<UploadPartResponse>(&router, post("/api/v1/upload/h.png/h.png-0/0", b"abc"))
                .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.data.unwrap().written, 3);

        // 续传：从已落盘位置继续
        let (_, body) =
            call::<UploadPartResponse>(&router, post("/api/v1/upload/h.png/h.png-0/3", b"de"))
                .await;
        assert_eq!(body.data.unwrap().written, 2);

        call::<UploadPartResponse>(&router, post("/api/v1/upload/h.png/h.png-1/0", b"fg")).await;

        let (_, body) = call::<VerifyResult>(
            &router,
            Request::get("/api/v1/verify/h.png").body(Body::empty()).unwrap(),
        )
        .await;
        let persisted = body.data.unwrap().persisted;
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted[0].size, 5);

        let (status, body) = call::<crate::storage::MergeResult>(
            &router,
            post("/api/v1/merge/h.png/5", b""),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.data.unwrap().size, 7);

        // 秒传
        let (_, body) = call::<VerifyResult>(
            &router,
            Request::get("/api/v1/verify/h.png").body(Body::empty()).unwrap(),
        )
        .await;
        assert!(body.data.unwrap().exists_final);

        // 最终文件可以直接访问
        let response = router
            .clone()
            .oneshot(Request::get("/h.png").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"abcdefg");
    }

    #[tokio::test]
    async fn test_offset_beyond_persisted_rejected() {
        let (_dir, router) = setup();
        let (status, body) =
            call::<UploadPartResponse>(&router, post("/api/v1/upload/h.png/h.png-0/10", b"x"))
                .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.code, 400);
        assert!(body.data.is_none());
    }

    fn broken_body(kind: std::io::ErrorKind) -> Request<Body> {
        let parts = futures::stream::iter(vec![
            Ok(bytes::Bytes::from_static(b"12")),
            Err(std::io::Error::new(kind, "body interrupted")),
        ]);
        Request::post("/api/v1/upload/h.png/h.png-0/0")
            .header("content-type", "application/octet-stream")
            .body(Body::from_stream(parts))
            .unwrap()
    }

    #[tokio::test]
    async fn test_client_abort_keeps_partial_chunk() {
        let (_dir, router) = setup();
        let (status, body) = call::<UploadPartResponse>(
            &router,
            broken_body(std::io::ErrorKind::ConnectionAborted),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.data.unwrap().written, 2);

        // 断开前的字节保留，可以从 2 续传
        let (status, body) =
            call::<UploadPartResponse>(&router, post("/api/v1/upload/h.png/h.png-0/2", b"34"))
                .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.data.unwrap().written, 2);
    }

    #[tokio::test]
    async fn test_corrupt_body_is_error() {
        let (_dir, router) = setup();
        let (status, body) =
            call::<UploadPartResponse>(&router, broken_body(std::io::ErrorKind::InvalidData))
                .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.code, 500);
        assert!(body.data.is_none());

        // 出错前写入的字节仍在，续传协商可见
        let (_, body) = call::<VerifyResult>(
            &router,
            Request::get("/api/v1/verify/h.png").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(body.data.unwrap().persisted[0].size, 2);
    }

    #[tokio::test]
    async fn test_traversal_name_rejected() {
        let (_dir, router) = setup();
        let (status, _) = call::<VerifyResult>(
            &router,
            Request::get("/api/v1/verify/..").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_merge_without_chunks_not_found() {
        let (_dir, router) = setup();
        let (status, body) =
            call::<crate::storage::MergeResult>(&router, post("/api/v1/merge/none.png/100", b""))
                .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_ne!(body.code, 0);
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, router) = setup();
        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
