// Resumable Upload Rust Library
// 可续传、按内容寻址的分片上传

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// Web服务器模块
pub mod server;

// 服务端分片存储 / 合并模块
pub mod storage;

// 上传客户端模块
pub mod uploader;

// 导出常用类型
pub use config::AppConfig;
pub use server::{build_router, AppState};
pub use storage::{ChunkRecord, ChunkStore, MergeEngine, MergeResult, StorageLayout, VerifyResult};
pub use uploader::{
    HttpTransport, LocalTransport, UploadEngine, UploadError, UploadEvent, UploadManager,
    UploadOutcome, UploadStatus, UploadTask, UploadTransport,
};
