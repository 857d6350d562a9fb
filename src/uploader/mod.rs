// 上传客户端模块
//
// - 指纹计算在独立的阻塞线程中执行，按分片回传进度
// - 续传协商后只传输缺失或不完整的分片
// - 分片并发传输，暂停即取消所有传输中的分片
// - 全部分片成功后才请求合并

pub mod chunk;
pub mod engine;
pub mod error;
pub mod hasher;
pub mod manager;
pub mod task;
pub mod transport;
pub mod validate;

pub use chunk::{
    partition, PartProgress, UploadChunk, UploadChunkManager, DEFAULT_UPLOAD_CHUNK_SIZE,
};
pub use engine::{plan_transfers, PlannedTransfer, UploadEngine, UploadOutcome};
pub use error::UploadError;
pub use hasher::{calculate_fingerprint, spawn_hash_worker, HashEvent};
pub use manager::{UploadManager, UploadTaskInfo};
pub use task::{UploadEvent, UploadStatus, UploadTask};
pub use transport::{HttpTransport, LocalTransport, PartUpload, UploadTransport};
pub use validate::{extension_of, fingerprint_name, UploadPolicy, DEFAULT_MAX_FILE_SIZE};
