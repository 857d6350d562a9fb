// 服务端存储模块
//
// - 分片存储：按偏移追加写入、续传协商
// - 合并引擎：按数字序号并发写入最终文件
// - 服务端切分工具

pub mod chunk_store;
pub mod error;
pub mod layout;
pub mod merge;
pub mod split;

pub use chunk_store::{list_and_stat, ChunkRecord, ChunkStore, VerifyResult, WriteOutcome};
pub use error::{StorageError, StorageResult};
pub use layout::{chunk_name, parse_chunk_index, validate_name, StorageLayout};
pub use merge::{plan_chunk_writes, ChunkWriteTask, MergeEngine, MergeResult};
pub use split::{split_file, DEFAULT_SPLIT_CHUNK_SIZE};
