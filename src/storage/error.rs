// 存储层错误类型

use thiserror::Error;

/// 分片存储 / 合并错误
#[derive(Debug, Error)]
pub enum StorageError {
    /// 名称非法（包含路径分隔符、`..` 或为空）
    #[error("非法名称: {0}")]
    InvalidName(String),

    /// 分片名称无法解析出数字序号
    #[error("无法从分片名称解析序号: {0}")]
    InvalidChunkName(String),

    /// 分片大小非法（必须大于 0）
    #[error("非法分片大小: {0}")]
    InvalidChunkSize(u64),

    /// 续传起始偏移与已落盘字节数不一致
    #[error("续传偏移非法: start={start}, 已落盘={persisted}")]
    InvalidOffset { start: u64, persisted: u64 },

    /// 合并时分片目录不存在
    #[error("分片目录不存在: {0}")]
    ChunkDirMissing(String),

    /// 合并时分片目录为空
    #[error("分片目录为空: {0}")]
    NoChunks(String),

    /// 分片序号不连续，缺少中间分片
    #[error("缺少分片 #{index}")]
    MissingChunk { index: u64 },

    /// 写入流出错
    #[error("数据流错误: {0}")]
    Stream(String),

    /// 后台任务异常退出
    #[error("后台任务异常: {0}")]
    Join(String),

    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
