// 上传客户端错误定义

use thiserror::Error;

/// 上传错误
///
/// 传输失败和用户暂停统一为 `FailedOrPaused`，两者的恢复方式都是续传
#[derive(Debug, Error)]
pub enum UploadError {
    /// 文件类型不在允许列表中
    #[error("不支持的文件类型: {0}")]
    UnsupportedType(String),

    /// 文件过大
    #[error("文件过大: {size} bytes (上限 {limit} bytes)")]
    TooLarge { size: u64, limit: u64 },

    /// 分片大小必须为正数
    #[error("无效的分片大小: {0}")]
    InvalidPartSize(u64),

    /// 本地文件读取失败
    #[error("读取文件失败: {0}")]
    Read(#[from] std::io::Error),

    /// 续传协商失败
    #[error("续传协商失败: {0}")]
    Negotiate(String),

    /// 分片传输失败或已暂停
    #[error("上传失败或暂停中")]
    FailedOrPaused,

    /// 合并失败，分片保留可重试
    #[error("合并失败: {0}")]
    Merge(String),

    /// 任务不存在或状态不允许该操作
    #[error("任务状态错误: {0}")]
    InvalidState(String),
}

impl UploadError {
    /// 是否属于输入校验错误（在创建任何状态前被拒绝）
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            UploadError::UnsupportedType(_) | UploadError::TooLarge { .. }
        )
    }
}
