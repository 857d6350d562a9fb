// 上传分片管理
//
// 分片规则：
// - 固定分片大小（默认 50MB），最后一个分片可以更短
// - 分片名称为 `<fingerprint.ext>-<index>`，与服务端目录结构对应
// - 每个分片记录服务端已落盘的字节数，用于断点续传

use crate::uploader::UploadError;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 默认上传分片大小: 50MB
pub const DEFAULT_UPLOAD_CHUNK_SIZE: u64 = 50 * 1024 * 1024;

/// 把 `[0, total_size)` 切成连续、不重叠的区间
///
/// 共 `ceil(total_size / part_size)` 个区间，按序号升序
pub fn partition(total_size: u64, part_size: u64) -> Result<Vec<Range<u64>>, UploadError> {
    if part_size == 0 {
        return Err(UploadError::InvalidPartSize(part_size));
    }

    let mut ranges = Vec::with_capacity(total_size.div_ceil(part_size) as usize);
    let mut offset = 0u64;
    while offset < total_size {
        let end = std::cmp::min(offset + part_size, total_size);
        ranges.push(offset..end);
        offset = end;
    }

    Ok(ranges)
}

/// 保留两位小数
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// 分片进度
///
/// `loaded` = 续传前已落盘字节数 + 本次已发送字节数
#[derive(Debug)]
pub struct PartProgress {
    size: u64,
    loaded: AtomicU64,
}

impl PartProgress {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            loaded: AtomicU64::new(0),
        }
    }

    /// 以已落盘字节数作为新的起点
    pub fn seed(&self, persisted: u64) {
        self.loaded.store(persisted.min(self.size), Ordering::SeqCst);
    }

    /// 累加本次发送的字节数
    pub fn add(&self, bytes: u64) {
        self.loaded.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn loaded(&self) -> u64 {
        self.loaded.load(Ordering::SeqCst).min(self.size)
    }

    /// 百分比（0-100，两位小数）
    pub fn percent(&self) -> f64 {
        if self.size == 0 {
            return 100.0;
        }
        round2(self.loaded() as f64 / self.size as f64 * 100.0)
    }
}

/// 上传分片信息
#[derive(Debug, Clone)]
pub struct UploadChunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
    /// 分片名称
    pub name: String,
    /// 协商时服务端已落盘的字节数
    pub persisted_bytes: u64,
    /// 进度
    pub progress: Arc<PartProgress>,
    /// 正在传输时的取消句柄
    pub transfer_handle: Option<CancellationToken>,
}

impl UploadChunk {
    pub fn new(index: usize, range: Range<u64>, file_name: &str) -> Self {
        let size = range.end - range.start;
        Self {
            index,
            range,
            name: crate::storage::chunk_name(file_name, index as u64),
            persisted_bytes: 0,
            progress: Arc::new(PartProgress::new(size)),
            transfer_handle: None,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn percent(&self) -> f64 {
        self.progress.percent()
    }

    pub fn is_transferring(&self) -> bool {
        self.transfer_handle.is_some()
    }
}

/// 上传分片管理器
#[derive(Debug)]
pub struct UploadChunkManager {
    /// 指纹文件名
    file_name: String,
    /// 所有分片
    chunks: Vec<UploadChunk>,
    /// 文件总大小
    total_size: u64,
    /// 分片大小
    chunk_size: u64,
}

impl UploadChunkManager {
    /// 创建新的上传分片管理器
    ///
    /// # 参数
    /// * `file_name` - 指纹文件名（`<fingerprint><ext>`）
    /// * `total_size` - 文件总大小
    /// * `chunk_size` - 分片大小
    pub fn new(file_name: &str, total_size: u64, chunk_size: u64) -> Result<Self, UploadError> {
        let chunks: Vec<UploadChunk> = partition(total_size, chunk_size)?
            .into_iter()
            .enumerate()
            .map(|(index, range)| UploadChunk::new(index, range, file_name))
            .collect();

        info!(
            "创建上传分片管理器: file={}, 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            file_name,
            total_size,
            chunk_size,
            chunks.len()
        );

        Ok(Self {
            file_name: file_name.to_string(),
            chunks,
            total_size,
            chunk_size,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// 获取所有分片
    pub fn chunks(&self) -> &[UploadChunk] {
        &self.chunks
    }

    pub fn chunks_mut(&mut self) -> &mut [UploadChunk] {
        &mut self.chunks
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut UploadChunk> {
        self.chunks.get_mut(index)
    }

    /// 获取分片数量
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// 已传完的分片数量
    pub fn completed_count(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.progress.loaded() >= c.size())
            .count()
    }

    /// 各分片百分比
    pub fn part_percents(&self) -> Vec<f64> {
        self.chunks.iter().map(|c| c.percent()).collect()
    }

    /// 总进度：各分片百分比的算术平均（不按字节加权）
    pub fn progress(&self) -> f64 {
        if self.chunks.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.chunks.iter().map(|c| c.percent()).sum();
        round2(sum / self.chunks.len() as f64)
    }

    /// 全部标记为完成（秒传）
    pub fn mark_all_completed(&mut self) {
        for chunk in &mut self.chunks {
            chunk.persisted_bytes = chunk.size();
            chunk.progress.seed(chunk.size());
        }
    }

    /// 取消所有正在传输的分片，返回取消的数量
    pub fn cancel_all(&self) -> usize {
        self.chunks
            .iter()
            .filter_map(|c| c.transfer_handle.as_ref())
            .map(|handle| handle.cancel())
            .count()
    }

    /// 清除所有传输句柄
    pub fn clear_handles(&mut self) {
        for chunk in &mut self.chunks {
            chunk.transfer_handle = None;
        }
    }
}
