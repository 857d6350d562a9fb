// 服务端分片工具
//
// 把本地文件直接切成 `<name>-<index>` 分片放进 tmp/<name>/，
// 只用于在服务端准备合并数据（测试、手工修复），不走上传流程

use crate::storage::chunk_store::ChunkRecord;
use crate::storage::layout::{chunk_name, StorageLayout};
use crate::storage::{StorageError, StorageResult};
use crate::uploader::chunk::partition;
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::info;

/// 服务端默认分片大小: 80MB
pub const DEFAULT_SPLIT_CHUNK_SIZE: u64 = 80 * 1024 * 1024;

/// 切分本地文件
///
/// 分片目录名取源文件名，各分片并发写入
pub async fn split_file(
    layout: &StorageLayout,
    source: &Path,
    chunk_size: u64,
) -> StorageResult<Vec<ChunkRecord>> {
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| StorageError::InvalidName(source.display().to_string()))?;

    let total_size = fs::metadata(source).await?.len();
    let ranges = partition(total_size, chunk_size)
        .map_err(|_| StorageError::InvalidChunkSize(chunk_size))?;

    let chunk_dir = layout.chunk_dir(&file_name)?;
    fs::create_dir_all(&chunk_dir).await?;

    let mut join_set: JoinSet<StorageResult<(usize, ChunkRecord)>> = JoinSet::new();
    for (index, range) in ranges.into_iter().enumerate() {
        let name = chunk_name(&file_name, index as u64);
        let target = chunk_dir.join(&name);
        let source = source.to_path_buf();

        join_set.spawn(async move {
            let mut reader = File::open(&source).await?;
            reader.seek(SeekFrom::Start(range.start)).await?;
            let mut reader = reader.take(range.end - range.start);

            let mut writer = File::create(&target).await?;
            let size = tokio::io::copy(&mut reader, &mut writer).await?;
            writer.flush().await?;

            Ok((index, ChunkRecord { name, size }))
        });
    }

    let mut indexed = Vec::new();
    while let Some(result) = join_set.join_next().await {
        indexed.push(result.map_err(|e| StorageError::Join(e.to_string()))??);
    }
    indexed.sort_by_key(|(index, _)| *index);
    let records: Vec<ChunkRecord> = indexed.into_iter().map(|(_, r)| r).collect();

    info!(
        "文件切分完成: {} ({} bytes, {} 个分片)",
        file_name,
        total_size,
        records.len()
    );

    Ok(records)
}
