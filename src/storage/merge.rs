// 分片合并引擎
//
// 合并流程：
// 1. 列出分片目录，按名称末尾的数字序号升序排序（不能按字符串排序，"10" 会排在 "2" 前面）
// 2. 检查序号必须是 0..n 连续，缺分片时直接失败，不写入任何数据
// 3. 确保目标文件存在；每个分片单独打开一个读写句柄（不截断），
//    定位到 index * chunk_size 后并发写入
// 4. 全部写入成功后删除分片目录（失败只记日志）
//
// 各分片目标区间互不重叠，所以并发写入不需要加锁。目标文件在合并成功前
// 处于中间状态，不应被其他读者使用

use crate::storage::layout::{parse_chunk_index, StorageLayout};
use crate::storage::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// 单个分片的合并写入任务
///
/// 绝对偏移在构造时就已确定（`index * chunk_size`），写入时不再协商。
/// 同一次合并中各任务的 `[offset, offset + len)` 互不重叠
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkWriteTask {
    /// 分片序号
    pub index: u64,
    /// 分片文件路径
    pub source: PathBuf,
    /// 目标文件中的写入偏移
    pub offset: u64,
    /// 分片长度
    pub len: u64,
}

/// 合并结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    /// 最终文件名
    pub name: String,
    /// 最终文件大小
    pub size: u64,
}

/// 分片合并引擎
#[derive(Debug, Clone)]
pub struct MergeEngine {
    layout: StorageLayout,
}

impl MergeEngine {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// 合并指定文件的全部分片
    ///
    /// # 参数
    /// * `file_name` - 指纹文件名
    /// * `chunk_size` - 名义分片大小（最后一个分片可以更短）
    ///
    /// # 失败语义
    /// 任一分片写入失败则整体失败，分片目录保留以便重试
    pub async fn merge(&self, file_name: &str, chunk_size: u64) -> StorageResult<MergeResult> {
        if chunk_size == 0 {
            return Err(StorageError::InvalidChunkSize(chunk_size));
        }

        let chunk_dir = self.layout.chunk_dir(file_name)?;
        let artifact = self.layout.artifact_path(file_name)?;

        let tasks = plan_chunk_writes(&chunk_dir, chunk_size).await.map_err(|e| {
            match e {
                StorageError::Io(io) if io.kind() == ErrorKind::NotFound => {
                    StorageError::ChunkDirMissing(file_name.to_string())
                }
                StorageError::NoChunks(_) => StorageError::NoChunks(file_name.to_string()),
                other => other,
            }
        })?;

        info!(
            "开始合并: {} ({} 个分片, chunk_size={})",
            file_name,
            tasks.len(),
            chunk_size
        );

        // 目标文件不存在时先创建，绝不截断：并发写入者各自打开句柄
        if let Some(parent) = artifact.parent() {
            fs::create_dir_all(parent).await?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .open(&artifact)
            .await?;

        let mut join_set: JoinSet<StorageResult<u64>> = JoinSet::new();
        for task in tasks {
            let artifact = artifact.clone();
            join_set.spawn(async move { copy_chunk_into(&task, &artifact).await });
        }

        // 等待全部写入结束后再汇报，避免失败返回时仍有写入者在运行
        let mut first_error = None;
        while let Some(result) = join_set.join_next().await {
            let result = result.map_err(|e| StorageError::Join(e.to_string())).and_then(|r| r);
            if let Err(e) = result {
                error!("分片合并写入失败: {}, 错误: {}", file_name, e);
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let size = fs::metadata(&artifact).await?.len();

        if let Err(e) = fs::remove_dir_all(&chunk_dir).await {
            warn!("删除分片目录失败: {:?}, 错误: {}", chunk_dir, e);
        }

        info!("合并完成: {} ({} bytes)", file_name, size);

        Ok(MergeResult {
            name: file_name.to_string(),
            size,
        })
    }
}

/// 根据分片目录生成写入计划
///
/// 按解析出的数字序号排序，并要求序号恰好为 `0..n`
pub async fn plan_chunk_writes(
    chunk_dir: &Path,
    chunk_size: u64,
) -> StorageResult<Vec<ChunkWriteTask>> {
    let mut entries = fs::read_dir(chunk_dir).await?;

    let mut tasks = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let index = parse_chunk_index(&name)?;
        // 偏移超出 u64 时分片会互相覆盖
        let offset = index
            .checked_mul(chunk_size)
            .ok_or(StorageError::InvalidChunkSize(chunk_size))?;
        tasks.push(ChunkWriteTask {
            index,
            source: entry.path(),
            offset,
            len: metadata.len(),
        });
    }

    if tasks.is_empty() {
        return Err(StorageError::NoChunks(chunk_dir.display().to_string()));
    }

    tasks.sort_by_key(|t| t.index);

    for (expected, task) in (0u64..).zip(tasks.iter()) {
        if task.index != expected {
            return Err(StorageError::MissingChunk { index: expected });
        }
    }

    Ok(tasks)
}

/// 把单个分片流式写入目标文件的指定偏移
async fn copy_chunk_into(task: &ChunkWriteTask, artifact: &Path) -> StorageResult<u64> {
    let mut source = File::open(&task.source).await?;

    // 读写模式打开，不能截断：其他分片可能已写入
    let mut dest = OpenOptions::new()
        .read(true)
        .write(true)
        .open(artifact)
        .await?;
    dest.seek(SeekFrom::Start(task.offset)).await?;

    let copied = tokio::io::copy(&mut source, &mut dest).await?;
    dest.flush().await?;

    debug!(
        "分片 #{} 写入完成: offset={}, {} bytes",
        task.index, task.offset, copied
    );

    Ok(copied)
}
