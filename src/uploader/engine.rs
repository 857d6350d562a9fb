// 上传引擎
//
// 核心功能：
// 1. 续传协商，最终文件已存在时直接秒传
// 2. 根据已落盘分片计算传输集合（跳过 / 续传 / 全量）
// 3. 并发上传分片，每个分片持有独立的取消句柄
// 4. 全部分片成功后请求合并
//
// 失败语义：
// - 任一分片失败或被取消，整体视为"失败或暂停"，已落盘字节不回滚
// - 恢复时重新协商，传输集合自然变小

use crate::storage::{ChunkRecord, MergeResult};
use crate::uploader::chunk::{UploadChunk, UploadChunkManager};
use crate::uploader::task::UploadEvent;
use crate::uploader::transport::{PartUpload, UploadTransport};
use crate::uploader::UploadError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 进度上报间隔
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// 单个分片的传输计划
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedTransfer {
    /// 分片索引
    pub index: usize,
    /// 分片内的续传起点（服务端已落盘字节数）
    pub offset: u64,
}

/// 上传结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// 秒传：最终文件已存在，未发送任何字节
    InstantUpload,
    /// 正常上传并合并完成
    Uploaded(MergeResult),
}

/// 计算传输集合
///
/// - 已落盘字节数 >= 分片大小：跳过
/// - 已落盘字节数 < 分片大小：从已落盘位置续传
/// - 没有落盘记录：从 0 开始
pub fn plan_transfers(chunks: &[UploadChunk], persisted: &[ChunkRecord]) -> Vec<PlannedTransfer> {
    let persisted: HashMap<&str, u64> = persisted
        .iter()
        .map(|r| (r.name.as_str(), r.size))
        .collect();

    chunks
        .iter()
        .filter_map(|chunk| match persisted.get(chunk.name.as_str()) {
            Some(&size) if size >= chunk.size() => None,
            Some(&size) => Some(PlannedTransfer {
                index: chunk.index,
                offset: size,
            }),
            None => Some(PlannedTransfer {
                index: chunk.index,
                offset: 0,
            }),
        })
        .collect()
}

/// 上传引擎
///
/// 负责单个文件一次上传尝试的全部过程，暂停后由调用方用新的引擎恢复
pub struct UploadEngine {
    /// 传输层
    transport: Arc<dyn UploadTransport>,
    /// 本地源文件
    source: PathBuf,
    /// 分片管理器
    chunk_manager: Arc<Mutex<UploadChunkManager>>,
    /// 任务ID（事件标识）
    task_id: String,
    /// 事件发送端
    events: broadcast::Sender<UploadEvent>,
    /// 根取消令牌，各分片句柄由它派生
    cancel_token: CancellationToken,
}

impl UploadEngine {
    pub fn new(
        transport: Arc<dyn UploadTransport>,
        source: PathBuf,
        chunk_manager: Arc<Mutex<UploadChunkManager>>,
        task_id: String,
        events: broadcast::Sender<UploadEvent>,
    ) -> Self {
        Self {
            transport,
            source,
            chunk_manager,
            task_id,
            events,
            cancel_token: CancellationToken::new(),
        }
    }

    /// 暂停：取消所有正在传输的分片，不删除任何已落盘数据
    pub async fn pause(&self) {
        self.cancel_token.cancel();
        let cancelled = self.chunk_manager.lock().await.cancel_all();
        info!("暂停上传: task={}, 取消 {} 个传输中的分片", self.task_id, cancelled);
    }

    pub fn is_paused(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 当前总进度
    pub async fn progress(&self) -> f64 {
        self.chunk_manager.lock().await.progress()
    }

    /// 执行上传
    ///
    /// # 上传流程
    /// 1. 续传协商
    /// 2. 秒传直接返回
    /// 3. 按传输集合并发上传分片
    /// 4. 全部成功后合并
    pub async fn run(&self) -> Result<UploadOutcome, UploadError> {
        let (file_name, chunk_size) = {
            let cm = self.chunk_manager.lock().await;
            (cm.file_name().to_string(), cm.chunk_size())
        };

        if self.cancel_token.is_cancelled() {
            return Err(UploadError::FailedOrPaused);
        }

        // 1. 续传协商
        let verify = self
            .transport
            .verify(&file_name)
            .await
            .map_err(|e| UploadError::Negotiate(e.to_string()))?;

        // 2. 秒传
        if verify.exists_final {
            self.chunk_manager.lock().await.mark_all_completed();
            info!("秒传成功: {}", file_name);
            self.emit(UploadEvent::InstantUpload {
                task_id: self.task_id.clone(),
                file_name: file_name.clone(),
            });
            return Ok(UploadOutcome::InstantUpload);
        }

        // 3. 计算传输集合并启动分片上传
        let mut join_set = self.spawn_transfers(&file_name, &verify.persisted).await;
        let failed = self.wait_transfers(&mut join_set).await;

        {
            let mut cm = self.chunk_manager.lock().await;
            cm.clear_handles();
        }
        self.emit_progress().await;

        if failed > 0 || self.cancel_token.is_cancelled() {
            warn!(
                "上传失败或暂停中: {} ({} 个分片未完成)",
                file_name, failed
            );
            self.emit(UploadEvent::FailedOrPaused {
                task_id: self.task_id.clone(),
                message: UploadError::FailedOrPaused.to_string(),
            });
            return Err(UploadError::FailedOrPaused);
        }

        // 4. 合并
        info!("所有分片上传完成，请求合并: {}", file_name);
        let merged = self
            .transport
            .merge(&file_name, chunk_size)
            .await
            .map_err(|e| {
                error!("合并失败: {}, 错误: {}", file_name, e);
                UploadError::Merge(e.to_string())
            })?;

        info!("上传完成: {} ({} bytes)", merged.name, merged.size);
        self.emit(UploadEvent::Completed {
            task_id: self.task_id.clone(),
            file_name: merged.name.clone(),
            size: merged.size,
        });

        Ok(UploadOutcome::Uploaded(merged))
    }

    /// 根据协商结果播种进度并启动传输
    async fn spawn_transfers(
        &self,
        file_name: &str,
        persisted: &[ChunkRecord],
    ) -> JoinSet<(usize, anyhow::Result<()>)> {
        let mut join_set = JoinSet::new();
        let mut cm = self.chunk_manager.lock().await;

        let plan = plan_transfers(cm.chunks(), persisted);
        let planned: HashMap<usize, u64> = plan.iter().map(|p| (p.index, p.offset)).collect();

        // 跳过的分片视为已完成，续传的分片从已落盘位置开始计算进度
        for chunk in cm.chunks_mut() {
            let persisted_bytes = planned.get(&chunk.index).copied().unwrap_or(chunk.size());
            chunk.persisted_bytes = persisted_bytes;
            chunk.progress.seed(persisted_bytes);
        }

        info!(
            "[并发上传] {}: 共 {} 个分片，需要传输 {} 个",
            file_name,
            cm.chunk_count(),
            plan.len()
        );

        for transfer in plan {
            let Some(chunk) = cm.get_mut(transfer.index) else {
                continue;
            };

            let handle = self.cancel_token.child_token();
            chunk.transfer_handle = Some(handle.clone());

            let part = PartUpload {
                file_name: file_name.to_string(),
                chunk_name: chunk.name.clone(),
                source: self.source.clone(),
                range: (chunk.range.start + transfer.offset)..chunk.range.end,
                offset: transfer.offset,
                progress: chunk.progress.clone(),
            };

            debug!(
                "启动分片传输: {} (offset={}, {} bytes)",
                part.chunk_name,
                part.offset,
                part.len()
            );

            let transport = self.transport.clone();
            let index = transfer.index;
            join_set.spawn(async move { (index, transport.upload_part(part, handle).await) });
        }

        join_set
    }

    /// 等待所有传输结束，返回失败数量
    ///
    /// 某个分片失败后其余分片继续传输，尽量多地保留已落盘数据
    async fn wait_transfers(&self, join_set: &mut JoinSet<(usize, anyhow::Result<()>)>) -> usize {
        let mut failed = 0;
        let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);

        loop {
            tokio::select! {
                joined = join_set.join_next() => match joined {
                    None => break,
                    Some(Ok((index, Ok(())))) => {
                        debug!("分片 #{} 传输完成", index);
                        if let Some(chunk) = self.chunk_manager.lock().await.get_mut(index) {
                            chunk.transfer_handle = None;
                        }
                    }
                    Some(Ok((index, Err(e)))) => {
                        warn!("分片 #{} 传输失败: {}", index, e);
                        failed += 1;
                    }
                    Some(Err(e)) => {
                        error!("分片任务异常: {}", e);
                        failed += 1;
                    }
                },
                _ = ticker.tick() => self.emit_progress().await,
            }
        }

        failed
    }

    async fn emit_progress(&self) {
        let (part_percents, progress) = {
            let cm = self.chunk_manager.lock().await;
            (cm.part_percents(), cm.progress())
        };
        self.emit(UploadEvent::PartProgress {
            task_id: self.task_id.clone(),
            part_percents,
            progress,
        });
    }

    fn emit(&self, event: UploadEvent) {
        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(event);
    }
}
