// 上传管理器
//
// 负责管理上传任务：
// - 创建任务（先校验类型和大小，不通过时不创建任何状态）
// - 计算指纹、命名、启动上传引擎
// - 暂停/恢复：恢复时重新协商，不重新计算指纹
// - 通过 broadcast 通知订阅者

use crate::uploader::chunk::{partition, UploadChunkManager};
use crate::uploader::engine::{UploadEngine, UploadOutcome};
use crate::uploader::hasher::{spawn_hash_worker, HashEvent};
use crate::uploader::task::{UploadEvent, UploadStatus, UploadTask};
use crate::uploader::transport::UploadTransport;
use crate::uploader::validate::{fingerprint_name, UploadPolicy};
use crate::uploader::UploadError;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// 事件 channel 容量
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 上传任务信息
#[derive(Clone)]
pub struct UploadTaskInfo {
    /// 任务
    pub task: Arc<Mutex<UploadTask>>,
    /// 当前运行的引擎（仅在上传阶段存在）
    pub engine: Arc<Mutex<Option<Arc<UploadEngine>>>>,
    /// 是否已请求暂停
    pub is_paused: Arc<AtomicBool>,
}

/// 上传管理器
#[derive(Clone)]
pub struct UploadManager {
    /// 传输层
    transport: Arc<dyn UploadTransport>,
    /// 分片大小
    chunk_size: u64,
    /// 上传策略
    policy: UploadPolicy,
    /// 所有任务（task_id -> TaskInfo）
    tasks: Arc<DashMap<String, UploadTaskInfo>>,
    /// 事件发送端
    events: broadcast::Sender<UploadEvent>,
}

impl UploadManager {
    /// 创建上传管理器
    ///
    /// # 参数
    /// * `transport` - 传输层
    /// * `chunk_size` - 分片大小，必须为正数
    /// * `policy` - 类型和大小限制
    pub fn new(
        transport: Arc<dyn UploadTransport>,
        chunk_size: u64,
        policy: UploadPolicy,
    ) -> Result<Self, UploadError> {
        if chunk_size == 0 {
            return Err(UploadError::InvalidPartSize(chunk_size));
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            transport,
            chunk_size,
            policy,
            tasks: Arc::new(DashMap::new()),
            events,
        })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// 订阅上传事件
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    /// 创建上传任务
    pub async fn create_task(&self, local_path: PathBuf) -> Result<String, UploadError> {
        let metadata = tokio::fs::metadata(&local_path).await?;
        if !metadata.is_file() {
            return Err(UploadError::Read(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("不是文件: {:?}", local_path),
            )));
        }

        self.policy.check(&local_path, metadata.len())?;

        let task = UploadTask::new(local_path.clone(), metadata.len());
        let task_id = task.id.clone();

        info!(
            "创建上传任务: id={}, local={:?}, size={}",
            task_id,
            local_path,
            metadata.len()
        );

        self.tasks.insert(
            task_id.clone(),
            UploadTaskInfo {
                task: Arc::new(Mutex::new(task)),
                engine: Arc::new(Mutex::new(None)),
                is_paused: Arc::new(AtomicBool::new(false)),
            },
        );

        Ok(task_id)
    }

    /// 在后台启动任务
    pub fn start_task(
        &self,
        task_id: &str,
    ) -> Result<JoinHandle<Result<UploadOutcome, UploadError>>, UploadError> {
        if !self.tasks.contains_key(task_id) {
            return Err(UploadError::InvalidState(format!("任务不存在: {}", task_id)));
        }

        let manager = self.clone();
        let task_id = task_id.to_string();
        Ok(tokio::spawn(async move { manager.run_task(&task_id).await }))
    }

    /// 恢复已暂停或失败的任务
    pub async fn resume_task(
        &self,
        task_id: &str,
    ) -> Result<JoinHandle<Result<UploadOutcome, UploadError>>, UploadError> {
        let info = self.task_info(task_id)?;
        let status = info.task.lock().await.status;
        if !status.is_resumable() {
            return Err(UploadError::InvalidState(format!(
                "任务当前状态不能恢复: {:?}",
                status
            )));
        }

        info!("恢复上传任务: {}", task_id);
        self.start_task(task_id)
    }

    /// 暂停任务
    ///
    /// 取消所有正在传输的分片；计算指纹期间暂停时，在指纹完成后停止
    pub async fn pause_task(&self, task_id: &str) -> Result<(), UploadError> {
        let info = self.task_info(task_id)?;

        let status = info.task.lock().await.status;
        if status.is_finished() {
            return Err(UploadError::InvalidState(format!(
                "任务已完成，不能暂停: {}",
                task_id
            )));
        }

        info.is_paused.store(true, Ordering::SeqCst);

        let engine = info.engine.lock().await.clone();
        if let Some(engine) = engine {
            engine.pause().await;
        }

        info!("暂停上传任务: {}", task_id);
        Ok(())
    }

    /// 获取任务快照
    pub async fn get_task(&self, task_id: &str) -> Option<UploadTask> {
        let info = self.tasks.get(task_id).map(|e| e.value().clone())?;

        let mut task = info.task.lock().await.clone();
        let engine = info.engine.lock().await.clone();
        if let Some(engine) = engine {
            task.progress = engine.progress().await;
        }
        Some(task)
    }

    /// 获取所有任务
    pub async fn get_all_tasks(&self) -> Vec<UploadTask> {
        let ids: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = self.get_task(&id).await {
                tasks.push(task);
            }
        }
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// 执行任务（在当前协程中运行到结束）
    ///
    /// 首次运行计算指纹；恢复时沿用已有指纹，直接重新协商
    pub async fn run_task(&self, task_id: &str) -> Result<UploadOutcome, UploadError> {
        let info = self.task_info(task_id)?;

        // 状态检查与切换放在同一把锁内，避免同一任务被并发启动
        let (local_path, total_size, file_name) = {
            let mut task = info.task.lock().await;
            match task.status {
                UploadStatus::Init | UploadStatus::Paused | UploadStatus::Failed => {}
                status => {
                    return Err(UploadError::InvalidState(format!(
                        "任务当前状态不能启动: {:?}",
                        status
                    )))
                }
            }
            info.is_paused.store(false, Ordering::SeqCst);
            if task.file_name.is_none() {
                task.mark_hashing();
            } else {
                task.status = UploadStatus::Uploading;
            }
            (task.local_path.clone(), task.total_size, task.file_name.clone())
        };

        // 1. 指纹
        let file_name = match file_name {
            Some(name) => name,
            None => match self.hash_task(&info, task_id, &local_path, total_size).await {
                Ok((fingerprint, name)) => {
                    info.task
                        .lock()
                        .await
                        .mark_uploading(fingerprint, name.clone());
                    name
                }
                Err(e) => {
                    error!("指纹计算失败: task={}, 错误: {}", task_id, e);
                    info.task.lock().await.mark_failed(e.to_string());
                    return Err(e);
                }
            },
        };

        if info.is_paused.load(Ordering::SeqCst) {
            info.task.lock().await.mark_paused();
            return Err(UploadError::FailedOrPaused);
        }

        // 2. 上传
        let chunk_manager = UploadChunkManager::new(&file_name, total_size, self.chunk_size)?;
        let engine = Arc::new(UploadEngine::new(
            self.transport.clone(),
            local_path,
            Arc::new(Mutex::new(chunk_manager)),
            task_id.to_string(),
            self.events.clone(),
        ));
        *info.engine.lock().await = Some(engine.clone());

        // 设置引擎与暂停请求之间可能有竞争，再检查一次
        if info.is_paused.load(Ordering::SeqCst) {
            engine.pause().await;
        }

        let result = engine.run().await;
        let progress = engine.progress().await;

        // 本次运行的分片列表和传输句柄不再保留
        *info.engine.lock().await = None;

        let mut task = info.task.lock().await;
        task.progress = progress;
        match &result {
            Ok(UploadOutcome::InstantUpload) => task.mark_instant_upload_success(),
            Ok(UploadOutcome::Uploaded(_)) => task.mark_completed(),
            Err(UploadError::FailedOrPaused) if info.is_paused.load(Ordering::SeqCst) => {
                task.mark_paused()
            }
            Err(e) => {
                warn!("上传任务失败: task={}, 错误: {}", task_id, e);
                task.mark_failed(e.to_string());
            }
        }

        result
    }

    /// 计算指纹，进度同时写入任务并广播
    async fn hash_task(
        &self,
        info: &UploadTaskInfo,
        task_id: &str,
        local_path: &std::path::Path,
        total_size: u64,
    ) -> Result<(String, String), UploadError> {
        let ranges = partition(total_size, self.chunk_size)?;
        info!("开始计算文件指纹: {:?} ({} 个分片)", local_path, ranges.len());

        let mut rx = spawn_hash_worker(local_path.to_path_buf(), ranges);
        while let Some(event) = rx.recv().await {
            let (percent, fingerprint) = match event {
                HashEvent::Progress(percent) => (percent, None),
                HashEvent::Finished { fingerprint } => (100.0, Some(fingerprint)),
                HashEvent::Failed { error } => {
                    return Err(UploadError::Read(std::io::Error::other(error)));
                }
            };

            info.task.lock().await.hash_percent = percent;
            let _ = self.events.send(UploadEvent::HashProgress {
                task_id: task_id.to_string(),
                percent,
            });

            if let Some(fingerprint) = fingerprint {
                info!("文件指纹计算完成: {:?} -> {}", local_path, fingerprint);
                let name = fingerprint_name(&fingerprint, local_path);
                return Ok((fingerprint, name));
            }
        }

        Err(UploadError::Read(std::io::Error::other("指纹计算线程异常退出")))
    }

    fn task_info(&self, task_id: &str) -> Result<UploadTaskInfo, UploadError> {
        self.tasks
            .get(task_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| UploadError::InvalidState(format!("任务不存在: {}", task_id)))
    }
}
