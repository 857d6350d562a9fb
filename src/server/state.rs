// 应用状态

use crate::config::AppConfig;
use crate::storage::{ChunkStore, MergeEngine, StorageLayout};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 应用配置
    pub config: Arc<AppConfig>,
    /// 分片存储
    pub store: ChunkStore,
    /// 合并引擎
    pub merger: MergeEngine,
    /// 关闭信号，触发后进行中的分片写入按中断处理
    pub shutdown: CancellationToken,
}

impl AppState {
    /// 根据配置创建应用状态，并确保存储目录存在
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let layout = StorageLayout::new(
            config.storage.tmp_dir.clone(),
            config.storage.public_dir.clone(),
        );
        layout.ensure_dirs().await?;

        Ok(Self::with_layout(config, layout))
    }

    /// 使用指定目录布局创建（不创建目录）
    pub fn with_layout(config: AppConfig, layout: StorageLayout) -> Self {
        Self {
            config: Arc::new(config),
            store: ChunkStore::new(layout.clone()),
            merger: MergeEngine::new(layout),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        self.store.layout()
    }
}
