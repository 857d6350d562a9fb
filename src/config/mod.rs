// 配置管理模块

use crate::uploader::validate::{default_allowed_mime_types, DEFAULT_MAX_FILE_SIZE};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

const MB: u64 = 1024 * 1024;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 存储配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 上传客户端配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS允许的源（为空时允许任意源）
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    34778
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 分片目录
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
    /// 最终文件目录（静态服务）
    #[serde(default = "default_public_dir")]
    pub public_dir: PathBuf,
    /// 服务端切分工具的分片大小 (MB)
    #[serde(default = "default_split_chunk_size_mb")]
    pub split_chunk_size_mb: u64,
}

fn default_tmp_dir() -> PathBuf {
    PathBuf::from("./tmp")
}

fn default_public_dir() -> PathBuf {
    PathBuf::from("./public")
}

fn default_split_chunk_size_mb() -> u64 {
    80
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            tmp_dir: default_tmp_dir(),
            public_dir: default_public_dir(),
            split_chunk_size_mb: default_split_chunk_size_mb(),
        }
    }
}

impl StorageConfig {
    pub fn split_chunk_size(&self) -> u64 {
        self.split_chunk_size_mb * MB
    }
}

/// 上传客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 服务地址
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// 分片大小 (MB)
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    /// 文件大小上限（字节，不含）
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// 允许的文件类型
    #[serde(default = "default_allowed_mime_types")]
    pub allowed_mime_types: Vec<String>,
}

fn default_server_url() -> String {
    "http://127.0.0.1:34778".to_string()
}

fn default_chunk_size_mb() -> u64 {
    50
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            chunk_size_mb: default_chunk_size_mb(),
            max_file_size: default_max_file_size(),
            allowed_mime_types: default_allowed_mime_types(),
        }
    }
}

impl UploadConfig {
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size_mb * MB
    }

    /// 转换为上传策略
    pub fn policy(&self) -> crate::uploader::UploadPolicy {
        crate::uploader::UploadPolicy {
            allowed_mime_types: self.allowed_mime_types.clone(),
            max_file_size: self.max_file_size,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置文件验证失败")?;

        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.upload.chunk_size_mb == 0 {
            anyhow::bail!("上传分片大小必须大于0");
        }
        if self.storage.split_chunk_size_mb == 0 {
            anyhow::bail!("切分分片大小必须大于0");
        }
        if self.upload.max_file_size == 0 {
            anyhow::bail!("文件大小上限必须大于0");
        }
        Ok(())
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 34778);
        assert_eq!(config.upload.chunk_size(), 50 * MB);
        assert_eq!(config.storage.split_chunk_size(), 80 * MB);
        assert_eq!(config.upload.max_file_size, 2 * 1024 * MB);
        assert_eq!(config.upload.allowed_mime_types.len(), 4);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut config = AppConfig::default();
        config.server.port = 9000;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.server.port, 9000);
        assert_eq!(loaded.storage.tmp_dir, config.storage.tmp_dir);
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "[upload]\nchunk_size_mb = 8\n").unwrap();

        let loaded = AppConfig::load_from_file(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(loaded.upload.chunk_size(), 8 * MB);
        assert_eq!(loaded.server.port, 34778);
        assert_eq!(loaded.log.level, "info");
    }

    #[tokio::test]
    async fn test_zero_chunk_size_is_error() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "[upload]\nchunk_size_mb = 0\n").unwrap();

        assert!(AppConfig::load_from_file(temp_file.path().to_str().unwrap())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_load_or_default_writes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config").join("app.toml");
        let path = path.to_str().unwrap();

        let config = AppConfig::load_or_default(path).await;
        assert_eq!(config.server.port, 34778);
        assert!(std::path::Path::new(path).exists());
    }
}
