// 上传传输层
//
// 客户端与分片存储之间的三个操作：续传协商、分片写入、合并。
// - HttpTransport：通过 /api/v1 接口访问远端服务
// - LocalTransport：直接调用本进程内的 ChunkStore / MergeEngine（测试、单机部署）
//
// 分片写入支持取消：取消令牌触发后立即放弃请求，服务端把断开视为暂停

use crate::server::handlers::{ApiResponse, UploadPartResponse};
use crate::storage::{ChunkStore, MergeEngine, MergeResult, VerifyResult, WriteOutcome};
use crate::uploader::chunk::PartProgress;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use serde::de::DeserializeOwned;
use std::io::SeekFrom;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 读取分片数据的缓冲区大小: 64KB
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// 单次分片传输请求
#[derive(Debug, Clone)]
pub struct PartUpload {
    /// 指纹文件名
    pub file_name: String,
    /// 分片名称
    pub chunk_name: String,
    /// 本地源文件
    pub source: PathBuf,
    /// 本次需要发送的字节在源文件中的区间
    pub range: Range<u64>,
    /// 服务端分片文件中的写入起点（已落盘字节数）
    pub offset: u64,
    /// 分片进度，发送过程中累加
    pub progress: Arc<PartProgress>,
}

impl PartUpload {
    /// 本次发送的字节数
    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 上传传输层
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// 续传协商
    async fn verify(&self, file_name: &str) -> Result<VerifyResult>;

    /// 发送单个分片的剩余字节
    ///
    /// 取消令牌触发时返回错误，已发送的字节由服务端保留
    async fn upload_part(&self, part: PartUpload, cancel: CancellationToken) -> Result<()>;

    /// 请求合并
    async fn merge(&self, file_name: &str, chunk_size: u64) -> Result<MergeResult>;
}

/// 打开分片数据流
///
/// 按需从磁盘读取，不把整个分片读进内存；每读出一块就累加进度
pub async fn open_part_stream(
    source: &std::path::Path,
    range: Range<u64>,
    progress: Arc<PartProgress>,
) -> std::io::Result<impl Stream<Item = std::io::Result<Bytes>> + Send + 'static> {
    let mut file = File::open(source).await?;
    file.seek(SeekFrom::Start(range.start)).await?;
    let reader = file.take(range.end - range.start);

    Ok(ReaderStream::with_capacity(reader, STREAM_BUFFER_SIZE)
        .inspect_ok(move |data| progress.add(data.len() as u64)))
}

/// 服务端写入的字节数必须等于本次发送的字节数
fn ensure_fully_written(part: &PartUpload, written: u64) -> Result<()> {
    if written != part.len() {
        anyhow::bail!(
            "分片未完整写入: {} (期望 {} bytes, 实际 {} bytes)",
            part.chunk_name,
            part.len(),
            written
        );
    }
    Ok(())
}

// =====================================================
// 进程内传输
// =====================================================

/// 进程内传输
#[derive(Debug, Clone)]
pub struct LocalTransport {
    store: ChunkStore,
    merger: MergeEngine,
}

impl LocalTransport {
    pub fn new(store: ChunkStore, merger: MergeEngine) -> Self {
        Self { store, merger }
    }
}

#[async_trait]
impl UploadTransport for LocalTransport {
    async fn verify(&self, file_name: &str) -> Result<VerifyResult> {
        Ok(self.store.verify(file_name).await?)
    }

    async fn upload_part(&self, part: PartUpload, cancel: CancellationToken) -> Result<()> {
        let stream = open_part_stream(&part.source, part.range.clone(), part.progress.clone())
            .await
            .with_context(|| format!("打开分片数据失败: {}", part.chunk_name))?;

        let outcome = self
            .store
            .write(&part.file_name, &part.chunk_name, part.offset, stream, &cancel)
            .await?;

        match outcome {
            WriteOutcome::Completed { written } => {
                debug!("分片发送完成: {} ({} bytes)", part.chunk_name, written);
                ensure_fully_written(&part, written)
            }
            WriteOutcome::Aborted { .. } => Err(anyhow::anyhow!("上传已取消")),
        }
    }

    async fn merge(&self, file_name: &str, chunk_size: u64) -> Result<MergeResult> {
        Ok(self.merger.merge(file_name, chunk_size).await?)
    }
}

// =====================================================
// HTTP 传输
// =====================================================

/// HTTP 传输
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// 创建 HTTP 传输
    ///
    /// # 参数
    /// * `base_url` - 服务地址，如 `http://127.0.0.1:34778`
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    /// 解析统一响应格式
    async fn decode<T: DeserializeOwned>(response: reqwest::Response, step: &str) -> Result<T> {
        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("{}: 读取响应失败", step))?;

        let envelope: ApiResponse<T> = serde_json::from_str(&text).with_context(|| {
            format!("{}: 解析响应失败: status={}, body={}", step, status, text)
        })?;

        if envelope.code != 0 {
            anyhow::bail!("{}失败: {} - {}", step, envelope.code, envelope.message);
        }

        envelope
            .data
            .ok_or_else(|| anyhow::anyhow!("{}: 响应缺少 data 字段", step))
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn verify(&self, file_name: &str) -> Result<VerifyResult> {
        let url = self.url(&format!("/verify/{}", urlencoding::encode(file_name)));

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("续传协商请求发送失败")?;

        Self::decode(response, "续传协商").await
    }

    async fn upload_part(&self, part: PartUpload, cancel: CancellationToken) -> Result<()> {
        let url = self.url(&format!(
            "/upload/{}/{}/{}",
            urlencoding::encode(&part.file_name),
            urlencoding::encode(&part.chunk_name),
            part.offset
        ));

        let stream = open_part_stream(&part.source, part.range.clone(), part.progress.clone())
            .await
            .with_context(|| format!("打开分片数据失败: {}", part.chunk_name))?;

        let request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, part.len())
            .body(reqwest::Body::wrap_stream(stream))
            .send();

        // 取消时丢弃请求 future，连接随之断开
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("分片传输已取消: {}", part.chunk_name);
                return Err(anyhow::anyhow!("上传已取消"));
            }
            response = request => response.context("上传分片请求发送失败")?,
        };

        let result: UploadPartResponse = Self::decode(response, "上传分片").await?;
        debug!(
            "上传分片成功: {} (+{} bytes)",
            part.chunk_name, result.written
        );

        // 服务端关闭等情况下请求可能提前结束
        ensure_fully_written(&part, result.written)
    }

    async fn merge(&self, file_name: &str, chunk_size: u64) -> Result<MergeResult> {
        let url = self.url(&format!(
            "/merge/{}/{}",
            urlencoding::encode(file_name),
            chunk_size
        ));

        let response = self
            .client
            .post(&url)
            .send()
            .await
            .context("合并请求发送失败")?;

        Self::decode(response, "合并").await
    }
}
