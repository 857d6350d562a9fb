// 分片存储
//
// 核心功能：
// 1. 按 (文件名, 分片名, 起始偏移) 追加写入分片数据，支持断点续传
// 2. 区分三种结束方式：正常结束 / 客户端中断（暂停） / 数据流错误
// 3. 续传协商：最终文件已存在时直接秒传，否则列出已落盘分片及其大小
//
// 会话状态不单独持久化，每次 verify 都从分片目录现场推导

use crate::storage::layout::{parse_chunk_index, StorageLayout};
use crate::storage::{StorageError, StorageResult};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, SeekFrom};
use std::path::Path;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 已落盘分片记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// 分片名称（`<fingerprint.ext>-<index>`）
    pub name: String,
    /// 已写入字节数
    pub size: u64,
}

/// 续传协商结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResult {
    /// 最终文件是否已存在（秒传）
    pub exists_final: bool,
    /// 已落盘的分片
    #[serde(default)]
    pub persisted: Vec<ChunkRecord>,
}

/// 单次分片写入的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// 数据流正常结束
    Completed { written: u64 },
    /// 客户端中断（暂停），已写入的字节保留用于续传
    Aborted { written: u64 },
}

impl WriteOutcome {
    pub fn written(&self) -> u64 {
        match self {
            WriteOutcome::Completed { written } | WriteOutcome::Aborted { written } => *written,
        }
    }
}

/// 数据流错误是否代表客户端主动断开
fn is_client_abort(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}

/// 分片存储
#[derive(Debug, Clone)]
pub struct ChunkStore {
    layout: StorageLayout,
}

impl ChunkStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// 续传协商
    ///
    /// 只读、幂等。最终文件存在时不扫描分片目录
    pub async fn verify(&self, file_name: &str) -> StorageResult<VerifyResult> {
        let artifact = self.layout.artifact_path(file_name)?;
        if fs::try_exists(&artifact).await? {
            info!("文件已存在，秒传: {}", file_name);
            return Ok(VerifyResult {
                exists_final: true,
                persisted: Vec::new(),
            });
        }

        let chunk_dir = self.layout.chunk_dir(file_name)?;
        let persisted = list_and_stat(&chunk_dir).await?;

        debug!(
            "续传协商: file={}, 已落盘分片数={}",
            file_name,
            persisted.len()
        );

        Ok(VerifyResult {
            exists_final: false,
            persisted,
        })
    }

    /// 写入分片数据
    ///
    /// 从 `start` 开始写入，不截断已有内容。`start` 不能超过已落盘字节数，
    /// 否则分片中间会出现空洞
    ///
    /// # 参数
    /// * `file_name` - 指纹文件名（`<fingerprint><ext>`）
    /// * `chunk_name` - 分片名称
    /// * `start` - 写入起始偏移
    /// * `body` - 数据流
    /// * `cancel` - 取消令牌，触发后视为客户端中断
    pub async fn write<S>(
        &self,
        file_name: &str,
        chunk_name: &str,
        start: u64,
        body: S,
        cancel: &CancellationToken,
    ) -> StorageResult<WriteOutcome>
    where
        S: Stream<Item = std::io::Result<Bytes>>,
    {
        let chunk_dir = self.layout.chunk_dir(file_name)?;
        let chunk_path = self.layout.chunk_path(file_name, chunk_name)?;

        fs::create_dir_all(&chunk_dir).await?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&chunk_path)
            .await?;

        let persisted = file.metadata().await?.len();
        if start > persisted {
            return Err(StorageError::InvalidOffset { start, persisted });
        }
        file.seek(SeekFrom::Start(start)).await?;

        debug!(
            "开始写入分片: {} (start={}, 已落盘={})",
            chunk_name, start, persisted
        );

        tokio::pin!(body);
        let mut written = 0u64;

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break WriteOutcome::Aborted { written },
                next = body.next() => next,
            };

            match next {
                None => break WriteOutcome::Completed { written },
                Some(Ok(data)) => {
                    file.write_all(&data).await?;
                    written += data.len() as u64;
                }
                Some(Err(e)) if is_client_abort(&e) => {
                    break WriteOutcome::Aborted { written };
                }
                Some(Err(e)) => {
                    file.flush().await?;
                    warn!("分片 {} 数据流错误: {}", chunk_name, e);
                    return Err(StorageError::Stream(e.to_string()));
                }
            }
        };

        file.flush().await?;

        match outcome {
            WriteOutcome::Completed { written } => {
                debug!("分片写入完成: {} (+{} bytes)", chunk_name, written)
            }
            WriteOutcome::Aborted { written } => {
                info!("分片写入中断（暂停）: {} (+{} bytes)", chunk_name, written)
            }
        }

        Ok(outcome)
    }
}

/// 列出目录下所有分片文件及其当前大小
///
/// 目录不存在等价于空列表。结果按分片序号升序
pub async fn list_and_stat(dir: &Path) -> StorageResult<Vec<ChunkRecord>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        records.push(ChunkRecord {
            name: entry.file_name().to_string_lossy().into_owned(),
            size: metadata.len(),
        });
    }

    records.sort_by_key(|r| (parse_chunk_index(&r.name).unwrap_or(u64::MAX), r.name.clone()));
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ChunkStore) {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path().join("tmp"), dir.path().join("public"));
        (dir, ChunkStore::new(layout))
    }

    fn body(parts: &[&'static str]) -> impl Stream<Item = std::io::Result<Bytes>> {
        let parts: Vec<_> = parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect();
        stream::iter(parts)
    }

    #[tokio::test]
    async fn test_verify_empty() {
        let (_dir, store) = setup();
        let result = store.verify("abc.png").await.unwrap();
        assert!(!result.exists_final);
        assert!(result.persisted.is_empty());
    }

    #[tokio::test]
    async fn test_write_and_verify() {
        let (_dir, store) = setup();
        let cancel = CancellationToken::new();

        let outcome = store
            .write("abc.png", "abc.png-0", 0, body(&["hello", " world"]), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Completed { written: 11 });

        let result = store.verify("abc.png").await.unwrap();
        assert_eq!(
            result.persisted,
            vec![ChunkRecord {
                name: "abc.png-0".to_string(),
                size: 11
            }]
        );
    }

    #[tokio::test]
    async fn test_resume_appends_without_truncating() {
        let (dir, store) = setup();
        let cancel = CancellationToken::new();

        store
            .write("f.bin", "f.bin-0", 0, body(&["abc"]), &cancel)
            .await
            .unwrap();
        store
            .write("f.bin", "f.bin-0", 3, body(&["def"]), &cancel)
            .await
            .unwrap();

        let data = std::fs::read(dir.path().join("tmp/f.bin/f.bin-0")).unwrap();
        assert_eq!(data, b"abcdef");
    }

    #[tokio::test]
    async fn test_offset_beyond_persisted_rejected() {
        let (_dir, store) = setup();
        let cancel = CancellationToken::new();

        let err = store
            .write("f.bin", "f.bin-0", 5, body(&["x"]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::InvalidOffset {
                start: 5,
                persisted: 0
            }
        ));
    }

    #[tokio::test]
    async fn test_client_abort_keeps_partial_bytes() {
        let (_dir, store) = setup();
        let cancel = CancellationToken::new();

        let parts = stream::iter(vec![
            Ok(Bytes::from_static(b"1234")),
            Err(std::io::Error::new(ErrorKind::ConnectionAborted, "client gone")),
            Ok(Bytes::from_static(b"never")),
        ]);

        let outcome = store
            .write("f.bin", "f.bin-0", 0, parts, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Aborted { written: 4 });

        let result = store.verify("f.bin").await.unwrap();
        assert_eq!(result.persisted[0].size, 4);
    }

    #[tokio::test]
    async fn test_cancel_token_aborts() {
        let (_dir, store) = setup();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = store
            .write("f.bin", "f.bin-0", 0, stream::pending::<std::io::Result<Bytes>>(), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Aborted { written: 0 });
    }

    #[tokio::test]
    async fn test_stream_error_propagates() {
        let (_dir, store) = setup();
        let cancel = CancellationToken::new();

        let parts = stream::iter(vec![
            Ok(Bytes::from_static(b"12")),
            Err(std::io::Error::new(ErrorKind::InvalidData, "bad frame")),
        ]);

        let err = store
            .write("f.bin", "f.bin-0", 0, parts, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Stream(_)));

        // 出错前的字节仍然保留
        let result = store.verify("f.bin").await.unwrap();
        assert_eq!(result.persisted[0].size, 2);
    }

    #[tokio::test]
    async fn test_verify_final_exists_skips_chunks() {
        let (dir, store) = setup();
        let cancel = CancellationToken::new();

        store
            .write("f.bin", "f.bin-0", 0, body(&["abc"]), &cancel)
            .await
            .unwrap();
        std::fs::create_dir_all(dir.path().join("public")).unwrap();
        std::fs::write(dir.path().join("public/f.bin"), b"abc").unwrap();

        let result = store.verify("f.bin").await.unwrap();
        assert!(result.exists_final);
        assert!(result.persisted.is_empty());
    }

    #[tokio::test]
    async fn test_list_and_stat_numeric_order() {
        let dir = TempDir::new().unwrap();
        for i in [10u64, 2, 0, 1] {
            std::fs::write(dir.path().join(format!("f.bin-{}", i)), vec![0u8; i as usize]).unwrap();
        }

        let records = list_and_stat(dir.path()).await.unwrap();
        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["f.bin-0", "f.bin-1", "f.bin-2", "f.bin-10"]);
        assert_eq!(records[3].size, 10);
    }

    #[tokio::test]
    async fn test_list_and_stat_missing_dir() {
        let dir = TempDir::new().unwrap();
        let records = list_and_stat(&dir.path().join("nope")).await.unwrap();
        assert!(records.is_empty());
    }
}
