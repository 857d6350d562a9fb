// 内容指纹计算
//
// 按分片顺序读取文件并累加到同一个 MD5 上下文，结果与分片边界无关。
// 计算放在阻塞线程池中执行，通过 channel 回传进度，
// 避免大文件哈希阻塞上传调度和暂停响应

use crate::uploader::chunk::round2;
use crate::uploader::UploadError;
use md5::Context as Md5Context;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 读取缓冲区大小: 64KB
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// 进度 channel 容量
const PROGRESS_CHANNEL_CAPACITY: usize = 64;

/// 指纹计算事件
#[derive(Debug, Clone, PartialEq)]
pub enum HashEvent {
    /// 进度（0-100，单调不减）
    Progress(f64),
    /// 计算完成
    Finished { fingerprint: String },
    /// 读取失败，不产生指纹
    Failed { error: String },
}

/// 启动指纹计算工作线程
///
/// 每读完一个分片发送一次进度，最后发送 100 和指纹。
/// 接收端被丢弃时工作线程提前退出
///
/// # 参数
/// * `path` - 本地文件路径
/// * `ranges` - 分片区间（按序号升序）
pub fn spawn_hash_worker(path: PathBuf, ranges: Vec<Range<u64>>) -> mpsc::Receiver<HashEvent> {
    let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);

    tokio::task::spawn_blocking(move || {
        let event = match hash_ranges_sync(&path, &ranges, |percent| {
            tx.blocking_send(HashEvent::Progress(percent)).is_ok()
        }) {
            Ok(Some(fingerprint)) => HashEvent::Finished { fingerprint },
            Ok(None) => {
                debug!("指纹计算被放弃: {:?}", path);
                return;
            }
            Err(e) => {
                warn!("指纹计算失败: {:?}, 错误: {}", path, e);
                HashEvent::Failed {
                    error: e.to_string(),
                }
            }
        };
        let _ = tx.blocking_send(event);
    });

    rx
}

/// 计算文件指纹，进度通过回调上报
///
/// 任意分片读取失败时整体失败
pub async fn calculate_fingerprint<F>(
    path: &Path,
    ranges: Vec<Range<u64>>,
    mut on_progress: F,
) -> Result<String, UploadError>
where
    F: FnMut(f64),
{
    info!("开始计算文件指纹: {:?} ({} 个分片)", path, ranges.len());

    let mut rx = spawn_hash_worker(path.to_path_buf(), ranges);

    while let Some(event) = rx.recv().await {
        match event {
            HashEvent::Progress(percent) => on_progress(percent),
            HashEvent::Finished { fingerprint } => {
                on_progress(100.0);
                info!("文件指纹计算完成: {:?} -> {}", path, fingerprint);
                return Ok(fingerprint);
            }
            HashEvent::Failed { error } => {
                return Err(UploadError::Read(std::io::Error::other(error)));
            }
        }
    }

    Err(UploadError::Read(std::io::Error::other("指纹计算线程异常退出")))
}

/// 同步计算（内部方法）
///
/// 回调返回 false 表示接收端已放弃，返回 Ok(None)
fn hash_ranges_sync<F>(
    path: &Path,
    ranges: &[Range<u64>],
    mut report: F,
) -> std::io::Result<Option<String>>
where
    F: FnMut(f64) -> bool,
{
    let mut file = File::open(path)?;
    let mut hasher = Md5Context::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let count = ranges.len();

    for (i, range) in ranges.iter().enumerate() {
        file.seek(SeekFrom::Start(range.start))?;
        let mut remaining = range.end - range.start;

        while remaining > 0 {
            let to_read = (remaining as usize).min(buffer.len());
            file.read_exact(&mut buffer[..to_read])?;
            hasher.consume(&buffer[..to_read]);
            remaining -= to_read as u64;
        }

        // 按已完成分片数计算，避免浮点累加误差导致超过 100
        let percent = round2((i + 1) as f64 * 100.0 / count as f64);
        if !report(percent) {
            return Ok(None);
        }
    }

    Ok(Some(format!("{:x}", hasher.compute())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::chunk::partition;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_file(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_fingerprint_matches_plain_md5() {
        let content = b"Hello, World! This is a test file.";
        let file = temp_file(content);

        let ranges = partition(content.len() as u64, 7).unwrap();
        let fingerprint = calculate_fingerprint(file.path(), ranges, |_| {})
            .await
            .unwrap();

        assert_eq!(fingerprint, format!("{:x}", md5::compute(content)));
    }

    #[tokio::test]
    async fn test_fingerprint_independent_of_chunk_boundaries() {
        let content: Vec<u8> = (0..100_000u32).map(|i| (i % 241) as u8).collect();
        let file = temp_file(&content);
        let size = content.len() as u64;

        let a = calculate_fingerprint(file.path(), partition(size, 1000).unwrap(), |_| {})
            .await
            .unwrap();
        let b = calculate_fingerprint(file.path(), partition(size, 65_537).unwrap(), |_| {})
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_single_byte_change_changes_fingerprint() {
        let mut content = vec![7u8; 4096];
        let a = temp_file(&content);
        content[2048] = 8;
        let b = temp_file(&content);

        let ranges = partition(4096, 1024).unwrap();
        let fa = calculate_fingerprint(a.path(), ranges.clone(), |_| {})
            .await
            .unwrap();
        let fb = calculate_fingerprint(b.path(), ranges, |_| {}).await.unwrap();
        assert_ne!(fa, fb);
    }

    #[tokio::test]
    async fn test_progress_monotonic_to_100() {
        let content = vec![1u8; 3000];
        let file = temp_file(&content);

        let mut seen = Vec::new();
        calculate_fingerprint(file.path(), partition(3000, 1000).unwrap(), |p| seen.push(p))
            .await
            .unwrap();

        assert_eq!(seen.first(), Some(&33.33));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&100.0));
    }

    #[tokio::test]
    async fn test_unreadable_chunk_fails() {
        let file = temp_file(b"short");
        // 区间超出文件末尾，读取失败
        let result = calculate_fingerprint(file.path(), vec![0..5, 5..100], |_| {}).await;
        assert!(matches!(result, Err(UploadError::Read(_))));
    }

    #[tokio::test]
    async fn test_missing_file_fails() {
        let result =
            calculate_fingerprint(Path::new("/nonexistent/file.bin"), vec![0..10], |_| {}).await;
        assert!(result.is_err());
    }
}
