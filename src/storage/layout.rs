// 存储目录布局
//
// tmp/<fingerprint.ext>/<fingerprint.ext>-<index>   分片文件
// public/<fingerprint.ext>                          合并后的最终文件

use crate::storage::{StorageError, StorageResult};
use std::path::{Component, Path, PathBuf};

/// 存储目录布局
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// 分片临时目录根路径
    tmp_dir: PathBuf,
    /// 最终文件目录（对外公开访问）
    public_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(tmp_dir: impl Into<PathBuf>, public_dir: impl Into<PathBuf>) -> Self {
        Self {
            tmp_dir: tmp_dir.into(),
            public_dir: public_dir.into(),
        }
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub fn public_dir(&self) -> &Path {
        &self.public_dir
    }

    /// 指纹对应的分片目录
    pub fn chunk_dir(&self, file_name: &str) -> StorageResult<PathBuf> {
        validate_name(file_name)?;
        Ok(self.tmp_dir.join(file_name))
    }

    /// 单个分片文件路径
    pub fn chunk_path(&self, file_name: &str, chunk_name: &str) -> StorageResult<PathBuf> {
        validate_name(chunk_name)?;
        Ok(self.chunk_dir(file_name)?.join(chunk_name))
    }

    /// 最终文件路径
    pub fn artifact_path(&self, file_name: &str) -> StorageResult<PathBuf> {
        validate_name(file_name)?;
        Ok(self.public_dir.join(file_name))
    }

    /// 确保根目录存在
    pub async fn ensure_dirs(&self) -> StorageResult<()> {
        tokio::fs::create_dir_all(&self.tmp_dir).await?;
        tokio::fs::create_dir_all(&self.public_dir).await?;
        Ok(())
    }
}

/// 校验名称只能是单个普通路径分量
pub fn validate_name(name: &str) -> StorageResult<()> {
    if name.is_empty() || name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(StorageError::InvalidName(name.to_string()));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(StorageError::InvalidName(name.to_string())),
    }
}

/// 从 `<name>-<index>` 中解析数字序号
///
/// 只看最后一个 `-` 之后的部分，指纹名本身不含 `-`，但扩展名可能含有
pub fn parse_chunk_index(chunk_name: &str) -> StorageResult<u64> {
    chunk_name
        .rsplit_once('-')
        .and_then(|(_, index)| index.parse::<u64>().ok())
        .ok_or_else(|| StorageError::InvalidChunkName(chunk_name.to_string()))
}

/// 生成分片名称
pub fn chunk_name(file_name: &str, index: u64) -> String {
    format!("{}-{}", file_name, index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("d41d8cd98f00b204e9800998ecf8427e.png").is_ok());
        assert!(validate_name("abc.tar.gz-12").is_ok());

        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\\b").is_err());
        assert!(validate_name("/abs").is_err());
        assert!(validate_name(".").is_err());
    }

    #[test]
    fn test_parse_chunk_index() {
        assert_eq!(parse_chunk_index("abc.png-0").unwrap(), 0);
        assert_eq!(parse_chunk_index("abc.png-10").unwrap(), 10);
        assert_eq!(parse_chunk_index("abc.my-ext-3").unwrap(), 3);

        assert!(parse_chunk_index("abc.png").is_err());
        assert!(parse_chunk_index("abc.png-x").is_err());
        assert!(parse_chunk_index("abc.png-").is_err());
    }

    #[test]
    fn test_paths() {
        let layout = StorageLayout::new("/data/tmp", "/data/public");
        assert_eq!(
            layout.chunk_path("f.png", "f.png-2").unwrap(),
            PathBuf::from("/data/tmp/f.png/f.png-2")
        );
        assert_eq!(
            layout.artifact_path("f.png").unwrap(),
            PathBuf::from("/data/public/f.png")
        );
        assert!(layout.chunk_path("f.png", "../x").is_err());
    }
}
