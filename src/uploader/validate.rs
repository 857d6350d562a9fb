// 上传前校验
//
// 在计算指纹和切分分片之前执行，校验失败时不创建任何状态

use crate::uploader::UploadError;
use std::path::Path;

/// 默认文件大小上限: 2GB（不含）
pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// 默认允许的文件类型
pub fn default_allowed_mime_types() -> Vec<String> {
    vec![
        "image/jpeg".to_string(),
        "image/png".to_string(),
        "image/gif".to_string(),
        "video/mp4".to_string(),
    ]
}

/// 上传策略
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    /// 允许的 MIME 类型
    pub allowed_mime_types: Vec<String>,
    /// 文件大小上限（不含）
    pub max_file_size: u64,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            allowed_mime_types: default_allowed_mime_types(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl UploadPolicy {
    /// 校验文件类型和大小
    ///
    /// MIME 类型根据扩展名推断
    pub fn check(&self, path: &Path, size: u64) -> Result<(), UploadError> {
        let mime = mime_guess::from_path(path)
            .first()
            .map(|m| m.essence_str().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        if !self.allowed_mime_types.iter().any(|allowed| *allowed == mime) {
            return Err(UploadError::UnsupportedType(mime));
        }

        if size >= self.max_file_size {
            return Err(UploadError::TooLarge {
                size,
                limit: self.max_file_size,
            });
        }

        Ok(())
    }
}

/// 取文件扩展名（含 `.`），没有 `.` 时为空
pub fn extension_of(file_name: &str) -> &str {
    file_name
        .rfind('.')
        .map(|pos| &file_name[pos..])
        .unwrap_or("")
}

/// 服务端存储名：`<fingerprint><ext>`
pub fn fingerprint_name(fingerprint: &str, source: &Path) -> String {
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    format!("{}{}", fingerprint, extension_of(&file_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_allowed_types_pass() {
        let policy = UploadPolicy::default();
        assert!(policy.check(Path::new("a.jpg"), 10).is_ok());
        assert!(policy.check(Path::new("b.PNG"), 10).is_ok());
        assert!(policy.check(Path::new("movie.mp4"), 10).is_ok());
    }

    #[test]
    fn test_disallowed_type_rejected() {
        let policy = UploadPolicy::default();
        let err = policy.check(Path::new("notes.txt"), 10).unwrap_err();
        assert!(matches!(err, UploadError::UnsupportedType(ref m) if m == "text/plain"));
        assert!(err.is_validation());

        assert!(matches!(
            policy.check(Path::new("noext"), 10),
            Err(UploadError::UnsupportedType(_))
        ));
    }

    #[test]
    fn test_size_limit_is_exclusive() {
        let policy = UploadPolicy::default();
        assert!(policy
            .check(Path::new("a.gif"), DEFAULT_MAX_FILE_SIZE - 1)
            .is_ok());
        assert!(matches!(
            policy.check(Path::new("a.gif"), DEFAULT_MAX_FILE_SIZE),
            Err(UploadError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("movie.mp4"), ".mp4");
        assert_eq!(extension_of("archive.tar.gz"), ".gz");
        assert_eq!(extension_of("README"), "");
        assert_eq!(extension_of(".hidden"), ".hidden");
    }

    #[test]
    fn test_fingerprint_name() {
        let source = PathBuf::from("/home/user/photos/cat.jpeg");
        assert_eq!(
            fingerprint_name("d41d8cd98f00b204e9800998ecf8427e", &source),
            "d41d8cd98f00b204e9800998ecf8427e.jpeg"
        );
    }
}
