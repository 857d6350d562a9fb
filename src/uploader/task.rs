// 上传任务定义
//
// 状态流转：
//   init -> hashing -> uploading -> completed
//                              \-> instant_upload_success
//                              \-> paused  (恢复后回到 uploading)
//                              \-> failed  (恢复后回到 uploading)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// 上传任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// 已创建，尚未开始
    Init,
    /// 计算指纹中
    Hashing,
    /// 上传中
    Uploading,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 秒传成功
    InstantUploadSuccess,
    /// 失败
    Failed,
}

impl UploadStatus {
    /// 是否为终态
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::InstantUploadSuccess
        )
    }

    /// 是否可以恢复
    pub fn is_resumable(&self) -> bool {
        matches!(self, UploadStatus::Paused | UploadStatus::Failed)
    }
}

/// 上传事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 指纹计算进度
    HashProgress { task_id: String, percent: f64 },
    /// 分片进度
    PartProgress {
        task_id: String,
        part_percents: Vec<f64>,
        progress: f64,
    },
    /// 秒传成功
    InstantUpload { task_id: String, file_name: String },
    /// 上传完成
    Completed {
        task_id: String,
        file_name: String,
        size: u64,
    },
    /// 上传失败或暂停中
    FailedOrPaused { task_id: String, message: String },
}

impl UploadEvent {
    pub fn task_id(&self) -> &str {
        match self {
            UploadEvent::HashProgress { task_id, .. }
            | UploadEvent::PartProgress { task_id, .. }
            | UploadEvent::InstantUpload { task_id, .. }
            | UploadEvent::Completed { task_id, .. }
            | UploadEvent::FailedOrPaused { task_id, .. } => task_id,
        }
    }
}

/// 上传任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    /// 任务ID
    pub id: String,
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 文件大小
    pub total_size: u64,
    /// 任务状态
    pub status: UploadStatus,
    /// 指纹计算进度
    pub hash_percent: f64,
    /// 上传进度（各分片百分比的平均值）
    pub progress: f64,
    /// 文件指纹
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// 服务端存储名（`<fingerprint><ext>`）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
    /// 错误信息
    pub error: Option<String>,
}

impl UploadTask {
    /// 创建新的上传任务
    pub fn new(local_path: PathBuf, total_size: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            local_path,
            total_size,
            status: UploadStatus::Init,
            hash_percent: 0.0,
            progress: 0.0,
            fingerprint: None,
            file_name: None,
            created_at: chrono::Utc::now().timestamp(),
            completed_at: None,
            error: None,
        }
    }

    pub fn mark_hashing(&mut self) {
        self.status = UploadStatus::Hashing;
        self.hash_percent = 0.0;
    }

    /// 记录指纹，进入上传阶段
    pub fn mark_uploading(&mut self, fingerprint: String, file_name: String) {
        self.fingerprint = Some(fingerprint);
        self.file_name = Some(file_name);
        self.hash_percent = 100.0;
        self.status = UploadStatus::Uploading;
        self.error = None;
    }

    pub fn mark_completed(&mut self) {
        self.status = UploadStatus::Completed;
        self.progress = 100.0;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    pub fn mark_instant_upload_success(&mut self) {
        self.status = UploadStatus::InstantUploadSuccess;
        self.progress = 100.0;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    pub fn mark_paused(&mut self) {
        self.status = UploadStatus::Paused;
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = UploadStatus::Failed;
        self.error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation() {
        let task = UploadTask::new(PathBuf::from("./test/movie.mp4"), 1024 * 1024);

        assert_eq!(task.status, UploadStatus::Init);
        assert_eq!(task.progress, 0.0);
        assert!(task.fingerprint.is_none());
    }

    #[test]
    fn test_status_transitions() {
        let mut task = UploadTask::new(PathBuf::from("./a.png"), 1000);

        task.mark_hashing();
        assert_eq!(task.status, UploadStatus::Hashing);

        task.mark_uploading("abc".to_string(), "abc.png".to_string());
        assert_eq!(task.status, UploadStatus::Uploading);
        assert_eq!(task.hash_percent, 100.0);

        task.mark_paused();
        assert!(task.status.is_resumable());

        task.mark_failed("上传失败或暂停中".to_string());
        assert_eq!(task.status, UploadStatus::Failed);
        assert!(task.status.is_resumable());

        task.mark_completed();
        assert!(task.status.is_finished());
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_event_serialization() {
        let event = UploadEvent::HashProgress {
            task_id: "t1".to_string(),
            percent: 33.33,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "hash_progress");
        assert_eq!(json["percent"], 33.33);
        assert_eq!(event.task_id(), "t1");
    }
}
