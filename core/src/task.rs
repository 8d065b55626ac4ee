use std::fmt;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Injecting,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Injecting => "injecting",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Software {
    pub name: String,
    #[serde(rename = "bundleID")]
    pub bundle_id: String,
    pub version: String,
    #[serde(
        rename = "fileSizeBytes",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub file_size_bytes: Option<u64>,
}

/// Opaque signature material paired with a manifest entry by index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sinf {
    pub id: u32,
    pub sinf: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub software: Software,
    pub account_hash: String,
    #[serde(rename = "downloadURL", default)]
    pub download_url: String,
    #[serde(default)]
    pub sinfs: Vec<Sinf>,
    #[serde(
        rename = "iTunesMetadata",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub itunes_metadata: Option<String>,
    pub status: TaskStatus,
    pub progress: u8,
    pub speed: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
}

impl Task {
    pub fn new(
        software: Software,
        account_hash: String,
        download_url: String,
        sinfs: Vec<Sinf>,
        itunes_metadata: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            software,
            account_hash,
            download_url,
            sinfs,
            itunes_metadata,
            status: TaskStatus::Pending,
            progress: 0,
            speed: "0 B/s".to_string(),
            file_path: String::new(),
            error: None,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn has_file(&self) -> bool {
        !self.file_path.is_empty() && Path::new(&self.file_path).is_file()
    }

    /// Strip secret fields after a successful completion.
    pub fn scrub_secrets(&mut self) {
        self.download_url = String::new();
        self.sinfs = Vec::new();
        self.itunes_metadata = None;
    }

    pub fn to_public(&self) -> PublicTask {
        PublicTask {
            id: self.id,
            software: self.software.clone(),
            account_hash: self.account_hash.clone(),
            status: self.status,
            progress: self.progress,
            speed: self.speed.clone(),
            error: self.error.clone(),
            created_at: self.created_at.clone(),
            has_file: self.has_file(),
        }
    }
}

/// Outward projection of a task: no origin URL, signature material,
/// metadata blob, or filesystem path ever leaves the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicTask {
    pub id: TaskId,
    pub software: Software,
    pub account_hash: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub speed: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
    pub has_file: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task::new(
            Software {
                name: "Example".to_string(),
                bundle_id: "com.example.app".to_string(),
                version: "1.0".to_string(),
                file_size_bytes: Some(1024),
            },
            "acct123".to_string(),
            "https://iosapps.itunes.apple.com/file.ipa".to_string(),
            vec![Sinf {
                id: 0,
                sinf: "AAAA".to_string(),
            }],
            Some("PD94bWw=".to_string()),
        )
    }

    #[test]
    fn new_task_starts_pending() {
        let task = sample_task();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);
        assert_eq!(task.speed, "0 B/s");
        assert!(!task.has_file());
    }

    #[test]
    fn scrub_removes_all_secret_fields() {
        let mut task = sample_task();
        task.scrub_secrets();
        assert_eq!(task.download_url, "");
        assert!(task.sinfs.is_empty());
        assert!(task.itunes_metadata.is_none());
    }

    #[test]
    fn public_projection_hides_internal_fields() {
        let task = sample_task();
        let value = serde_json::to_value(task.to_public()).unwrap();
        let object = value.as_object().unwrap();
        assert!(!object.contains_key("downloadURL"));
        assert!(!object.contains_key("sinfs"));
        assert!(!object.contains_key("iTunesMetadata"));
        assert!(!object.contains_key("filePath"));
        assert_eq!(object.get("hasFile"), Some(&serde_json::Value::Bool(false)));
    }

    #[test]
    fn wire_names_are_camel_case() {
        let task = sample_task();
        let value = serde_json::to_value(&task).unwrap();
        let object = value.as_object().unwrap();
        assert!(object.contains_key("accountHash"));
        assert!(object.contains_key("downloadURL"));
        assert!(object.contains_key("iTunesMetadata"));
        assert!(object.contains_key("createdAt"));
        let software = object.get("software").unwrap().as_object().unwrap();
        assert!(software.contains_key("bundleID"));
        assert!(software.contains_key("fileSizeBytes"));
    }
}
