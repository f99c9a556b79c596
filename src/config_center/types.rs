//! 配置中心数据类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const META_AUTHOR: &str = "author";
const META_COMMENT: &str = "comment";

/// 存储中的一条配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: serde_json::Value,
    /// 从 1 开始、每次写入加一
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ConfigEntry {
    pub fn author(&self) -> Option<&str> {
        self.metadata.get(META_AUTHOR).map(String::as_str)
    }

    pub fn comment(&self) -> Option<&str> {
        self.metadata.get(META_COMMENT).map(String::as_str)
    }
}

/// 历史版本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigVersion {
    pub version: i64,
    pub value: serde_json::Value,
    /// 该版本写入的时间
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl From<&ConfigEntry> for ConfigVersion {
    fn from(entry: &ConfigEntry) -> Self {
        Self {
            version: entry.version,
            value: entry.value.clone(),
            created_at: entry.updated_at,
            author: entry.author().map(str::to_string),
            comment: entry.comment().map(str::to_string),
        }
    }
}

/// 写入附带的说明信息
#[derive(Debug, Clone, Default)]
pub struct ConfigMeta {
    pub author: Option<String>,
    pub comment: Option<String>,
    pub labels: HashMap<String, String>,
}

impl ConfigMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub(crate) fn into_metadata(self) -> HashMap<String, String> {
        let mut metadata = self.labels;
        if let Some(author) = self.author {
            metadata.insert(META_AUTHOR.to_string(), author);
        }
        if let Some(comment) = self.comment {
            metadata.insert(META_COMMENT.to_string(), comment);
        }
        metadata
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

/// 配置变更事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub change_type: ChangeType,
    /// 不带存储前缀的配置键
    pub key: String,
    pub old_value: Option<ConfigEntry>,
    pub new_value: Option<ConfigEntry>,
    pub timestamp: DateTime<Utc>,
}
