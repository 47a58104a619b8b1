//! 客户端本地持久化
//!
//! 简单的 key → JSON 文件存储（`<data_dir>/<key>.json`），没有过期。
//! 文件不存在或内容损坏一律按空处理，不会报错。

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::Result;

/// 最近使用的聊天会话 ID
pub const LAST_SESSION_KEY: &str = "rag_chat_last_session_id";

/// 检索历史
pub const SEARCH_HISTORY_KEY: &str = "rag_search_history";

/// 检索历史最多保留条数
pub const SEARCH_HISTORY_LIMIT: usize = 50;

/// 本地 key/value 存储
#[derive(Debug, Clone)]
pub struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// 读取；缺失或损坏返回 None
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let path = self.path_for(key);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("读取本地存储失败 {:?}: {}", path, e);
                return None;
            }
        };

        match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("本地存储内容损坏，按空处理 key={}: {}", key, e);
                None
            }
        }
    }

    /// 写入（先写临时文件再 rename）
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(value)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// [`Self::set`] 的异步版本，供异步上下文调用
    pub async fn persist<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// [`Self::remove`] 的异步版本
    pub async fn forget(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// 检索过滤条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub collection: String,
    pub limit: u32,
    pub min_score: f64,
    #[serde(default)]
    pub hybrid: bool,
}

impl From<&crate::types::SearchRequest> for SearchFilters {
    fn from(request: &crate::types::SearchRequest) -> Self {
        Self {
            collection: request.collection.clone(),
            limit: request.limit,
            min_score: request.min_score,
            hybrid: request.hybrid,
        }
    }
}

/// 一条检索历史
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHistoryEntry {
    pub query: String,
    pub filters: SearchFilters,
    pub result_count: usize,
    pub timestamp: DateTime<Utc>,
}

impl SearchHistoryEntry {
    pub fn new(query: &str, filters: SearchFilters, result_count: usize) -> Self {
        Self {
            query: query.to_string(),
            filters,
            result_count,
            timestamp: Utc::now(),
        }
    }
}

/// 检索历史（最新在前，最多 [`SEARCH_HISTORY_LIMIT`] 条）
#[derive(Debug, Clone)]
pub struct SearchHistory {
    store: LocalStore,
}

impl SearchHistory {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub fn entries(&self) -> Vec<SearchHistoryEntry> {
        self.store.get(SEARCH_HISTORY_KEY).unwrap_or_default()
    }

    /// 记录一次检索；相同 query + filters 的旧记录移到最前
    pub fn record(&self, entry: SearchHistoryEntry) -> Result<()> {
        let mut entries = self.entries();
        entries.retain(|e| !(e.query == entry.query && e.filters == entry.filters));
        entries.insert(0, entry);
        entries.truncate(SEARCH_HISTORY_LIMIT);
        self.store.set(SEARCH_HISTORY_KEY, &entries)
    }

    pub fn clear(&self) -> Result<()> {
        self.store.remove(SEARCH_HISTORY_KEY)
    }
}
