//! 数据类型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 乐观插入的用户消息 ID 前缀
pub const TEMP_ID_PREFIX: &str = "temp-";

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// 连接状态
///
/// 状态机：`disconnected → connecting → connected → (disconnected | error)`，
/// `error` 只能回到 `connecting`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    #[default]
    Disconnected,
    Error,
}

impl ConnectionStatus {
    /// 是否允许迁移到 `next`（相同状态视为允许）
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Connected, Error)
                | (Error, Connecting)
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Error => write!(f, "error"),
        }
    }
}

/// 文档 ID（后端可能返回数字或字符串）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentId {
    Int(i64),
    Text(String),
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentId::Int(id) => write!(f, "{}", id),
            DocumentId::Text(id) => write!(f, "{}", id),
        }
    }
}

/// 引用来源（检索到的文档分块）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCitation {
    /// 排名（从 1 开始）
    pub index: u32,
    pub title: String,
    pub article_id: DocumentId,
    pub chunk_index: u32,
    /// 相关度 [0, 1]
    pub score: f64,
}

/// 会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default = "defaults::title")]
    pub title: String,
    #[serde(default, with = "timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
    // RAG 配置
    #[serde(default = "defaults::collection_name")]
    pub collection_name: String,
    #[serde(default = "defaults::llm_model")]
    pub llm_model: String,
    #[serde(default = "defaults::embedding_model")]
    pub embedding_model: String,
    #[serde(default = "defaults::temperature")]
    pub temperature: f64,
    #[serde(default = "defaults::top_k")]
    pub top_k: u32,
    #[serde(default = "defaults::min_score")]
    pub min_score: f64,
    #[serde(default = "defaults::max_context_length")]
    pub max_context_length: u32,
    #[serde(default = "defaults::max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "defaults::show_sources", deserialize_with = "lenient_bool")]
    pub show_sources: bool,
    #[serde(default)]
    pub message_count: u32,
}

impl Session {
    /// 用配置构造一个会话（未持久化，时间戳为当前时间）
    pub fn from_settings(id: impl Into<String>, settings: &SessionSettings) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: settings.title.clone(),
            created_at: Some(now),
            updated_at: Some(now),
            collection_name: settings.collection_name.clone(),
            llm_model: settings.llm_model.clone(),
            embedding_model: settings.embedding_model.clone(),
            temperature: settings.temperature,
            top_k: settings.top_k,
            min_score: settings.min_score,
            max_context_length: settings.max_context_length,
            max_tokens: settings.max_tokens,
            system_prompt: settings.system_prompt.clone(),
            show_sources: settings.show_sources,
            message_count: 0,
        }
    }

    /// 应用局部更新
    pub fn apply(&mut self, update: &SessionUpdate) {
        if let Some(ref v) = update.title {
            self.title = v.clone();
        }
        if let Some(ref v) = update.collection_name {
            self.collection_name = v.clone();
        }
        if let Some(ref v) = update.llm_model {
            self.llm_model = v.clone();
        }
        if let Some(ref v) = update.embedding_model {
            self.embedding_model = v.clone();
        }
        if let Some(v) = update.temperature {
            self.temperature = v;
        }
        if let Some(v) = update.top_k {
            self.top_k = v;
        }
        if let Some(v) = update.min_score {
            self.min_score = v;
        }
        if let Some(v) = update.max_context_length {
            self.max_context_length = v;
        }
        if let Some(v) = update.max_tokens {
            self.max_tokens = v;
        }
        if let Some(ref v) = update.system_prompt {
            self.system_prompt = Some(v.clone());
        }
        if let Some(v) = update.show_sources {
            self.show_sources = v;
        }
        self.updated_at = Some(Utc::now());
    }
}

/// 新建会话的参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub title: String,
    pub collection_name: String,
    pub llm_model: String,
    pub embedding_model: String,
    pub temperature: f64,
    pub top_k: u32,
    pub min_score: f64,
    pub max_context_length: u32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub show_sources: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            title: defaults::title(),
            collection_name: defaults::collection_name(),
            llm_model: defaults::llm_model(),
            embedding_model: defaults::embedding_model(),
            temperature: defaults::temperature(),
            top_k: defaults::top_k(),
            min_score: defaults::min_score(),
            max_context_length: defaults::max_context_length(),
            max_tokens: defaults::max_tokens(),
            system_prompt: None,
            show_sources: defaults::show_sources(),
        }
    }
}

/// 会话设置的局部更新（只序列化有值的字段）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_context_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_sources: Option<bool>,
}

/// 消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, with = "timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub response_time_ms: Option<u64>,
    #[serde(default)]
    pub token_count: Option<u64>,
    #[serde(default)]
    pub sources: Option<Vec<SourceCitation>>,
    #[serde(default)]
    pub search_query: Option<String>,
    /// 客户端标记：生成失败时插入的错误消息
    #[serde(default, skip_serializing)]
    pub is_error: bool,
}

impl Message {
    /// 乐观插入的用户消息（临时 ID）
    pub fn optimistic_user(session_id: &str, content: &str) -> Self {
        Self {
            id: format!("{}{}", TEMP_ID_PREFIX, uuid::Uuid::new_v4()),
            session_id: session_id.to_string(),
            role: Role::User,
            content: content.to_string(),
            created_at: Some(Utc::now()),
            response_time_ms: None,
            token_count: None,
            sources: None,
            search_query: None,
            is_error: false,
        }
    }

    /// 是否为尚未被服务端确认的临时消息
    pub fn is_optimistic(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }
}

// ==================== Dashboard API 类型 ====================

/// 向量集合
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    #[serde(default)]
    pub points_count: u64,
    #[serde(default)]
    pub vectors_count: u64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub vector_size: Option<u32>,
    #[serde(default)]
    pub distance_metric: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// 集合统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub name: String,
    #[serde(default)]
    pub points_count: u64,
    #[serde(default)]
    pub vectors_count: u64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub vector_size: Option<u32>,
    #[serde(default)]
    pub last_stats_update: Option<String>,
}

/// Embedding 模型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingModel {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub vector_size: u32,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub is_available: String,
    #[serde(default)]
    pub recommended: bool,
}

/// 检索请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub limit: u32,
    pub min_score: f64,
    pub hybrid: bool,
    pub collection: String,
}

impl SearchRequest {
    pub fn new(query: &str) -> Self {
        Self {
            query: query.to_string(),
            limit: 10,
            min_score: 0.0,
            hybrid: false,
            collection: defaults::collection_name(),
        }
    }
}

/// 检索结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: DocumentId,
    pub score: f64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub article_id: DocumentId,
    #[serde(default)]
    pub chunk_index: u32,
}

/// 系统状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub qdrant_status: String,
    pub ollama_status: String,
    #[serde(default)]
    pub active_connections: u32,
    #[serde(default)]
    pub uptime: String,
}

/// 依赖服务健康状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service: String,
    pub status: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub response_time_ms: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// 分类类别
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub sample_texts: Vec<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub sample_count: u32,
}

/// 分类请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRequest {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub top_k: u32,
}

/// 单个类别的分类结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub category_id: i64,
    pub category_name: String,
    pub confidence: f64,
    #[serde(default)]
    pub sample_count: u32,
}

/// 分类响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResponse {
    pub text: String,
    pub model: String,
    pub results: Vec<ClassificationResult>,
}

/// Embedding 模型校验结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelValidation {
    pub model_name: String,
    pub is_valid: bool,
    #[serde(default)]
    pub vector_size: Option<u32>,
    #[serde(default)]
    pub availability_status: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub model_info: Option<serde_json::Value>,
}

/// 整体健康报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub services: Vec<ServiceHealth>,
    #[serde(default)]
    pub timestamp: f64,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// 新建集合请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionCreate {
    pub name: String,
    pub embedding_model: String,
    /// 不填时由服务端按模型推断
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_size: Option<u32>,
    pub distance_metric: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON 字符串
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
}

impl CollectionCreate {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            embedding_model: defaults::embedding_model(),
            vector_size: None,
            distance_metric: "cosine".to_string(),
            description: None,
            tags: None,
        }
    }
}

/// 文档（文章）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub chunk_count: u32,
    #[serde(default)]
    pub collection: String,
}

/// 文档分块
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub chunk_index: u32,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub score: Option<f64>,
}

/// 索引任务请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexingRequest {
    /// `json` 或 `markdown`
    pub source_type: String,
    pub source_path: String,
    pub collection_name: String,
    pub chunk_size: u32,
    pub chunk_overlap: u32,
    pub embedding_model: String,
}

impl IndexingRequest {
    pub fn new(source_type: &str, source_path: &str) -> Self {
        Self {
            source_type: source_type.to_string(),
            source_path: source_path.to_string(),
            collection_name: defaults::collection_name(),
            chunk_size: 150,
            chunk_overlap: 30,
            embedding_model: defaults::embedding_model(),
        }
    }
}

/// 索引任务状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexingJob {
    pub id: String,
    pub status: String,
    /// 0 ~ 100
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub total_documents: u64,
    #[serde(default)]
    pub processed_documents: u64,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl IndexingJob {
    pub fn is_finished(&self) -> bool {
        matches!(self.status.as_str(), "completed" | "failed" | "cancelled")
    }
}

// ==================== serde 辅助 ====================

mod defaults {
    pub fn title() -> String {
        "New Conversation".to_string()
    }
    pub fn collection_name() -> String {
        "articles".to_string()
    }
    pub fn llm_model() -> String {
        "llama2".to_string()
    }
    pub fn embedding_model() -> String {
        "embeddinggemma:latest".to_string()
    }
    pub fn temperature() -> f64 {
        0.7
    }
    pub fn top_k() -> u32 {
        5
    }
    pub fn min_score() -> f64 {
        0.5
    }
    pub fn max_context_length() -> u32 {
        3000
    }
    pub fn max_tokens() -> u32 {
        2000
    }
    pub fn show_sources() -> bool {
        true
    }
}

/// 接受 `true/false` 或 `0/1`（SQLite 直出的整数）
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Bool(b) => Ok(b),
        serde_json::Value::Number(n) => Ok(n.as_i64().unwrap_or(0) != 0),
        serde_json::Value::Null => Ok(defaults::show_sources()),
        other => Err(D::Error::custom(format!("expected bool, got {}", other))),
    }
}

/// 时间戳：RFC 3339 或不带时区的 ISO-8601（按 UTC 处理）
pub(crate) mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(s: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(dt) => serializer.serialize_str(&dt.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        Ok(raw.as_deref().and_then(parse))
    }
}
