//! WebSocket 协议定义
//!
//! 每一帧都是 JSON：`{"type": string, "data": any, "timestamp": number}`。
//! 帧先在传输层解析为 [`Envelope`]，解析失败直接丢弃；各逻辑路径再把
//! Envelope 解码成自己的强类型事件。

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::types::SourceCitation;
use crate::{Error, Result};

/// 逻辑路径
pub mod paths {
    /// 集合变更推送
    pub const COLLECTIONS: &str = "/collections";
    /// 系统状态推送
    pub const SYSTEM: &str = "/system";

    /// 会话聊天通道
    pub fn chat(session_id: &str) -> String {
        format!("/chat/{}", session_id)
    }

    /// 索引任务进度推送
    pub fn indexing(job_id: &str) -> String {
        format!("/indexing/{}", job_id)
    }
}

/// 线上帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    /// 毫秒时间戳
    #[serde(default, deserialize_with = "lenient_millis")]
    pub timestamp: i64,
}

impl Envelope {
    /// 构造一帧，时间戳取当前时间
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 解析文本帧
    pub fn parse(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)?;
        if envelope.kind.trim().is_empty() {
            return Err(Error::Protocol("帧缺少 type".to_string()));
        }
        Ok(envelope)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// 时间戳可能是整数也可能是浮点毫秒
fn lenient_millis<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        _ => 0,
    })
}

/// 聊天通道的消息类型
pub mod chat_type {
    pub const CONNECTED: &str = "connected";
    pub const STATUS: &str = "status";
    pub const CONTEXT: &str = "context";
    pub const CONTENT: &str = "content";
    pub const COMPLETE: &str = "complete";
    pub const ERROR: &str = "error";
    pub const PONG: &str = "pong";

    pub const MESSAGE: &str = "message";
    pub const TYPING: &str = "typing";
    pub const PING: &str = "ping";
}

/// `context` 负载：本轮回答检索到的来源
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextPayload {
    #[serde(default)]
    pub sources: Vec<SourceCitation>,
    #[serde(default)]
    pub context_found: bool,
}

/// `complete` 负载
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletePayload {
    #[serde(default)]
    pub response_time_ms: Option<u64>,
    /// 缺省表示沿用 `context` 阶段的来源；显式空数组表示不展示来源
    #[serde(default)]
    pub sources: Option<Vec<SourceCitation>>,
    #[serde(default)]
    pub token_count: Option<u64>,
    /// 服务端落库后的消息 ID
    #[serde(default)]
    pub message_id: Option<String>,
}

/// `error` 负载
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorPayload {
    pub message: String,
}

impl ErrorPayload {
    /// 接受 `"text"`、`{"error": "text"}` 或 `{"message": "text"}`
    fn from_value(data: &Value) -> Self {
        let message = match data {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("error")
                .or_else(|| map.get("message"))
                .or_else(|| map.get("detail"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| data.to_string()),
            Value::Null => "Unknown error".to_string(),
            other => other.to_string(),
        };
        Self { message }
    }
}

/// 聊天通道入站事件（Server → Client）
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// 握手确认
    Connected(Value),
    /// 进度文本，例如 "Searching for relevant context..."
    Status(String),
    /// 检索到的来源
    Context(ContextPayload),
    /// 回答片段
    Content(String),
    /// 回答结束
    Complete(CompletePayload),
    /// 生成或检索失败
    Error(ErrorPayload),
    /// 心跳回复
    Pong,
    /// 未知类型（记录后忽略）
    Unknown(String),
}

impl ChatEvent {
    /// 从 Envelope 解码
    pub fn decode(envelope: &Envelope) -> Result<Self> {
        let data = &envelope.data;
        let event = match envelope.kind.as_str() {
            chat_type::CONNECTED => ChatEvent::Connected(data.clone()),
            chat_type::STATUS => ChatEvent::Status(String::deserialize(data)?),
            chat_type::CONTEXT => ChatEvent::Context(ContextPayload::deserialize(data)?),
            chat_type::CONTENT => ChatEvent::Content(String::deserialize(data)?),
            chat_type::COMPLETE => {
                if data.is_null() {
                    ChatEvent::Complete(CompletePayload::default())
                } else {
                    ChatEvent::Complete(CompletePayload::deserialize(data)?)
                }
            }
            chat_type::ERROR => ChatEvent::Error(ErrorPayload::from_value(data)),
            chat_type::PONG => ChatEvent::Pong,
            other => ChatEvent::Unknown(other.to_string()),
        };
        Ok(event)
    }
}

/// 聊天通道出站命令（Client → Server）
#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    /// 用户消息
    Message { content: String },
    /// 输入状态
    Typing { is_typing: bool },
    /// 心跳探测
    Ping,
}

impl From<ChatCommand> for Envelope {
    fn from(command: ChatCommand) -> Self {
        match command {
            ChatCommand::Message { content } => {
                Envelope::new(chat_type::MESSAGE, serde_json::json!({ "message": content }))
            }
            ChatCommand::Typing { is_typing } => {
                Envelope::new(chat_type::TYPING, serde_json::json!({ "is_typing": is_typing }))
            }
            ChatCommand::Ping => Envelope::new(chat_type::PING, serde_json::json!({})),
        }
    }
}

/// `/collections` 推送事件
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionEvent {
    Created(Value),
    Deleted(Value),
    Updated(Value),
    Stats(Value),
}

impl CollectionEvent {
    /// 未知类型返回 None
    pub fn decode(envelope: &Envelope) -> Option<Self> {
        let data = envelope.data.clone();
        match envelope.kind.as_str() {
            "collection_created" => Some(CollectionEvent::Created(data)),
            "collection_deleted" => Some(CollectionEvent::Deleted(data)),
            "collection_updated" => Some(CollectionEvent::Updated(data)),
            "collection_stats" => Some(CollectionEvent::Stats(data)),
            _ => None,
        }
    }

    pub fn data(&self) -> &Value {
        match self {
            CollectionEvent::Created(d)
            | CollectionEvent::Deleted(d)
            | CollectionEvent::Updated(d)
            | CollectionEvent::Stats(d) => d,
        }
    }

    /// 事件涉及的集合名（`data.name` 或 `data.collection_name`）
    pub fn collection_name(&self) -> Option<&str> {
        let data = self.data();
        data.get("name")
            .or_else(|| data.get("collection_name"))
            .and_then(Value::as_str)
    }
}

/// `/system` 推送事件
#[derive(Debug, Clone, PartialEq)]
pub enum SystemEvent {
    SystemStatus(Value),
    HealthUpdate(Value),
    ConnectionStatus(Value),
}

impl SystemEvent {
    /// 未知类型返回 None
    pub fn decode(envelope: &Envelope) -> Option<Self> {
        let data = envelope.data.clone();
        match envelope.kind.as_str() {
            "system_status" => Some(SystemEvent::SystemStatus(data)),
            "health_update" => Some(SystemEvent::HealthUpdate(data)),
            "connection_status" => Some(SystemEvent::ConnectionStatus(data)),
            _ => None,
        }
    }
}
