//! 会话状态容器
//!
//! [`ConversationStore`] 是聊天界面唯一的状态来源：会话列表、当前会话、
//! 消息列表、连接状态和流式缓冲区。状态变化通过 [`Notifier`] 推送给订阅者。

mod backend;
mod conversation;
mod notifier;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConnectionStatus, Message, SourceCitation};

pub use backend::ChatBackend;
pub use conversation::{ConversationStore, Subscription};
pub use notifier::{EventSender, Notifier, SubscriberId};

/// 流式缓冲区快照（进行中的回答，尚未成为消息）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamingSnapshot {
    /// 已收到的片段（按到达顺序拼接）
    pub content: String,
    /// 进度文本
    pub status_message: Option<String>,
    /// 临时来源
    pub sources: Vec<SourceCitation>,
    /// 是否正在接收片段
    pub active: bool,
}

impl StreamingSnapshot {
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.status_message.is_none() && self.sources.is_empty()
    }
}

/// 通知级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// 面向用户的通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(level: NotificationLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            created_at: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Error, message)
    }
}

/// Store 事件
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// 会话列表变化
    SessionsChanged,
    /// 当前会话切换
    CurrentSessionChanged(Option<String>),
    /// 加载状态变化
    LoadingChanged(bool),
    /// 消息列表整体替换（切换会话、加载历史）
    MessagesReplaced,
    /// 新增一条消息
    MessageAdded(Message),
    /// 进度文本
    StatusMessage(String),
    /// 新片段
    ContentAppended(String),
    /// 临时来源更新（数量）
    SourcesUpdated(usize),
    /// 缓冲区清空
    StreamingReset,
    /// 连接状态变化
    ConnectionChanged(ConnectionStatus),
    /// 用户通知
    Notification(Notification),
}

/// 事件类别（用于订阅）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreEventKind {
    Sessions,
    Messages,
    Streaming,
    Connection,
    Notification,
}

impl StoreEventKind {
    pub const ALL: [StoreEventKind; 5] = [
        StoreEventKind::Sessions,
        StoreEventKind::Messages,
        StoreEventKind::Streaming,
        StoreEventKind::Connection,
        StoreEventKind::Notification,
    ];
}

impl StoreEvent {
    pub fn kind(&self) -> StoreEventKind {
        match self {
            StoreEvent::SessionsChanged
            | StoreEvent::CurrentSessionChanged(_)
            | StoreEvent::LoadingChanged(_) => StoreEventKind::Sessions,
            StoreEvent::MessagesReplaced | StoreEvent::MessageAdded(_) => StoreEventKind::Messages,
            StoreEvent::StatusMessage(_)
            | StoreEvent::ContentAppended(_)
            | StoreEvent::SourcesUpdated(_)
            | StoreEvent::StreamingReset => StoreEventKind::Streaming,
            StoreEvent::ConnectionChanged(_) => StoreEventKind::Connection,
            StoreEvent::Notification(_) => StoreEventKind::Notification,
        }
    }
}
