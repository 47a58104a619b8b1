//! rag-chat-client - RAG 后端的异步客户端
//!
//! 面向检索增强问答服务（`/api/v1` HTTP + `/ws/...` WebSocket）的客户端库，
//! 核心是实时聊天：多路 WebSocket 传输、单会话协议适配、会话状态容器。
//!
//! # 核心功能
//!
//! - **传输层**: 按逻辑路径管理连接，帧分发给处理器，异常断开自动重连
//! - **协议适配**: 流式回答（status / context / content / complete / error）→ Store
//! - **状态容器**: 会话列表、当前会话、消息、流式缓冲、连接状态，订阅式通知
//! - **HTTP API**: 会话 CRUD、消息历史、集合、检索、系统状态、分类
//!
//! # Feature Flags
//!
//! - `ws`: WebSocket 传输、聊天通道、推送订阅
//! - `http`: 基于 reqwest 的 API 客户端
//!
//! # 架构
//!
//! 用户意图 → [`ConversationStore`] → [`chat::ChatChannel`] → [`transport::TransportManager`]；
//! 入站帧反向流动。两层共用同一个 [`ReconnectPolicy`]。

pub mod config;
pub mod error;
pub mod protocol;
pub mod reconnect;
pub mod storage;
pub mod store;
pub mod types;

#[cfg(feature = "ws")]
pub mod transport;

#[cfg(feature = "ws")]
pub mod chat;

#[cfg(feature = "ws")]
pub mod monitor;

#[cfg(feature = "http")]
pub mod api;

// Re-exports
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use protocol::{ChatCommand, ChatEvent, CollectionEvent, Envelope, SystemEvent};
pub use reconnect::{Backoff, ReconnectPolicy};
pub use storage::{LocalStore, SearchHistory, SearchHistoryEntry};
pub use store::{ChatBackend, ConversationStore, Notification, StoreEvent, StoreEventKind};
pub use types::*;

#[cfg(feature = "ws")]
pub use chat::{ChannelOptions, ChatApp, ChatChannel};

#[cfg(feature = "ws")]
pub use transport::{TransportEvent, TransportManager};

#[cfg(feature = "http")]
pub use api::ApiClient;
