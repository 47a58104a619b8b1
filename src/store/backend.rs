//! Store 依赖的后端接口
//!
//! HTTP 实现见 [`crate::api::ApiClient`]，测试里用内存实现。

use async_trait::async_trait;

use crate::types::{Message, Session, SessionSettings, SessionUpdate};
use crate::Result;

/// 会话与消息历史的持久化后端
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// 会话列表（按最近更新排序）
    async fn list_sessions(&self) -> Result<Vec<Session>>;

    async fn get_session(&self, session_id: &str) -> Result<Session>;

    async fn create_session(&self, settings: &SessionSettings) -> Result<Session>;

    async fn update_session(&self, session_id: &str, update: &SessionUpdate) -> Result<Session>;

    /// 删除会话（服务端级联删除消息）
    async fn delete_session(&self, session_id: &str) -> Result<()>;

    /// 消息历史（按时间正序）
    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>>;
}
