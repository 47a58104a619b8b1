//! ConversationStore 实现

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::backend::ChatBackend;
use super::notifier::{Notifier, SubscriberId};
use super::{Notification, StoreEvent, StoreEventKind, StreamingSnapshot};
use crate::protocol::CompletePayload;
use crate::storage::{LocalStore, LAST_SESSION_KEY};
use crate::types::{
    ConnectionStatus, Message, Role, Session, SessionSettings, SessionUpdate, SourceCitation,
};
use crate::{Error, Result};

/// 订阅者通道容量
const SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct State {
    sessions: Vec<Session>,
    current_session_id: Option<String>,
    messages: Vec<Message>,
    connection: ConnectionStatus,
    streaming: StreamingSnapshot,
    /// 进行中的加载操作数
    loading: u32,
}

impl State {
    fn bump_message_count(&mut self, session_id: &str) {
        if let Some(session) = self.sessions.iter_mut().find(|s| s.id == session_id) {
            session.message_count += 1;
        }
    }

    fn upsert_session(&mut self, session: &Session) {
        match self.sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session.clone(),
            None => self.sessions.insert(0, session.clone()),
        }
    }
}

struct Inner {
    state: RwLock<State>,
    backend: Arc<dyn ChatBackend>,
    local: LocalStore,
    notifier: Notifier,
}

/// 会话状态容器
///
/// Clone 开销很小（内部是 Arc），由应用根持有并注入给 [`crate::chat::ChatChannel`]。
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<Inner>,
}

/// 事件订阅
pub struct Subscription {
    pub id: SubscriberId,
    receiver: mpsc::Receiver<StoreEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<StoreEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StoreEvent> {
        self.receiver.try_recv().ok()
    }
}

/// 加载计数守卫，离开作用域时自动减一
struct LoadingGuard<'a> {
    store: &'a ConversationStore,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let finished = {
            let mut state = self.store.inner.state.write();
            state.loading = state.loading.saturating_sub(1);
            state.loading == 0
        };
        if finished {
            self.store.emit(StoreEvent::LoadingChanged(false));
        }
    }
}

impl ConversationStore {
    pub fn new(backend: Arc<dyn ChatBackend>, local: LocalStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                backend,
                local,
                notifier: Notifier::new(),
            }),
        }
    }

    // ==================== 订阅 ====================

    /// 订阅指定类别的事件
    pub fn subscribe(&self, kinds: &[StoreEventKind]) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = self.inner.notifier.register(tx, kinds);
        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.inner.notifier.unregister(id);
    }

    fn emit(&self, event: StoreEvent) {
        self.inner.notifier.broadcast(event);
    }

    // ==================== 只读视图 ====================

    pub fn sessions(&self) -> Vec<Session> {
        self.inner.state.read().sessions.clone()
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.inner.state.read().current_session_id.clone()
    }

    pub fn current_session(&self) -> Option<Session> {
        let state = self.inner.state.read();
        let id = state.current_session_id.as_ref()?;
        state.sessions.iter().find(|s| &s.id == id).cloned()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.state.read().messages.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.read().loading > 0
    }

    pub fn streaming(&self) -> StreamingSnapshot {
        self.inner.state.read().streaming.clone()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.state.read().connection
    }

    /// 本地记住的最近使用会话
    pub fn last_session_id(&self) -> Option<String> {
        self.inner.local.get(LAST_SESSION_KEY)
    }

    fn begin_loading(&self) -> LoadingGuard<'_> {
        let started = {
            let mut state = self.inner.state.write();
            state.loading += 1;
            state.loading == 1
        };
        if started {
            self.emit(StoreEvent::LoadingChanged(true));
        }
        LoadingGuard { store: self }
    }

    async fn remember(&self, session_id: &str) {
        if let Err(e) = self.inner.local.persist(LAST_SESSION_KEY, session_id).await {
            tracing::warn!("保存最近会话失败: {}", e);
        }
    }

    // ==================== 会话 ====================

    /// 从后端刷新会话列表
    pub async fn load_sessions(&self) -> Result<Vec<Session>> {
        let _loading = self.begin_loading();
        let sessions = self.inner.backend.list_sessions().await?;
        self.inner.state.write().sessions = sessions.clone();
        self.emit(StoreEvent::SessionsChanged);
        Ok(sessions)
    }

    /// 初始化当前会话
    ///
    /// 指定 `session_id` 时直接加载；否则依次尝试：本地记住的会话 →
    /// 最近更新的会话 → 新建会话。成功返回时一定有且只有一个当前会话。
    pub async fn initialize_session(&self, session_id: Option<&str>) -> Result<Session> {
        let _loading = self.begin_loading();

        if let Some(id) = session_id {
            let session = self.inner.backend.get_session(id).await?;
            return self.activate(session).await;
        }

        let sessions = self.load_sessions().await?;

        let remembered = self
            .last_session_id()
            .and_then(|id| sessions.iter().find(|s| s.id == id).cloned());
        if remembered.is_none() {
            tracing::debug!("没有可恢复的最近会话，回退到最近更新的会话");
        }

        match remembered.or_else(|| most_recent(&sessions)) {
            Some(session) => self.activate(session).await,
            None => {
                tracing::info!("没有任何会话，新建一个");
                self.create_session(SessionSettings::default()).await
            }
        }
    }

    /// 切换到已存在的会话（加载消息历史）
    async fn activate(&self, session: Session) -> Result<Session> {
        let messages = self.inner.backend.list_messages(&session.id).await?;

        {
            let mut state = self.inner.state.write();
            state.upsert_session(&session);
            state.current_session_id = Some(session.id.clone());
            state.messages = messages;
            state.streaming = StreamingSnapshot::default();
        }
        self.remember(&session.id).await;

        tracing::info!("📂 当前会话: {} ({})", session.id, session.title);
        self.emit(StoreEvent::SessionsChanged);
        self.emit(StoreEvent::CurrentSessionChanged(Some(session.id.clone())));
        self.emit(StoreEvent::MessagesReplaced);
        self.emit(StoreEvent::StreamingReset);
        Ok(session)
    }

    /// 新建会话并设为当前会话
    pub async fn create_session(&self, settings: SessionSettings) -> Result<Session> {
        let _loading = self.begin_loading();
        let session = self.inner.backend.create_session(&settings).await?;

        {
            let mut state = self.inner.state.write();
            state.sessions.retain(|s| s.id != session.id);
            state.sessions.insert(0, session.clone());
            state.current_session_id = Some(session.id.clone());
            state.messages.clear();
            state.streaming = StreamingSnapshot::default();
        }
        self.remember(&session.id).await;

        tracing::info!("🆕 新建会话: {}", session.id);
        self.emit(StoreEvent::SessionsChanged);
        self.emit(StoreEvent::CurrentSessionChanged(Some(session.id.clone())));
        self.emit(StoreEvent::MessagesReplaced);
        self.emit(StoreEvent::StreamingReset);
        Ok(session)
    }

    /// 更新会话设置
    pub async fn update_session_settings(
        &self,
        session_id: &str,
        update: SessionUpdate,
    ) -> Result<Session> {
        let session = self.inner.backend.update_session(session_id, &update).await?;
        {
            let mut state = self.inner.state.write();
            if let Some(existing) = state.sessions.iter_mut().find(|s| s.id == session.id) {
                *existing = session.clone();
            }
        }
        self.emit(StoreEvent::SessionsChanged);
        Ok(session)
    }

    /// 删除会话
    ///
    /// 删除的是当前会话时，当前会话置空，由调用方决定替代会话。
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.inner.backend.delete_session(session_id).await?;

        let was_current = {
            let mut state = self.inner.state.write();
            state.sessions.retain(|s| s.id != session_id);
            if state.current_session_id.as_deref() == Some(session_id) {
                state.current_session_id = None;
                state.messages.clear();
                state.streaming = StreamingSnapshot::default();
                true
            } else {
                false
            }
        };

        if self.last_session_id().as_deref() == Some(session_id) {
            if let Err(e) = self.inner.local.forget(LAST_SESSION_KEY).await {
                tracing::warn!("清除最近会话失败: {}", e);
            }
        }

        tracing::info!("🗑️ 删除会话: {} (current={})", session_id, was_current);
        self.emit(StoreEvent::SessionsChanged);
        if was_current {
            self.emit(StoreEvent::CurrentSessionChanged(None));
            self.emit(StoreEvent::MessagesReplaced);
        }
        Ok(())
    }

    // ==================== 消息与流式缓冲 ====================

    /// 乐观插入用户消息（不等待服务端确认）
    pub fn add_user_message(&self, content: &str) -> Result<Message> {
        let message = {
            let mut state = self.inner.state.write();
            let session_id = state
                .current_session_id
                .clone()
                .ok_or(Error::NoCurrentSession)?;
            let message = Message::optimistic_user(&session_id, content);
            state.messages.push(message.clone());
            state.bump_message_count(&session_id);
            message
        };
        self.emit(StoreEvent::MessageAdded(message.clone()));
        Ok(message)
    }

    /// 追加回答片段
    pub fn append_streaming_content(&self, fragment: &str) {
        {
            let mut state = self.inner.state.write();
            state.streaming.content.push_str(fragment);
            state.streaming.active = true;
        }
        self.emit(StoreEvent::ContentAppended(fragment.to_string()));
    }

    pub fn set_status_message(&self, text: impl Into<String>) {
        let text = text.into();
        self.inner.state.write().streaming.status_message = Some(text.clone());
        self.emit(StoreEvent::StatusMessage(text));
    }

    pub fn set_current_sources(&self, sources: Vec<SourceCitation>) {
        let count = sources.len();
        self.inner.state.write().streaming.sources = sources;
        self.emit(StoreEvent::SourcesUpdated(count));
    }

    /// 清空流式缓冲区
    pub fn reset_streaming(&self) {
        self.inner.state.write().streaming = StreamingSnapshot::default();
        self.emit(StoreEvent::StreamingReset);
    }

    /// 用缓冲区内容生成最终的助手消息并清空缓冲区
    ///
    /// 没有当前会话时只清空缓冲区，返回 None。
    pub fn finalize_streaming_message(&self, payload: CompletePayload) -> Option<Message> {
        let message = {
            let mut state = self.inner.state.write();
            let buffer = std::mem::take(&mut state.streaming);

            match state.current_session_id.clone() {
                None => None,
                Some(session_id) => {
                    let sources = match payload.sources {
                        Some(sources) if sources.is_empty() => None,
                        Some(sources) => Some(sources),
                        None if buffer.sources.is_empty() => None,
                        None => Some(buffer.sources),
                    };
                    let search_query = state
                        .messages
                        .iter()
                        .rev()
                        .find(|m| m.role == Role::User)
                        .map(|m| m.content.clone());

                    let message = Message {
                        id: payload
                            .message_id
                            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                        session_id: session_id.clone(),
                        role: Role::Assistant,
                        content: buffer.content,
                        created_at: Some(Utc::now()),
                        response_time_ms: payload.response_time_ms,
                        token_count: payload.token_count,
                        sources,
                        search_query,
                        is_error: false,
                    };
                    state.messages.push(message.clone());
                    state.bump_message_count(&session_id);
                    Some(message)
                }
            }
        };

        match message {
            Some(ref m) => {
                tracing::debug!(
                    "✅ 回答完成: len={}, response_time_ms={:?}",
                    m.content.len(),
                    m.response_time_ms
                );
                self.emit(StoreEvent::MessageAdded(m.clone()));
            }
            None => tracing::warn!("收到 complete 但没有当前会话，丢弃"),
        }
        self.emit(StoreEvent::StreamingReset);
        message
    }

    /// 插入一条助手角色的错误消息，清空缓冲区并发出错误通知
    pub fn add_error_message(&self, error: &str) -> Option<Message> {
        let message = {
            let mut state = self.inner.state.write();
            state.streaming = StreamingSnapshot::default();

            state.current_session_id.clone().map(|session_id| {
                let message = Message {
                    id: uuid::Uuid::new_v4().to_string(),
                    session_id: session_id.clone(),
                    role: Role::Assistant,
                    content: format!("Error: {}", error),
                    created_at: Some(Utc::now()),
                    response_time_ms: None,
                    token_count: None,
                    sources: None,
                    search_query: None,
                    is_error: true,
                };
                state.messages.push(message.clone());
                state.bump_message_count(&session_id);
                message
            })
        };

        if let Some(ref m) = message {
            self.emit(StoreEvent::MessageAdded(m.clone()));
        }
        self.emit(StoreEvent::StreamingReset);
        self.notify(Notification::error(error));
        message
    }

    // ==================== 连接状态 / 通知 ====================

    /// 更新连接状态；不合法的迁移被忽略并返回 false
    pub fn set_connection_status(&self, status: ConnectionStatus) -> bool {
        let changed = {
            let mut state = self.inner.state.write();
            let current = state.connection;
            if !current.can_transition_to(status) {
                tracing::debug!("忽略非法的连接状态迁移: {} → {}", current, status);
                return false;
            }
            state.connection = status;
            current != status
        };

        if changed {
            tracing::debug!("🔌 连接状态: {}", status);
            self.emit(StoreEvent::ConnectionChanged(status));
        }
        true
    }

    pub fn notify(&self, notification: Notification) {
        self.emit(StoreEvent::Notification(notification));
    }
}

/// 最近更新的会话；时间相同取列表中靠前的
fn most_recent(sessions: &[Session]) -> Option<Session> {
    sessions
        .iter()
        .rev()
        .max_by_key(|s| s.updated_at)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn session(id: &str, updated_hour: Option<u32>) -> Session {
        let mut s = Session::from_settings(id, &SessionSettings::default());
        s.updated_at = updated_hour.map(|h| Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).unwrap());
        s
    }

    #[test]
    fn test_most_recent_picks_latest_update() {
        let sessions = vec![session("a", Some(1)), session("b", Some(9)), session("c", Some(3))];
        assert_eq!(most_recent(&sessions).unwrap().id, "b");
    }

    #[test]
    fn test_most_recent_ties_keep_list_order() {
        let sessions = vec![session("a", None), session("b", None)];
        assert_eq!(most_recent(&sessions).unwrap().id, "a");
        assert!(most_recent(&[]).is_none());

        let mut later = session("z", Some(1));
        later.updated_at = later.updated_at.map(|t| t + Duration::minutes(1));
        let sessions = vec![session("y", Some(1)), later];
        assert_eq!(most_recent(&sessions).unwrap().id, "z");
    }
}
