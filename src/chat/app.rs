//! 聊天应用根

use std::sync::Arc;

use parking_lot::Mutex;

use super::channel::{ChannelOptions, ChatChannel};
use crate::config::ClientConfig;
use crate::storage::LocalStore;
use crate::store::{ChatBackend, ConversationStore};
use crate::transport::TransportManager;
use crate::types::{ConnectionStatus, Session, SessionSettings};
use crate::Result;

/// 聊天应用
///
/// 同一时间只有一个当前会话，也只有一条会话通道。
pub struct ChatApp {
    config: ClientConfig,
    store: ConversationStore,
    manager: TransportManager,
    channel: Mutex<Option<Arc<ChatChannel>>>,
}

impl ChatApp {
    pub fn new(config: ClientConfig, backend: Arc<dyn ChatBackend>) -> Self {
        let store = ConversationStore::new(backend, LocalStore::new(config.data_dir.clone()));
        let manager = TransportManager::from_config(&config);
        Self {
            config,
            store,
            manager,
            channel: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn transport(&self) -> &TransportManager {
        &self.manager
    }

    /// 当前会话通道
    pub fn channel(&self) -> Option<Arc<ChatChannel>> {
        self.channel.lock().clone()
    }

    /// 打开会话并连接
    ///
    /// 先拆掉旧通道再初始化，旧会话迟到的事件没有处理器接收。
    /// 连接失败不影响返回值：通道会在后台重试，状态反映在 Store 上。
    pub async fn open_session(&self, session_id: Option<&str>) -> Result<Session> {
        self.detach();
        let session = self.store.initialize_session(session_id).await?;
        self.attach(&session.id).await;
        Ok(session)
    }

    /// 新建会话并切换过去
    pub async fn new_session(&self, settings: SessionSettings) -> Result<Session> {
        self.detach();
        let session = self.store.create_session(settings).await?;
        self.attach(&session.id).await;
        Ok(session)
    }

    /// 删除会话；删除当前会话时断开通道，不自动补一个新会话
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let is_current = self.store.current_session_id().as_deref() == Some(session_id);
        if is_current {
            self.detach();
        }
        self.store.delete_session(session_id).await
    }

    /// 是否允许发送：已连接、有当前会话、没有进行中的回答
    pub fn can_send(&self) -> bool {
        self.store.connection_status() == ConnectionStatus::Connected
            && self.store.current_session_id().is_some()
            && !self.store.streaming().active
            && self.channel().is_some_and(|c| c.is_connected())
    }

    /// 发送用户消息
    ///
    /// 不满足 [`Self::can_send`] 时什么都不做并返回 `Ok(false)`。
    pub fn send(&self, content: &str) -> Result<bool> {
        let content = content.trim();
        if content.is_empty() || !self.can_send() {
            return Ok(false);
        }
        let Some(channel) = self.channel() else {
            return Ok(false);
        };

        self.store.add_user_message(content)?;
        self.store.reset_streaming();
        Ok(channel.send_message(content))
    }

    pub fn set_typing(&self, is_typing: bool) -> bool {
        self.channel().is_some_and(|c| c.send_typing(is_typing))
    }

    /// 关闭当前通道
    pub fn close(&self) {
        self.detach();
        self.manager.disconnect_all();
    }

    async fn attach(&self, session_id: &str) {
        let channel = ChatChannel::new(
            session_id,
            self.manager.clone(),
            self.store.clone(),
            ChannelOptions::from(&self.config),
        );
        *self.channel.lock() = Some(channel.clone());

        if let Err(e) = channel.open().await {
            tracing::warn!("会话通道连接失败，后台重试: {} ({})", session_id, e);
        }
    }

    fn detach(&self) {
        let previous = self.channel.lock().take();
        if let Some(channel) = previous {
            tracing::debug!("拆除会话通道: {}", channel.session_id());
            channel.close();
        }
    }
}

impl Drop for ChatApp {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.get_mut().take() {
            channel.close();
        }
    }
}
