//! 单个会话的实时通道
//!
//! 包装 `/chat/{session_id}` 这条连接：把入站事件翻译成 Store 操作，
//! 把用户动作（发送、输入状态、心跳）翻译成出站帧。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

use crate::config::ClientConfig;
use crate::protocol::{paths, ChatCommand, ChatEvent, Envelope};
use crate::reconnect::{Backoff, ReconnectPolicy};
use crate::store::ConversationStore;
use crate::transport::{EventHandler, TransportEvent, TransportManager};
use crate::types::ConnectionStatus;
use crate::Result;

/// 回答中途断线时写入的错误消息
pub const CONNECTION_LOST: &str = "Connection lost before the response completed";

/// 通道参数
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    /// 握手失败后的重试策略
    pub reconnect: ReconnectPolicy,
    /// 心跳间隔
    pub keepalive_interval: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

impl From<&ClientConfig> for ChannelOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            reconnect: config.reconnect,
            keepalive_interval: config.keepalive_interval,
        }
    }
}

/// 会话协议适配器
pub struct ChatChannel {
    session_id: String,
    path: String,
    manager: TransportManager,
    store: ConversationStore,
    options: ChannelOptions,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    this: Weak<ChatChannel>,
}

impl ChatChannel {
    /// 创建通道（不发起连接）
    pub fn new(
        session_id: &str,
        manager: TransportManager,
        store: ConversationStore,
        options: ChannelOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            session_id: session_id.to_string(),
            path: paths::chat(session_id),
            manager,
            store,
            options,
            keepalive_task: Mutex::new(None),
            retry_task: Mutex::new(None),
            closed: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected(&self.path)
    }

    /// 建立连接
    ///
    /// 握手失败时返回错误，同时在后台按重连策略重试。
    pub async fn open(&self) -> Result<()> {
        match self.try_connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.store.set_connection_status(ConnectionStatus::Error);
                self.schedule_retry();
                Err(e)
            }
        }
    }

    async fn try_connect(&self) -> Result<()> {
        self.store.set_connection_status(ConnectionStatus::Connecting);
        self.manager
            .connect(&self.path, self.handler())
            .await
            .map(|_| ())
    }

    fn handler(&self) -> EventHandler {
        let this = self.this.clone();
        Arc::new(move |event: TransportEvent| {
            if let Some(channel) = this.upgrade() {
                channel.on_transport_event(event);
            }
        })
    }

    fn schedule_retry(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let this = self.this.clone();
        let policy = self.options.reconnect;
        let task = tokio::spawn(async move {
            let mut backoff = Backoff::new(policy);
            while let Some(delay) = backoff.next_delay() {
                tokio::time::sleep(delay).await;

                let Some(channel) = this.upgrade() else { return };
                if channel.closed.load(Ordering::SeqCst) {
                    return;
                }

                match channel.try_connect().await {
                    Ok(()) => {
                        tracing::info!(
                            "会话通道重试成功: {} (attempt={})",
                            channel.session_id,
                            backoff.attempts()
                        );
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "会话通道重试失败: {} (attempt={}): {}",
                            channel.session_id,
                            backoff.attempts(),
                            e
                        );
                        channel.store.set_connection_status(ConnectionStatus::Error);
                    }
                }
            }
            tracing::warn!("会话通道重试次数已用尽，等待手动重连");
        });

        if let Some(previous) = self.retry_task.lock().replace(task) {
            previous.abort();
        }
    }

    fn on_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Opened { reconnected } => {
                tracing::debug!("会话通道已连接: {} (reconnected={})", self.session_id, reconnected);
                self.store.set_connection_status(ConnectionStatus::Connected);
                self.start_keepalive();
            }
            TransportEvent::Frame(envelope) => self.handle_envelope(&envelope),
            TransportEvent::Closed { code, normal } => {
                tracing::debug!(
                    "会话通道关闭: {} (code={}, normal={})",
                    self.session_id,
                    code,
                    normal
                );
                self.stop_keepalive();
                self.abandon_stream();
                self.store.set_connection_status(ConnectionStatus::Disconnected);
            }
            TransportEvent::Reconnecting { .. } => {
                self.store.set_connection_status(ConnectionStatus::Connecting);
            }
            TransportEvent::Abandoned => {
                self.stop_keepalive();
                self.abandon_stream();
                self.store.set_connection_status(ConnectionStatus::Disconnected);
            }
        }
    }

    /// 断线时丢弃进行中的回答
    ///
    /// 新连接不会续传旧连接上的回答。
    fn abandon_stream(&self) {
        if !self.store.streaming().active {
            return;
        }
        tracing::warn!("回答进行中连接断开，丢弃未完成的回答: {}", self.session_id);
        self.store.add_error_message(CONNECTION_LOST);
    }

    /// 处理一帧入站消息
    pub fn handle_envelope(&self, envelope: &Envelope) {
        match ChatEvent::decode(envelope) {
            Ok(event) => self.apply(event),
            Err(e) => tracing::warn!("无法解析 {} 消息，忽略: {}", envelope.kind, e),
        }
    }

    /// 把入站事件应用到 Store
    pub fn apply(&self, event: ChatEvent) {
        match event {
            ChatEvent::Connected(_) => {
                tracing::debug!("服务端确认连接: {}", self.session_id);
                self.start_keepalive();
            }
            ChatEvent::Status(text) => self.store.set_status_message(text),
            ChatEvent::Context(payload) => self.store.set_current_sources(payload.sources),
            ChatEvent::Content(fragment) => self.store.append_streaming_content(&fragment),
            ChatEvent::Complete(payload) => {
                self.store.finalize_streaming_message(payload);
            }
            ChatEvent::Error(payload) => {
                tracing::warn!("生成失败: {} ({})", payload.message, self.session_id);
                self.store.add_error_message(&payload.message);
            }
            ChatEvent::Pong => {}
            ChatEvent::Unknown(kind) => {
                tracing::debug!("忽略未知消息类型: {}", kind);
            }
        }
    }

    // ==================== 出站 ====================

    /// 发送用户消息；未连接时记录警告并返回 false
    pub fn send_message(&self, content: &str) -> bool {
        self.manager.send(
            &self.path,
            ChatCommand::Message {
                content: content.to_string(),
            },
        )
    }

    pub fn send_typing(&self, is_typing: bool) -> bool {
        self.manager.send(&self.path, ChatCommand::Typing { is_typing })
    }

    pub fn ping(&self) -> bool {
        self.manager.send(&self.path, ChatCommand::Ping)
    }

    // ==================== 心跳 ====================

    fn start_keepalive(&self) {
        let this = self.this.clone();
        let period = self.options.keepalive_interval;
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(channel) = this.upgrade() else { break };
                if !channel.is_connected() {
                    tracing::debug!("连接已关闭，停止心跳: {}", channel.session_id);
                    break;
                }
                channel.ping();
            }
        });

        if let Some(previous) = self.keepalive_task.lock().replace(task) {
            previous.abort();
        }
    }

    fn stop_keepalive(&self) {
        if let Some(task) = self.keepalive_task.lock().take() {
            task.abort();
        }
    }

    /// 关闭通道：停止心跳和重试，正常断开连接
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.retry_task.lock().take() {
            task.abort();
        }
        self.stop_keepalive();
        if self.manager.disconnect(&self.path) {
            tracing::info!("会话通道已关闭: {}", self.session_id);
        }
        self.store.set_connection_status(ConnectionStatus::Disconnected);
    }
}

impl Drop for ChatChannel {
    fn drop(&mut self) {
        if let Some(task) = self.keepalive_task.get_mut().take() {
            task.abort();
        }
        if let Some(task) = self.retry_task.get_mut().take() {
            task.abort();
        }
    }
}
