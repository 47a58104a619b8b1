//! 多路 WebSocket 连接管理
//!
//! 每条连接由一个任务独占 socket：读取入站帧并分发，执行出站命令，
//! 异常断开后按重连策略重试。分发时通过 路径 → 代次 查表取处理器，
//! 被替换或断开的连接查不到处理器，迟到的帧自然被丢弃。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::ClientConfig;
use crate::protocol::Envelope;
use crate::reconnect::{Backoff, ReconnectPolicy};
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 正常关闭
pub const CLOSE_NORMAL: u16 = 1000;
/// 对端关闭但没带状态码
const CLOSE_NO_STATUS: u16 = 1005;
/// 连接异常中断（无关闭帧）
const CLOSE_ABNORMAL: u16 = 1006;

/// 传输事件（分发给路径上的处理器）
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// 握手完成
    Opened { reconnected: bool },
    /// 入站帧（已通过 Envelope 校验）
    Frame(Envelope),
    /// 连接关闭；`normal` 为 false 时随后会尝试重连
    Closed { code: u16, normal: bool },
    /// 即将进行第 `attempt` 次重连
    Reconnecting { attempt: u32, delay: Duration },
    /// 重连次数用尽，放弃该路径
    Abandoned,
}

/// 事件处理器
pub type EventHandler = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// 连接任务的命令
enum Command {
    Send(String),
    Close,
}

/// 连接任务的退出原因
enum Closure {
    /// 本端主动关闭
    Local,
    /// 对端关闭或网络中断
    Remote(u16),
}

struct Entry {
    /// 代次：每次 connect 递增，用来识别过期的连接任务
    generation: u64,
    handlers: Vec<EventHandler>,
    commands: mpsc::UnboundedSender<Command>,
    open: Arc<AtomicBool>,
}

struct Inner {
    ws_base_url: String,
    policy: ReconnectPolicy,
    connections: RwLock<HashMap<String, Entry>>,
    next_generation: AtomicU64,
}

impl Inner {
    fn is_current(&self, path: &str, generation: u64) -> bool {
        self.connections
            .read()
            .get(path)
            .is_some_and(|e| e.generation == generation)
    }

    fn remove_if_current(&self, path: &str, generation: u64) {
        let mut connections = self.connections.write();
        if connections.get(path).is_some_and(|e| e.generation == generation) {
            connections.remove(path);
        }
    }

    /// 分发事件；处理器在锁外调用
    fn dispatch(&self, path: &str, generation: u64, event: TransportEvent) {
        let handlers = {
            let connections = self.connections.read();
            match connections.get(path) {
                Some(entry) if entry.generation == generation => entry.handlers.clone(),
                _ => {
                    tracing::trace!("丢弃过期连接的事件: path={}, event={:?}", path, event);
                    return;
                }
            }
        };

        for handler in handlers {
            handler(event.clone());
        }
    }
}

/// WebSocket 连接管理器
///
/// Clone 共享同一份连接表。
#[derive(Clone)]
pub struct TransportManager {
    inner: Arc<Inner>,
}

impl TransportManager {
    /// `ws_base_url` 形如 `ws://host:8000/ws`
    pub fn new(ws_base_url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                ws_base_url: ws_base_url.into().trim_end_matches('/').to_string(),
                policy,
                connections: RwLock::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.ws_base_url(), config.reconnect)
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.inner.policy
    }

    /// 逻辑路径对应的完整地址
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.inner.ws_base_url, path)
        } else {
            format!("{}/{}", self.inner.ws_base_url, path)
        }
    }

    /// 建立连接
    ///
    /// 同一路径已有连接时先正常关闭旧连接（连同其处理器和重连计数）。
    /// 握手失败返回错误，不会自动重试。
    pub async fn connect(&self, path: &str, handler: EventHandler) -> Result<Connection> {
        if self.disconnect(path) {
            tracing::debug!("替换已有连接: {}", path);
        }

        let url = self.url_for(path);
        tracing::debug!("连接 WebSocket: {}", url);

        let (ws, _) = connect_async(url.as_str()).await.map_err(|e| {
            tracing::warn!("WebSocket 握手失败: url={}, error={}", url, e);
            Error::Connection(format!("{}: {}", url, e))
        })?;

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let previous = self.inner.connections.write().insert(
            path.to_string(),
            Entry {
                generation,
                handlers: vec![handler],
                commands: tx,
                open: open.clone(),
            },
        );
        if let Some(previous) = previous {
            // 并发 connect 同一路径，后完成的胜出
            previous.open.store(false, Ordering::SeqCst);
            let _ = previous.commands.send(Command::Close);
        }

        tracing::info!("🔌 WebSocket 已连接: {}", path);
        self.inner
            .dispatch(path, generation, TransportEvent::Opened { reconnected: false });

        tokio::spawn(run_connection(
            self.inner.clone(),
            path.to_string(),
            generation,
            url,
            ws,
            rx,
            open,
        ));

        Ok(Connection {
            manager: self.clone(),
            path: path.to_string(),
            generation,
        })
    }

    /// 在已有连接上追加处理器
    pub fn add_handler(&self, path: &str, handler: EventHandler) -> bool {
        match self.inner.connections.write().get_mut(path) {
            Some(entry) => {
                entry.handlers.push(handler);
                true
            }
            None => false,
        }
    }

    /// 发送消息（fire-and-forget）
    ///
    /// 连接未打开时只记录警告并返回 false。
    pub fn send(&self, path: &str, message: impl Into<Envelope>) -> bool {
        let envelope = message.into();

        let commands = {
            let connections = self.inner.connections.read();
            match connections.get(path) {
                Some(entry) if entry.open.load(Ordering::SeqCst) => Some(entry.commands.clone()),
                _ => None,
            }
        };

        let Some(commands) = commands else {
            tracing::warn!(
                "WebSocket 未连接，丢弃消息: path={}, type={}",
                path,
                envelope.kind
            );
            return false;
        };

        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to serialize envelope: {}", e);
                return false;
            }
        };

        commands.send(Command::Send(text)).is_ok()
    }

    /// 正常关闭连接（不重连），处理器一并移除
    pub fn disconnect(&self, path: &str) -> bool {
        let entry = self.inner.connections.write().remove(path);
        match entry {
            Some(entry) => {
                entry.open.store(false, Ordering::SeqCst);
                let _ = entry.commands.send(Command::Close);
                tracing::info!("WebSocket 断开: {}", path);
                true
            }
            None => false,
        }
    }

    /// 关闭所有连接
    pub fn disconnect_all(&self) {
        let paths: Vec<String> = self.inner.connections.read().keys().cloned().collect();
        for path in paths {
            self.disconnect(&path);
        }
    }

    /// 路径当前是否可发送
    pub fn is_connected(&self, path: &str) -> bool {
        self.inner
            .connections
            .read()
            .get(path)
            .is_some_and(|e| e.open.load(Ordering::SeqCst))
    }

    /// 已登记的路径（含正在重连的）
    pub fn paths(&self) -> Vec<String> {
        self.inner.connections.read().keys().cloned().collect()
    }
}

/// 一次 connect 得到的连接句柄
///
/// 句柄绑定代次：路径被重新 connect 后旧句柄失效。
#[derive(Clone)]
pub struct Connection {
    manager: TransportManager,
    path: String,
    generation: u64,
}

impl Connection {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.manager.inner.is_current(&self.path, self.generation)
            && self.manager.is_connected(&self.path)
    }

    pub fn send(&self, message: impl Into<Envelope>) -> bool {
        if !self.manager.inner.is_current(&self.path, self.generation) {
            tracing::warn!("连接句柄已失效: {}", self.path);
            return false;
        }
        self.manager.send(&self.path, message)
    }

    pub fn close(&self) -> bool {
        if self.manager.inner.is_current(&self.path, self.generation) {
            self.manager.disconnect(&self.path)
        } else {
            false
        }
    }
}

/// 连接任务：收发 + 重连
async fn run_connection(
    inner: Arc<Inner>,
    path: String,
    generation: u64,
    url: String,
    ws: WsStream,
    mut commands: mpsc::UnboundedReceiver<Command>,
    open: Arc<AtomicBool>,
) {
    let mut backoff = Backoff::new(inner.policy);
    let mut ws = ws;

    loop {
        let closure = pump(&inner, &path, generation, ws, &mut commands).await;
        open.store(false, Ordering::SeqCst);

        let code = match closure {
            Closure::Local => {
                tracing::debug!("连接已主动关闭: {}", path);
                return;
            }
            Closure::Remote(code) => code,
        };

        if code == CLOSE_NORMAL {
            tracing::info!("WebSocket 正常关闭: {}", path);
            inner.dispatch(&path, generation, TransportEvent::Closed { code, normal: true });
            inner.remove_if_current(&path, generation);
            return;
        }

        tracing::warn!("WebSocket 异常断开: path={}, code={}", path, code);
        inner.dispatch(&path, generation, TransportEvent::Closed { code, normal: false });

        ws = match reconnect(&inner, &path, generation, &url, &mut backoff).await {
            Some(ws) => ws,
            None => return,
        };

        backoff.reset();
        open.store(true, Ordering::SeqCst);
        tracing::info!("🔌 WebSocket 重连成功: {}", path);
        inner.dispatch(&path, generation, TransportEvent::Opened { reconnected: true });
    }
}

/// 收发循环，直到连接关闭
async fn pump(
    inner: &Inner,
    path: &str,
    generation: u64,
    ws: WsStream,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> Closure {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match Envelope::parse(&text) {
                    Ok(envelope) => {
                        tracing::trace!("⬇️ {} {}", path, envelope.kind);
                        inner.dispatch(path, generation, TransportEvent::Frame(envelope));
                    }
                    Err(e) => {
                        tracing::warn!("丢弃无法解析的帧: path={}, error={}", path, e);
                    }
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code)).unwrap_or(CLOSE_NO_STATUS);
                    return Closure::Remote(code);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("WebSocket 读取失败: path={}, error={}", path, e);
                    return Closure::Remote(CLOSE_ABNORMAL);
                }
                None => return Closure::Remote(CLOSE_ABNORMAL),
            },
            command = commands.recv() => match command {
                Some(Command::Send(text)) => {
                    if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                        tracing::warn!("WebSocket 发送失败: path={}, error={}", path, e);
                        return Closure::Remote(CLOSE_ABNORMAL);
                    }
                }
                Some(Command::Close) | None => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client disconnect".into(),
                    };
                    let _ = sink.send(WsMessage::Close(Some(frame))).await;
                    let _ = sink.close().await;
                    return Closure::Local;
                }
            },
        }
    }
}

/// 按策略重连；放弃或连接已被替换时返回 None
async fn reconnect(
    inner: &Inner,
    path: &str,
    generation: u64,
    url: &str,
    backoff: &mut Backoff,
) -> Option<WsStream> {
    loop {
        let Some(delay) = backoff.next_delay() else {
            tracing::warn!(
                "重连次数已用尽，放弃: path={}, attempts={}",
                path,
                backoff.attempts()
            );
            inner.dispatch(path, generation, TransportEvent::Abandoned);
            inner.remove_if_current(path, generation);
            return None;
        };

        let attempt = backoff.attempts();
        tracing::debug!("{:?} 后重连 (attempt={}): {}", delay, attempt, path);
        inner.dispatch(path, generation, TransportEvent::Reconnecting { attempt, delay });
        tokio::time::sleep(delay).await;

        if !inner.is_current(path, generation) {
            tracing::debug!("连接已被替换或断开，停止重连: {}", path);
            return None;
        }

        match connect_async(url).await {
            Ok((mut ws, _)) => {
                if inner.is_current(path, generation) {
                    return Some(ws);
                }
                let _ = ws.close(None).await;
                return None;
            }
            Err(e) => {
                tracing::warn!("重连失败 (attempt={}): path={}, error={}", attempt, path, e);
            }
        }
    }
}
