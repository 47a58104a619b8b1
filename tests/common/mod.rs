//! 集成测试共用工具

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use rag_chat_client::store::{ChatBackend, ConversationStore, StoreEvent, Subscription};
use rag_chat_client::storage::LocalStore;
use rag_chat_client::types::{Message, Session, SessionSettings, SessionUpdate};
use rag_chat_client::{Error, Result};

/// 内存后端
#[derive(Default)]
pub struct MemoryBackend {
    sessions: Mutex<Vec<Session>>,
    messages: Mutex<HashMap<String, Vec<Message>>>,
    next_id: AtomicU64,
    offline: AtomicBool,
    pub created: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 预置一个会话，`updated_hour` 决定更新时间
    pub fn seed(&self, id: &str, updated_hour: u32) -> Session {
        let mut session = Session::from_settings(id, &SessionSettings::default());
        session.title = format!("Session {}", id);
        session.updated_at = Some(Utc.with_ymd_and_hms(2024, 5, 1, updated_hour, 0, 0).unwrap());
        self.sessions.lock().push(session.clone());
        session
    }

    pub fn seed_message(&self, message: Message) {
        self.messages
            .lock()
            .entry(message.session_id.clone())
            .or_default()
            .push(message);
    }

    /// 模拟后端不可达
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().iter().map(|s| s.id.clone()).collect()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Connection("backend unreachable".to_string()));
        }
        Ok(())
    }

    fn not_found(id: &str) -> Error {
        Error::Api {
            status: 404,
            message: format!("Session {} not found", id),
        }
    }
}

#[async_trait]
impl ChatBackend for MemoryBackend {
    async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.check_online()?;
        let mut sessions = self.sessions.lock().clone();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn get_session(&self, session_id: &str) -> Result<Session> {
        self.check_online()?;
        self.sessions
            .lock()
            .iter()
            .find(|s| s.id == session_id)
            .cloned()
            .ok_or_else(|| Self::not_found(session_id))
    }

    async fn create_session(&self, settings: &SessionSettings) -> Result<Session> {
        self.check_online()?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Session::from_settings(format!("new-{}", n), settings);
        self.sessions.lock().push(session.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(session)
    }

    async fn update_session(&self, session_id: &str, update: &SessionUpdate) -> Result<Session> {
        self.check_online()?;
        let mut sessions = self.sessions.lock();
        let session = sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or_else(|| Self::not_found(session_id))?;
        session.apply(update);
        Ok(session.clone())
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.check_online()?;
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|s| s.id != session_id);
        if sessions.len() == before {
            return Err(Self::not_found(session_id));
        }
        self.messages.lock().remove(session_id);
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        self.check_online()?;
        Ok(self
            .messages
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}

pub fn store_with(backend: Arc<MemoryBackend>, dir: &std::path::Path) -> ConversationStore {
    ConversationStore::new(backend, LocalStore::new(dir))
}

/// 取出当前已排队的所有事件
pub fn drain(subscription: &mut Subscription) -> Vec<StoreEvent> {
    let mut events = Vec::new();
    while let Some(event) = subscription.try_recv() {
        events.push(event);
    }
    events
}

/// 轮询直到条件成立或超时
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[cfg(feature = "ws")]
pub mod server {
    //! 本地 WebSocket 测试服务端

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use futures_util::{SinkExt, StreamExt};
    use parking_lot::Mutex;
    use rag_chat_client::Envelope;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::WebSocketStream;

    pub type ServerSocket = WebSocketStream<TcpStream>;

    /// 被接受的连接（附带请求路径）
    pub struct Accepted {
        pub path: String,
        pub socket: ServerSocket,
    }

    /// 启动服务端，返回 `ws://127.0.0.1:port/ws` 和连接接收端
    pub async fn start() -> (String, mpsc::UnboundedReceiver<Accepted>) {
        let (base, accepted, _task) = start_abortable().await;
        (base, accepted)
    }

    /// 同 [`start`]，另外返回监听任务；abort 后端口关闭，后续握手全部失败
    pub async fn start_abortable(
    ) -> (String, mpsc::UnboundedReceiver<Accepted>, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        serve(listener)
    }

    /// 在指定地址（`ws://host:port/ws`）上启动服务端
    pub async fn start_at(base: &str) -> mpsc::UnboundedReceiver<Accepted> {
        let addr = base.trim_start_matches("ws://").trim_end_matches("/ws");
        let listener = TcpListener::bind(addr).await.unwrap();
        let (_, accepted, _task) = serve(listener);
        accepted
    }

    fn serve(listener: TcpListener) -> (String, mpsc::UnboundedReceiver<Accepted>, JoinHandle<()>) {
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let path = Arc::new(Mutex::new(String::new()));
                    let captured = path.clone();
                    let callback =
                        move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                            *captured.lock() = req.uri().path().to_string();
                            Ok(resp)
                        };
                    if let Ok(socket) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                    {
                        let path = path.lock().clone();
                        let _ = tx.send(Accepted { path, socket });
                    }
                });
            }
        });

        (format!("ws://{}/ws", addr), rx, task)
    }

    /// 接受 TCP 连接后立即断开，握手全部失败；返回地址和连接计数
    pub async fn refusing() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });

        (format!("ws://{}/ws", addr), count)
    }

    /// 启动一个直接拒绝握手的地址（端口已关闭）
    pub async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{}/ws", addr)
    }

    pub async fn send(socket: &mut ServerSocket, kind: &str, data: serde_json::Value) {
        let text = Envelope::new(kind, data).to_json().unwrap();
        socket.send(WsMessage::Text(text.into())).await.unwrap();
    }

    pub async fn send_raw(socket: &mut ServerSocket, text: &str) {
        socket.send(WsMessage::Text(text.to_string().into())).await.unwrap();
    }

    /// 读下一帧文本并解析；连接结束返回 None
    pub async fn recv(socket: &mut ServerSocket) -> Option<Envelope> {
        while let Some(frame) = socket.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => return Envelope::parse(&text).ok(),
                Ok(WsMessage::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
        None
    }

    /// 读到关闭帧，返回关闭码
    pub async fn recv_close(socket: &mut ServerSocket) -> Option<u16> {
        while let Some(frame) = socket.next().await {
            match frame {
                Ok(WsMessage::Close(frame)) => return frame.map(|f| u16::from(f.code)),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    }

    /// 以指定关闭码关闭
    pub async fn close_with(socket: &mut ServerSocket, code: u16) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        let _ = socket.close(Some(frame)).await;
    }
}

#[cfg(feature = "http")]
pub mod http {
    //! 本地 HTTP 应答器：按 `(method, path)` 返回预设的 JSON

    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// 收到的请求
    #[derive(Debug, Clone)]
    pub struct Recorded {
        pub method: String,
        pub path: String,
        pub body: String,
    }

    /// 预设路由
    pub struct Route {
        pub method: &'static str,
        pub path: &'static str,
        pub status: u16,
        pub body: String,
    }

    pub fn route(method: &'static str, path: &'static str, status: u16, body: &str) -> Route {
        Route {
            method,
            path,
            status,
            body: body.to_string(),
        }
    }

    /// 启动应答器，返回 `http://127.0.0.1:port` 和请求记录
    pub async fn respond(routes: Vec<Route>) -> (String, Arc<Mutex<Vec<Recorded>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes = Arc::new(routes);
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let log = recorded.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let routes = routes.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    let _ = handle(stream, &routes, &log).await;
                });
            }
        });

        (format!("http://{}", addr), recorded)
    }

    async fn handle(
        mut stream: TcpStream,
        routes: &[Route],
        log: &Mutex<Vec<Recorded>>,
    ) -> std::io::Result<()> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let mut lines = head.lines();
        let mut request_line = lines.next().unwrap_or_default().split_whitespace();
        let method = request_line.next().unwrap_or_default().to_string();
        let path = request_line.next().unwrap_or_default().to_string();
        let content_length = lines
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);

        while buf.len() < header_end + content_length {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let body = String::from_utf8_lossy(&buf[header_end..]).to_string();

        let (status, payload) = routes
            .iter()
            .find(|r| r.method == method && r.path == path)
            .map(|r| (r.status, r.body.clone()))
            .unwrap_or((404, r#"{"detail": "Not Found"}"#.to_string()));
        log.lock().push(Recorded { method, path, body });

        let response = format!(
            "HTTP/1.1 {} X\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{}",
            status,
            payload.len(),
            payload
        );
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await
    }
}
