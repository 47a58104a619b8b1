//! ChatApp / ChatChannel 端到端测试

mod common;

#[cfg(feature = "ws")]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use rag_chat_client::chat::CONNECTION_LOST;
    use rag_chat_client::store::{NotificationLevel, StoreEvent, StoreEventKind};
    use rag_chat_client::types::{ConnectionStatus, Role};
    use rag_chat_client::{ChatApp, ChatEvent, ClientConfig, ReconnectPolicy};
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::time::timeout;

    use super::common::server::{self, recv, recv_close, send, Accepted};
    use super::common::{drain, wait_until, MemoryBackend};

    const WAIT: Duration = Duration::from_secs(5);

    /// `ws://127.0.0.1:port/ws` → `http://127.0.0.1:port`
    fn config_for(ws_base: &str, dir: &TempDir) -> ClientConfig {
        let http = ws_base.replacen("ws://", "http://", 1);
        ClientConfig::new(http.trim_end_matches("/ws"))
            .with_data_dir(dir.path())
            .with_reconnect(ReconnectPolicy::new(
                2,
                Duration::from_millis(20),
                Duration::from_millis(50),
            ))
    }

    async fn open_app(
        sessions: &[&str],
        keepalive: Duration,
    ) -> (ChatApp, Arc<MemoryBackend>, tokio::sync::mpsc::UnboundedReceiver<Accepted>, TempDir) {
        let dir = TempDir::new().unwrap();
        let (base, accepted) = server::start().await;
        let backend = MemoryBackend::new();
        for (hour, id) in sessions.iter().enumerate() {
            backend.seed(id, hour as u32);
        }
        let config = config_for(&base, &dir).with_keepalive(keepalive);
        let app = ChatApp::new(config, backend.clone());
        (app, backend, accepted, dir)
    }

    fn assistant_messages(app: &ChatApp) -> Vec<rag_chat_client::Message> {
        app.store()
            .messages()
            .into_iter()
            .filter(|m| m.role == Role::Assistant)
            .collect()
    }

    #[tokio::test]
    async fn test_streamed_answer_becomes_single_message() {
        let (app, _backend, mut accepted, _dir) = open_app(&["S1"], Duration::from_secs(30)).await;

        app.open_session(Some("S1")).await.unwrap();
        let mut peer = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
        assert_eq!(peer.path, "/ws/chat/S1");
        assert_eq!(app.store().connection_status(), ConnectionStatus::Connected);

        send(&mut peer.socket, "connected", json!({"session_id": "S1"})).await;
        send(&mut peer.socket, "status", json!("searching")).await;
        send(&mut peer.socket, "content", json!("Hel")).await;
        send(&mut peer.socket, "content", json!("lo")).await;
        send(&mut peer.socket, "complete", json!({"response_time_ms": 120})).await;

        assert!(wait_until(WAIT, || assistant_messages(&app).len() == 1).await);
        let answer = &assistant_messages(&app)[0];
        assert_eq!(answer.content, "Hello");
        assert_eq!(answer.response_time_ms, Some(120));
        assert!(app.store().streaming().is_empty());
        assert_eq!(app.store().messages().len(), 1);
    }

    #[tokio::test]
    async fn test_send_reaches_server_and_blocks_while_streaming() {
        let (app, _backend, mut accepted, _dir) = open_app(&["S1"], Duration::from_secs(30)).await;
        app.open_session(Some("S1")).await.unwrap();
        let mut peer = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();

        assert!(app.can_send());
        assert!(app.send("what is qdrant?").unwrap());

        let frame = timeout(WAIT, recv(&mut peer.socket)).await.unwrap().unwrap();
        assert_eq!(frame.kind, "message");
        assert_eq!(frame.data, json!({"message": "what is qdrant?"}));

        let messages = app.store().messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert!(messages[0].is_optimistic());

        send(&mut peer.socket, "context", json!({
            "sources": [{"index": 1, "title": "Qdrant intro", "article_id": 7, "chunk_index": 0, "score": 0.82}],
            "context_found": true
        }))
        .await;
        send(&mut peer.socket, "content", json!("A vector")).await;
        assert!(wait_until(WAIT, || app.store().streaming().active).await);

        // 回答进行中不能再发
        assert!(!app.can_send());
        assert!(!app.send("another").unwrap());
        assert_eq!(app.store().messages().len(), 1);

        send(&mut peer.socket, "content", json!(" database.")).await;
        send(&mut peer.socket, "complete", json!({"response_time_ms": 950})).await;
        assert!(wait_until(WAIT, || assistant_messages(&app).len() == 1).await);

        let answer = &assistant_messages(&app)[0];
        assert_eq!(answer.content, "A vector database.");
        assert_eq!(answer.search_query.as_deref(), Some("what is qdrant?"));
        assert_eq!(answer.sources.as_ref().unwrap()[0].title, "Qdrant intro");
        assert!(app.can_send());
    }

    #[tokio::test]
    async fn test_error_frame_is_non_fatal() {
        let (app, _backend, mut accepted, _dir) = open_app(&["S1"], Duration::from_secs(30)).await;
        app.open_session(Some("S1")).await.unwrap();
        let mut peer = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
        let mut sub = app.store().subscribe(&[StoreEventKind::Notification]);

        send(&mut peer.socket, "content", json!("partial")).await;
        send(&mut peer.socket, "error", json!({"error": "model unavailable"})).await;

        assert!(wait_until(WAIT, || assistant_messages(&app).len() == 1).await);
        let error = &assistant_messages(&app)[0];
        assert!(error.is_error);
        assert!(error.content.contains("model unavailable"));
        assert!(app.store().streaming().is_empty());

        let events = drain(&mut sub);
        assert!(events.iter().any(|e| matches!(
            e,
            StoreEvent::Notification(n) if n.level == NotificationLevel::Error
        )));

        // 连接保持可用
        assert_eq!(app.store().connection_status(), ConnectionStatus::Connected);
        assert!(app.send("retry").unwrap());
        let frame = timeout(WAIT, recv(&mut peer.socket)).await.unwrap().unwrap();
        assert_eq!(frame.data["message"], "retry");
    }

    #[tokio::test]
    async fn test_switching_sessions_tears_down_old_channel() {
        let (app, _backend, mut accepted, _dir) =
            open_app(&["S1", "S2"], Duration::from_secs(30)).await;

        app.open_session(Some("S1")).await.unwrap();
        let mut first = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();

        app.open_session(Some("S2")).await.unwrap();
        let mut second = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
        assert_eq!(second.path, "/ws/chat/S2");

        let code = timeout(WAIT, recv_close(&mut first.socket)).await.unwrap();
        assert_eq!(code, Some(1000));

        assert_eq!(app.store().current_session_id().as_deref(), Some("S2"));
        assert_eq!(app.channel().unwrap().session_id(), "S2");
        assert_eq!(app.transport().paths(), vec!["/chat/S2".to_string()]);

        send(&mut second.socket, "content", json!("only S2")).await;
        assert!(wait_until(WAIT, || app.store().streaming().content == "only S2").await);
    }

    #[tokio::test]
    async fn test_delete_current_session_detaches() {
        let (app, _backend, mut accepted, _dir) =
            open_app(&["S1", "S2"], Duration::from_secs(30)).await;
        app.open_session(Some("S1")).await.unwrap();
        let mut peer = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();

        app.delete_session("S1").await.unwrap();

        assert_eq!(timeout(WAIT, recv_close(&mut peer.socket)).await.unwrap(), Some(1000));
        assert!(app.channel().is_none());
        assert!(app.store().current_session_id().is_none());
        assert_eq!(app.store().connection_status(), ConnectionStatus::Disconnected);
        assert!(!app.send("anyone?").unwrap());
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let base = server::closed_port().await;
        let backend = MemoryBackend::new();
        backend.seed("S1", 1);
        let config = config_for(&base, &dir).with_reconnect(ReconnectPolicy::new(
            2,
            Duration::from_millis(500),
            Duration::from_secs(1),
        ));
        let app = ChatApp::new(config, backend);

        // 连接失败不影响打开会话
        let session = app.open_session(None).await.unwrap();
        assert_eq!(session.id, "S1");
        assert_eq!(app.store().connection_status(), ConnectionStatus::Error);

        assert!(!app.can_send());
        assert!(!app.send("hello?").unwrap());
        assert!(app.store().messages().is_empty());
        assert!(!app.set_typing(true));
        app.close();
    }

    #[tokio::test]
    async fn test_keepalive_pings_while_connected() {
        let (app, _backend, mut accepted, _dir) =
            open_app(&["S1"], Duration::from_millis(50)).await;
        app.open_session(Some("S1")).await.unwrap();
        let mut peer = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();

        let frame = timeout(WAIT, recv(&mut peer.socket)).await.unwrap().unwrap();
        assert_eq!(frame.kind, "ping");
        send(&mut peer.socket, "pong", json!({})).await;

        assert!(app.set_typing(true));
        app.close();
        assert_eq!(app.store().connection_status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_unknown_and_pong_events_leave_state_alone() {
        let (app, _backend, mut accepted, _dir) = open_app(&["S1"], Duration::from_secs(30)).await;
        app.open_session(Some("S1")).await.unwrap();
        let _peer = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
        let channel = app.channel().unwrap();

        channel.apply(ChatEvent::Unknown("stats".into()));
        channel.apply(ChatEvent::Pong);

        assert!(app.store().messages().is_empty());
        assert!(app.store().streaming().is_empty());
        assert_eq!(app.store().connection_status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_connection_lost_mid_answer_keeps_session_usable() {
        let (app, _backend, mut accepted, _dir) = open_app(&["S1"], Duration::from_secs(30)).await;
        app.open_session(Some("S1")).await.unwrap();
        let mut first = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();

        assert!(app.send("q").unwrap());
        timeout(WAIT, recv(&mut first.socket)).await.unwrap().unwrap();
        send(&mut first.socket, "content", json!("partial")).await;
        assert!(wait_until(WAIT, || app.store().streaming().active).await);

        // 回答中途断线，旧连接上的 complete 永远不会到达
        drop(first);

        let mut second = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
        assert_eq!(second.path, "/ws/chat/S1");
        assert!(wait_until(WAIT, || app.can_send()).await);
        assert!(app.store().streaming().is_empty());

        let lost = assistant_messages(&app).pop().unwrap();
        assert!(lost.is_error);
        assert!(lost.content.contains(CONNECTION_LOST));

        assert!(app.send("again").unwrap());
        let frame = timeout(WAIT, recv(&mut second.socket)).await.unwrap().unwrap();
        assert_eq!(frame.data["message"], "again");
    }

    #[tokio::test]
    async fn test_channel_retries_until_server_is_up() {
        let dir = TempDir::new().unwrap();
        let base = server::closed_port().await;
        let backend = MemoryBackend::new();
        backend.seed("S1", 1);
        let config = config_for(&base, &dir).with_reconnect(ReconnectPolicy::new(
            5,
            Duration::from_millis(100),
            Duration::from_millis(200),
        ));
        let app = ChatApp::new(config, backend);

        app.open_session(Some("S1")).await.unwrap();
        assert_eq!(app.store().connection_status(), ConnectionStatus::Error);

        let mut accepted = server::start_at(&base).await;
        let peer = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
        assert_eq!(peer.path, "/ws/chat/S1");

        assert!(
            wait_until(WAIT, || app.store().connection_status() == ConnectionStatus::Connected)
                .await
        );
        assert!(app.can_send());
    }

    #[tokio::test]
    async fn test_channel_retry_stops_after_max_attempts() {
        let dir = TempDir::new().unwrap();
        let (base, handshakes) = server::refusing().await;
        let backend = MemoryBackend::new();
        backend.seed("S1", 1);
        // 2 次重试：20ms, 40ms
        let app = ChatApp::new(config_for(&base, &dir), backend);

        app.open_session(Some("S1")).await.unwrap();

        // 首次握手 + 2 次重试
        assert!(wait_until(WAIT, || handshakes.load(Ordering::SeqCst) == 3).await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handshakes.load(Ordering::SeqCst), 3);

        assert_eq!(app.store().connection_status(), ConnectionStatus::Error);
        assert!(!app.can_send());
    }
}
