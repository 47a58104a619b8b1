//! rag-chat - 终端聊天前端
//!
//! 用法: `rag-chat [session-id]`
//!
//! 命令：
//! - `/sessions`      列出会话
//! - `/new`           新建会话
//! - `/switch <id>`   切换会话
//! - `/delete <id>`   删除会话
//! - `/status`        连接状态
//! - `/search <q>`    检索知识库（记入本地检索历史）
//! - `/history`       最近的检索
//! - `/quit`          退出
//!
//! 其他输入作为消息发送。

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use rag_chat_client::store::{NotificationLevel, StoreEvent, StoreEventKind, Subscription};
use rag_chat_client::storage::{LocalStore, SearchFilters, SearchHistory, SearchHistoryEntry};
use rag_chat_client::types::{Role, SearchRequest, SessionSettings};
use rag_chat_client::{ApiClient, ChatApp, ClientConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 日志走 stderr，不和对话输出混在一起
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("rag_chat_client=warn".parse()?))
        .init();

    let config = ClientConfig::from_env();
    tracing::info!("🚀 rag-chat v{} -> {}", env!("CARGO_PKG_VERSION"), config.server_url);

    let api = Arc::new(ApiClient::new(&config)?);
    let history = SearchHistory::new(LocalStore::new(config.data_dir.clone()));
    let app = ChatApp::new(config, api.clone());

    let printer = tokio::spawn(print_events(app.store().subscribe(&StoreEventKind::ALL)));

    let requested = std::env::args().nth(1);
    match app.open_session(requested.as_deref()).await {
        Ok(session) => println!("📂 {} ({})", session.title, session.id),
        Err(e) => {
            eprintln!("❌ 无法打开会话: {}", e);
            return Err(e.into());
        }
    }
    print_history(&app);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if !line.starts_with('/') {
            match app.send(line) {
                Ok(true) => {}
                Ok(false) => println!("⚠️ 当前无法发送（未连接或上一条回答尚未完成）"),
                Err(e) => println!("❌ {}", e),
            }
            continue;
        }

        let mut parts = line.splitn(2, ' ');
        let command = parts.next().unwrap_or_default();
        let arg = parts.next().map(str::trim).filter(|s| !s.is_empty());

        let result = match (command, arg) {
            ("/quit", _) => break,
            ("/sessions", _) => {
                let current = app.store().current_session_id();
                match app.store().load_sessions().await {
                    Ok(sessions) => {
                        for s in sessions {
                            let marker = if current.as_deref() == Some(s.id.as_str()) {
                                "*"
                            } else {
                                " "
                            };
                            println!(
                                "{} {}  {}  ({} 条消息)",
                                marker, s.id, s.title, s.message_count
                            );
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            ("/new", _) => app.new_session(SessionSettings::default()).await.map(|s| {
                println!("🆕 {} ({})", s.title, s.id);
            }),
            ("/switch", Some(id)) => app.open_session(Some(id)).await.map(|s| {
                println!("📂 {} ({})", s.title, s.id);
                print_history(&app);
            }),
            ("/delete", Some(id)) => app.delete_session(id).await.map(|_| {
                println!("🗑️ 已删除 {}", id);
                if app.store().current_session_id().is_none() {
                    println!("当前没有会话，使用 /new 或 /switch <id>");
                }
            }),
            ("/status", _) => {
                let session = app.store().current_session_id().unwrap_or_else(|| "-".into());
                println!("🔌 {}  session={}", app.store().connection_status(), session);
                Ok(())
            }
            ("/search", Some(query)) => {
                let request = SearchRequest::new(query);
                match api.search(&request).await {
                    Ok(results) => {
                        for r in &results {
                            println!(
                                "  {:.3}  {}  (article {}, chunk {})",
                                r.score, r.title, r.article_id, r.chunk_index
                            );
                        }
                        let filters = SearchFilters::from(&request);
                        let entry = SearchHistoryEntry::new(query, filters, results.len());
                        if let Err(e) = history.record(entry) {
                            tracing::warn!("保存检索历史失败: {}", e);
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            ("/history", _) => {
                for entry in history.entries() {
                    println!("  {}  ({} 条结果)", entry.query, entry.result_count);
                }
                Ok(())
            }
            _ => {
                println!("未知命令: {}", line);
                Ok(())
            }
        };

        if let Err(e) = result {
            println!("❌ {}", e);
        }
    }

    app.close();
    printer.abort();
    tracing::info!("👋 rag-chat exiting");
    Ok(())
}

fn print_history(app: &ChatApp) {
    for message in app.store().messages() {
        let who = match message.role {
            Role::User => "you",
            Role::Assistant => "assistant",
        };
        println!("[{}] {}", who, message.content);
    }
}

async fn print_events(mut subscription: Subscription) {
    while let Some(event) = subscription.recv().await {
        match event {
            StoreEvent::StatusMessage(text) => println!("… {}", text),
            StoreEvent::ContentAppended(fragment) => {
                print!("{}", fragment);
                let _ = std::io::stdout().flush();
            }
            StoreEvent::MessageAdded(message) if message.role == Role::Assistant => {
                if message.is_error {
                    println!("\n❌ {}", message.content);
                    continue;
                }
                println!();
                for source in message.sources.iter().flatten() {
                    println!("  [{}] {} (score {:.2})", source.index, source.title, source.score);
                }
                if let Some(ms) = message.response_time_ms {
                    println!("  ⏱ {} ms", ms);
                }
            }
            StoreEvent::ConnectionChanged(status) => println!("🔌 {}", status),
            StoreEvent::Notification(n) if n.level == NotificationLevel::Error => {
                eprintln!("⚠️ {}", n.message);
            }
            _ => {}
        }
    }
}
