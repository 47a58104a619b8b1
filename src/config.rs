//! 客户端配置

use std::path::PathBuf;
use std::time::Duration;

use crate::reconnect::ReconnectPolicy;
use crate::{Error, Result};

/// 默认后端地址
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8000";

/// 默认 API 前缀
pub const DEFAULT_API_PREFIX: &str = "/api/v1";

/// 客户端配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// 后端根地址（http/https，WebSocket 地址由此推导）
    pub server_url: String,
    /// HTTP API 前缀
    pub api_prefix: String,
    /// 本地持久化目录（默认 ~/.rag-chat）
    pub data_dir: PathBuf,
    /// 重连策略（传输层和会话层共用）
    pub reconnect: ReconnectPolicy,
    /// 心跳间隔
    pub keepalive_interval: Duration,
    /// HTTP 请求超时
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".rag-chat");

        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            data_dir,
            reconnect: ReconnectPolicy::default(),
            keepalive_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    /// 指定后端地址，其他使用默认值
    pub fn new(server_url: &str) -> Self {
        Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }

    /// 从环境变量创建配置
    ///
    /// - `RAG_CHAT_SERVER_URL`: 后端地址
    /// - `RAG_CHAT_DATA_DIR`: 本地持久化目录
    pub fn from_env() -> Self {
        let mut config = match std::env::var("RAG_CHAT_SERVER_URL") {
            Ok(url) if !url.trim().is_empty() => Self::new(url.trim()),
            _ => Self::default(),
        };

        if let Ok(dir) = std::env::var("RAG_CHAT_DATA_DIR") {
            if !dir.trim().is_empty() {
                config.data_dir = PathBuf::from(dir);
            }
        }

        config
    }

    /// 设置本地持久化目录
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// 设置重连策略
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// 设置心跳间隔
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// 检查地址和前缀格式
    pub fn validate(&self) -> Result<()> {
        const SCHEMES: [&str; 4] = ["http://", "https://", "ws://", "wss://"];
        let host = SCHEMES
            .iter()
            .find_map(|scheme| self.server_url.strip_prefix(scheme));
        match host {
            Some(rest) if !rest.trim_matches('/').is_empty() => {}
            _ => {
                return Err(Error::Config(format!(
                    "server_url 必须是 http(s):// 或 ws(s):// 地址: {:?}",
                    self.server_url
                )))
            }
        }
        if !self.api_prefix.is_empty() && !self.api_prefix.starts_with('/') {
            return Err(Error::Config(format!(
                "api_prefix 必须以 / 开头: {:?}",
                self.api_prefix
            )));
        }
        Ok(())
    }

    /// HTTP API 根地址，例如 `http://localhost:8000/api/v1`
    pub fn api_base_url(&self) -> String {
        format!(
            "{}{}",
            self.server_url.trim_end_matches('/'),
            self.api_prefix.trim_end_matches('/')
        )
    }

    /// 拼接 API 路径
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url(), ensure_leading_slash(path))
    }

    /// WebSocket 根地址，例如 `ws://localhost:8000/ws`
    pub fn ws_base_url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            base.to_string()
        } else {
            format!("ws://{}", base)
        };
        format!("{}/ws", base)
    }

    /// 逻辑路径对应的 WebSocket 地址，例如 `/chat/abc` → `ws://host/ws/chat/abc`
    pub fn ws_url(&self, logical_path: &str) -> String {
        format!("{}{}", self.ws_base_url(), ensure_leading_slash(logical_path))
    }
}

fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}
