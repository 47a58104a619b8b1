//! 错误类型定义

use thiserror::Error;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 连接错误（握手失败、地址无效等）
    #[error("连接错误: {0}")]
    Connection(String),

    /// HTTP 传输错误
    #[cfg(feature = "http")]
    #[error("HTTP 错误: {0}")]
    Http(#[from] reqwest::Error),

    /// 后端返回非 2xx
    #[error("API 错误 ({status}): {message}")]
    Api { status: u16, message: String },

    /// 协议错误（帧格式不符）
    #[error("协议错误: {0}")]
    Protocol(String),

    /// 需要当前会话但没有
    #[error("没有当前会话")]
    NoCurrentSession,

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// 是否为 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Api { status: 404, .. })
    }
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
