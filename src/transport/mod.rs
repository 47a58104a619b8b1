//! WebSocket 传输层
//!
//! 按逻辑路径（`/chat/{id}`、`/collections`、`/system`）管理多条连接，
//! 把入站帧分发给该路径上注册的处理器，异常断开时按 [`crate::ReconnectPolicy`] 重连。

mod manager;

pub use manager::{Connection, EventHandler, TransportEvent, TransportManager, CLOSE_NORMAL};
