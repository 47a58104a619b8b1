//! 实时聊天
//!
//! - [`ChatChannel`]: 单个会话的协议适配器（入站事件 → Store，用户动作 → 出站帧）
//! - [`ChatApp`]: 应用根，持有 Store / 传输层 / 当前通道，串起"用户意图 → Store → 适配器 → 传输"

mod app;
mod channel;

pub use app::ChatApp;
pub use channel::{ChannelOptions, ChatChannel, CONNECTION_LOST};
