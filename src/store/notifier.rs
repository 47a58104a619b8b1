//! Store 变更通知
//!
//! 每个订阅者一个有界 mpsc 通道，按事件类别过滤。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::{StoreEvent, StoreEventKind};

/// 订阅者 ID
pub type SubscriberId = u64;

/// 事件发送通道
pub type EventSender = mpsc::Sender<StoreEvent>;

struct Subscriber {
    sender: EventSender,
    kinds: HashSet<StoreEventKind>,
}

/// 变更通知器
pub struct Notifier {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// 注册订阅者，返回订阅者 ID
    pub fn register(&self, sender: EventSender, kinds: &[StoreEventKind]) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kinds: HashSet<StoreEventKind> = kinds.iter().copied().collect();
        tracing::debug!("📡 订阅者加入: id={}, kinds={:?}", id, kinds);
        self.subscribers.write().insert(id, Subscriber { sender, kinds });
        id
    }

    pub fn unregister(&self, id: SubscriberId) {
        if self.subscribers.write().remove(&id).is_some() {
            tracing::debug!("📡 订阅者退出: id={}", id);
        }
    }

    /// 非阻塞推送；队列满的订阅者丢掉这条事件，接收端已释放的订阅者被移除
    pub fn broadcast(&self, event: StoreEvent) {
        let kind = event.kind();

        let targets: Vec<(SubscriberId, EventSender)> = self
            .subscribers
            .read()
            .iter()
            .filter(|(_, sub)| sub.kinds.contains(&kind))
            .map(|(id, sub)| (*id, sub.sender.clone()))
            .collect();

        let closed: Vec<SubscriberId> = targets
            .into_iter()
            .filter_map(|(id, sender)| match sender.try_send(event.clone()) {
                Ok(()) => None,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("📡 订阅者队列已满，丢弃事件: id={}, kind={:?}", id, kind);
                    None
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Some(id),
            })
            .collect();

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in closed {
                subscribers.remove(&id);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
