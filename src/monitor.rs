//! `/collections`、`/system` 与 `/indexing/{job_id}` 推送订阅
//!
//! 复用 [`TransportManager`]，把入站帧解码成强类型事件放进 mpsc 通道，
//! 由调用方在自己的 select! 循环里消费。未知类型丢弃。

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::protocol::{paths, CollectionEvent, Envelope, SystemEvent};
use crate::transport::{TransportEvent, TransportManager};
use crate::types::IndexingJob;
use crate::Result;

/// 推送通道容量
const FEED_CAPACITY: usize = 100;

/// 订阅集合变更推送
pub async fn watch_collections(
    manager: &TransportManager,
) -> Result<mpsc::Receiver<CollectionEvent>> {
    watch(manager, paths::COLLECTIONS, CollectionEvent::decode).await
}

/// 订阅系统状态推送
pub async fn watch_system(manager: &TransportManager) -> Result<mpsc::Receiver<SystemEvent>> {
    watch(manager, paths::SYSTEM, SystemEvent::decode).await
}

/// 订阅索引任务进度
///
/// 服务端推送的是任务快照，`data` 能解析成 [`IndexingJob`] 的帧才会转发。
pub async fn watch_indexing(
    manager: &TransportManager,
    job_id: &str,
) -> Result<mpsc::Receiver<IndexingJob>> {
    watch(manager, &paths::indexing(job_id), decode_job).await
}

fn decode_job(envelope: &Envelope) -> Option<IndexingJob> {
    serde_json::from_value(envelope.data.clone()).ok()
}

async fn watch<T, F>(
    manager: &TransportManager,
    path: &str,
    decode: F,
) -> Result<mpsc::Receiver<T>>
where
    T: Send + 'static,
    F: Fn(&Envelope) -> Option<T> + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel(FEED_CAPACITY);
    let label = path.to_string();

    let handler = Arc::new(move |event: TransportEvent| match event {
        TransportEvent::Frame(envelope) => match decode(&envelope) {
            Some(item) => {
                if let Err(e) = tx.try_send(item) {
                    tracing::warn!("推送队列已满或已关闭，丢弃 {}: {}", envelope.kind, e);
                }
            }
            None => tracing::debug!("忽略未知推送类型: path={}, type={}", label, envelope.kind),
        },
        TransportEvent::Abandoned => tracing::warn!("推送订阅已放弃重连: {}", label),
        _ => {}
    });

    manager.connect(path, handler).await?;
    tracing::info!("📡 已订阅推送: {}", path);
    Ok(rx)
}
