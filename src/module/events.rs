//! 运行时事件与错误通道
//!
//! 状态转换产生 [`FrameworkEvent`]，经由操作执行器按发生顺序投递给 [`EventSink`]。
//! 回调失败和归档读取失败等非致命错误报告给 [`ErrorSink`]。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::utils::{fields, CoreError};

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Installed,
    Resolved,
    Starting,
    Started,
    Stopping,
    Stopped,
    Updated,
    Unresolved,
    Uninstalled,
    /// 延迟激活的模块被首次类加载触发
    LazyActivation,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Installed => "installed",
            EventKind::Resolved => "resolved",
            EventKind::Starting => "starting",
            EventKind::Started => "started",
            EventKind::Stopping => "stopping",
            EventKind::Stopped => "stopped",
            EventKind::Updated => "updated",
            EventKind::Unresolved => "unresolved",
            EventKind::Uninstalled => "uninstalled",
            EventKind::LazyActivation => "lazy_activation",
        };
        f.write_str(name)
    }
}

/// 模块状态转换事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkEvent {
    /// 事件唯一标识
    pub event_id: String,

    /// 全局递增序号，反映转换发生的顺序
    pub sequence: u64,

    pub kind: EventKind,

    pub module_id: u64,

    pub timestamp: DateTime<Utc>,
}

impl FrameworkEvent {
    pub fn new(sequence: u64, kind: EventKind, module_id: u64) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            sequence,
            kind,
            module_id,
            timestamp: Utc::now(),
        }
    }
}

/// 事件接收端
///
/// 同步接收端在触发操作的调用方观察到成功之前完成。
pub trait EventSink: Send + Sync {
    fn notify(&self, event: &FrameworkEvent);
}

/// 非致命错误通道
pub trait ErrorSink: Send + Sync {
    fn report(&self, module_id: u64, error: &CoreError);
}

/// 以 `debug!` 记录事件的默认接收端
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn notify(&self, event: &FrameworkEvent) {
        debug!(
            { fields::MODULE_ID } = event.module_id,
            { fields::KIND } = %event.kind,
            sequence = event.sequence,
            "模块事件"
        );
    }
}

/// 以 `error!` 记录错误并计数的默认错误通道
#[derive(Debug, Default)]
pub struct TracingErrorSink {
    reported: AtomicU64,
}

impl TracingErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已报告的错误数
    pub fn reported(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }
}

impl ErrorSink for TracingErrorSink {
    fn report(&self, module_id: u64, error: &CoreError) {
        self.reported.fetch_add(1, Ordering::Relaxed);
        error!(
            { fields::MODULE_ID } = module_id,
            { fields::ERROR_CODE } = error.error_code(),
            error = %error,
            "模块错误"
        );
    }
}

/// 广播事件接收端
///
/// 通过 `tokio::sync::broadcast` 将事件分发给异步订阅者。没有订阅者时事件被丢弃。
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<FrameworkEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> broadcast::Receiver<FrameworkEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastEventSink {
    fn notify(&self, event: &FrameworkEvent) {
        // 没有订阅者时发送失败，属正常情况
        let _ = self.sender.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = FrameworkEvent::new(3, EventKind::Started, 7);
        assert_eq!(event.sequence, 3);
        assert_eq!(event.module_id, 7);
        assert_eq!(event.event_id.len(), 36);
        assert_eq!(event.kind.to_string(), "started");
    }

    #[test]
    fn test_tracing_error_sink_counts() {
        let sink = TracingErrorSink::new();
        sink.report(1, &CoreError::ModuleNotFound(1));
        sink.report(2, &CoreError::illegal_state(2, "x"));
        assert_eq!(sink.reported(), 2);
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers_in_order() {
        let sink = BroadcastEventSink::new(16);
        let mut rx = sink.subscribe();
        assert_eq!(sink.subscriber_count(), 1);

        sink.notify(&FrameworkEvent::new(1, EventKind::Installed, 1));
        sink.notify(&FrameworkEvent::new(2, EventKind::Resolved, 1));

        assert_eq!(rx.recv().await.unwrap().kind, EventKind::Installed);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::Resolved);
    }

    #[test]
    fn test_broadcast_without_subscribers() {
        let sink = BroadcastEventSink::default();
        sink.notify(&FrameworkEvent::new(1, EventKind::Installed, 1));
    }
}
