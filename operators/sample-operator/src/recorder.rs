//! 事件记录模块
//!
//! 把协调结果记录为 Foo 上的 Kubernetes Event。记录失败只写日志，不影响协调结果。

use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use tracing::warn;

use crate::crd::Foo;

/// 同步成功时的事件原因
pub const REASON_SYNCED: &str = "Synced";

/// 同名资源已存在且不归 Foo 管理时的事件原因
pub const REASON_ERR_RESOURCE_EXISTS: &str = "ErrResourceExists";

/// 同步成功时的事件消息
pub const MESSAGE_RESOURCE_SYNCED: &str = "Foo synced successfully";

/// 事件记录接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// 在 Foo 上记录一条事件
    async fn record(&self, foo: &Foo, event_type: EventType, reason: &str, note: &str);
}

/// 基于 kube-runtime Recorder 的实现
#[derive(Clone)]
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl KubeEventRecorder {
    /// 创建新的事件记录器
    pub fn new(client: Client, controller_name: impl Into<String>) -> Self {
        let reporter = Reporter {
            controller: controller_name.into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, foo: &Foo, event_type: EventType, reason: &str, note: &str) {
        let event = Event {
            type_: event_type,
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };

        if let Err(e) = self.recorder.publish(&event, &foo.object_ref(&())).await {
            warn!(
                "记录 Foo {}/{} 事件 {} 失败: {}",
                foo.namespace().unwrap_or_default(),
                foo.name_any(),
                reason,
                e
            );
        }
    }
}
