//! 事件处理模块
//!
//! 把缓存通知转换为 Foo 对象键并加入工作队列。处理器不包含业务逻辑，
//! 不阻塞，也不读取通知之外的状态：协调时会按键重新读取缓存。

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::ApiResource;
use kube::ResourceExt;
use sample_common::{ObjectKey, WorkQueue};
use tracing::{debug, trace, warn};

use crate::cache::ResourceEventHandler;
use crate::crd::Foo;

/// 把对象键加入队列
fn enqueue(queue: &WorkQueue<ObjectKey>, namespace: Option<String>, name: Option<String>) {
    match ObjectKey::from_meta(namespace.as_deref(), name.as_deref()) {
        Ok(key) => {
            trace!("加入队列: {}", key);
            queue.add(key);
        }
        Err(e) => warn!("无法生成对象键: {}", e),
    }
}

/// Foo 事件处理器
pub struct FooEventHandler {
    /// 工作队列
    queue: Arc<WorkQueue<ObjectKey>>,
}

impl FooEventHandler {
    /// 创建新的 Foo 事件处理器
    pub fn new(queue: Arc<WorkQueue<ObjectKey>>) -> Self {
        Self { queue }
    }

    fn enqueue_foo(&self, foo: &Foo) {
        enqueue(&self.queue, foo.namespace(), foo.metadata.name.clone());
    }
}

impl ResourceEventHandler<Foo> for FooEventHandler {
    fn on_add(&self, foo: &Foo) {
        self.enqueue_foo(foo);
    }

    fn on_update(&self, _old: &Foo, new: &Foo) {
        // 重新同步也入队，定期刷新 status
        self.enqueue_foo(new);
    }

    fn on_delete(&self, foo: &Foo) {
        // Deployment 由属主引用级联回收，这里无需处理
        debug!("Foo {}/{} 已删除", foo.namespace().unwrap_or_default(), foo.name_any());
    }
}

/// Deployment 事件处理器
///
/// 通过控制者属主引用反查所属 Foo，使控制器能感知 Deployment 被外部修改或删除。
pub struct DeploymentEventHandler {
    /// 工作队列
    queue: Arc<WorkQueue<ObjectKey>>,
    /// 属主资源类型
    owner: ApiResource,
}

impl DeploymentEventHandler {
    /// 创建新的 Deployment 事件处理器
    pub fn new(queue: Arc<WorkQueue<ObjectKey>>, owner: ApiResource) -> Self {
        Self { queue, owner }
    }

    /// 是否为本控制器管理的属主类型，版本不同也视为同一类型
    fn is_owner_kind(&self, reference: &OwnerReference) -> bool {
        let group = reference
            .api_version
            .rsplit_once('/')
            .map_or("", |(group, _)| group);
        reference.kind == self.owner.kind && group == self.owner.group
    }

    /// 若 Deployment 由 Foo 控制，将该 Foo 加入队列
    fn handle_object(&self, deployment: &Deployment) {
        let Some(owner) = deployment
            .owner_references()
            .iter()
            .find(|reference| reference.controller == Some(true))
        else {
            return;
        };

        if !self.is_owner_kind(owner) {
            trace!(
                "忽略由 {} 控制的 Deployment {}",
                owner.kind,
                deployment.name_any()
            );
            return;
        }

        debug!(
            "Deployment {}/{} 变化，属主 Foo {}",
            deployment.namespace().unwrap_or_default(),
            deployment.name_any(),
            owner.name
        );
        enqueue(&self.queue, deployment.namespace(), Some(owner.name.clone()));
    }
}

impl ResourceEventHandler<Deployment> for DeploymentEventHandler {
    fn on_add(&self, deployment: &Deployment) {
        self.handle_object(deployment);
    }

    fn on_update(&self, old: &Deployment, new: &Deployment) {
        // 周期性重新同步会带来资源版本相同的更新，忽略
        if old.resource_version().is_some() && old.resource_version() == new.resource_version() {
            return;
        }
        // 属主引用可能被改动，新旧属主都需要重新协调
        self.handle_object(old);
        self.handle_object(new);
    }

    fn on_delete(&self, deployment: &Deployment) {
        self.handle_object(deployment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::Scheme;
    use kube::api::ObjectMeta;
    use sample_common::ItemExponentialFailureRateLimiter;

    fn queue() -> Arc<WorkQueue<ObjectKey>> {
        WorkQueue::new(ItemExponentialFailureRateLimiter::default())
    }

    fn deployment_handler(queue: &Arc<WorkQueue<ObjectKey>>) -> DeploymentEventHandler {
        let owner = Scheme::new().api_resource_for::<Foo>().unwrap().clone();
        DeploymentEventHandler::new(queue.clone(), owner)
    }

    fn owner_ref(api_version: &str, kind: &str, name: &str, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("uid-{name}"),
            controller: Some(controller),
            block_owner_deletion: Some(true),
        }
    }

    fn deployment(resource_version: &str, owners: Vec<OwnerReference>) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("example-foo".to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some(resource_version.to_string()),
                owner_references: Some(owners),
                ..ObjectMeta::default()
            },
            ..Deployment::default()
        }
    }

    async fn drain(queue: &WorkQueue<ObjectKey>) -> Vec<String> {
        let mut keys = Vec::new();
        while !queue.is_empty() {
            if let Some(key) = queue.get().await {
                queue.done(&key);
                keys.push(key.to_string());
            }
        }
        keys
    }

    #[tokio::test]
    async fn test_foo_add_and_update_enqueue_own_key() {
        let queue = queue();
        let handler = FooEventHandler::new(queue.clone());
        let foo = Foo {
            metadata: ObjectMeta {
                name: Some("example-foo".to_string()),
                namespace: Some("default".to_string()),
                ..ObjectMeta::default()
            },
            spec: Default::default(),
            status: None,
        };

        handler.on_add(&foo);
        handler.on_update(&foo, &foo);
        assert_eq!(drain(&queue).await, vec!["default/example-foo"]);

        handler.on_delete(&foo);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_owned_deployment_enqueues_owner() {
        let queue = queue();
        let handler = deployment_handler(&queue);
        let owned = deployment(
            "1",
            vec![owner_ref("samplecontroller.k8s.io/v1alpha1", "Foo", "example-foo", true)],
        );

        handler.on_add(&owned);
        assert_eq!(drain(&queue).await, vec!["default/example-foo"]);

        handler.on_delete(&owned);
        assert_eq!(drain(&queue).await, vec!["default/example-foo"]);
    }

    #[tokio::test]
    async fn test_foreign_deployments_are_ignored() {
        let queue = queue();
        let handler = deployment_handler(&queue);

        handler.on_add(&deployment("1", vec![]));
        handler.on_add(&deployment(
            "1",
            vec![owner_ref("apps/v1", "ReplicaSet", "rs", true)],
        ));
        handler.on_add(&deployment(
            "1",
            vec![owner_ref("other.example.com/v1", "Foo", "example-foo", true)],
        ));
        // 非控制者属主不触发
        handler.on_add(&deployment(
            "1",
            vec![owner_ref("samplecontroller.k8s.io/v1alpha1", "Foo", "example-foo", false)],
        ));

        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_resync_update_is_ignored() {
        let queue = queue();
        let handler = deployment_handler(&queue);
        let owners = vec![owner_ref("samplecontroller.k8s.io/v1alpha1", "Foo", "example-foo", true)];

        handler.on_update(&deployment("7", owners.clone()), &deployment("7", owners.clone()));
        assert!(queue.is_empty());

        handler.on_update(&deployment("7", owners.clone()), &deployment("8", owners));
        assert_eq!(drain(&queue).await, vec!["default/example-foo"]);
    }

    #[tokio::test]
    async fn test_owner_change_enqueues_both_owners() {
        let queue = queue();
        let handler = deployment_handler(&queue);
        let old = deployment(
            "1",
            vec![owner_ref("samplecontroller.k8s.io/v1alpha1", "Foo", "first", true)],
        );
        let new = deployment(
            "2",
            vec![owner_ref("samplecontroller.k8s.io/v1beta1", "Foo", "second", true)],
        );

        handler.on_update(&old, &new);
        assert_eq!(drain(&queue).await, vec!["default/first", "default/second"]);
    }
}
