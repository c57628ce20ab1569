//! 资源协调模块
//!
//! 对单个 Foo 执行一次收敛：读取缓存中的 Foo 与其 Deployment，必要时创建或更新
//! Deployment，再把观测到的可用副本数写回 Foo 的 status。
//!
//! 协调是电平触发的：只依据调用时缓存中的状态，不关心是哪个事件触发了它，
//! 因此重复执行是安全的，已经收敛时不会产生任何写操作。

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kube::runtime::events::EventType;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Resource, ResourceExt};
use sample_common::ObjectKey;
use thiserror::Error;
use tracing::{debug, info};

use crate::client::ClusterApi;
use crate::crd::{Foo, FooStatus, DEFAULT_REPLICAS};
use crate::recorder::{
    EventRecorder, MESSAGE_RESOURCE_SYNCED, REASON_ERR_RESOURCE_EXISTS, REASON_SYNCED,
};
use crate::scheme;

/// 协调错误
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// 键无法定位到命名空间内的 Foo
    #[error("无效的对象键: {0}")]
    InvalidKey(String),

    /// Foo 未指定 Deployment 名称
    #[error("{key}: 必须指定 Deployment 名称")]
    MissingDeploymentName { key: ObjectKey },

    /// 同名 Deployment 已存在但不由该 Foo 控制
    #[error("资源 {name:?} 已存在且不由 Foo {key} 管理")]
    ResourceExists { key: ObjectKey, name: String },

    /// Foo 缺少名称或 UID，无法构造属主引用
    #[error("{key}: 缺少名称或 UID，无法建立属主引用")]
    MissingOwnerMetadata { key: ObjectKey },

    /// API 调用失败
    #[error("Kubernetes API 错误: {0}")]
    Api(#[from] kube::Error),
}

impl ReconcileError {
    /// 是否为需要用户修改资源才能恢复的错误
    ///
    /// 永久错误同样按退避重试，只是以 error 级别记录。
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::Api(_))
    }
}

/// 协调器
pub struct Reconciler {
    /// Foo 缓存
    foos: Store<Foo>,
    /// Deployment 缓存
    deployments: Store<Deployment>,
    /// 集群写操作
    api: Arc<dyn ClusterApi>,
    /// 事件记录
    recorder: Arc<dyn EventRecorder>,
}

impl Reconciler {
    /// 创建新的协调器
    pub fn new(
        foos: Store<Foo>,
        deployments: Store<Deployment>,
        api: Arc<dyn ClusterApi>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            foos,
            deployments,
            api,
            recorder,
        }
    }

    /// 协调一个 Foo
    pub async fn sync_handler(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        if key.is_cluster_scoped() {
            return Err(ReconcileError::InvalidKey(key.to_string()));
        }

        let Some(foo) = self
            .foos
            .get(&ObjectRef::new(&key.name).within(&key.namespace))
        else {
            // 已被删除，Deployment 由垃圾回收清理
            debug!("{} '{}' 已不存在", scheme::resource("foos"), key);
            return Ok(());
        };

        let deployment_name = foo.spec.deployment_name.as_str();
        if deployment_name.is_empty() {
            return Err(ReconcileError::MissingDeploymentName { key: key.clone() });
        }

        let deployment = match self
            .deployments
            .get(&ObjectRef::new(deployment_name).within(&key.namespace))
        {
            Some(deployment) => deployment,
            None => {
                info!("为 Foo {} 创建 Deployment {}", key, deployment_name);
                let desired = new_deployment(&foo, key)?;
                Arc::new(self.api.create_deployment(&key.namespace, &desired).await?)
            }
        };

        if !is_controlled_by(&deployment, &foo) {
            let message = format!(
                "Resource {deployment_name:?} already exists and is not managed by Foo"
            );
            self.recorder
                .record(&foo, EventType::Warning, REASON_ERR_RESOURCE_EXISTS, &message)
                .await;
            return Err(ReconcileError::ResourceExists {
                key: key.clone(),
                name: deployment_name.to_string(),
            });
        }

        let deployment = match replicas_drift(&foo, &deployment) {
            Some(desired) => {
                info!(
                    "Foo {} 期望副本数 {}，更新 Deployment {}",
                    key, desired, deployment_name
                );
                let scaled = with_replicas(&deployment, desired);
                Arc::new(self.api.update_deployment(&key.namespace, &scaled).await?)
            }
            None => deployment,
        };

        self.update_foo_status(&foo, &deployment).await?;

        self.recorder
            .record(&foo, EventType::Normal, REASON_SYNCED, MESSAGE_RESOURCE_SYNCED)
            .await;
        Ok(())
    }

    /// 把 Deployment 的可用副本数写回 Foo，未变化时不写
    async fn update_foo_status(
        &self,
        foo: &Foo,
        deployment: &Deployment,
    ) -> Result<(), ReconcileError> {
        let available = deployment
            .status
            .as_ref()
            .and_then(|status| status.available_replicas)
            .unwrap_or(0);
        if foo.status.is_some() && foo.available_replicas() == available {
            return Ok(());
        }

        // 缓存中的对象只读，修改副本
        let mut updated = foo.clone();
        updated.status = Some(FooStatus {
            available_replicas: available,
        });
        debug!(
            "更新 Foo {}/{} 可用副本数为 {}",
            foo.namespace().unwrap_or_default(),
            foo.name_any(),
            available
        );
        self.api.update_foo_status(&updated).await?;
        Ok(())
    }
}

/// Deployment 是否由该 Foo 控制
///
/// 比较控制者属主引用的 apiVersion、kind 与名称；两边都有 UID 时还要求 UID 一致。
pub fn is_controlled_by(deployment: &Deployment, foo: &Foo) -> bool {
    let foo_uid = foo.uid();
    deployment.owner_references().iter().any(|reference| {
        reference.controller == Some(true)
            && reference.api_version == Foo::api_version(&())
            && reference.kind == Foo::kind(&())
            && reference.name == foo.name_any()
            && match foo_uid.as_deref() {
                Some(uid) if !reference.uid.is_empty() => reference.uid == uid,
                _ => true,
            }
    })
}

/// 需要写入的副本数；未设置或已一致时返回 `None`
fn replicas_drift(foo: &Foo, deployment: &Deployment) -> Option<i32> {
    let desired = foo.spec.replicas?;
    let current = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(DEFAULT_REPLICAS);
    (current != desired).then_some(desired)
}

/// 复制缓存中的 Deployment 并修改副本数，保留资源版本用于冲突检测
fn with_replicas(deployment: &Deployment, replicas: i32) -> Deployment {
    let mut scaled = deployment.clone();
    scaled
        .spec
        .get_or_insert_with(DeploymentSpec::default)
        .replicas = Some(replicas);
    scaled
}

/// 根据 Foo 构造期望的 Deployment
pub fn new_deployment(foo: &Foo, key: &ObjectKey) -> Result<Deployment, ReconcileError> {
    let owner = foo
        .controller_owner_ref(&())
        .ok_or_else(|| ReconcileError::MissingOwnerMetadata { key: key.clone() })?;

    let labels = BTreeMap::from([
        ("app".to_string(), "nginx".to_string()),
        ("controller".to_string(), foo.name_any()),
    ]);

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(foo.spec.deployment_name.clone()),
            namespace: foo.namespace(),
            owner_references: Some(vec![owner]),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(foo.desired_replicas()),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "nginx".to_string(),
                        image: Some("nginx:latest".to_string()),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    })
}
