//! 集群 API 模块
//!
//! 协调器对集群的全部写操作都经过 [`ClusterApi`]。每个调用都是同步等待的请求，
//! 可能因网络、对象不存在或资源版本冲突而失败，调用方按可重试错误处理。

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use crate::crd::Foo;

/// 集群写操作接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// 创建 Deployment
    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, kube::Error>;

    /// 整体替换 Deployment，携带的资源版本用于乐观并发控制
    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, kube::Error>;

    /// 通过 status 子资源写入 Foo 状态，不触碰 spec
    async fn update_foo_status(&self, foo: &Foo) -> Result<Foo, kube::Error>;
}

/// 基于 kube 客户端的实现
#[derive(Clone)]
pub struct KubeClusterApi {
    /// Kubernetes 客户端
    client: Client,
    /// 写入时使用的字段管理者名称
    field_manager: String,
}

impl KubeClusterApi {
    /// 创建新的集群 API
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..PostParams::default()
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, kube::Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        debug!("创建 Deployment {}/{}", namespace, deployment.name_any());
        api.create(&self.post_params(), deployment).await
    }

    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, kube::Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let name = deployment.name_any();
        debug!("更新 Deployment {}/{}", namespace, name);
        api.replace(&name, &self.post_params(), deployment).await
    }

    async fn update_foo_status(&self, foo: &Foo) -> Result<Foo, kube::Error> {
        let namespace = foo.namespace().unwrap_or_default();
        let name = foo.name_any();
        let api: Api<Foo> = Api::namespaced(self.client.clone(), &namespace);

        // 创建状态补丁
        let patch = json!({
            "status": foo.status
        });
        let patch_params = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..PatchParams::default()
        };

        debug!("更新 Foo {}/{} 状态", namespace, name);
        api.patch_status(&name, &patch_params, &Patch::Merge(patch))
            .await
    }
}
