//! 自定义资源定义模块
//!
//! 该模块定义了 Foo 自定义资源。Foo 由用户创建和修改，声明期望的 Deployment
//! 名称和副本数；控制器只读取 spec，只写入 status。

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Foo 规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "samplecontroller.k8s.io",
    version = "v1alpha1",
    kind = "Foo",
    plural = "foos",
    namespaced,
    annotation("api-approved.kubernetes.io", "unapproved, experimental-only")
)]
#[kube(status = "FooStatus")]
#[kube(printcolumn = r#"{"name":"Deployment", "type":"string", "jsonPath":".spec.deploymentName"}"#)]
#[kube(printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#)]
#[kube(printcolumn = r#"{"name":"Available", "type":"integer", "jsonPath":".status.availableReplicas"}"#)]
#[serde(rename_all = "camelCase")]
pub struct FooSpec {
    /// 受管 Deployment 的名称，为空表示尚未命名
    #[serde(default)]
    pub deployment_name: String,

    /// 期望副本数；未设置时创建为 1，之后不再干预
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

/// Foo 状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FooStatus {
    /// 受管 Deployment 观测到的可用副本数
    #[serde(default)]
    pub available_replicas: i32,
}

/// 未设置副本数时新建 Deployment 使用的副本数
pub const DEFAULT_REPLICAS: i32 = 1;

impl Foo {
    /// 新建 Deployment 时使用的副本数
    pub fn desired_replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(DEFAULT_REPLICAS)
    }

    /// 当前记录的可用副本数
    pub fn available_replicas(&self) -> i32 {
        self.status
            .as_ref()
            .map_or(0, |status| status.available_replicas)
    }
}
