//! 类型注册模块
//!
//! 启动时显式构造的类型注册表，把 (apiVersion, kind) 映射到具体的资源描述。
//! 注册表以引用方式传给需要识别资源种类的组件，例如按属主引用反查 Foo 的事件处理器。

use std::collections::HashMap;

use k8s_openapi::api::apps::v1::Deployment;
use kube::core::ApiResource;
use kube::Resource;

use crate::crd::Foo;

/// Foo 所属的 API 组
pub const GROUP_NAME: &str = "samplecontroller.k8s.io";

/// Foo 的 API 版本
pub const VERSION: &str = "v1alpha1";

/// 返回带组名的资源名，例如 `foos.samplecontroller.k8s.io`
pub fn resource(resource: &str) -> String {
    format!("{resource}.{GROUP_NAME}")
}

/// 类型注册表
#[derive(Debug, Clone, Default)]
pub struct Scheme {
    /// (apiVersion, kind) -> 资源描述
    known_types: HashMap<(String, String), ApiResource>,
}

impl Scheme {
    /// 创建包含控制器所需全部类型的注册表
    pub fn new() -> Self {
        let mut scheme = Self::default();
        scheme.add_known_type::<Foo>();
        scheme.add_known_type::<Deployment>();
        scheme
    }

    /// 注册一个静态类型
    pub fn add_known_type<K>(&mut self)
    where
        K: Resource<DynamicType = ()>,
    {
        let resource = ApiResource::erase::<K>(&());
        self.known_types.insert(
            (resource.api_version.clone(), resource.kind.clone()),
            resource,
        );
    }

    /// 查找已注册的资源描述
    pub fn lookup(&self, api_version: &str, kind: &str) -> Option<&ApiResource> {
        self.known_types
            .get(&(api_version.to_string(), kind.to_string()))
    }

    /// 取得某个静态类型的资源描述，未注册时返回 `None`
    pub fn api_resource_for<K>(&self) -> Option<&ApiResource>
    where
        K: Resource<DynamicType = ()>,
    {
        self.lookup(&K::api_version(&()), &K::kind(&()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_registers_controller_types() {
        let scheme = Scheme::new();
        assert!(scheme
            .lookup("samplecontroller.k8s.io/v1alpha1", "Foo")
            .is_some());
        let deployment = scheme.lookup("apps/v1", "Deployment").unwrap();
        assert_eq!(deployment.plural, "deployments");

        // 不同版本视为不同类型
        assert!(scheme
            .lookup("samplecontroller.k8s.io/v1beta1", "Foo")
            .is_none());
        assert!(scheme.lookup("v1", "Pod").is_none());
    }

    #[test]
    fn test_api_resource_for() {
        let scheme = Scheme::new();
        let foo = scheme.api_resource_for::<Foo>().unwrap();
        assert_eq!(foo.group, GROUP_NAME);
        assert_eq!(foo.version, VERSION);
        assert_eq!(foo.plural, "foos");

        assert!(Scheme::default().api_resource_for::<Foo>().is_none());
    }

    #[test]
    fn test_group_resource() {
        assert_eq!(resource("foos"), "foos.samplecontroller.k8s.io");
    }
}
