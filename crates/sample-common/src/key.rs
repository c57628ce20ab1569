//! 对象键模块
//!
//! 工作队列中以 `namespace/name` 字符串标识对象，集群级对象只有 `name`。

use std::fmt;

use crate::error::{Error, Result};

/// 对象键：命名空间 + 名称
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// 命名空间，集群级对象为空
    pub namespace: String,
    /// 对象名称
    pub name: String,
}

impl ObjectKey {
    /// 创建命名空间内的对象键
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// 从对象元数据构造键，缺少名称时返回错误
    pub fn from_meta(namespace: Option<&str>, name: Option<&str>) -> Result<Self> {
        match name {
            Some(name) if !name.is_empty() => Ok(Self::new(namespace.unwrap_or_default(), name)),
            _ => Err(Error::InvalidKey("对象缺少名称".to_string())),
        }
    }

    /// 是否为集群级对象的键
    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let key = ObjectKey::new("default", "example-foo");
        assert_eq!(key.to_string(), "default/example-foo");

        let cluster_scoped = ObjectKey::new("", "node-a");
        assert!(cluster_scoped.is_cluster_scoped());
        assert_eq!(cluster_scoped.to_string(), "node-a");
    }

    #[test]
    fn test_from_meta() {
        let key = ObjectKey::from_meta(Some("kube-system"), Some("dns")).unwrap();
        assert_eq!(key, ObjectKey::new("kube-system", "dns"));

        // 没有名称的对象无法入队
        assert!(ObjectKey::from_meta(Some("default"), None).is_err());
        assert!(ObjectKey::from_meta(None, Some("")).is_err());
    }
}
