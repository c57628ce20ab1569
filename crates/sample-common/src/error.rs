//! 错误处理模块
//!
//! 该模块提供控制器各组件共享的错误类型，便于统一转换与日志记录。

use thiserror::Error;

/// 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 对象键格式错误
    #[error("无效的对象键: {0}")]
    InvalidKey(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),
}

/// 统一结果类型别名
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// 构造配置错误
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
