//! Sample Common - 控制器共享的基础组件
//!
//! 该模块提供与具体资源类型无关的基础设施：对象键、去重工作队列、
//! 失败重试限速器以及统一的错误处理机制。

pub mod error;
pub mod key;
pub mod workqueue;

/// 重新导出常用类型，方便使用
pub use error::Error;
pub use error::Result;
pub use key::ObjectKey;
pub use workqueue::rate_limiter::{
    BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter,
};
pub use workqueue::{WorkQueue, MAX_DELAY};
