//! 限速器模块
//!
//! 决定失败对象重新入队前需要等待多久。按对象的指数退避与全局令牌桶
//! 可以通过 [`MaxOfRateLimiter`] 组合，取两者中较长的等待时间。

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// 限速器接口
pub trait RateLimiter<T>: Send + Sync {
    /// 返回对象下次入队前需要等待的时间，并记录一次失败
    fn when(&self, item: &T) -> Duration;

    /// 清除对象的失败记录
    fn forget(&self, item: &T);

    /// 对象已经重试的次数
    fn num_requeues(&self, item: &T) -> u32;
}

fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 按对象的指数退避限速器
///
/// 第 n 次失败等待 `base * 2^n`，最长不超过 `max`。
#[derive(Debug)]
pub struct ItemExponentialFailureRateLimiter<T> {
    /// 初始等待时间
    base: Duration,
    /// 最大等待时间
    max: Duration,
    /// 每个对象的失败次数
    failures: Mutex<HashMap<T, u32>>,
}

impl<T> ItemExponentialFailureRateLimiter<T> {
    /// 创建新的指数退避限速器
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> Default for ItemExponentialFailureRateLimiter<T> {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl<T> RateLimiter<T> for ItemExponentialFailureRateLimiter<T>
where
    T: Clone + Eq + Hash + Send,
{
    fn when(&self, item: &T) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(item.clone()).or_insert(0);
        let exponent = *count;
        *count = count.saturating_add(1);

        // 指数过大时直接取上限，避免溢出
        let backoff = self.base.as_secs_f64() * 2f64.powi(exponent.min(1024) as i32);
        if !backoff.is_finite() || backoff > self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(backoff)
    }

    fn forget(&self, item: &T) {
        lock(&self.failures).remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        lock(&self.failures).get(item).copied().unwrap_or(0)
    }
}

/// 令牌桶状态
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// 全局令牌桶限速器
///
/// 限制所有对象合计的重新入队速率，与具体对象无关。
#[derive(Debug)]
pub struct BucketRateLimiter {
    /// 每秒补充的令牌数
    qps: f64,
    /// 桶容量
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    /// 创建新的令牌桶，初始为满桶
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }

    /// 预定一个令牌，返回需要等待的时间
    fn reserve(&self) -> Duration {
        let mut bucket = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            // 速率极低时等待时间可能超出 Duration 的范围
            Duration::try_from_secs_f64(-bucket.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        self.reserve()
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// 组合限速器，取所有成员中最长的等待时间
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    /// 由一组限速器创建组合限速器
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> std::fmt::Debug for MaxOfRateLimiter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaxOfRateLimiter")
            .field("limiters", &self.limiters.len())
            .finish()
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        // 每个成员都要记录这次失败，因此不能短路
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// 控制器默认使用的限速器：按对象指数退避与全局令牌桶取较大值
pub fn default_controller_rate_limiter<T>(
    base: Duration,
    max: Duration,
    qps: f64,
    burst: u32,
) -> MaxOfRateLimiter<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(base, max)),
        Box::new(BucketRateLimiter::new(qps, burst)),
    ])
}
