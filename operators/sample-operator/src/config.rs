//! 配置管理模块
//!
//! 配置按以下顺序叠加，后者覆盖前者：内置默认值、YAML/JSON 配置文件、
//! `SAMPLE_CONTROLLER_` 前缀的环境变量。命令行参数在 `main` 中最后覆盖。

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use sample_common::workqueue::rate_limiter::default_controller_rate_limiter;
use sample_common::{Error, MaxOfRateLimiter, ObjectKey, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "SAMPLE_CONTROLLER";

/// 重新同步周期与最大退避的上限（秒）
pub const MAX_PERIOD_SECS: u64 = 24 * 60 * 60;

/// 控制器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// 并发 worker 数量
    pub workers: usize,
    /// informer 重新同步周期（秒），0 表示关闭
    pub resync_period_secs: u64,
    /// 失败重试的初始退避（毫秒）
    pub backoff_base_ms: u64,
    /// 失败重试的最大退避（秒）
    pub backoff_max_secs: u64,
    /// 重试令牌桶速率
    pub bucket_qps: f64,
    /// 重试令牌桶容量
    pub bucket_burst: u32,
    /// 等待缓存同步时的轮询间隔（毫秒）
    pub cache_sync_poll_ms: u64,
    /// 日志级别，可以是 EnvFilter 指令
    pub log_level: String,
    /// 控制器名称，用作事件来源和字段管理者
    pub controller_name: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            resync_period_secs: 30,
            backoff_base_ms: 5,
            backoff_max_secs: 1000,
            bucket_qps: 50.0,
            bucket_burst: 300,
            cache_sync_poll_ms: 100,
            log_level: "info".to_string(),
            controller_name: "sample-controller".to_string(),
        }
    }
}

impl OperatorConfig {
    /// 加载配置，`path` 为空时只使用默认值和环境变量
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&Self::default())
            .map_err(|e| Error::config(format!("序列化默认配置失败: {e}")))?;
        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = path {
            // 确定配置文件格式
            let format = match path.extension().and_then(|ext| ext.to_str()) {
                Some("yaml") | Some("yml") => FileFormat::Yaml,
                Some("json") => FileFormat::Json,
                _ => {
                    return Err(Error::config(format!(
                        "不支持的配置文件格式 {path:?}，仅支持 YAML 或 JSON"
                    )))
                }
            };
            debug!("加载配置文件 {:?}", path);
            builder = builder.add_source(File::from(path).format(format));
        }

        let config = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .map_err(|e| Error::config(format!("构建配置失败: {e}")))?
            .try_deserialize::<Self>()
            .map_err(|e| Error::config(format!("配置格式错误: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("workers 必须大于 0"));
        }
        if !(self.bucket_qps > 0.0) || self.bucket_burst == 0 {
            return Err(Error::config("bucket_qps 与 bucket_burst 必须大于 0"));
        }
        if self.resync_period_secs > MAX_PERIOD_SECS {
            return Err(Error::config(format!(
                "resync_period_secs 不能超过 {MAX_PERIOD_SECS}"
            )));
        }
        if self.backoff_max_secs > MAX_PERIOD_SECS {
            return Err(Error::config(format!(
                "backoff_max_secs 不能超过 {MAX_PERIOD_SECS}"
            )));
        }
        if self.cache_sync_poll_ms == 0 {
            return Err(Error::config("cache_sync_poll_ms 必须大于 0"));
        }
        if self.backoff_base() > self.backoff_max() {
            return Err(Error::config(format!(
                "初始退避 {:?} 大于最大退避 {:?}",
                self.backoff_base(),
                self.backoff_max()
            )));
        }
        if self.controller_name.is_empty() {
            return Err(Error::config("controller_name 不能为空"));
        }
        Ok(())
    }

    /// 重新同步周期，关闭时返回 `None`
    pub fn resync_period(&self) -> Option<Duration> {
        (self.resync_period_secs > 0).then(|| Duration::from_secs(self.resync_period_secs))
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn cache_sync_poll(&self) -> Duration {
        Duration::from_millis(self.cache_sync_poll_ms)
    }

    /// 工作队列使用的限速器
    pub fn rate_limiter(&self) -> MaxOfRateLimiter<ObjectKey> {
        default_controller_rate_limiter(
            self.backoff_base(),
            self.backoff_max(),
            self.bucket_qps,
            self.bucket_burst,
        )
    }
}
