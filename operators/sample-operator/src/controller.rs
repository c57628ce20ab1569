//! 控制器模块
//!
//! 把 informer、工作队列和协调器连接起来：等待缓存完成初始同步后启动若干 worker，
//! 每个 worker 循环地从队列取出 Foo 键并执行协调，直到队列关闭。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use futures::FutureExt;
use k8s_openapi::api::apps::v1::Deployment;
use sample_common::{ObjectKey, WorkQueue};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{wait_for_cache_sync, SharedInformer, SyncedFlag};
use crate::client::ClusterApi;
use crate::config::OperatorConfig;
use crate::crd::Foo;
use crate::event_handler::{DeploymentEventHandler, FooEventHandler};
use crate::reconcile::{ReconcileError, Reconciler};
use crate::recorder::EventRecorder;
use crate::scheme::Scheme;

/// 控制器结构体
pub struct Controller {
    /// 工作队列
    queue: Arc<WorkQueue<ObjectKey>>,
    /// 协调器
    reconciler: Reconciler,
    /// 需要等待同步的缓存
    caches: Vec<SyncedFlag>,
    /// 等待缓存同步时的轮询间隔
    cache_sync_poll: Duration,
}

impl Controller {
    /// 创建新的控制器，并在两个 informer 上注册事件处理器
    ///
    /// 必须在 informer 启动之前调用。
    pub fn new(
        foo_informer: &mut SharedInformer<Foo>,
        deployment_informer: &mut SharedInformer<Deployment>,
        api: Arc<dyn ClusterApi>,
        recorder: Arc<dyn EventRecorder>,
        scheme: &Scheme,
        config: &OperatorConfig,
    ) -> Result<Self> {
        let owner = scheme
            .api_resource_for::<Foo>()
            .cloned()
            .ok_or_else(|| anyhow!("类型注册表中缺少 Foo"))?;

        let queue = WorkQueue::new(config.rate_limiter());

        info!("注册事件处理器");
        foo_informer.add_event_handler(Arc::new(FooEventHandler::new(queue.clone())));
        deployment_informer
            .add_event_handler(Arc::new(DeploymentEventHandler::new(queue.clone(), owner)));

        let reconciler = Reconciler::new(
            foo_informer.store(),
            deployment_informer.store(),
            api,
            recorder,
        );

        Ok(Self {
            queue,
            reconciler,
            caches: vec![foo_informer.synced(), deployment_informer.synced()],
            cache_sync_poll: config.cache_sync_poll(),
        })
    }

    /// 运行控制器直到关闭令牌被取消
    ///
    /// 返回前关闭工作队列，并等待正在进行的协调结束。
    pub async fn run(self, workers: usize, shutdown: CancellationToken) -> Result<()> {
        info!("启动 Foo 控制器");

        info!("等待 informer 缓存同步");
        if !wait_for_cache_sync(&shutdown, self.cache_sync_poll, &self.caches).await {
            self.queue.shut_down();
            bail!("等待缓存同步失败");
        }

        info!("启动 {} 个 worker", workers);
        let controller = Arc::new(self);
        let mut handles = JoinSet::new();
        for id in 0..workers {
            handles.spawn(controller.clone().run_worker(id));
        }
        info!("worker 已启动");

        shutdown.cancelled().await;
        info!("关闭 worker");
        controller.queue.shut_down();

        while let Some(result) = handles.join_next().await {
            if let Err(e) = result {
                error!("worker 异常退出: {}", e);
            }
        }

        info!("Foo 控制器已停止");
        Ok(())
    }

    async fn run_worker(self: Arc<Self>, id: usize) {
        debug!("worker {} 启动", id);
        while self.process_next_work_item().await {}
        debug!("worker {} 退出", id);
    }

    /// 处理队列中的下一个对象，队列关闭时返回 `false`
    async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        // 协调中的 panic 只影响当前对象
        let outcome = AssertUnwindSafe(self.reconciler.sync_handler(&key))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                self.queue.forget(&key);
                info!("已同步 '{}'", key);
            }
            Ok(Err(e)) => self.handle_error(&key, e),
            Err(payload) => {
                error!("协调 '{}' 时发生 panic: {}", key, panic_message(payload.as_ref()));
                self.queue.add_rate_limited(key.clone());
            }
        }

        self.queue.done(&key);
        true
    }

    /// 按错误类别记录日志并安排重试
    fn handle_error(&self, key: &ObjectKey, err: ReconcileError) {
        match &err {
            ReconcileError::InvalidKey(_) => {
                // 重试也无法恢复，直接丢弃
                error!("丢弃 '{}': {}", key, err);
                self.queue.forget(key);
                return;
            }
            e if e.is_permanent() => error!("协调 '{}' 失败: {}", key, e),
            e if self.queue.num_requeues(key) == 0 => warn!("协调 '{}' 失败，将重试: {}", key, e),
            e => debug!("协调 '{}' 再次失败: {}", key, e),
        }
        self.queue.add_rate_limited(key.clone());
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("未知错误")
}
