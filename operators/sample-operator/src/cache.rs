//! 本地缓存模块
//!
//! 在 kube-runtime 的 reflector 存储之上实现共享 informer：消费 watch 事件流，
//! 维护最终一致的本地镜像，并向注册的处理器分发新增、更新、删除通知。
//!
//! 存储总是先于通知更新，处理器触发的协调读到的缓存至少与通知一样新。

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use kube::api::Api;
use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Resource;
use serde::de::DeserializeOwned;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 资源事件处理器
///
/// 在 informer 的事件循环中同步调用，实现不能阻塞。
pub trait ResourceEventHandler<K>: Send + Sync {
    /// 对象新增
    fn on_add(&self, obj: &K);

    /// 对象更新；周期性重新同步时 `old` 与 `new` 相同
    fn on_update(&self, old: &K, new: &K);

    /// 对象删除，携带最后一次观测到的状态
    fn on_delete(&self, obj: &K);
}

/// 缓存同步标记
#[derive(Debug, Clone, Default)]
pub struct SyncedFlag(Arc<AtomicBool>);

impl SyncedFlag {
    /// 初始全量列举是否已完成
    pub fn has_synced(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn mark_synced(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// 重新列举期间缓冲的对象：(列举前的旧对象, 新对象)
type RelistBuffer<K> = Vec<(Option<Arc<K>>, K)>;

/// 共享 informer
pub struct SharedInformer<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    /// 只读存储视图
    reader: Store<K>,
    /// 存储写入端
    writer: Writer<K>,
    /// 已注册的处理器
    handlers: Vec<Arc<dyn ResourceEventHandler<K>>>,
    /// 同步标记
    synced: SyncedFlag,
    /// 重新同步周期
    resync_period: Option<Duration>,
}

impl<K> SharedInformer<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
{
    /// 创建新的 informer
    pub fn new(resync_period: Option<Duration>) -> Self {
        let (reader, writer) = reflector::store();
        Self {
            reader,
            writer,
            handlers: Vec::new(),
            synced: SyncedFlag::default(),
            resync_period: resync_period.filter(|period| !period.is_zero()),
        }
    }

    /// 只读存储视图，可按 namespace/name 查询
    pub fn store(&self) -> Store<K> {
        self.reader.clone()
    }

    /// 同步标记
    pub fn synced(&self) -> SyncedFlag {
        self.synced.clone()
    }

    /// 注册处理器，必须在 [`SharedInformer::run`] 之前调用
    pub fn add_event_handler(&mut self, handler: Arc<dyn ResourceEventHandler<K>>) {
        self.handlers.push(handler);
    }

    /// 消费事件流直到流结束或收到关闭信号
    pub async fn run<S>(mut self, stream: S, shutdown: CancellationToken)
    where
        S: Stream<Item = watcher::Result<watcher::Event<K>>> + Send,
    {
        let kind = K::kind(&()).to_string();
        let mut resync = self.resync_period.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut relist: Option<RelistBuffer<K>> = None;

        info!("启动 {} informer", kind);
        tokio::pin!(stream);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(event)) => self.handle_event(event, &mut relist),
                    Some(Err(e)) => warn!("{} watch 错误: {}", kind, e),
                    None => {
                        warn!("{} watch 流已结束", kind);
                        break;
                    }
                },
                () = tick(&mut resync) => self.resync(),
            }
        }

        info!("{} informer 已停止", kind);
    }

    /// 处理单个 watch 事件
    fn handle_event(&mut self, event: watcher::Event<K>, relist: &mut Option<RelistBuffer<K>>) {
        match event {
            watcher::Event::Apply(obj) => {
                let old = self.reader.get(&ObjectRef::from_obj(&obj));
                self.writer
                    .apply_watcher_event(&watcher::Event::Apply(obj.clone()));
                self.notify_applied(old.as_deref(), &obj);
            }
            watcher::Event::Delete(obj) => {
                self.writer
                    .apply_watcher_event(&watcher::Event::Delete(obj.clone()));
                for handler in &self.handlers {
                    handler.on_delete(&obj);
                }
            }
            watcher::Event::Init => {
                debug!("开始重新列举 {}", K::kind(&()));
                *relist = Some(Vec::new());
                self.writer.apply_watcher_event(&watcher::Event::Init);
            }
            watcher::Event::InitApply(obj) => {
                // 列举完成前存储仍是旧视图，这里记下旧对象
                let old = self.reader.get(&ObjectRef::from_obj(&obj));
                self.writer
                    .apply_watcher_event(&watcher::Event::InitApply(obj.clone()));
                relist.get_or_insert_with(Vec::new).push((old, obj));
            }
            watcher::Event::InitDone => {
                let listed = relist.take().unwrap_or_default();
                let seen: HashSet<ObjectRef<K>> = listed
                    .iter()
                    .map(|(_, obj)| ObjectRef::from_obj(obj))
                    .collect();
                let removed: Vec<Arc<K>> = self
                    .reader
                    .state()
                    .into_iter()
                    .filter(|obj| !seen.contains(&ObjectRef::from_obj(obj.as_ref())))
                    .collect();

                self.writer.apply_watcher_event(&watcher::Event::InitDone);

                for (old, obj) in &listed {
                    self.notify_applied(old.as_deref(), obj);
                }
                for obj in &removed {
                    for handler in &self.handlers {
                        handler.on_delete(obj);
                    }
                }

                if !self.synced.has_synced() {
                    info!("{} 缓存已同步，共 {} 个对象", K::kind(&()), listed.len());
                    self.synced.mark_synced();
                }
            }
        }
    }

    fn notify_applied(&self, old: Option<&K>, obj: &K) {
        for handler in &self.handlers {
            match old {
                Some(old) => handler.on_update(old, obj),
                None => handler.on_add(obj),
            }
        }
    }

    /// 把缓存中的每个对象作为更新重新分发一次
    fn resync(&self) {
        let objects = self.reader.state();
        debug!("重新同步 {} 个 {}", objects.len(), K::kind(&()));
        for obj in &objects {
            for handler in &self.handlers {
                handler.on_update(obj, obj);
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// 带默认退避的 watch 事件流
pub fn watch_stream<K>(
    api: Api<K>,
) -> impl Stream<Item = watcher::Result<watcher::Event<K>>> + Send
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher(api, watcher::Config::default()).default_backoff()
}

/// 等待所有缓存完成初始同步
///
/// 收到关闭信号时返回 `false`。
pub async fn wait_for_cache_sync(
    shutdown: &CancellationToken,
    poll_interval: Duration,
    caches: &[SyncedFlag],
) -> bool {
    let mut interval = tokio::time::interval(poll_interval);
    loop {
        if caches.iter().all(SyncedFlag::has_synced) {
            return true;
        }
        tokio::select! {
            () = shutdown.cancelled() => return false,
            _ = interval.tick() => {}
        }
    }
}
