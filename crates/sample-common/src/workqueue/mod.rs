//! 工作队列模块
//!
//! 去重、支持延迟与限速重试的 FIFO 队列。队列中的对象有三种状态：
//!
//! - `dirty`：等待被处理（可能已在队列中，也可能正在处理时被再次加入）
//! - `processing`：已被某个 worker 通过 [`WorkQueue::get`] 取走，尚未 [`WorkQueue::done`]
//! - 二者皆否：不在队列中
//!
//! 处理期间再次加入的对象只会标记为 `dirty`，等 `done` 时才重新放回队列，
//! 因此同一个对象同时至多被一个 worker 处理，而且处理期间到达的更新不会丢失。

pub mod rate_limiter;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, trace, warn};

use self::rate_limiter::RateLimiter;

/// 单次延迟入队的最长等待，更长的延迟按此值处理
pub const MAX_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// 队列元素需要满足的约束
pub trait QueueItem: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> QueueItem for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// 受互斥锁保护的队列状态
struct QueueState<T> {
    /// 可被取走的对象，按加入顺序排列
    queue: VecDeque<T>,
    /// 等待处理的对象
    dirty: HashSet<T>,
    /// 正在处理的对象
    processing: HashSet<T>,
    /// 是否已关闭
    shutting_down: bool,
}

/// 工作队列
///
/// 必须在 Tokio 运行时中创建：延迟入队由一个后台任务负责。
pub struct WorkQueue<T: QueueItem> {
    /// 队列状态
    state: Mutex<QueueState<T>>,
    /// 唤醒等待中的 `get`
    notify: Notify,
    /// 发往延迟任务的 (对象, 延迟)
    waiting_tx: mpsc::UnboundedSender<(T, Duration)>,
    /// 关闭信号，同时停止延迟任务
    shutdown: CancellationToken,
    /// 失败重试限速器
    rate_limiter: Box<dyn RateLimiter<T>>,
}

impl<T: QueueItem> WorkQueue<T> {
    /// 创建新的工作队列
    pub fn new(rate_limiter: impl RateLimiter<T> + 'static) -> Arc<Self> {
        let (waiting_tx, waiting_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let queue = Arc::new(Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            waiting_tx,
            shutdown: shutdown.clone(),
            rate_limiter: Box::new(rate_limiter),
        });

        tokio::spawn(waiting_loop(Arc::downgrade(&queue), waiting_rx, shutdown));

        queue
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 加入对象
    ///
    /// 已在等待的对象不会重复加入；正在处理的对象在 `done` 之后重新入队；
    /// 队列关闭后的加入会被丢弃。
    pub fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down {
            trace!(?item, "队列已关闭，丢弃对象");
            return;
        }
        if !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);

        self.notify.notify_one();
    }

    /// 取出下一个对象
    ///
    /// 队列为空时等待，队列关闭后返回 `None`。取出的对象处于处理中状态，
    /// 处理结束后必须调用 [`WorkQueue::done`]。
    pub async fn get(&self) -> Option<T> {
        loop {
            // 先登记等待，再检查状态，避免错过检查与等待之间的唤醒
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// 标记对象处理完成
    ///
    /// 处理期间被再次加入的对象会立即重新变为可取。
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        if state.shutting_down || !state.dirty.contains(item) {
            return;
        }
        state.queue.push_back(item.clone());
        drop(state);

        self.notify.notify_one();
    }

    /// 延迟一段时间后加入对象
    ///
    /// 同一个对象多次延迟加入时，以最早的到期时间为准。延迟超过 [`MAX_DELAY`]
    /// 时按 [`MAX_DELAY`] 处理。
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let delay = delay.min(MAX_DELAY);
        if let Err(mpsc::error::SendError((item, _))) = self.waiting_tx.send((item, delay)) {
            warn!(?item, "延迟入队任务已退出，丢弃对象");
        }
    }

    /// 按限速器给出的等待时间重新加入对象
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.rate_limiter.when(&item);
        trace!(?item, ?delay, "限速重新入队");
        self.add_after(item, delay);
    }

    /// 清除对象的失败记录，通常在处理成功后调用
    pub fn forget(&self, item: &T) {
        self.rate_limiter.forget(item);
    }

    /// 对象已经重试的次数
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.rate_limiter.num_requeues(item)
    }

    /// 可被取走的对象数量
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// 队列中是否没有可取的对象
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 关闭队列
    ///
    /// 之后的加入会被丢弃，所有等待中的 `get` 返回 `None`，正在处理的对象不受影响。
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    /// 队列是否已关闭
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}

impl<T: QueueItem> Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("WorkQueue")
            .field("queued", &state.queue.len())
            .field("processing", &state.processing.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

/// 延迟入队任务
///
/// 持有队列的弱引用：队列被释放或关闭时任务退出。
async fn waiting_loop<T: QueueItem>(
    queue: Weak<WorkQueue<T>>,
    mut waiting_rx: mpsc::UnboundedReceiver<(T, Duration)>,
    shutdown: CancellationToken,
) {
    let mut delayed: DelayQueue<T> = DelayQueue::new();
    let mut waiting: HashMap<T, (delay_queue::Key, Instant)> = HashMap::new();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            received = waiting_rx.recv() => {
                let Some((item, delay)) = received else { break };
                let ready_at = Instant::now() + delay;
                match waiting.get_mut(&item) {
                    Some((key, deadline)) => {
                        if ready_at < *deadline {
                            delayed.reset_at(key, ready_at);
                            *deadline = ready_at;
                        }
                    }
                    None => {
                        let key = delayed.insert_at(item.clone(), ready_at);
                        waiting.insert(item, (key, ready_at));
                    }
                }
            }
            Some(expired) = delayed.next(), if !delayed.is_empty() => {
                let item = expired.into_inner();
                waiting.remove(&item);
                let Some(queue) = queue.upgrade() else { break };
                queue.add(item);
            }
        }
    }

    debug!(pending = waiting.len(), "延迟入队任务退出");
}

#[cfg(test)]
mod tests {
    use super::rate_limiter::ItemExponentialFailureRateLimiter;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn new_queue() -> Arc<WorkQueue<String>> {
        WorkQueue::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        ))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_add_is_deduplicated() {
        let queue = new_queue();
        queue.add("default/foo".to_string());
        queue.add("default/foo".to_string());
        queue.add("default/bar".to_string());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await.as_deref(), Some("default/foo"));
        assert_eq!(queue.get().await.as_deref(), Some("default/bar"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_readd_while_processing_is_deferred_until_done() {
        let queue = new_queue();
        let key = "default/foo".to_string();
        queue.add(key.clone());

        let item = queue.get().await.unwrap();
        // 处理期间的多次加入合并为一次，且不会立即可取
        queue.add(key.clone());
        queue.add(key.clone());
        assert!(queue.is_empty());

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(key.clone()));
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_waits_for_add() {
        let queue = new_queue();
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.get().await }
        });

        settle().await;
        assert!(!waiter.is_finished());

        queue.add("default/foo".to_string());
        assert_eq!(waiter.await.unwrap().as_deref(), Some("default/foo"));
    }

    #[tokio::test]
    async fn test_shut_down_releases_waiters_and_drops_adds() {
        let queue = new_queue();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();
        settle().await;

        queue.shut_down();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), None);
        }

        queue.add("default/foo".to_string());
        assert!(queue.is_empty());
        assert!(queue.is_shutting_down());
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_done_after_shut_down_does_not_requeue() {
        let queue = new_queue();
        queue.add("default/foo".to_string());
        let item = queue.get().await.unwrap();
        queue.add(item.clone());

        queue.shut_down();
        queue.done(&item);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_delivers_when_delay_expires() {
        let queue = new_queue();
        queue.add_after("default/foo".to_string(), Duration::from_secs(5));
        settle().await;
        assert!(queue.is_empty());

        tokio::time::advance(Duration::from_secs(4)).await;
        settle().await;
        assert!(queue.is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_keeps_earliest_deadline() {
        let queue = new_queue();
        queue.add_after("default/foo".to_string(), Duration::from_secs(60));
        queue.add_after("default/foo".to_string(), Duration::from_secs(1));
        queue.add_after("default/foo".to_string(), Duration::from_secs(30));
        settle().await;

        tokio::time::advance(Duration::from_millis(1500)).await;
        settle().await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("default/foo"));

        // 延迟项只投递一次
        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_delay_is_capped() {
        let queue = WorkQueue::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_secs(100_000_000),
            Duration::from_secs(100_000_000),
        ));
        queue.add_rate_limited("default/broken".to_string());
        queue.add_after("default/ok".to_string(), Duration::from_millis(10));
        settle().await;

        // 超长延迟不影响其他对象的延迟入队
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("default/ok"));

        tokio::time::advance(MAX_DELAY).await;
        settle().await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("default/broken"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_rate_limited_backs_off_and_forget_resets() {
        let queue = new_queue();
        let key = "default/foo".to_string();

        queue.add_rate_limited(key.clone());
        queue.add_rate_limited(key.clone());
        queue.add_rate_limited(key.clone());
        assert_eq!(queue.num_requeues(&key), 3);
        settle().await;

        // 第一次失败等待 5ms，最早的到期时间生效
        tokio::time::advance(Duration::from_millis(6)).await;
        settle().await;
        assert_eq!(queue.len(), 1);

        queue.forget(&key);
        assert_eq!(queue.num_requeues(&key), 0);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_at_most_one_worker_per_key() {
        let queue = new_queue();
        let key = "default/foo".to_string();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let in_flight = in_flight.clone();
                let max_in_flight = max_in_flight.clone();
                let processed = processed.clone();
                tokio::spawn(async move {
                    while let Some(item) = queue.get().await {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_in_flight.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        processed.fetch_add(1, Ordering::SeqCst);
                        queue.done(&item);
                    }
                })
            })
            .collect();

        for _ in 0..50 {
            queue.add(key.clone());
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(processed.load(Ordering::SeqCst) > 0);

        queue.shut_down();
        for worker in workers {
            worker.await.unwrap();
        }
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    }
}
