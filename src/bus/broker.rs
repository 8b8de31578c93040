// 事件总线
// 订阅表以快照形式发布，读路径无锁；每个订阅者拥有独立的有界队列和投递路径

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::bus::{DeliveryQueue, Event, EventHandler, OverflowPolicy, PushOutcome, TopicPattern, validate_topic};
use crate::config::EventBusConfig;
use crate::core::{HookFailure, guarded};
use crate::errors::{CoreError, CoreResult};

/// 投递模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// 专属顺序路径，同一订阅者的调用不会重叠
    #[default]
    Sync,
    /// 共享工作池，调用之间可能重叠
    Async,
}

/// 订阅选项
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub mode: DeliveryMode,
    /// 为空时使用总线默认策略
    pub overflow: Option<OverflowPolicy>,
    /// 为空时使用总线默认容量
    pub capacity: Option<usize>,
    /// 载荷字段精确匹配过滤
    pub filter: Option<Map<String, Value>>,
}

impl SubscribeOptions {
    pub fn new(mode: DeliveryMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn with_overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = Some(policy);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.filter.get_or_insert_with(Map::new).insert(key.into(), value);
        self
    }
}

#[derive(Default)]
struct DeliveryCounters {
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

struct SubscriberEntry {
    id: String,
    pattern: TopicPattern,
    mode: DeliveryMode,
    overflow: OverflowPolicy,
    filter: Option<Map<String, Value>>,
    created_at: DateTime<Utc>,
    queue: DeliveryQueue,
    revoked: CancellationToken,
    counters: DeliveryCounters,
}

impl SubscriberEntry {
    fn accepts(&self, event: &Event) -> bool {
        if !self.pattern.matches(event.topic()) {
            return false;
        }
        match &self.filter {
            None => true,
            Some(filter) => filter
                .iter()
                .all(|(key, expected)| event.field(key) == Some(expected)),
        }
    }

    /// 撤销后不再分发新的投递，已排队事件被丢弃
    fn revoke(&self) {
        self.revoked.cancel();
        let discarded = self.queue.close();
        if discarded > 0 {
            debug!(subscriber_id = %self.id, discarded, "撤销订阅，丢弃未分发事件");
        }
    }

    fn record_drop(&self, event: &Event, policy: OverflowPolicy) {
        let total = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            subscriber_id = %self.id,
            topic = %event.topic(),
            event_id = %event.id(),
            policy = ?policy,
            dropped_total = total,
            "订阅者队列溢出"
        );
    }

    fn stats(&self) -> SubscriberStats {
        SubscriberStats {
            subscriber_id: self.id.clone(),
            pattern: self.pattern.to_string(),
            mode: self.mode,
            overflow: self.overflow,
            queue_depth: self.queue.len(),
            capacity: self.queue.capacity(),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            created_at: self.created_at,
        }
    }
}

/// 单个订阅者的投递统计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberStats {
    pub subscriber_id: String,
    pub pattern: String,
    pub mode: DeliveryMode,
    pub overflow: OverflowPolicy,
    pub queue_depth: usize,
    pub capacity: usize,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
    pub created_at: DateTime<Utc>,
}

/// 总线统计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusStats {
    pub published: u64,
    pub subscription_count: usize,
    pub closed: bool,
    /// 按订阅者 ID 排序
    pub subscribers: Vec<SubscriberStats>,
}

impl BusStats {
    /// 发生过溢出丢弃的订阅者
    pub fn overflowing_subscribers(&self) -> Vec<String> {
        self.subscribers
            .iter()
            .filter(|s| s.dropped > 0)
            .map(|s| s.subscriber_id.clone())
            .collect()
    }

    pub fn subscriber(&self, subscriber_id: &str) -> Option<&SubscriberStats> {
        self.subscribers.iter().find(|s| s.subscriber_id == subscriber_id)
    }
}

type Registry = HashMap<String, Arc<SubscriberEntry>>;

struct BusInner {
    config: EventBusConfig,
    registry: ArcSwap<Registry>,
    /// 串行化订阅表写入
    write_lock: Mutex<()>,
    sequence: AtomicU64,
    published: AtomicU64,
    workers: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

/// 进程内事件总线，克隆开销很小
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// 创建新的事件总线
    pub fn new(config: Option<EventBusConfig>) -> Self {
        let config = config.unwrap_or_default();
        // 至少两个工作槽，单个订阅者占满自己的槽位后仍留有余量
        let workers = Arc::new(Semaphore::new(config.worker_pool_size.max(2)));

        info!(
            queue_capacity = config.queue_capacity,
            worker_pool_size = config.worker_pool_size,
            "创建事件总线"
        );

        Self {
            inner: Arc::new(BusInner {
                config,
                registry: ArcSwap::from_pointee(Registry::new()),
                write_lock: Mutex::new(()),
                sequence: AtomicU64::new(0),
                published: AtomicU64::new(0),
                workers,
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    /// 以默认选项订阅
    pub fn subscribe(
        &self,
        subscriber_id: impl Into<String>,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
        mode: DeliveryMode,
    ) -> CoreResult<()> {
        self.subscribe_with(subscriber_id, pattern, handler, SubscribeOptions::new(mode))
    }

    /// 订阅；相同 ID 的旧订阅被原子替换
    pub fn subscribe_with(
        &self,
        subscriber_id: impl Into<String>,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> CoreResult<()> {
        let subscriber_id = subscriber_id.into();
        if subscriber_id.trim().is_empty() {
            return Err(CoreError::invalid_name(subscriber_id, "订阅者 ID 不能为空"));
        }
        let pattern = TopicPattern::parse(pattern)?;
        let runtime = Handle::try_current()
            .map_err(|_| CoreError::internal("订阅必须在 tokio 运行时内进行"))?;

        let config = &self.inner.config;
        let entry = Arc::new(SubscriberEntry {
            id: subscriber_id.clone(),
            pattern,
            mode: options.mode,
            overflow: options.overflow.unwrap_or(config.default_overflow),
            filter: options.filter,
            created_at: Utc::now(),
            queue: DeliveryQueue::new(options.capacity.unwrap_or(config.queue_capacity)),
            revoked: self.inner.shutdown.child_token(),
            counters: DeliveryCounters::default(),
        });

        let previous = {
            let _guard = self.inner.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(CoreError::BusClosed);
            }
            let mut next = Registry::clone(&self.inner.registry.load());
            let previous = next.insert(subscriber_id.clone(), Arc::clone(&entry));
            self.inner.registry.store(Arc::new(next));
            previous
        };

        self.spawn_delivery_path(entry, handler, &runtime);

        if let Some(previous) = previous {
            previous.revoke();
            debug!(subscriber_id = %subscriber_id, "替换已有订阅");
        }
        debug!(
            subscriber_id = %subscriber_id,
            mode = ?options.mode,
            "注册订阅"
        );
        Ok(())
    }

    fn spawn_delivery_path(&self, entry: Arc<SubscriberEntry>, handler: Arc<dyn EventHandler>, runtime: &Handle) {
        let handler_timeout = self.inner.config.handler_timeout();
        match entry.mode {
            DeliveryMode::Sync => {
                self.inner
                    .tracker
                    .spawn_on(run_sequential_path(entry, handler, handler_timeout), runtime);
            }
            DeliveryMode::Async => {
                let workers = Arc::clone(&self.inner.workers);
                let lane = Arc::new(Semaphore::new(self.inner.config.worker_pool_size.max(2) - 1));
                let tracker = self.inner.tracker.clone();
                self.inner.tracker.spawn_on(
                    run_pooled_dispatcher(entry, handler, handler_timeout, Pool { workers, lane }, tracker),
                    runtime,
                );
            }
        }
    }

    /// 取消订阅；未知 ID 时返回 false
    pub fn unsubscribe(&self, subscriber_id: &str) -> bool {
        self.remove_where(|id| id == subscriber_id) > 0
    }

    /// 移除命名空间下的全部订阅（`ns` 或 `ns.` 前缀）
    pub fn unsubscribe_namespace(&self, namespace: &str) -> usize {
        let prefix = format!("{}.", namespace);
        self.remove_where(|id| id == namespace || id.starts_with(&prefix))
    }

    fn remove_where(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let removed: Vec<Arc<SubscriberEntry>> = {
            let _guard = self.inner.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let current = self.inner.registry.load();
            if !current.keys().any(|id| predicate(id)) {
                return 0;
            }
            let mut next = Registry::with_capacity(current.len());
            let mut removed = Vec::new();
            for (id, entry) in current.iter() {
                if predicate(id) {
                    removed.push(Arc::clone(entry));
                } else {
                    next.insert(id.clone(), Arc::clone(entry));
                }
            }
            self.inner.registry.store(Arc::new(next));
            removed
        };

        for entry in &removed {
            entry.revoke();
            debug!(subscriber_id = %entry.id, "取消订阅");
        }
        removed.len()
    }

    /// 发布事件
    ///
    /// 仅在事件进入所有匹配订阅者的队列后返回。block-publisher 策略的订阅者
    /// 在超时后仍满时返回 `QueueFull`，其余订阅者的投递不受影响。
    pub async fn publish(
        &self,
        topic: &str,
        source: &str,
        payload: Value,
        correlation_id: Option<String>,
    ) -> CoreResult<Uuid> {
        validate_topic(topic)?;
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(CoreError::BusClosed);
        }

        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let event = Arc::new(Event::new(sequence, topic, source, payload, correlation_id));
        let snapshot = self.inner.registry.load_full();

        let mut targets: Vec<&Arc<SubscriberEntry>> =
            snapshot.values().filter(|entry| entry.accepts(&event)).collect();
        targets.sort_by(|a, b| a.id.cmp(&b.id));

        let mut blocking = Vec::new();
        for entry in targets {
            if entry.overflow == OverflowPolicy::BlockPublisher {
                blocking.push(entry);
                continue;
            }
            match entry.queue.try_push(&event, entry.overflow) {
                PushOutcome::DroppedOldest | PushOutcome::DroppedNewest => {
                    entry.record_drop(&event, entry.overflow)
                }
                _ => {}
            }
        }

        let wait = self.inner.config.publish_timeout();
        let mut full = None;
        for entry in blocking {
            if entry.queue.push(&event, OverflowPolicy::BlockPublisher, wait).await == PushOutcome::Full {
                entry.record_drop(&event, OverflowPolicy::BlockPublisher);
                full.get_or_insert_with(|| entry.id.clone());
            }
        }

        self.inner.published.fetch_add(1, Ordering::Relaxed);
        trace!(topic = %topic, source = %source, event_id = %event.id(), sequence, "发布事件");

        match full {
            Some(subscriber_id) => Err(CoreError::QueueFull {
                subscriber_id,
                topic: topic.to_string(),
            }),
            None => Ok(event.id()),
        }
    }

    pub fn is_subscribed(&self, subscriber_id: &str) -> bool {
        self.inner.registry.load().contains_key(subscriber_id)
    }

    /// 当前订阅者 ID（已排序）
    pub fn subscriber_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.registry.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.registry.load().len()
    }

    /// 一致快照上的统计
    pub fn stats(&self) -> BusStats {
        let snapshot = self.inner.registry.load();
        let mut subscribers: Vec<SubscriberStats> = snapshot.values().map(|e| e.stats()).collect();
        subscribers.sort_by(|a, b| a.subscriber_id.cmp(&b.subscriber_id));

        BusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            subscription_count: subscribers.len(),
            closed: self.is_closed(),
            subscribers,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// 关闭总线：拒绝新的发布和订阅，撤销全部订阅并等待在途投递
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let drained = {
            let _guard = self.inner.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.inner.registry.swap(Arc::new(Registry::new()))
        };
        for entry in drained.values() {
            entry.revoke();
        }

        self.inner.shutdown.cancel();
        self.inner.tracker.close();

        let timeout = self.inner.config.shutdown_timeout();
        if tokio::time::timeout(timeout, self.inner.tracker.wait()).await.is_err() {
            warn!(timeout_ms = timeout.as_millis() as u64, "部分投递任务未在关闭超时内结束");
        }
        info!(subscriptions = drained.len(), "事件总线已关闭");
    }
}

/// 同步模式：单任务顺序投递
async fn run_sequential_path(
    entry: Arc<SubscriberEntry>,
    handler: Arc<dyn EventHandler>,
    handler_timeout: Option<Duration>,
) {
    while let Some(event) = entry.queue.pop().await {
        if entry.revoked.is_cancelled() {
            break;
        }
        deliver(&entry, handler.as_ref(), event, handler_timeout).await;
    }
    trace!(subscriber_id = %entry.id, "顺序投递路径退出");
}

/// 异步订阅者的工作槽：共享池加上单个订阅者的并发上限
struct Pool {
    workers: Arc<Semaphore>,
    /// 比共享池少一个槽，挂起的处理器占不满共享池
    lane: Arc<Semaphore>,
}

/// 异步模式：分发到共享工作池
async fn run_pooled_dispatcher(
    entry: Arc<SubscriberEntry>,
    handler: Arc<dyn EventHandler>,
    handler_timeout: Option<Duration>,
    pool: Pool,
    tracker: TaskTracker,
) {
    while let Some(event) = entry.queue.pop().await {
        // 先占本订阅者的槽，再占共享槽
        let permits = tokio::select! {
            permits = async {
                let lane = Arc::clone(&pool.lane).acquire_owned().await?;
                let worker = Arc::clone(&pool.workers).acquire_owned().await?;
                Ok::<_, tokio::sync::AcquireError>((lane, worker))
            } => match permits {
                Ok(permits) => permits,
                Err(_) => break,
            },
            _ = entry.revoked.cancelled() => break,
        };
        if entry.revoked.is_cancelled() {
            break;
        }

        let entry = Arc::clone(&entry);
        let handler = Arc::clone(&handler);
        tracker.spawn(async move {
            let _permits = permits;
            deliver(&entry, handler.as_ref(), event, handler_timeout).await;
        });
    }
    trace!(subscriber_id = %entry.id, "工作池分发器退出");
}

async fn deliver(
    entry: &SubscriberEntry,
    handler: &dyn EventHandler,
    event: Arc<Event>,
    handler_timeout: Option<Duration>,
) {
    match guarded(handler_timeout, handler.handle(Arc::clone(&event))).await {
        Ok(()) => {
            entry.counters.delivered.fetch_add(1, Ordering::Relaxed);
        }
        Err(failure) => {
            entry.counters.failed.fetch_add(1, Ordering::Relaxed);
            match failure {
                HookFailure::Panic(_) => error!(
                    subscriber_id = %entry.id,
                    topic = %event.topic(),
                    event_id = %event.id(),
                    error = %failure,
                    "事件处理器 panic"
                ),
                _ => warn!(
                    subscriber_id = %entry.id,
                    topic = %event.topic(),
                    event_id = %event.id(),
                    error = %failure,
                    "事件处理失败"
                ),
            }
        }
    }
}
