// 订阅者有界投递队列
// 满队列时按溢出策略处理；block-publisher 策略只阻塞发布方且有超时

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::bus::Event;

/// 队列溢出策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// 丢弃最旧的排队事件
    #[default]
    DropOldest,
    /// 丢弃新事件
    DropNewest,
    /// 阻塞发布方直到有空间或超时
    BlockPublisher,
}

/// 入队结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    DroppedOldest,
    DroppedNewest,
    /// 等待超时仍无空间
    Full,
    Closed,
}

struct QueueState {
    items: VecDeque<Arc<Event>>,
    closed: bool,
}

/// 单消费者有界队列
pub struct DeliveryQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    items_ready: Notify,
    space_ready: Notify,
}

impl DeliveryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            capacity: capacity.max(1),
            items_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// 立即入队，不等待
    pub fn try_push(&self, event: &Arc<Event>, policy: OverflowPolicy) -> PushOutcome {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            if state.items.len() < self.capacity {
                state.items.push_back(Arc::clone(event));
                PushOutcome::Enqueued
            } else {
                match policy {
                    OverflowPolicy::DropOldest => {
                        state.items.pop_front();
                        state.items.push_back(Arc::clone(event));
                        PushOutcome::DroppedOldest
                    }
                    OverflowPolicy::DropNewest => PushOutcome::DroppedNewest,
                    OverflowPolicy::BlockPublisher => PushOutcome::Full,
                }
            }
        };

        if matches!(outcome, PushOutcome::Enqueued | PushOutcome::DroppedOldest) {
            self.items_ready.notify_one();
        }
        outcome
    }

    /// 入队；BlockPublisher 策略下最多等待 `wait`
    pub async fn push(&self, event: &Arc<Event>, policy: OverflowPolicy, wait: Duration) -> PushOutcome {
        if policy != OverflowPolicy::BlockPublisher {
            return self.try_push(event, policy);
        }

        let deadline = Instant::now() + wait;
        loop {
            let notified = self.space_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_push(event, policy) {
                PushOutcome::Full => {}
                outcome => return outcome,
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_push(event, policy);
            }
        }
    }

    /// 取出下一个事件；队列关闭后返回 None
    pub async fn pop(&self) -> Option<Arc<Event>> {
        loop {
            let notified = self.items_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(event) = state.items.pop_front() {
                    drop(state);
                    self.space_ready.notify_waiters();
                    return Some(event);
                }
            }

            notified.await;
        }
    }

    /// 关闭队列并丢弃尚未分发的事件，返回丢弃数量
    pub fn close(&self) -> usize {
        let discarded = {
            let mut state = self.lock();
            state.closed = true;
            let count = state.items.len();
            state.items.clear();
            count
        };
        self.items_ready.notify_waiters();
        self.space_ready.notify_waiters();
        discarded
    }
}
