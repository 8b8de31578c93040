// 插件作用域总线代理
// 订阅 ID 统一加上插件名前缀，并记录到订阅台账中以便卸载时完整撤销

use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

use crate::bus::{DeliveryMode, EventBus, EventHandler, SubscribeOptions};
use crate::errors::{CoreError, CoreResult};

#[derive(Default)]
struct LedgerState {
    ids: BTreeSet<String>,
    revoked: bool,
}

/// 订阅台账：记录插件注册过的全部订阅 ID
#[derive(Default)]
pub struct SubscriptionLedger {
    state: Mutex<LedgerState>,
    detached: AtomicBool,
}

impl SubscriptionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前记录的订阅 ID
    pub fn ids(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ids
            .iter()
            .cloned()
            .collect()
    }

    /// 撤销台账：之后的订阅请求全部失败，返回曾注册的 ID
    pub fn revoke(&self) -> Vec<String> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.revoked = true;
        state.ids.iter().cloned().collect()
    }

    pub fn is_revoked(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).revoked
    }

    /// 插件卸载完成后调用，之后句柄也不能再发布
    pub fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

/// 作用域总线代理
#[derive(Clone)]
pub struct ScopedBus {
    bus: EventBus,
    namespace: String,
    ledger: Arc<SubscriptionLedger>,
}

impl ScopedBus {
    pub fn new(bus: EventBus, namespace: impl Into<String>) -> Self {
        Self {
            bus,
            namespace: namespace.into(),
            ledger: Arc::new(SubscriptionLedger::new()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub(crate) fn ledger(&self) -> Arc<SubscriptionLedger> {
        Arc::clone(&self.ledger)
    }

    fn full_id(&self, local_id: &str) -> String {
        format!("{}.{}", self.namespace, local_id)
    }

    /// 以命名空间名义发布事件
    pub async fn publish(
        &self,
        topic: &str,
        payload: Value,
        correlation_id: Option<String>,
    ) -> CoreResult<Uuid> {
        if self.ledger.is_detached() {
            return Err(CoreError::Revoked {
                namespace: self.namespace.clone(),
            });
        }
        self.bus.publish(topic, &self.namespace, payload, correlation_id).await
    }

    pub fn subscribe(
        &self,
        local_id: &str,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
        mode: DeliveryMode,
    ) -> CoreResult<String> {
        self.subscribe_with(local_id, pattern, handler, SubscribeOptions::new(mode))
    }

    /// 注册订阅，返回完整订阅 ID `<namespace>.<local_id>`
    pub fn subscribe_with(
        &self,
        local_id: &str,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> CoreResult<String> {
        if local_id.trim().is_empty() {
            return Err(CoreError::invalid_name(local_id, "订阅 ID 不能为空"));
        }
        let full_id = self.full_id(local_id);

        // 持锁注册，与撤销互斥
        let mut state = self.ledger.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.revoked {
            return Err(CoreError::Revoked {
                namespace: self.namespace.clone(),
            });
        }
        self.bus.subscribe_with(full_id.clone(), pattern, handler, options)?;
        state.ids.insert(full_id.clone());

        Ok(full_id)
    }

    pub fn unsubscribe(&self, local_id: &str) -> bool {
        self.bus.unsubscribe(&self.full_id(local_id))
    }

    /// 本命名空间当前在总线上的订阅
    pub fn subscriber_ids(&self) -> Vec<String> {
        let prefix = format!("{}.", self.namespace);
        self.bus
            .subscriber_ids()
            .into_iter()
            .filter(|id| id.starts_with(&prefix))
            .collect()
    }
}
