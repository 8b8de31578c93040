// 监控服务
// 统计管理器与插件的生命周期事件；出现失败事件后自报降级

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

use crate::bus::{DeliveryMode, Event, EventBus, handler_fn};
use crate::core::{HealthReport, Manager, ManagerContext};
use crate::services::config_service::CONFIG_SERVICE;

/// 监控服务的管理器名称
pub const MONITORING_SERVICE: &str = "monitoring";

const MANAGER_SUBSCRIPTION: &str = "monitoring.manager_events";
const PLUGIN_SUBSCRIPTION: &str = "monitoring.plugin_events";

/// 生命周期事件计数
#[derive(Debug, Clone, Default, Serialize)]
pub struct LifecycleCounters {
    /// 按事件类型（主题末段）统计的管理器事件
    pub managers: BTreeMap<String, u64>,
    pub plugins: BTreeMap<String, u64>,
    pub failures: u64,
    /// 最近一次失败事件的主题
    pub last_failure: Option<String>,
}

impl LifecycleCounters {
    fn record(&mut self, event: &Event) {
        let kind = event.kind().to_string();
        let bucket = if event.topic().starts_with("plugin.") {
            &mut self.plugins
        } else {
            &mut self.managers
        };
        *bucket.entry(kind).or_insert(0) += 1;

        if event.kind() == "failed" {
            self.failures += 1;
            self.last_failure = Some(event.topic().to_string());
        }
    }

    pub fn manager_events(&self, kind: &str) -> u64 {
        self.managers.get(kind).copied().unwrap_or(0)
    }

    pub fn plugin_events(&self, kind: &str) -> u64 {
        self.plugins.get(kind).copied().unwrap_or(0)
    }
}

pub struct MonitoringService {
    counters: Arc<Mutex<LifecycleCounters>>,
    bus: Mutex<Option<EventBus>>,
}

impl MonitoringService {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Mutex::new(LifecycleCounters::default())),
            bus: Mutex::new(None),
        }
    }

    pub fn counters(&self) -> LifecycleCounters {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for MonitoringService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Manager for MonitoringService {
    async fn initialize(&self, context: &ManagerContext) -> anyhow::Result<()> {
        let bus = context.bus().clone();
        for (subscriber_id, pattern) in [(MANAGER_SUBSCRIPTION, "manager.**"), (PLUGIN_SUBSCRIPTION, "plugin.**")] {
            let counters = Arc::clone(&self.counters);
            bus.subscribe(
                subscriber_id,
                pattern,
                handler_fn(move |event| {
                    let failed = event.kind() == "failed";
                    counters
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .record(&event);
                    if failed {
                        warn!(topic = %event.topic(), error = ?event.field("error"), "监控到失败事件");
                    }
                    async { Ok(()) }
                }),
                DeliveryMode::Sync,
            )?;
        }

        if let Some(config) = context.dependency(CONFIG_SERVICE) {
            let environment = config.query("environment.name").await;
            info!(environment = ?environment, "监控服务已启动");
        }
        *self.bus.lock().unwrap_or_else(PoisonError::into_inner) = Some(bus);
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        let bus = self.bus.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(bus) = bus {
            bus.unsubscribe(MANAGER_SUBSCRIPTION);
            bus.unsubscribe(PLUGIN_SUBSCRIPTION);
        }
        info!(counters = ?self.counters(), "监控服务已停止");
        Ok(())
    }

    async fn health(&self) -> HealthReport {
        let counters = self.counters();
        match counters.last_failure {
            Some(topic) if counters.failures > 0 => {
                HealthReport::degraded(format!("已观察到 {} 次失败事件，最近一次: {}", counters.failures, topic))
            }
            _ => HealthReport::running(),
        }
    }

    async fn query(&self, key: &str) -> Option<Value> {
        let counters = self.counters();
        match key {
            "failures" => Some(json!(counters.failures)),
            "counters" => serde_json::to_value(&counters).ok(),
            _ => None,
        }
    }
}
