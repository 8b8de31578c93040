// 内置插件入口
// event_logger：以 debug 级别记录总线上的每个事件

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::bus::{DeliveryMode, handler_fn};
use crate::errors::CoreResult;
use crate::plugins::interface::{Plugin, PluginFactory, PluginHandle, factory_fn};
use crate::plugins::manager::PluginManager;

pub const EVENT_LOGGER_ENTRY: &str = "event_logger";

const EVENT_LOGGER_SUBSCRIPTION: &str = "events";

/// 事件日志插件
pub struct EventLoggerPlugin {
    handle: Option<PluginHandle>,
    observed: Arc<AtomicU64>,
}

impl EventLoggerPlugin {
    pub fn new() -> Self {
        Self {
            handle: None,
            observed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn observed(&self) -> u64 {
        self.observed.load(Ordering::Relaxed)
    }
}

impl Default for EventLoggerPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for EventLoggerPlugin {
    async fn initialize(&mut self, handle: PluginHandle) -> anyhow::Result<()> {
        let observed = Arc::clone(&self.observed);
        let plugin = handle.name().to_string();
        handle.bus().subscribe(
            EVENT_LOGGER_SUBSCRIPTION,
            "**",
            handler_fn(move |event| {
                observed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    plugin = %plugin,
                    topic = %event.topic(),
                    source = %event.source(),
                    sequence = event.sequence(),
                    payload = %event.payload(),
                    "总线事件"
                );
                async { Ok(()) }
            }),
            DeliveryMode::Sync,
        )?;

        info!(plugin = %handle.name(), version = %handle.version(), "事件日志插件已启动");
        self.handle = Some(handle);
        Ok(())
    }

    async fn shutdown(&mut self) -> anyhow::Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.bus().unsubscribe(EVENT_LOGGER_SUBSCRIPTION);
            info!(plugin = %handle.name(), observed = self.observed(), "事件日志插件已停止");
        }
        Ok(())
    }
}

pub fn event_logger_factory() -> Arc<dyn PluginFactory> {
    factory_fn(|_manifest| Ok(Box::new(EventLoggerPlugin::new()) as Box<dyn Plugin>))
}

/// 注册全部内置入口
pub fn register_builtin_entry_points(manager: &PluginManager) -> CoreResult<()> {
    manager.register_entry_point(EVENT_LOGGER_ENTRY, event_logger_factory())
}
