// 内置服务模块
// 由二进制注册到应用核心的管理器

pub mod config_service;
pub mod monitoring;

#[cfg(test)]
mod tests;

pub use config_service::*;
pub use monitoring::*;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::ApplicationCore;
use crate::errors::CoreResult;

/// 注册内置管理器：`config` 与依赖它的 `monitoring`
pub fn register_builtin_services(core: &ApplicationCore, config: AppConfig) -> CoreResult<()> {
    core.register(CONFIG_SERVICE, Vec::<String>::new(), Arc::new(ConfigService::new(Some(config))))?;
    core.register(MONITORING_SERVICE, [CONFIG_SERVICE], Arc::new(MonitoringService::new()))?;
    Ok(())
}
