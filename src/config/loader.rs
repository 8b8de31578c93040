// 配置加载器
// 处理 .env、配置文件加载与校验

use crate::config::AppConfig;
use crate::errors::CoreError;
use dotenvy::dotenv;
use std::path::Path;
use tracing::{info, warn};

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 加载并校验配置
    pub fn init(file: Option<&Path>) -> Result<AppConfig, CoreError> {
        if let Err(e) = dotenv() {
            warn!("无法加载 .env 文件: {}", e);
        }

        let config = match file {
            Some(path) => AppConfig::load_from(Some(path))?,
            None => AppConfig::load()?,
        };

        config.validate()?;

        info!("配置加载成功");
        Self::log_summary(&config);

        Ok(config)
    }

    /// 打印配置摘要
    pub fn log_summary(config: &AppConfig) {
        info!(
            environment = %config.environment.name,
            version = %config.environment.version,
            "运行环境"
        );
        info!(
            queue_capacity = config.event_bus.queue_capacity,
            worker_pool_size = config.event_bus.worker_pool_size,
            overflow = ?config.event_bus.default_overflow,
            "事件总线配置"
        );
        info!(
            directory = %config.plugins.directory,
            autoload = config.plugins.autoload,
            disabled = ?config.plugins.disabled,
            "插件配置"
        );
    }
}
