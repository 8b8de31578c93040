// 配置服务
// 持有已加载的应用配置，作为 `config` 管理器向插件提供只读查询

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::core::{HealthReport, Manager, ManagerContext};

/// 配置服务的管理器名称
pub const CONFIG_SERVICE: &str = "config";

pub struct ConfigService {
    config: Arc<AppConfig>,
}

impl ConfigService {
    pub fn new(config: Option<AppConfig>) -> Self {
        Self {
            config: Arc::new(config.unwrap_or_default()),
        }
    }

    pub fn config(&self) -> Arc<AppConfig> {
        Arc::clone(&self.config)
    }

    /// 按点分路径读取配置项
    pub fn lookup(&self, key: &str) -> Option<Value> {
        self.config.lookup(key)
    }
}

#[async_trait]
impl Manager for ConfigService {
    async fn initialize(&self, context: &ManagerContext) -> anyhow::Result<()> {
        let environment = self.config.environment.name.clone();
        context
            .bus()
            .publish(
                "config.loaded",
                context.name(),
                json!({
                    "environment": environment,
                    "plugins_directory": self.config.plugins.directory,
                    "autoload": self.config.plugins.autoload,
                }),
                None,
            )
            .await?;

        info!(environment = %environment, "配置服务已就绪");
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        debug!("配置服务关闭");
        Ok(())
    }

    async fn health(&self) -> HealthReport {
        HealthReport::running()
    }

    async fn query(&self, key: &str) -> Option<Value> {
        self.lookup(key)
    }
}
