// 应用程序设置和配置
// 定义配置结构体和加载逻辑

use config::{Config, ConfigError, Environment, File};
use nexus_common::CommonError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::bus::OverflowPolicy;

/// 默认配置文件名（不含扩展名）
pub const DEFAULT_CONFIG_FILE: &str = "nexus";

/// 应用程序配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub event_bus: EventBusConfig,
    pub lifecycle: LifecycleConfig,
    pub plugins: PluginsConfig,
    pub logging: LoggingConfig,
    pub environment: EnvironmentConfig,
}

/// 事件总线配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// 每个订阅者的入站队列容量
    pub queue_capacity: usize,
    /// 异步投递工作池大小
    pub worker_pool_size: usize,
    /// block-publisher 策略的最长等待时间
    pub publish_timeout_ms: u64,
    /// 单次处理器调用超时，None 表示不限制
    pub handler_timeout_ms: Option<u64>,
    /// 关闭时等待在途投递的时间
    pub shutdown_timeout_ms: u64,
    pub default_overflow: OverflowPolicy,
}

impl EventBusConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            worker_pool_size: 4,
            publish_timeout_ms: 5000,
            handler_timeout_ms: Some(30_000),
            shutdown_timeout_ms: 5000,
            default_overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// 管理器生命周期配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub initialize_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl LifecycleConfig {
    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_secs(self.initialize_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            initialize_timeout_secs: 30,
            shutdown_timeout_secs: 30,
        }
    }
}

/// 插件系统配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// 插件目录
    pub directory: String,
    /// 插件清单文件名
    pub manifest_file: String,
    /// 启动时是否自动加载发现的插件
    pub autoload: bool,
    /// 禁用的插件列表
    pub disabled: Vec<String>,
    pub max_manifest_bytes: u64,
    pub max_version_history: usize,
    pub max_transition_history: usize,
    pub initialize_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl PluginsConfig {
    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_secs(self.initialize_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            directory: "plugins".to_string(),
            manifest_file: "plugin.toml".to_string(),
            autoload: true,
            disabled: Vec::new(),
            max_manifest_bytes: 64 * 1024,
            max_version_history: 10,
            max_transition_history: 32,
            initialize_timeout_secs: 30,
            shutdown_timeout_secs: 30,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub file_enabled: bool,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_enabled: false,
            file_path: None,
        }
    }
}

/// 环境配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    pub debug: bool,
    pub version: String,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            name: "development".to_string(),
            debug: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl AppConfig {
    /// 从默认值、配置文件和环境变量加载配置
    pub fn load() -> Result<Self, ConfigError> {
        let default_file = Path::new(DEFAULT_CONFIG_FILE).with_extension("toml");
        if default_file.exists() {
            Self::load_from(Some(&default_file))
        } else {
            Self::load_from(None)
        }
    }

    /// 从指定配置文件加载配置
    pub fn load_from(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Config::builder();

        // 1. 加载默认配置
        config = config.add_source(Config::try_from(&AppConfig::default())?);

        // 2. 加载配置文件
        if let Some(path) = file {
            config = config.add_source(File::from(path).required(true));
        }

        // 3. 加载环境变量（优先级最高）
        config = config.add_source(
            Environment::with_prefix("NEXUS")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("plugins.disabled")
                .try_parsing(true),
        );

        let mut app_config: AppConfig = config.build()?.try_deserialize()?;
        app_config.environment.version = env!("CARGO_PKG_VERSION").to_string();

        Ok(app_config)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<(), CommonError> {
        use crate::config::ConfigValidator;

        match ConfigValidator::validate_all(self) {
            Ok(()) => Ok(()),
            Err(errors) => {
                let error_messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                Err(CommonError::configuration(format!(
                    "配置验证失败: {}",
                    error_messages.join("; ")
                )))
            }
        }
    }

    /// 按点分路径读取配置项，例如 `event_bus.queue_capacity`
    pub fn lookup(&self, key: &str) -> Option<serde_json::Value> {
        let mut current = serde_json::to_value(self).ok()?;
        for part in key.split('.') {
            current = current.get_mut(part)?.take();
        }
        Some(current)
    }
}
