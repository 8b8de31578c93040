// 配置验证器
// 收集所有无效字段而不是只报告第一个

use crate::config::{
    AppConfig, EnvironmentConfig, EventBusConfig, LifecycleConfig, LoggingConfig, PluginsConfig,
};
use crate::logging::LogFormat;
use nexus_common::CommonError;

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// 配置验证器
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证完整配置
    pub fn validate_all(config: &AppConfig) -> Result<(), Vec<CommonError>> {
        let mut errors = Vec::new();

        errors.extend(Self::validate_event_bus(&config.event_bus));
        errors.extend(Self::validate_lifecycle(&config.lifecycle));
        errors.extend(Self::validate_plugins(&config.plugins));
        errors.extend(Self::validate_logging(&config.logging));
        errors.extend(Self::validate_environment(&config.environment));

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// 验证事件总线配置
    pub fn validate_event_bus(config: &EventBusConfig) -> Vec<CommonError> {
        let mut errors = Vec::new();

        if config.queue_capacity == 0 {
            errors.push(CommonError::validation("event_bus.queue_capacity", "队列容量不能为 0"));
        }
        if config.worker_pool_size < 2 {
            errors.push(CommonError::validation("event_bus.worker_pool_size", "工作池大小不能小于 2"));
        }
        if config.publish_timeout_ms == 0 {
            errors.push(CommonError::validation("event_bus.publish_timeout_ms", "发布等待超时不能为 0"));
        }
        if config.handler_timeout_ms == Some(0) {
            errors.push(CommonError::validation("event_bus.handler_timeout_ms", "处理器超时不能为 0"));
        }

        errors
    }

    /// 验证生命周期配置
    pub fn validate_lifecycle(config: &LifecycleConfig) -> Vec<CommonError> {
        let mut errors = Vec::new();

        if config.initialize_timeout_secs == 0 {
            errors.push(CommonError::validation("lifecycle.initialize_timeout_secs", "初始化超时不能为 0"));
        }
        if config.shutdown_timeout_secs == 0 {
            errors.push(CommonError::validation("lifecycle.shutdown_timeout_secs", "关闭超时不能为 0"));
        }

        errors
    }

    /// 验证插件配置
    pub fn validate_plugins(config: &PluginsConfig) -> Vec<CommonError> {
        let mut errors = Vec::new();

        if config.directory.trim().is_empty() {
            errors.push(CommonError::validation("plugins.directory", "插件目录不能为空"));
        }
        if config.manifest_file.trim().is_empty() || !config.manifest_file.ends_with(".toml") {
            errors.push(CommonError::validation("plugins.manifest_file", "清单文件必须是 .toml 文件"));
        }
        if config.max_manifest_bytes == 0 {
            errors.push(CommonError::validation("plugins.max_manifest_bytes", "清单大小上限不能为 0"));
        }
        if config.max_version_history == 0 {
            errors.push(CommonError::validation("plugins.max_version_history", "版本历史上限不能为 0"));
        }
        if config.initialize_timeout_secs == 0 || config.shutdown_timeout_secs == 0 {
            errors.push(CommonError::validation("plugins", "插件超时不能为 0"));
        }

        errors
    }

    /// 验证日志配置
    pub fn validate_logging(config: &LoggingConfig) -> Vec<CommonError> {
        let mut errors = Vec::new();

        if !VALID_LEVELS.contains(&config.level.to_lowercase().as_str()) {
            errors.push(CommonError::validation(
                "logging.level",
                format!("无效的日志级别: {}", config.level),
            ));
        }
        if config.format.parse::<LogFormat>().is_err() {
            errors.push(CommonError::validation(
                "logging.format",
                format!("无效的日志格式: {}", config.format),
            ));
        }
        if config.file_enabled && config.file_path.as_deref().is_none_or(str::is_empty) {
            errors.push(CommonError::validation("logging.file_path", "启用文件日志时必须指定路径"));
        }

        errors
    }

    /// 验证环境配置
    pub fn validate_environment(config: &EnvironmentConfig) -> Vec<CommonError> {
        let mut errors = Vec::new();

        if !["development", "test", "staging", "production"].contains(&config.name.as_str()) {
            errors.push(CommonError::validation(
                "environment.name",
                format!("无效的环境名称: {}", config.name),
            ));
        }

        errors
    }
}
