// 统一错误类型定义

use nexus_common::{CommonError, UnitFailure};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 微内核统一错误类型
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "error_type", content = "details")]
pub enum CoreError {
    /// 主题不符合分段命名规则
    #[error("非法主题: {topic} - {reason}")]
    InvalidTopic { topic: String, reason: String },

    /// 订阅模式通配符语法错误
    #[error("非法订阅模式: {pattern} - {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// block-publisher 策略下等待超时
    #[error("订阅者队列已满: {subscriber_id} (主题 {topic})")]
    QueueFull { subscriber_id: String, topic: String },

    #[error("事件总线已关闭")]
    BusClosed,

    /// 管理器名称重复
    #[error("管理器重复注册: {name}")]
    DuplicateManager { name: String },

    /// 插件与管理器争用同一订阅命名空间
    #[error("命名空间冲突: {name} 已被{owner}占用")]
    NamespaceConflict { name: String, owner: String },

    /// 依赖图中存在环
    #[error("检测到循环依赖: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// 依赖的单元未声明
    #[error("缺失依赖: {unit} 依赖未知单元 {dependency}")]
    MissingDependency { unit: String, dependency: String },

    /// 插件依赖版本范围不满足
    #[error("依赖不满足: {plugin} 需要 {dependency} {requirement} (当前: {})", found.as_deref().unwrap_or("无"))]
    UnsatisfiedDependency {
        plugin: String,
        dependency: String,
        requirement: String,
        found: Option<String>,
    },

    /// 插件所需管理器未注册或未运行
    #[error("缺失能力: {plugin} 需要管理器 {capability}")]
    MissingCapability { plugin: String, capability: String },

    /// 插件实例化或初始化失败
    #[error("插件加载失败: {plugin} - {message}")]
    PluginLoadFailure { plugin: String, message: String },

    #[error("管理器初始化失败: {manager} - {message}")]
    ManagerInitialization { manager: String, message: String },

    #[error("管理器关闭失败: {manager} - {message}")]
    ManagerShutdown { manager: String, message: String },

    /// 插件关闭钩子失败（清理仍已完成）
    #[error("插件关闭失败: {plugin} - {message}")]
    PluginShutdown { plugin: String, message: String },

    /// 启动中止，已回滚的管理器失败一并记录
    #[error("启动中止: 管理器 {manager} 失败 ({cause})")]
    StartupAborted {
        manager: String,
        cause: Box<CoreError>,
        rollback_failures: Vec<UnitFailure>,
    },

    /// 尽力而为操作的汇总失败
    #[error("{operation} 存在 {} 个失败单元", failures.len())]
    Aggregate {
        operation: String,
        failures: Vec<UnitFailure>,
    },

    #[error("非法状态转换: {unit} {from} -> {to}")]
    InvalidState { unit: String, from: String, to: String },

    #[error("非法名称: {name} - {reason}")]
    InvalidName { name: String, reason: String },

    #[error("资源未找到: {resource}")]
    NotFound { resource: String },

    /// 插件清单格式错误
    #[error("插件清单无效: {path} - {message}")]
    ManifestInvalid { path: String, message: String },

    /// 仍有活跃插件依赖目标插件
    #[error("插件 {plugin} 仍被依赖: {}", dependents.join(", "))]
    DependentsActive { plugin: String, dependents: Vec<String> },

    #[error("插件已禁用: {plugin}")]
    PluginDisabled { plugin: String },

    /// 作用域句柄已被撤销
    #[error("订阅命名空间已撤销: {namespace}")]
    Revoked { namespace: String },

    #[error("操作超时: {operation}")]
    Timeout { operation: String },

    #[error("配置错误: {message}")]
    Configuration { message: String },

    #[error("IO 错误: {message}")]
    Io { message: String },

    #[error("内部错误: {message}")]
    Internal { message: String },
}

impl CoreError {
    /// 获取错误代码
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidTopic { .. } => "INVALID_TOPIC",
            Self::InvalidPattern { .. } => "INVALID_PATTERN",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::BusClosed => "BUS_CLOSED",
            Self::DuplicateManager { .. } => "DUPLICATE_MANAGER",
            Self::NamespaceConflict { .. } => "NAMESPACE_CONFLICT",
            Self::CyclicDependency { .. } => "CYCLIC_DEPENDENCY",
            Self::MissingDependency { .. } => "MISSING_DEPENDENCY",
            Self::UnsatisfiedDependency { .. } => "UNSATISFIED_DEPENDENCY",
            Self::MissingCapability { .. } => "MISSING_CAPABILITY",
            Self::PluginLoadFailure { .. } => "PLUGIN_LOAD_FAILURE",
            Self::ManagerInitialization { .. } => "MANAGER_INITIALIZATION_ERROR",
            Self::ManagerShutdown { .. } => "MANAGER_SHUTDOWN_ERROR",
            Self::PluginShutdown { .. } => "PLUGIN_SHUTDOWN_ERROR",
            Self::StartupAborted { .. } => "STARTUP_ABORTED",
            Self::Aggregate { .. } => "AGGREGATE_FAILURE",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::InvalidName { .. } => "INVALID_NAME",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::ManifestInvalid { .. } => "MANIFEST_INVALID",
            Self::DependentsActive { .. } => "DEPENDENTS_ACTIVE",
            Self::PluginDisabled { .. } => "PLUGIN_DISABLED",
            Self::Revoked { .. } => "REVOKED",
            Self::Timeout { .. } => "TIMEOUT_ERROR",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::Io { .. } => "IO_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// 结构性错误在任何状态变更之前被检测
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::InvalidTopic { .. }
                | Self::InvalidPattern { .. }
                | Self::InvalidName { .. }
                | Self::DuplicateManager { .. }
                | Self::NamespaceConflict { .. }
                | Self::CyclicDependency { .. }
                | Self::MissingDependency { .. }
                | Self::ManifestInvalid { .. }
                | Self::Configuration { .. }
        )
    }

    /// 转换为汇总报告中的一行
    pub fn to_unit_failure(&self, unit: impl Into<String>) -> UnitFailure {
        UnitFailure::new(unit, self.error_code(), self.to_string())
    }

    pub fn invalid_topic(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTopic {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_pattern(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn missing_dependency(unit: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self::MissingDependency {
            unit: unit.into(),
            dependency: dependency.into(),
        }
    }

    pub fn namespace_conflict(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self::NamespaceConflict {
            name: name.into(),
            owner: owner.into(),
        }
    }

    pub fn plugin_load_failure(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PluginLoadFailure {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    pub fn invalid_state(
        unit: impl Into<String>,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidState {
            unit: unit.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn manifest_invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ManifestInvalid {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// 从 CommonError 转换
impl From<CommonError> for CoreError {
    fn from(err: CommonError) -> Self {
        match err {
            CommonError::Validation { field, message } => {
                Self::configuration(format!("{}: {}", field, message))
            }
            CommonError::NotFound { resource } => Self::not_found(resource),
            CommonError::Configuration { message } => Self::configuration(message),
            CommonError::Internal { message } => Self::internal(message),
        }
    }
}

/// 从 config::ConfigError 转换
impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        Self::configuration(format!("配置加载错误: {}", err))
    }
}

/// 从 std::io::Error 转换
impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(format!("文件或目录: {}", err)),
            std::io::ErrorKind::TimedOut => Self::timeout("文件操作"),
            _ => Self::Io {
                message: err.to_string(),
            },
        }
    }
}

/// 从 toml::de::Error 转换
impl From<toml::de::Error> for CoreError {
    fn from(err: toml::de::Error) -> Self {
        Self::manifest_invalid("<toml>", err.to_string())
    }
}

/// 从 semver::Error 转换
impl From<semver::Error> for CoreError {
    fn from(err: semver::Error) -> Self {
        Self::manifest_invalid("<semver>", format!("版本格式错误: {}", err))
    }
}

/// 从 serde_json::Error 转换
impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("JSON 序列化错误: {}", err))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
