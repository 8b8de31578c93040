// 管理器能力契约
// 常驻核心服务：initialize / shutdown / health

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::bus::EventBus;

/// 管理器自报健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerHealth {
    Running,
    Degraded,
    Failed,
}

/// 健康报告
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: ManagerHealth,
    pub detail: Option<String>,
}

impl HealthReport {
    pub fn running() -> Self {
        Self {
            status: ManagerHealth::Running,
            detail: None,
        }
    }

    pub fn degraded(detail: impl Into<String>) -> Self {
        Self {
            status: ManagerHealth::Degraded,
            detail: Some(detail.into()),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: ManagerHealth::Failed,
            detail: Some(detail.into()),
        }
    }
}

/// 管理器接口
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    /// 初始化；只能访问总线和已运行的依赖管理器
    async fn initialize(&self, context: &ManagerContext) -> anyhow::Result<()>;

    async fn shutdown(&self) -> anyhow::Result<()>;

    async fn health(&self) -> HealthReport;

    /// 只读查询入口，插件通过它使用声明的能力
    async fn query(&self, _key: &str) -> Option<serde_json::Value> {
        None
    }
}

/// 管理器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Created,
    Initializing,
    Running,
    Degraded,
    ShuttingDown,
    Stopped,
    Failed,
}

impl ManagerState {
    /// 允许的状态转换；Stopped 与 Failed 可重新初始化
    pub fn can_transition_to(self, to: ManagerState) -> bool {
        use ManagerState::*;
        matches!(
            (self, to),
            (Created | Stopped | Failed, Initializing)
                | (Initializing, Running | Failed)
                | (Running, Degraded | ShuttingDown | Failed)
                | (Degraded, Running | ShuttingDown | Failed)
                | (ShuttingDown, Stopped | Failed)
        )
    }

    pub fn is_live(self) -> bool {
        matches!(self, ManagerState::Running | ManagerState::Degraded)
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// 管理器描述符
#[derive(Clone)]
pub struct ManagerDescriptor {
    pub name: String,
    pub dependencies: Vec<String>,
    pub instance: Arc<dyn Manager>,
    pub state: ManagerState,
    pub last_error: Option<String>,
}

impl fmt::Debug for ManagerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerDescriptor")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("state", &self.state)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

/// 初始化上下文
#[derive(Clone)]
pub struct ManagerContext {
    name: String,
    bus: EventBus,
    dependencies: HashMap<String, Arc<dyn Manager>>,
}

impl ManagerContext {
    pub(crate) fn new(name: impl Into<String>, bus: EventBus, dependencies: HashMap<String, Arc<dyn Manager>>) -> Self {
        Self {
            name: name.into(),
            bus,
            dependencies,
        }
    }

    /// 正在初始化的管理器名称
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// 已运行的依赖管理器
    pub fn dependency(&self, name: &str) -> Option<Arc<dyn Manager>> {
        self.dependencies.get(name).cloned()
    }

    pub fn dependency_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.dependencies.keys().cloned().collect();
        names.sort();
        names
    }
}
