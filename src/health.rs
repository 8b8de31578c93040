// 系统健康状态
// 管理器健康聚合为单一进程状态

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::bus::BusStats;
use crate::core::{CorePhase, HealthReport, ManagerHealth, ManagerState};

/// 进程健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// 单个管理器的健康状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// 生命周期状态
    pub state: ManagerState,
    pub status: HealthStatus,
    pub detail: Option<String>,
    /// 健康检查耗时（毫秒）
    pub response_time_ms: Option<u64>,
    pub last_check: DateTime<Utc>,
}

impl ComponentHealth {
    pub fn new(state: ManagerState, report: Option<&HealthReport>, response_time_ms: Option<u64>) -> Self {
        Self {
            state,
            status: Self::classify(state, report),
            detail: report.and_then(|r| r.detail.clone()),
            response_time_ms,
            last_check: Utc::now(),
        }
    }

    /// 运行中且自报正常才算健康
    pub fn classify(state: ManagerState, report: Option<&HealthReport>) -> HealthStatus {
        match (state, report.map(|r| r.status)) {
            (ManagerState::Running, Some(ManagerHealth::Running) | None) => HealthStatus::Healthy,
            (ManagerState::Running | ManagerState::Degraded, Some(ManagerHealth::Degraded)) => {
                HealthStatus::Degraded
            }
            (ManagerState::Degraded, Some(ManagerHealth::Running) | None) => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }
}

/// 系统健康快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub overall_status: HealthStatus,
    pub phase: CorePhase,
    pub components: BTreeMap<String, ComponentHealth>,
    pub bus: BusStats,
    /// 发生过溢出丢弃的订阅者
    pub overflowing_subscribers: Vec<String>,
    pub last_check: DateTime<Utc>,
}

impl SystemHealth {
    pub fn is_healthy(&self) -> bool {
        self.overall_status == HealthStatus::Healthy
    }

    pub fn unhealthy_components(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter(|(_, c)| c.status == HealthStatus::Unhealthy)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// 聚合组件状态：任一不健康即不健康，其次为降级
pub fn aggregate<'a>(components: impl IntoIterator<Item = &'a ComponentHealth>) -> HealthStatus {
    let mut overall = HealthStatus::Healthy;
    for component in components {
        match component.status {
            HealthStatus::Unhealthy => return HealthStatus::Unhealthy,
            HealthStatus::Degraded => overall = HealthStatus::Degraded,
            HealthStatus::Healthy => {}
        }
    }
    overall
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(state: ManagerState, report: HealthReport) -> ComponentHealth {
        ComponentHealth::new(state, Some(&report), Some(1))
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            ComponentHealth::classify(ManagerState::Running, Some(&HealthReport::running())),
            HealthStatus::Healthy
        );
        assert_eq!(
            ComponentHealth::classify(ManagerState::Running, Some(&HealthReport::degraded("slow"))),
            HealthStatus::Degraded
        );
        assert_eq!(
            ComponentHealth::classify(ManagerState::Running, Some(&HealthReport::failed("down"))),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            ComponentHealth::classify(ManagerState::Stopped, None),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            ComponentHealth::classify(ManagerState::Created, None),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_aggregate() {
        let healthy = component(ManagerState::Running, HealthReport::running());
        let degraded = component(ManagerState::Degraded, HealthReport::degraded("lag"));
        let failed = ComponentHealth::new(ManagerState::Failed, None, None);

        assert_eq!(aggregate([&healthy]), HealthStatus::Healthy);
        assert_eq!(aggregate([&healthy, &degraded]), HealthStatus::Degraded);
        assert_eq!(aggregate([&degraded, &failed, &healthy]), HealthStatus::Unhealthy);
        assert_eq!(degraded.detail.as_deref(), Some("lag"));
    }
}
