// 错误报告格式化
// 将 CoreError 展开为面向运维的汇总报告

use chrono::{DateTime, Utc};
use nexus_common::UnitFailure;
use serde::{Deserialize, Serialize};

use crate::errors::CoreError;

/// 失败报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub code: String,
    pub message: String,
    /// 每个失败单元及其错误类型
    pub failures: Vec<UnitFailure>,
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub operation_id: Option<String>,
}

impl FailureReport {
    /// 从 CoreError 创建报告
    pub fn from_error(error: &CoreError) -> Self {
        let mut details = None;
        let failures = match error {
            CoreError::StartupAborted {
                manager,
                cause,
                rollback_failures,
            } => {
                let mut failures = vec![cause.to_unit_failure(manager.clone())];
                failures.extend(rollback_failures.iter().cloned());
                failures
            }
            CoreError::Aggregate { failures, .. } => failures.clone(),
            CoreError::CyclicDependency { cycle } => {
                details = Some(serde_json::json!({ "cycle": cycle }));
                Vec::new()
            }
            CoreError::DependentsActive { dependents, .. } => {
                details = Some(serde_json::json!({ "dependents": dependents }));
                Vec::new()
            }
            CoreError::QueueFull { subscriber_id, topic } => {
                details = Some(serde_json::json!({
                    "subscriber_id": subscriber_id,
                    "topic": topic,
                }));
                Vec::new()
            }
            _ => Vec::new(),
        };

        Self {
            code: error.error_code().to_string(),
            message: error.to_string(),
            failures,
            details,
            timestamp: Utc::now(),
            operation_id: None,
        }
    }

    /// 设置操作 ID
    pub fn with_operation_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    /// 失败单元名称列表
    pub fn failed_units(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.unit.as_str()).collect()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }
}
