// 日志上下文管理
// 每个生命周期操作一个操作 ID 与 span

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Span;
use uuid::Uuid;

/// 生命周期操作上下文
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationContext {
    pub operation_id: Uuid,
    /// 操作名称，如 `start_all`、`plugin.load`
    pub operation: String,
    /// 操作目标（管理器或插件名）
    pub unit: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl OperationContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            operation: operation.into(),
            unit: None,
            started_at: Utc::now(),
        }
    }

    pub fn for_unit(operation: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            unit: Some(unit.into()),
            ..Self::new(operation)
        }
    }

    /// 操作 span
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "lifecycle",
            operation = %self.operation,
            unit = self.unit.as_deref().unwrap_or("*"),
            operation_id = %self.operation_id,
        )
    }

    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }
}
