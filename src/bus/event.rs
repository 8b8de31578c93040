// 事件定义
// 发布时创建，之后不可变

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// 总线事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    id: Uuid,
    /// 总线内单调递增的发布序号
    sequence: u64,
    topic: String,
    source: String,
    payload: Value,
    timestamp: DateTime<Utc>,
    correlation_id: Option<String>,
}

impl Event {
    pub(crate) fn new(
        sequence: u64,
        topic: impl Into<String>,
        source: impl Into<String>,
        payload: Value,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            topic: topic.into(),
            source: source.into(),
            payload,
            timestamp: Utc::now(),
            correlation_id,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// 读取对象载荷中的字段
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.as_object().and_then(|map| map.get(key))
    }

    /// 主题的最后一段，如 `manager.db.started` 的 `started`
    pub fn kind(&self) -> &str {
        self.topic.rsplit('.').next().unwrap_or(&self.topic)
    }
}
