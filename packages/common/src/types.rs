// 通用类型定义

use serde::{Deserialize, Serialize};

/// 单个单元（管理器或插件）的失败记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitFailure {
    /// 失败的单元名称
    pub unit: String,
    /// 错误代码
    pub code: String,
    /// 错误消息
    pub message: String,
}

impl UnitFailure {
    pub fn new(unit: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}
