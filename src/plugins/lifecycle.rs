// 插件生命周期管理
// 插件状态机与状态转换记录

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::errors::{CoreError, CoreResult};
use crate::plugins::interface::PluginDescriptor;

/// 插件状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Discovered,
    Validated,
    Loading,
    Active,
    Unloading,
    Unloaded,
    Failed,
}

impl PluginState {
    /// 允许的状态转换
    ///
    /// 非活跃状态都可以因重新发现回到 Discovered；Unloaded 与 Failed 可重新校验。
    pub fn can_transition_to(self, to: PluginState) -> bool {
        use PluginState::*;
        matches!(
            (self, to),
            (Discovered | Validated | Unloaded | Failed, Discovered)
                | (Discovered | Unloaded | Failed, Validated)
                | (Discovered | Validated | Unloaded, Failed)
                | (Validated, Loading)
                | (Loading, Active | Failed)
                | (Active, Unloading)
                | (Unloading, Unloaded | Failed)
        )
    }

    /// 持有插件实例的状态，重新发现不得覆盖
    pub fn is_live(self) -> bool {
        matches!(self, PluginState::Loading | PluginState::Active | PluginState::Unloading)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Validated => "validated",
            Self::Loading => "loading",
            Self::Active => "active",
            Self::Unloading => "unloading",
            Self::Unloaded => "unloaded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 生命周期状态转换
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: PluginState,
    pub to: PluginState,
    pub timestamp: DateTime<Utc>,
    /// 转换原因
    pub reason: String,
    pub error: Option<String>,
}

impl PluginDescriptor {
    /// 校验并记录状态转换，历史超过 `max_history` 时丢弃最旧记录
    pub fn transition(
        &mut self,
        to: PluginState,
        reason: &str,
        error: Option<String>,
        max_history: usize,
    ) -> CoreResult<PluginState> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(CoreError::invalid_state(self.name.clone(), from, to));
        }

        debug!(plugin = %self.name, from = %from, to = %to, reason, "插件状态转换");

        self.state = to;
        if error.is_some() {
            self.last_error = error.clone();
        } else if to != PluginState::Failed {
            self.last_error = None;
        }
        if to == PluginState::Active {
            self.activated_at = Some(Utc::now());
        }

        self.record_transition(from, to, reason, error, max_history);
        Ok(from)
    }

    /// 追加一条转换记录，不校验状态机
    pub(crate) fn record_transition(
        &mut self,
        from: PluginState,
        to: PluginState,
        reason: &str,
        error: Option<String>,
        max_history: usize,
    ) {
        self.transitions.push(StatusTransition {
            from,
            to,
            timestamp: Utc::now(),
            reason: reason.to_string(),
            error,
        });
        if self.transitions.len() > max_history {
            let excess = self.transitions.len() - max_history;
            self.transitions.drain(..excess);
        }
    }
}
