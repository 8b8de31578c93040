// 插件注册表
// 入口名称到插件工厂的映射，以及已激活版本的历史

use chrono::{DateTime, Utc};
use semver::Version;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

use crate::errors::{CoreError, CoreResult};
use crate::plugins::interface::{PluginDescriptor, PluginFactory};

/// 插件版本
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginVersion {
    pub version: Version,
    pub entry_point: String,
    pub checksum: Option<String>,
    /// 激活时间
    pub activated_at: DateTime<Utc>,
}

/// 插件注册表
pub struct PluginRegistry {
    factories: RwLock<HashMap<String, Arc<dyn PluginFactory>>>,
    history: RwLock<HashMap<String, Vec<PluginVersion>>>,
    /// 最大版本历史数
    max_version_history: usize,
}

impl PluginRegistry {
    /// 创建新的插件注册表
    pub fn new(max_version_history: usize) -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
            max_version_history: max_version_history.max(1),
        }
    }

    /// 注册入口；同名入口被替换
    pub fn register_entry_point(&self, entry_point: impl Into<String>, factory: Arc<dyn PluginFactory>) -> CoreResult<()> {
        let entry_point = entry_point.into();
        if entry_point.trim().is_empty() {
            return Err(CoreError::invalid_name(entry_point, "入口名称不能为空"));
        }

        let mut factories = self.factories.write().unwrap_or_else(PoisonError::into_inner);
        if factories.insert(entry_point.clone(), factory).is_some() {
            warn!(entry_point = %entry_point, "替换已注册的插件入口");
        } else {
            info!(entry_point = %entry_point, "注册插件入口");
        }
        Ok(())
    }

    pub fn factory(&self, entry_point: &str) -> Option<Arc<dyn PluginFactory>> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entry_point)
            .cloned()
    }

    pub fn has_entry_point(&self, entry_point: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(entry_point)
    }

    /// 记录一次成功激活
    pub fn record_activation(&self, descriptor: &PluginDescriptor) {
        let Some(manifest) = descriptor.manifest.as_ref() else {
            return;
        };

        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        let versions = history.entry(descriptor.name.clone()).or_default();
        versions.push(PluginVersion {
            version: manifest.version.clone(),
            entry_point: manifest.entry_point.clone(),
            checksum: descriptor.checksum.clone(),
            activated_at: descriptor.activated_at.unwrap_or_else(Utc::now),
        });

        // 限制版本历史长度
        if versions.len() > self.max_version_history {
            let excess = versions.len() - self.max_version_history;
            versions.drain(..excess);
        }
    }

    /// 按激活时间排序的版本历史
    pub fn version_history(&self, name: &str) -> Vec<PluginVersion> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::interface::{Plugin, PluginHandle, PluginManifest, factory_fn};
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct Noop;

    #[async_trait]
    impl Plugin for Noop {
        async fn initialize(&mut self, _handle: PluginHandle) -> anyhow::Result<()> {
            Ok(())
        }

        async fn shutdown(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn descriptor(version: &str) -> PluginDescriptor {
        let text = format!("name = \"audit\"\nversion = \"{version}\"\nentry_point = \"audit\"\n");
        let manifest = PluginManifest::parse(&text, "audit.toml").unwrap();
        PluginDescriptor::discovered(manifest, PathBuf::from("audit.toml"), version.into(), 1)
    }

    #[test]
    fn test_entry_point_registration() {
        let registry = PluginRegistry::default();
        registry
            .register_entry_point("audit", factory_fn(|_| Ok(Box::new(Noop) as Box<dyn Plugin>)))
            .unwrap();

        assert!(registry.has_entry_point("audit"));
        assert!(registry.register_entry_point(" ", factory_fn(|_| Ok(Box::new(Noop) as Box<dyn Plugin>))).is_err());

        assert!(registry.factory("audit").is_some());
        assert!(registry.factory("missing").is_none());
    }

    #[test]
    fn test_version_history_is_bounded() {
        let registry = PluginRegistry::new(2);
        for version in ["1.0.0", "1.1.0", "2.0.0"] {
            registry.record_activation(&descriptor(version));
        }

        let history = registry.version_history("audit");
        let versions: Vec<String> = history.iter().map(|v| v.version.to_string()).collect();
        assert_eq!(versions, vec!["1.1.0", "2.0.0"]);
        assert_eq!(history[1].checksum.as_deref(), Some("2.0.0"));
        assert!(registry.version_history("unknown").is_empty());
    }
}
