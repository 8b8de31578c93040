// 插件接口规范
// 定义插件清单、描述符、入口契约与运行时句柄

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::bus::{ScopedBus, is_valid_segment};
use crate::core::Manager;
use crate::errors::{CoreError, CoreResult};
use crate::plugins::lifecycle::{PluginState, StatusTransition};

/// 插件接口
/// 所有插件必须实现此接口
#[async_trait]
pub trait Plugin: Send + Sync {
    /// 初始化插件，在此注册订阅
    async fn initialize(&mut self, handle: PluginHandle) -> anyhow::Result<()>;

    /// 关闭插件；无论成功与否，插件的全部订阅都会被撤销
    async fn shutdown(&mut self) -> anyhow::Result<()>;
}

/// 插件工厂
/// 通过清单中的 `entry_point` 在注册表中查找
pub trait PluginFactory: Send + Sync {
    fn create(&self, manifest: &PluginManifest) -> anyhow::Result<Box<dyn Plugin>>;
}

struct FnFactory<F>(F);

impl<F> PluginFactory for FnFactory<F>
where
    F: Fn(&PluginManifest) -> anyhow::Result<Box<dyn Plugin>> + Send + Sync,
{
    fn create(&self, manifest: &PluginManifest) -> anyhow::Result<Box<dyn Plugin>> {
        (self.0)(manifest)
    }
}

/// 用闭包构造插件工厂
pub fn factory_fn<F>(f: F) -> Arc<dyn PluginFactory>
where
    F: Fn(&PluginManifest) -> anyhow::Result<Box<dyn Plugin>> + Send + Sync + 'static,
{
    Arc::new(FnFactory(f))
}

/// 插件依赖
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDependency {
    /// 依赖插件名称
    pub name: String,
    /// 版本要求，缺省为任意版本
    #[serde(default)]
    pub version: VersionReq,
}

/// 插件清单 (`plugin.toml`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: Version,
    /// 注册表中的入口名称
    pub entry_point: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    /// 需要访问的管理器
    #[serde(default)]
    pub capabilities_required: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<PluginDependency>,
}

impl PluginManifest {
    /// 解析并校验 TOML 清单
    pub fn parse(text: &str, source: &str) -> CoreResult<Self> {
        let manifest: PluginManifest = toml::from_str(text)
            .map_err(|err| CoreError::manifest_invalid(source, err.to_string()))?;
        manifest.validate(source)?;
        Ok(manifest)
    }

    pub fn validate(&self, source: &str) -> CoreResult<()> {
        if !is_valid_segment(&self.name) {
            return Err(CoreError::manifest_invalid(
                source,
                format!("插件名称 '{}' 只能包含字母、数字、下划线和连字符", self.name),
            ));
        }
        if self.entry_point.trim().is_empty() {
            return Err(CoreError::manifest_invalid(source, "entry_point 不能为空"));
        }
        for dependency in &self.dependencies {
            if !is_valid_segment(&dependency.name) {
                return Err(CoreError::manifest_invalid(
                    source,
                    format!("非法依赖名称 '{}'", dependency.name),
                ));
            }
            if dependency.name == self.name {
                return Err(CoreError::manifest_invalid(source, "插件不能依赖自身"));
            }
        }
        if let Some(capability) = self.capabilities_required.iter().find(|c| !is_valid_segment(c)) {
            return Err(CoreError::manifest_invalid(
                source,
                format!("非法能力名称 '{}'", capability),
            ));
        }
        Ok(())
    }

    pub fn dependency_names(&self) -> Vec<String> {
        self.dependencies.iter().map(|d| d.name.clone()).collect()
    }
}

/// 插件描述符
#[derive(Debug, Clone, Serialize)]
pub struct PluginDescriptor {
    pub name: String,
    /// 清单无效时为空
    pub manifest: Option<PluginManifest>,
    /// 清单文件路径
    pub source: PathBuf,
    /// 清单 SHA-256
    pub checksum: Option<String>,
    pub size_bytes: u64,
    pub state: PluginState,
    pub enabled: bool,
    pub last_error: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    /// 状态转换历史（有界）
    pub transitions: Vec<StatusTransition>,
}

impl PluginDescriptor {
    pub fn discovered(manifest: PluginManifest, source: PathBuf, checksum: String, size_bytes: u64) -> Self {
        Self {
            name: manifest.name.clone(),
            manifest: Some(manifest),
            source,
            checksum: Some(checksum),
            size_bytes,
            state: PluginState::Discovered,
            enabled: true,
            last_error: None,
            discovered_at: Utc::now(),
            activated_at: None,
            transitions: Vec::new(),
        }
    }

    /// 清单无效的插件，记录失败原因
    pub fn rejected(name: impl Into<String>, source: PathBuf, checksum: Option<String>, size_bytes: u64, reason: &CoreError) -> Self {
        Self {
            name: name.into(),
            manifest: None,
            source,
            checksum,
            size_bytes,
            state: PluginState::Failed,
            enabled: true,
            last_error: Some(reason.to_string()),
            discovered_at: Utc::now(),
            activated_at: None,
            transitions: Vec::new(),
        }
    }

    pub fn version(&self) -> Option<&Version> {
        self.manifest.as_ref().map(|m| &m.version)
    }

    pub fn dependencies(&self) -> &[PluginDependency] {
        self.manifest.as_ref().map(|m| m.dependencies.as_slice()).unwrap_or_default()
    }

    pub fn capabilities_required(&self) -> &[String] {
        self.manifest
            .as_ref()
            .map(|m| m.capabilities_required.as_slice())
            .unwrap_or_default()
    }
}

/// 插件运行时句柄
///
/// 只暴露作用域总线和清单中声明的管理器。
#[derive(Clone)]
pub struct PluginHandle {
    name: String,
    version: Version,
    bus: ScopedBus,
    managers: HashMap<String, Arc<dyn Manager>>,
}

impl PluginHandle {
    pub(crate) fn new(
        name: impl Into<String>,
        version: Version,
        bus: ScopedBus,
        managers: HashMap<String, Arc<dyn Manager>>,
    ) -> Self {
        Self {
            name: name.into(),
            version,
            bus,
            managers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// 命名空间为插件名的总线代理
    pub fn bus(&self) -> &ScopedBus {
        &self.bus
    }

    /// 声明过的管理器；未声明的一律返回 None
    pub fn manager(&self, name: &str) -> Option<Arc<dyn Manager>> {
        self.managers.get(name).cloned()
    }

    pub fn capabilities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.managers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("name", &self.name)
            .field("version", &self.version.to_string())
            .field("capabilities", &self.capabilities())
            .finish_non_exhaustive()
    }
}
