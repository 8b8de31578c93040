// 插件管理器
// 发现、校验、加载、卸载与热替换插件；与应用核心共享生命周期闸门

use arc_swap::ArcSwap;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{Instrument, debug, error, info, warn};

use crate::bus::{ScopedBus, SubscriptionLedger, is_valid_segment};
use crate::config::PluginsConfig;
use crate::core::{
    ApplicationCore, DependencyNode, DependencyResolver, HookFailure, LifecycleGate, Manager, guarded,
    panic_message,
};
use crate::errors::{CoreError, CoreResult};
use crate::logging::OperationContext;
use crate::plugins::interface::{Plugin, PluginDescriptor, PluginFactory, PluginHandle, PluginManifest};
use crate::plugins::lifecycle::{PluginState, StatusTransition};
use crate::plugins::loader::PluginLoader;
use crate::plugins::registry::{PluginRegistry, PluginVersion};

/// 插件生命周期事件的发布者标识
pub const PLUGIN_MANAGER_SOURCE: &str = "plugin_manager";

#[derive(Clone, Default)]
struct PluginTable {
    /// 按发现顺序
    plugins: Vec<PluginDescriptor>,
    disabled: BTreeSet<String>,
}

impl PluginTable {
    fn find(&self, name: &str) -> Option<&PluginDescriptor> {
        self.plugins.iter().find(|d| d.name == name)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut PluginDescriptor> {
        self.plugins.iter_mut().find(|d| d.name == name)
    }

    /// 依赖图节点；只保留指向集合内插件的边，集合外的依赖由校验报告
    fn nodes(&self, include: impl Fn(&PluginDescriptor) -> bool) -> Vec<DependencyNode> {
        let members: Vec<&PluginDescriptor> = self
            .plugins
            .iter()
            .filter(|d| d.manifest.is_some() && include(d))
            .collect();
        let names: HashSet<&str> = members.iter().map(|d| d.name.as_str()).collect();
        members
            .iter()
            .map(|d| {
                let edges = d
                    .dependencies()
                    .iter()
                    .filter(|dep| names.contains(dep.name.as_str()))
                    .map(|dep| dep.name.clone());
                DependencyNode::new(d.name.clone(), edges)
            })
            .collect()
    }
}

/// 已加载的插件实例
struct LivePlugin {
    instance: Box<dyn Plugin>,
    ledger: Arc<SubscriptionLedger>,
}

/// 按状态统计
#[derive(Debug, Clone, Serialize)]
pub struct PluginStatusSummary {
    pub total: usize,
    pub by_state: BTreeMap<String, usize>,
    pub disabled: Vec<String>,
}

impl PluginStatusSummary {
    pub fn count(&self, state: PluginState) -> usize {
        self.by_state.get(state.as_str()).copied().unwrap_or(0)
    }
}

struct PluginManagerInner {
    core: ApplicationCore,
    config: PluginsConfig,
    loader: PluginLoader,
    registry: PluginRegistry,
    table: ArcSwap<PluginTable>,
    write_lock: Mutex<()>,
    live: Mutex<HashMap<String, LivePlugin>>,
    gate: LifecycleGate,
}

/// 插件管理器
#[derive(Clone)]
pub struct PluginManager {
    inner: Arc<PluginManagerInner>,
}

impl PluginManager {
    /// 创建插件管理器；`plugins.disabled` 作为初始禁用集合
    pub fn new(core: ApplicationCore, config: Option<PluginsConfig>) -> Self {
        let config = config.unwrap_or_default();
        let table = PluginTable {
            plugins: Vec::new(),
            disabled: config.disabled.iter().cloned().collect(),
        };
        let gate = core.gate();

        Self {
            inner: Arc::new(PluginManagerInner {
                core,
                loader: PluginLoader::new(Some(config.clone())),
                registry: PluginRegistry::new(config.max_version_history),
                config,
                table: ArcSwap::from_pointee(table),
                write_lock: Mutex::new(()),
                live: Mutex::new(HashMap::new()),
                gate,
            }),
        }
    }

    pub fn config(&self) -> &PluginsConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.inner.registry
    }

    /// 注册插件入口
    pub fn register_entry_point(&self, entry_point: impl Into<String>, factory: Arc<dyn PluginFactory>) -> CoreResult<()> {
        self.inner.registry.register_entry_point(entry_point, factory)
    }

    fn update<R>(&self, apply: impl FnOnce(&mut PluginTable) -> R) -> R {
        let _guard = self.inner.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = PluginTable::clone(&self.inner.table.load());
        let result = apply(&mut next);
        self.inner.table.store(Arc::new(next));
        result
    }

    fn transition(&self, name: &str, to: PluginState, reason: &str, error: Option<String>) -> CoreResult<PluginState> {
        let max_history = self.inner.config.max_transition_history;
        self.update(|table| {
            table
                .find_mut(name)
                .ok_or_else(|| CoreError::not_found(format!("插件 {}", name)))?
                .transition(to, reason, error, max_history)
        })
    }

    /// 标记失败并发布 `plugin.<name>.failed`；已失败时只更新错误信息
    async fn fail(&self, name: &str, phase: &str, err: &CoreError) {
        let message = err.to_string();
        let max_history = self.inner.config.max_transition_history;
        let outcome = self.update(|table| {
            let descriptor = table
                .find_mut(name)
                .ok_or_else(|| CoreError::not_found(format!("插件 {}", name)))?;
            if descriptor.state == PluginState::Failed {
                descriptor.last_error = Some(message.clone());
                return Ok(PluginState::Failed);
            }
            descriptor.transition(PluginState::Failed, phase, Some(message.clone()), max_history)
        });
        if let Err(transition_err) = outcome {
            warn!(plugin = %name, error = %transition_err, "无法标记插件失败");
        }

        error!(plugin = %name, phase, error = %message, "插件{}失败", phase);
        self.emit(
            name,
            "failed",
            json!({ "phase": phase, "error": message, "code": err.error_code() }),
        )
        .await;
    }

    async fn emit(&self, name: &str, kind: &str, extra: Value) {
        if !is_valid_segment(name) {
            debug!(plugin = %name, kind, "插件名称不是合法主题分段，跳过生命周期事件");
            return;
        }
        let mut payload = match extra {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        payload.insert("plugin".to_string(), json!(name));

        let topic = format!("plugin.{}.{}", name, kind);
        if let Err(err) = self
            .inner
            .core
            .bus()
            .publish(&topic, PLUGIN_MANAGER_SOURCE, Value::Object(payload), None)
            .await
        {
            warn!(topic = %topic, error = %err, "插件生命周期事件发布失败");
        }
    }

    /// 扫描插件目录；`source` 为空时使用配置的目录
    ///
    /// 清单无效的插件得到 `Failed` 描述符，不影响其他插件。持有实例的插件不会被覆盖，
    /// 已从目录中删除的非活跃插件被移除。
    pub async fn discover(&self, source: Option<&Path>) -> CoreResult<Vec<PluginDescriptor>> {
        let directory = source
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(&self.inner.config.directory));
        let _gate = self.inner.gate.lock().await;
        let operation = OperationContext::new("discover");
        self.discover_locked(&directory).instrument(operation.span()).await
    }

    async fn discover_locked(&self, directory: &Path) -> CoreResult<Vec<PluginDescriptor>> {
        let scanned = self.inner.loader.scan(directory).await?;
        let max_history = self.inner.config.max_transition_history;

        let (results, announcements) = self.update(|table| {
            let mut results = Vec::with_capacity(scanned.len());
            let mut announcements = Vec::new();
            let mut claimed = HashSet::new();

            for mut descriptor in scanned {
                if !claimed.insert(descriptor.name.clone()) {
                    results.push(descriptor);
                    continue;
                }
                descriptor.enabled = !table.disabled.contains(&descriptor.name);

                match table.find_mut(&descriptor.name) {
                    Some(existing) if existing.state.is_live() => {
                        debug!(plugin = %existing.name, state = %existing.state, "插件持有实例，保留现有描述符");
                        results.push(existing.clone());
                        continue;
                    }
                    Some(existing)
                        if existing.manifest.is_some()
                            && descriptor.manifest.is_some()
                            && existing.checksum == descriptor.checksum =>
                    {
                        results.push(existing.clone());
                        continue;
                    }
                    Some(existing) => {
                        descriptor.transitions = std::mem::take(&mut existing.transitions);
                        descriptor.record_transition(
                            existing.state,
                            descriptor.state,
                            "重新发现",
                            descriptor.last_error.clone(),
                            max_history,
                        );
                        *existing = descriptor.clone();
                    }
                    None => table.plugins.push(descriptor.clone()),
                }
                announcements.push(descriptor.clone());
                results.push(descriptor);
            }

            let before = table.plugins.len();
            table.plugins.retain(|d| {
                d.state.is_live() || claimed.contains(&d.name) || !d.source.starts_with(directory)
            });
            if table.plugins.len() < before {
                info!(removed = before - table.plugins.len(), "移除已从目录中删除的插件");
            }

            (results, announcements)
        });

        for descriptor in &announcements {
            match descriptor.state {
                PluginState::Failed => {
                    self.emit(
                        &descriptor.name,
                        "failed",
                        json!({ "phase": "discover", "error": descriptor.last_error }),
                    )
                    .await;
                }
                _ => {
                    self.emit(
                        &descriptor.name,
                        "discovered",
                        json!({
                            "version": descriptor.version().map(ToString::to_string),
                            "checksum": descriptor.checksum,
                        }),
                    )
                    .await;
                }
            }
        }

        info!(
            directory = %directory.display(),
            discovered = results.len(),
            changed = announcements.len(),
            "插件发现完成"
        );
        Ok(results)
    }

    /// 校验依赖版本、所需能力与入口
    pub async fn validate(&self, name: &str) -> CoreResult<()> {
        let _gate = self.inner.gate.lock().await;
        self.validate_locked(name).await
    }

    async fn validate_locked(&self, name: &str) -> CoreResult<()> {
        let descriptor = self
            .descriptor(name)
            .ok_or_else(|| CoreError::not_found(format!("插件 {}", name)))?;
        if descriptor.state.is_live() {
            return Err(CoreError::invalid_state(name, descriptor.state, PluginState::Validated));
        }
        let Some(manifest) = descriptor.manifest.as_ref() else {
            return Err(CoreError::manifest_invalid(
                descriptor.source.display().to_string(),
                descriptor.last_error.clone().unwrap_or_else(|| "清单无效".to_string()),
            ));
        };
        if !descriptor.enabled {
            return Err(CoreError::PluginDisabled {
                plugin: name.to_string(),
            });
        }

        if let Err(err) = self.check_requirements(manifest) {
            self.fail(name, "validate", &err).await;
            return Err(err);
        }

        if descriptor.state != PluginState::Validated {
            self.transition(name, PluginState::Validated, "依赖与能力校验通过", None)?;
            self.emit(name, "validated", json!({ "version": manifest.version.to_string() }))
                .await;
        }
        Ok(())
    }

    fn check_requirements(&self, manifest: &PluginManifest) -> CoreResult<()> {
        // 插件名即订阅命名空间，不得与管理器重名
        if self.inner.core.state_of(&manifest.name).is_some() {
            return Err(CoreError::namespace_conflict(&manifest.name, "管理器"));
        }

        let table = self.inner.table.load_full();
        for dependency in &manifest.dependencies {
            let found = table.find(&dependency.name).and_then(|d| d.version().cloned());
            match &found {
                Some(version) if dependency.version.matches(version) => {}
                _ => {
                    return Err(CoreError::UnsatisfiedDependency {
                        plugin: manifest.name.clone(),
                        dependency: dependency.name.clone(),
                        requirement: dependency.version.to_string(),
                        found: found.map(|v| v.to_string()),
                    });
                }
            }
        }

        for capability in &manifest.capabilities_required {
            let running = self
                .inner
                .core
                .state_of(capability)
                .is_some_and(|state| state.is_live());
            if !running {
                return Err(CoreError::MissingCapability {
                    plugin: manifest.name.clone(),
                    capability: capability.clone(),
                });
            }
        }

        if !self.inner.registry.has_entry_point(&manifest.entry_point) {
            return Err(CoreError::plugin_load_failure(
                &manifest.name,
                format!("入口 '{}' 未注册", manifest.entry_point),
            ));
        }
        Ok(())
    }

    /// 加载插件
    ///
    /// 依赖必须已激活。加载失败时插件的订阅全部撤销，状态为 `Failed`。
    pub async fn load(&self, name: &str) -> CoreResult<()> {
        let _gate = self.inner.gate.lock().await;
        let operation = OperationContext::for_unit("load_plugin", name);
        self.load_locked(name).instrument(operation.span()).await
    }

    async fn load_locked(&self, name: &str) -> CoreResult<()> {
        let state = self
            .state_of(name)
            .ok_or_else(|| CoreError::not_found(format!("插件 {}", name)))?;
        if state == PluginState::Active {
            return Err(CoreError::invalid_state(name, state, PluginState::Loading));
        }

        self.validate_locked(name).await?;
        let descriptor = self
            .descriptor(name)
            .ok_or_else(|| CoreError::not_found(format!("插件 {}", name)))?;
        let manifest = descriptor
            .manifest
            .clone()
            .ok_or_else(|| CoreError::internal(format!("插件 {} 校验后缺少清单", name)))?;

        // 依赖必须已激活
        let inactive = {
            let table = self.inner.table.load_full();
            manifest.dependencies.iter().find_map(|dependency| {
                let target = table.find(&dependency.name);
                (target.map(|d| d.state) != Some(PluginState::Active)).then(|| CoreError::UnsatisfiedDependency {
                    plugin: name.to_string(),
                    dependency: dependency.name.clone(),
                    requirement: format!("{} (active)", dependency.version),
                    found: target.and_then(|d| d.version().map(ToString::to_string)),
                })
            })
        };
        if let Some(err) = inactive {
            self.fail(name, "load", &err).await;
            return Err(err);
        }

        if let Err(err) = self.inner.core.claim_plugin_namespace(name) {
            self.fail(name, "load", &err).await;
            return Err(err);
        }

        self.transition(name, PluginState::Loading, "开始加载", None)?;
        self.emit(name, "loading", json!({ "version": manifest.version.to_string() }))
            .await;

        let started_at = Instant::now();
        let bus = ScopedBus::new(self.inner.core.bus().clone(), name);
        let ledger = bus.ledger();

        match self.instantiate(&manifest, bus).await {
            Ok(instance) => {
                let subscriptions = ledger.ids();
                self.inner
                    .live
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(name.to_string(), LivePlugin { instance, ledger });
                self.transition(name, PluginState::Active, "加载完成", None)?;
                if let Some(active) = self.descriptor(name) {
                    self.inner.registry.record_activation(&active);
                }

                let elapsed_ms = started_at.elapsed().as_millis() as u64;
                info!(plugin = %name, version = %manifest.version, subscriptions = subscriptions.len(), elapsed_ms, "插件已激活");
                self.emit(
                    name,
                    "active",
                    json!({
                        "version": manifest.version.to_string(),
                        "subscriptions": subscriptions,
                        "elapsed_ms": elapsed_ms,
                    }),
                )
                .await;
                Ok(())
            }
            Err(err) => {
                let revoked = self.revoke_subscriptions(name, &ledger);
                ledger.detach();
                self.inner.core.release_plugin_namespace(name);
                if revoked > 0 {
                    warn!(plugin = %name, revoked, "回滚加载失败插件的订阅");
                }
                self.fail(name, "load", &err).await;
                Err(err)
            }
        }
    }

    /// 实例化并初始化插件；只注入清单中声明的管理器
    async fn instantiate(&self, manifest: &PluginManifest, bus: ScopedBus) -> CoreResult<Box<dyn Plugin>> {
        let name = manifest.name.as_str();

        let mut managers: HashMap<String, Arc<dyn Manager>> = HashMap::new();
        for capability in &manifest.capabilities_required {
            let instance = self.inner.core.manager(capability).ok_or_else(|| CoreError::MissingCapability {
                plugin: name.to_string(),
                capability: capability.clone(),
            })?;
            managers.insert(capability.clone(), instance);
        }

        let factory = self
            .inner
            .registry
            .factory(&manifest.entry_point)
            .ok_or_else(|| CoreError::plugin_load_failure(name, format!("入口 '{}' 未注册", manifest.entry_point)))?;

        let mut instance = match std::panic::catch_unwind(AssertUnwindSafe(|| factory.create(manifest))) {
            Ok(Ok(instance)) => instance,
            Ok(Err(err)) => return Err(CoreError::plugin_load_failure(name, format!("{:#}", err))),
            Err(panic) => {
                return Err(CoreError::plugin_load_failure(
                    name,
                    format!("panic: {}", panic_message(panic.as_ref())),
                ));
            }
        };

        let handle = PluginHandle::new(name, manifest.version.clone(), bus, managers);
        let outcome = guarded(
            Some(self.inner.config.initialize_timeout()),
            instance.initialize(handle),
        )
        .await;

        match outcome {
            Ok(()) => Ok(instance),
            Err(HookFailure::Timeout(_)) => Err(CoreError::timeout(format!("plugin {}.initialize", name))),
            Err(failure) => Err(CoreError::plugin_load_failure(name, failure.to_string())),
        }
    }

    /// 撤销台账中的订阅，并清扫命名空间下的残留订阅
    fn revoke_subscriptions(&self, name: &str, ledger: &SubscriptionLedger) -> usize {
        let bus = self.inner.core.bus();
        let revoked = ledger.revoke().iter().filter(|id| bus.unsubscribe(id)).count();
        revoked + bus.unsubscribe_namespace(name)
    }

    /// 仍处于 Active 且依赖目标插件的插件
    fn active_dependents(&self, name: &str) -> Vec<String> {
        let table = self.inner.table.load_full();
        let nodes = table.nodes(|d| d.state == PluginState::Active);
        DependencyResolver::dependents(&nodes, name)
            .into_iter()
            .map(String::from)
            .collect()
    }

    /// 卸载插件
    ///
    /// 订阅先被撤销，然后调用关闭钩子，最后再次清扫命名空间。关闭钩子失败时插件仍为
    /// `Unloaded`，并返回 `PluginShutdown`。
    pub async fn unload(&self, name: &str) -> CoreResult<()> {
        let _gate = self.inner.gate.lock().await;
        let operation = OperationContext::for_unit("unload_plugin", name);
        self.unload_locked(name).instrument(operation.span()).await
    }

    async fn unload_locked(&self, name: &str) -> CoreResult<()> {
        let state = self
            .state_of(name)
            .ok_or_else(|| CoreError::not_found(format!("插件 {}", name)))?;
        if state != PluginState::Active {
            return Err(CoreError::invalid_state(name, state, PluginState::Unloading));
        }

        let dependents = self.active_dependents(name);
        if !dependents.is_empty() {
            return Err(CoreError::DependentsActive {
                plugin: name.to_string(),
                dependents,
            });
        }

        self.transition(name, PluginState::Unloading, "开始卸载", None)?;
        self.emit(name, "unloading", json!({})).await;

        let live = self
            .inner
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);

        let mut shutdown_error = None;
        let revoked = match live {
            Some(mut live) => {
                let mut revoked = self.revoke_subscriptions(name, &live.ledger);
                let limit = self.inner.config.shutdown_timeout();
                if let Err(failure) = guarded(Some(limit), live.instance.shutdown()).await {
                    warn!(plugin = %name, error = %failure, "插件关闭钩子失败，继续清理");
                    shutdown_error = Some(failure.to_string());
                }
                revoked += self.revoke_subscriptions(name, &live.ledger);
                live.ledger.detach();
                revoked
            }
            None => self.inner.core.bus().unsubscribe_namespace(name),
        };
        self.inner.core.release_plugin_namespace(name);

        self.transition(name, PluginState::Unloaded, "卸载完成", shutdown_error.clone())?;
        info!(plugin = %name, revoked, "插件已卸载");
        self.emit(
            name,
            "unloaded",
            json!({ "revoked": revoked, "error": shutdown_error }),
        )
        .await;

        match shutdown_error {
            Some(message) => Err(CoreError::PluginShutdown {
                plugin: name.to_string(),
                message,
            }),
            None => Ok(()),
        }
    }

    /// 热替换：卸载后用重新读取的清单加载
    ///
    /// 新版本加载失败时插件保持 `Failed`，不会恢复旧版本。
    pub async fn reload(&self, name: &str) -> CoreResult<()> {
        let _gate = self.inner.gate.lock().await;
        let operation = OperationContext::for_unit("reload_plugin", name);
        self.reload_locked(name).instrument(operation.span()).await
    }

    async fn reload_locked(&self, name: &str) -> CoreResult<()> {
        let descriptor = self
            .descriptor(name)
            .ok_or_else(|| CoreError::not_found(format!("插件 {}", name)))?;

        if descriptor.state == PluginState::Active {
            match self.unload_locked(name).await {
                Ok(()) => {}
                Err(err @ CoreError::PluginShutdown { .. }) => {
                    warn!(plugin = %name, error = %err, "旧版本关闭失败，继续重新加载");
                }
                Err(err) => return Err(err),
            }
        }

        let mut fresh = self.inner.loader.read_manifest(&descriptor.source).await;
        if fresh.manifest.is_none() {
            fresh.name = name.to_string();
        } else if fresh.name != name {
            let reason = CoreError::manifest_invalid(
                descriptor.source.display().to_string(),
                format!("清单名称由 '{}' 变为 '{}'", name, fresh.name),
            );
            fresh = PluginDescriptor::rejected(name, fresh.source, fresh.checksum, fresh.size_bytes, &reason);
        }

        let max_history = self.inner.config.max_transition_history;
        self.update(|table| {
            if let Some(existing) = table.find_mut(name) {
                fresh.enabled = existing.enabled;
                fresh.transitions = std::mem::take(&mut existing.transitions);
                fresh.record_transition(existing.state, fresh.state, "重新加载", fresh.last_error.clone(), max_history);
                *existing = fresh.clone();
            }
        });

        if fresh.state == PluginState::Failed {
            let err = CoreError::manifest_invalid(
                fresh.source.display().to_string(),
                fresh.last_error.clone().unwrap_or_default(),
            );
            self.fail(name, "reload", &err).await;
            return Err(err);
        }
        self.emit(
            name,
            "discovered",
            json!({
                "version": fresh.version().map(ToString::to_string),
                "checksum": fresh.checksum,
            }),
        )
        .await;

        self.load_locked(name).await.inspect_err(|err| {
            warn!(plugin = %name, error = %err, "重新加载失败，插件不会恢复旧版本");
        })
    }

    /// 按依赖顺序加载全部已发现且启用的插件，尽力而为
    pub async fn load_all(&self) -> CoreResult<Vec<String>> {
        let _gate = self.inner.gate.lock().await;
        let operation = OperationContext::new("load_all");
        self.load_all_locked().instrument(operation.span()).await
    }

    async fn load_all_locked(&self) -> CoreResult<Vec<String>> {
        let snapshot = self.inner.table.load_full();
        let order = DependencyResolver::resolve(&snapshot.nodes(|d| d.enabled)).inspect_err(|err| {
            warn!(error = %err, "插件依赖解析失败，未加载任何插件");
        })?;

        let mut loaded = Vec::new();
        let mut failures = Vec::new();
        for name in &order {
            if self.state_of(name) == Some(PluginState::Active) {
                continue;
            }
            match self.load_locked(name).await {
                Ok(()) => loaded.push(name.clone()),
                Err(err) => failures.push(err.to_unit_failure(name.clone())),
            }
        }

        if failures.is_empty() {
            info!(loaded = loaded.len(), "全部插件已加载");
            Ok(loaded)
        } else {
            error!(loaded = loaded.len(), failed = failures.len(), "部分插件加载失败");
            Err(CoreError::Aggregate {
                operation: "load_all".to_string(),
                failures,
            })
        }
    }

    /// 按逆依赖顺序卸载全部活跃插件，尽力而为
    pub async fn unload_all(&self) -> CoreResult<()> {
        let _gate = self.inner.gate.lock().await;
        let operation = OperationContext::new("unload_all");
        self.unload_all_locked().instrument(operation.span()).await
    }

    async fn unload_all_locked(&self) -> CoreResult<()> {
        let snapshot = self.inner.table.load_full();
        let nodes = snapshot.nodes(|d| d.state == PluginState::Active);
        let order = DependencyResolver::resolve(&nodes).unwrap_or_else(|err| {
            warn!(error = %err, "依赖解析失败，按发现顺序逆序卸载");
            nodes.iter().map(|n| n.name.clone()).collect()
        });

        let mut failures = Vec::new();
        for name in order.iter().rev() {
            if let Err(err) = self.unload_locked(name).await {
                failures.push(err.to_unit_failure(name.clone()));
            }
        }

        if failures.is_empty() {
            info!(unloaded = order.len(), "全部插件已卸载");
            Ok(())
        } else {
            error!(failed = failures.len(), "部分插件卸载失败");
            Err(CoreError::Aggregate {
                operation: "unload_all".to_string(),
                failures,
            })
        }
    }

    /// 启用插件
    pub async fn enable(&self, name: &str) -> CoreResult<()> {
        let _gate = self.inner.gate.lock().await;
        self.update(|table| {
            table.disabled.remove(name);
            if let Some(descriptor) = table.find_mut(name) {
                descriptor.enabled = true;
            }
        });
        info!(plugin = %name, "插件已启用");
        Ok(())
    }

    /// 禁用插件；活跃的插件先被卸载
    pub async fn disable(&self, name: &str) -> CoreResult<()> {
        if !is_valid_segment(name) {
            return Err(CoreError::invalid_name(name, "插件名称必须是合法的主题分段"));
        }
        let _gate = self.inner.gate.lock().await;

        if self.state_of(name) == Some(PluginState::Active) {
            match self.unload_locked(name).await {
                Ok(()) => {}
                Err(err @ CoreError::PluginShutdown { .. }) => {
                    warn!(plugin = %name, error = %err, "禁用时插件关闭失败");
                }
                Err(err) => return Err(err),
            }
        }

        self.update(|table| {
            table.disabled.insert(name.to_string());
            if let Some(descriptor) = table.find_mut(name) {
                descriptor.enabled = false;
            }
        });
        info!(plugin = %name, "插件已禁用");
        Ok(())
    }

    pub fn descriptor(&self, name: &str) -> Option<PluginDescriptor> {
        self.inner.table.load().find(name).cloned()
    }

    pub fn state_of(&self, name: &str) -> Option<PluginState> {
        self.inner.table.load().find(name).map(|d| d.state)
    }

    /// 按发现顺序列出插件
    pub fn list(&self) -> Vec<PluginDescriptor> {
        self.inner.table.load().plugins.clone()
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        self.inner.table.load().disabled.contains(name)
    }

    pub fn status(&self) -> PluginStatusSummary {
        let table = self.inner.table.load();
        let mut by_state = BTreeMap::new();
        for descriptor in &table.plugins {
            *by_state.entry(descriptor.state.as_str().to_string()).or_insert(0) += 1;
        }
        PluginStatusSummary {
            total: table.plugins.len(),
            by_state,
            disabled: table.disabled.iter().cloned().collect(),
        }
    }

    pub fn version_history(&self, name: &str) -> Vec<PluginVersion> {
        self.inner.registry.version_history(name)
    }

    pub fn transitions(&self, name: &str) -> Vec<StatusTransition> {
        self.inner
            .table
            .load()
            .find(name)
            .map(|d| d.transitions.clone())
            .unwrap_or_default()
    }

    /// 总线上属于该插件命名空间的订阅
    pub fn subscriptions_of(&self, name: &str) -> Vec<String> {
        let prefix = format!("{}.", name);
        self.inner
            .core
            .bus()
            .subscriber_ids()
            .into_iter()
            .filter(|id| id.starts_with(&prefix))
            .collect()
    }

    /// 活跃插件名称（发现顺序）
    pub fn active_plugins(&self) -> Vec<String> {
        self.inner
            .table
            .load()
            .plugins
            .iter()
            .filter(|d| d.state == PluginState::Active)
            .map(|d| d.name.clone())
            .collect()
    }
}
