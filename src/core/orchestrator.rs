// 生命周期编排器 (ApplicationCore)
// 按依赖顺序启动/停止管理器，聚合健康状态，每次状态转换发布生命周期事件

use arc_swap::ArcSwap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{Instrument, debug, error, info, warn};

use crate::bus::{EventBus, is_valid_segment};
use crate::config::LifecycleConfig;
use crate::core::{
    DependencyNode, DependencyResolver, HealthReport, HookFailure, Manager, ManagerContext,
    ManagerDescriptor, ManagerHealth, ManagerState, guarded, panic_message,
};
use crate::errors::{CoreError, CoreResult};
use crate::health::{ComponentHealth, HealthStatus, SystemHealth, aggregate};
use crate::logging::OperationContext;
use nexus_common::UnitFailure;

/// 生命周期事件的发布者标识
pub const CORE_SOURCE: &str = "core";

/// 全局生命周期闸门：同一时刻只有一个生命周期操作在进行
pub type LifecycleGate = Arc<tokio::sync::Mutex<()>>;

/// 编排器阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorePhase {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for CorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Clone)]
struct CoreTable {
    /// 按注册顺序
    managers: Vec<Arc<ManagerDescriptor>>,
    phase: CorePhase,
    startup_order: Vec<String>,
    /// 已由插件占用的订阅命名空间
    plugin_namespaces: BTreeSet<String>,
}

impl CoreTable {
    fn find(&self, name: &str) -> Option<&Arc<ManagerDescriptor>> {
        self.managers.iter().find(|d| d.name == name)
    }

    fn nodes(&self) -> Vec<DependencyNode> {
        self.managers
            .iter()
            .map(|d| DependencyNode::new(d.name.clone(), d.dependencies.clone()))
            .collect()
    }
}

struct CoreInner {
    bus: EventBus,
    config: LifecycleConfig,
    table: ArcSwap<CoreTable>,
    write_lock: Mutex<()>,
    gate: LifecycleGate,
}

/// 应用核心
#[derive(Clone)]
pub struct ApplicationCore {
    inner: Arc<CoreInner>,
}

impl ApplicationCore {
    pub fn new(bus: EventBus, config: Option<LifecycleConfig>) -> Self {
        Self {
            inner: Arc::new(CoreInner {
                bus,
                config: config.unwrap_or_default(),
                table: ArcSwap::from_pointee(CoreTable {
                    managers: Vec::new(),
                    phase: CorePhase::Idle,
                    startup_order: Vec::new(),
                    plugin_namespaces: BTreeSet::new(),
                }),
                write_lock: Mutex::new(()),
                gate: Arc::new(tokio::sync::Mutex::new(())),
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// 与插件管理器共享的生命周期闸门
    pub fn gate(&self) -> LifecycleGate {
        Arc::clone(&self.inner.gate)
    }

    /// 在一致快照上修改描述符表
    fn update<R>(&self, apply: impl FnOnce(&mut CoreTable) -> R) -> R {
        let _guard = self.inner.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = CoreTable::clone(&self.inner.table.load());
        let result = apply(&mut next);
        self.inner.table.store(Arc::new(next));
        result
    }

    /// 注册管理器；只能在编排开始之前或全部停止之后进行
    pub fn register<I, S>(&self, name: impl Into<String>, dependencies: I, instance: Arc<dyn Manager>) -> CoreResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        if !is_valid_segment(&name) {
            return Err(CoreError::invalid_name(name, "管理器名称必须是合法的主题分段"));
        }
        let dependencies: Vec<String> = dependencies.into_iter().map(Into::into).collect();

        self.update(|table| {
            if matches!(table.phase, CorePhase::Starting | CorePhase::Running | CorePhase::Stopping) {
                return Err(CoreError::invalid_state("core", table.phase, "register"));
            }
            if table.find(&name).is_some() {
                return Err(CoreError::DuplicateManager { name: name.clone() });
            }
            if table.plugin_namespaces.contains(&name) {
                return Err(CoreError::namespace_conflict(name.clone(), "插件"));
            }
            table.managers.push(Arc::new(ManagerDescriptor {
                name: name.clone(),
                dependencies: dependencies.clone(),
                instance,
                state: ManagerState::Created,
                last_error: None,
            }));
            Ok(())
        })?;

        info!(manager = %name, dependencies = ?dependencies, "注册管理器");
        Ok(())
    }

    /// 插件占用与自身同名的订阅命名空间；与管理器重名时拒绝
    pub fn claim_plugin_namespace(&self, name: &str) -> CoreResult<()> {
        self.update(|table| {
            if table.find(name).is_some() {
                return Err(CoreError::namespace_conflict(name, "管理器"));
            }
            table.plugin_namespaces.insert(name.to_string());
            Ok(())
        })
    }

    pub fn release_plugin_namespace(&self, name: &str) {
        self.update(|table| {
            table.plugin_namespaces.remove(name);
        });
    }

    fn set_phase(&self, phase: CorePhase) {
        self.update(|table| table.phase = phase);
        debug!(phase = %phase, "编排阶段变更");
    }

    /// 状态转换，校验状态机
    fn transition(&self, name: &str, to: ManagerState, error: Option<String>) -> CoreResult<ManagerState> {
        let from = self.update(|table| {
            let slot = table
                .managers
                .iter_mut()
                .find(|d| d.name == name)
                .ok_or_else(|| CoreError::not_found(format!("管理器 {}", name)))?;
            let from = slot.state;
            if !from.can_transition_to(to) {
                return Err(CoreError::invalid_state(name, from, to));
            }
            let mut next = ManagerDescriptor::clone(slot);
            next.state = to;
            if error.is_some() {
                next.last_error = error;
            }
            *slot = Arc::new(next);
            Ok(from)
        })?;

        debug!(manager = %name, from = %from, to = %to, "管理器状态转换");
        Ok(from)
    }

    async fn emit(&self, name: &str, kind: &str, extra: Value) {
        let mut payload = match extra {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        payload.insert("manager".to_string(), json!(name));

        let topic = format!("manager.{}.{}", name, kind);
        if let Err(err) = self
            .inner
            .bus
            .publish(&topic, CORE_SOURCE, Value::Object(payload), None)
            .await
        {
            warn!(topic = %topic, error = %err, "生命周期事件发布失败");
        }
    }

    /// 按依赖顺序启动全部管理器
    ///
    /// 依赖图错误在任何副作用之前返回。某个管理器初始化失败时，已启动的管理器
    /// 按逆序关闭，然后返回 `StartupAborted`。
    pub async fn start_all(&self) -> CoreResult<Vec<String>> {
        let _gate = self.inner.gate.lock().await;
        let operation = OperationContext::new("start_all");
        self.start_all_locked().instrument(operation.span()).await
    }

    async fn start_all_locked(&self) -> CoreResult<Vec<String>> {
        let snapshot = self.inner.table.load_full();
        let order = DependencyResolver::resolve(&snapshot.nodes()).inspect_err(|err| {
            warn!(error = %err, "依赖解析失败，未启动任何管理器");
        })?;

        self.set_phase(CorePhase::Starting);
        info!(order = ?order, "按依赖顺序启动管理器");

        let mut started: Vec<String> = Vec::with_capacity(order.len());
        for name in &order {
            let Some(descriptor) = self.descriptor(name) else {
                continue;
            };
            if descriptor.state.is_live() {
                started.push(name.clone());
                continue;
            }

            if let Err(cause) = self.start_one(&descriptor).await {
                warn!(manager = %name, rollback = ?started, "启动中止，逆序回滚已启动的管理器");
                let rollback_failures = self.shutdown_sequence(started.iter().rev()).await;
                self.set_phase(CorePhase::Failed);
                return Err(CoreError::StartupAborted {
                    manager: name.clone(),
                    cause: Box::new(cause),
                    rollback_failures,
                });
            }
            started.push(name.clone());
        }

        self.update(|table| {
            table.phase = CorePhase::Running;
            table.startup_order = order.clone();
        });
        info!(managers = order.len(), "全部管理器已启动");
        Ok(order)
    }

    async fn start_one(&self, descriptor: &ManagerDescriptor) -> CoreResult<()> {
        let name = descriptor.name.as_str();

        let snapshot = self.inner.table.load_full();
        let mut dependencies: HashMap<String, Arc<dyn Manager>> = HashMap::new();
        for dependency in &descriptor.dependencies {
            match snapshot.find(dependency) {
                Some(d) if d.state.is_live() => {
                    dependencies.insert(dependency.clone(), Arc::clone(&d.instance));
                }
                _ => {
                    return Err(CoreError::ManagerInitialization {
                        manager: name.to_string(),
                        message: format!("依赖 {} 未运行", dependency),
                    });
                }
            }
        }

        self.transition(name, ManagerState::Initializing, None)?;
        self.emit(name, "starting", json!({ "dependencies": descriptor.dependencies })).await;

        let context = ManagerContext::new(name, self.inner.bus.clone(), dependencies);
        let started_at = Instant::now();
        let limit = self.inner.config.initialize_timeout();

        match guarded(Some(limit), descriptor.instance.initialize(&context)).await {
            Ok(()) => {
                self.transition(name, ManagerState::Running, None)?;
                let elapsed_ms = started_at.elapsed().as_millis() as u64;
                info!(manager = %name, elapsed_ms, "管理器已启动");
                self.emit(name, "started", json!({ "elapsed_ms": elapsed_ms })).await;
                Ok(())
            }
            Err(failure) => {
                let message = failure.to_string();
                if let Err(err) = self.transition(name, ManagerState::Failed, Some(message.clone())) {
                    warn!(manager = %name, error = %err, "无法标记管理器失败");
                }
                error!(manager = %name, error = %message, "管理器初始化失败");
                self.emit(name, "failed", json!({ "phase": "initialize", "error": message }))
                    .await;
                Err(match failure {
                    HookFailure::Timeout(_) => CoreError::timeout(format!("{}.initialize", name)),
                    _ => CoreError::ManagerInitialization {
                        manager: name.to_string(),
                        message,
                    },
                })
            }
        }
    }

    /// 依次关闭给定管理器；失败被记录但不会中断后续关闭
    async fn shutdown_sequence<'a>(&self, names: impl Iterator<Item = &'a String>) -> Vec<UnitFailure> {
        let mut failures = Vec::new();
        for name in names {
            let Some(descriptor) = self.descriptor(name) else {
                continue;
            };
            if !descriptor.state.is_live() {
                continue;
            }
            if let Err(err) = self.stop_one(&descriptor).await {
                failures.push(err.to_unit_failure(name.clone()));
            }
        }
        failures
    }

    async fn stop_one(&self, descriptor: &ManagerDescriptor) -> CoreResult<()> {
        let name = descriptor.name.as_str();
        self.transition(name, ManagerState::ShuttingDown, None)?;
        self.emit(name, "stopping", json!({})).await;

        let limit = self.inner.config.shutdown_timeout();
        match guarded(Some(limit), descriptor.instance.shutdown()).await {
            Ok(()) => {
                self.transition(name, ManagerState::Stopped, None)?;
                info!(manager = %name, "管理器已停止");
                self.emit(name, "stopped", json!({})).await;
                Ok(())
            }
            Err(failure) => {
                let message = failure.to_string();
                if let Err(err) = self.transition(name, ManagerState::Failed, Some(message.clone())) {
                    warn!(manager = %name, error = %err, "无法标记管理器失败");
                }
                error!(manager = %name, error = %message, "管理器关闭失败");
                self.emit(name, "failed", json!({ "phase": "shutdown", "error": message }))
                    .await;
                Err(CoreError::ManagerShutdown {
                    manager: name.to_string(),
                    message,
                })
            }
        }
    }

    /// 按逆依赖顺序关闭全部管理器，尽力而为并汇总所有失败
    pub async fn stop_all(&self) -> CoreResult<()> {
        let _gate = self.inner.gate.lock().await;
        let operation = OperationContext::new("stop_all");
        self.stop_all_locked().instrument(operation.span()).await
    }

    async fn stop_all_locked(&self) -> CoreResult<()> {
        let snapshot = self.inner.table.load_full();
        let order = DependencyResolver::resolve(&snapshot.nodes()).unwrap_or_else(|err| {
            warn!(error = %err, "依赖解析失败，按注册顺序逆序关闭");
            snapshot.managers.iter().map(|d| d.name.clone()).collect()
        });

        self.set_phase(CorePhase::Stopping);
        let failures = self.shutdown_sequence(order.iter().rev()).await;
        self.set_phase(CorePhase::Stopped);

        if failures.is_empty() {
            info!("全部管理器已停止");
            Ok(())
        } else {
            error!(failed = failures.len(), "部分管理器关闭失败");
            Err(CoreError::Aggregate {
                operation: "stop_all".to_string(),
                failures,
            })
        }
    }

    /// 聚合健康状态
    ///
    /// 在描述符表快照上探测，不持有生命周期闸门。只有闸门空闲时才根据自报健康
    /// 调整状态，否则报告探测时的状态。
    pub async fn health(&self) -> SystemHealth {
        let snapshot = self.inner.table.load_full();
        let limit = self.inner.config.initialize_timeout();

        let mut components = BTreeMap::new();
        for descriptor in &snapshot.managers {
            if !descriptor.state.is_live() {
                components.insert(
                    descriptor.name.clone(),
                    ComponentHealth::new(descriptor.state, None, None),
                );
                continue;
            }

            let started_at = Instant::now();
            let call = AssertUnwindSafe(descriptor.instance.health()).catch_unwind();
            let report = match tokio::time::timeout(limit, call).await {
                Ok(Ok(report)) => report,
                Ok(Err(panic)) => HealthReport::failed(format!("健康检查 panic: {}", panic_message(panic.as_ref()))),
                Err(_) => HealthReport::failed("健康检查超时"),
            };
            let elapsed_ms = started_at.elapsed().as_millis() as u64;
            let state = self.reconcile(descriptor, &report).await;
            components.insert(
                descriptor.name.clone(),
                ComponentHealth::new(state, Some(&report), Some(elapsed_ms)),
            );
        }

        let phase = self.phase();
        let overall_status = if phase == CorePhase::Running {
            aggregate(components.values())
        } else {
            HealthStatus::Unhealthy
        };
        let bus = self.inner.bus.stats();

        SystemHealth {
            overall_status,
            phase,
            components,
            overflowing_subscribers: bus.overflowing_subscribers(),
            bus,
            last_check: chrono::Utc::now(),
        }
    }

    /// 根据自报健康调整 Running/Degraded/Failed
    async fn reconcile(&self, descriptor: &ManagerDescriptor, report: &HealthReport) -> ManagerState {
        let name = descriptor.name.as_str();
        let Ok(_gate) = self.inner.gate.try_lock() else {
            debug!(manager = %name, "生命周期操作进行中，跳过健康状态调整");
            return descriptor.state;
        };
        // 探测期间状态可能已变化
        let current = self.state_of(name).unwrap_or(descriptor.state);
        let target = match (current, report.status) {
            (ManagerState::Running, ManagerHealth::Degraded) => ManagerState::Degraded,
            (ManagerState::Degraded, ManagerHealth::Running) => ManagerState::Running,
            (ManagerState::Running | ManagerState::Degraded, ManagerHealth::Failed) => ManagerState::Failed,
            _ => return current,
        };

        let error = (target == ManagerState::Failed).then(|| report.detail.clone()).flatten();
        if let Err(err) = self.transition(name, target, error) {
            debug!(manager = %name, error = %err, "健康状态转换被拒绝");
            return current;
        }

        match target {
            ManagerState::Degraded => {
                warn!(manager = %name, detail = ?report.detail, "管理器降级");
                self.emit(name, "degraded", json!({ "detail": report.detail })).await;
            }
            ManagerState::Running => {
                info!(manager = %name, "管理器已恢复");
                self.emit(name, "started", json!({ "recovered": true })).await;
            }
            _ => {
                error!(manager = %name, detail = ?report.detail, "管理器健康检查失败");
                self.emit(name, "failed", json!({ "phase": "health", "detail": report.detail }))
                    .await;
            }
        }
        target
    }

    /// 运行中的管理器实例
    pub fn manager(&self, name: &str) -> Option<Arc<dyn Manager>> {
        self.inner
            .table
            .load()
            .find(name)
            .filter(|d| d.state.is_live())
            .map(|d| Arc::clone(&d.instance))
    }

    pub fn descriptor(&self, name: &str) -> Option<ManagerDescriptor> {
        self.inner.table.load().find(name).map(|d| ManagerDescriptor::clone(d))
    }

    pub fn state_of(&self, name: &str) -> Option<ManagerState> {
        self.inner.table.load().find(name).map(|d| d.state)
    }

    /// 按注册顺序的状态快照
    pub fn manager_states(&self) -> Vec<(String, ManagerState)> {
        self.inner
            .table
            .load()
            .managers
            .iter()
            .map(|d| (d.name.clone(), d.state))
            .collect()
    }

    /// 最近一次成功启动的顺序
    pub fn startup_order(&self) -> Vec<String> {
        self.inner.table.load().startup_order.clone()
    }

    pub fn phase(&self) -> CorePhase {
        self.inner.table.load().phase
    }
}
