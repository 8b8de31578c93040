// Nexus Core Library
// 微内核运行时：事件总线、生命周期编排与插件管理

pub mod bus;
pub mod config;
pub mod core;
pub mod errors;
pub mod health;
pub mod logging;
pub mod plugins;
pub mod services;

pub use bus::{DeliveryMode, Event, EventBus, ScopedBus};
pub use config::{AppConfig, ConfigLoader};
pub use core::{ApplicationCore, Manager, ManagerContext, ManagerState};
pub use errors::{CoreError, CoreResult, FailureReport};
pub use health::*;
pub use plugins::{Plugin, PluginHandle, PluginManager, PluginState};
