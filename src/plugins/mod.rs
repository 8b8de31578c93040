// 插件系统模块
// 插件清单、入口注册表、生命周期状态机与插件管理器

pub mod interface;
pub mod lifecycle;
pub mod loader;
pub mod registry;
pub mod manager;
pub mod builtin;

#[cfg(test)]
mod tests;

pub use interface::*;
pub use lifecycle::*;
pub use loader::*;
pub use registry::*;
pub use manager::*;
pub use builtin::*;
