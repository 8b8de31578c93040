// 协调核心模块
// 依赖解析、管理器契约与生命周期编排

pub mod guard;
pub mod resolver;
pub mod manager;
pub mod orchestrator;

#[cfg(test)]
mod tests;

pub use guard::*;
pub use resolver::*;
pub use manager::*;
pub use orchestrator::*;
