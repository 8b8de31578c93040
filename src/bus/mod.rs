// 事件总线模块
// 进程内发布/订阅：主题路由、有界队列、独立投递路径

pub mod event;
pub mod topic;
pub mod queue;
pub mod handler;
pub mod broker;
pub mod scoped;


pub use event::*;
pub use topic::*;
pub use queue::*;
pub use handler::*;
pub use broker::*;
pub use scoped::*;
