// 错误处理模块
// 定义统一的错误类型和汇总报告

pub mod types;
pub mod report;


pub use types::*;
pub use report::*;
