// 受保护的钩子调用
// 捕获 panic 并施加可选超时，失败只影响被调用的单元

use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

/// 钩子失败原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookFailure {
    Error(String),
    Panic(String),
    Timeout(Duration),
}

impl fmt::Display for HookFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(message) => f.write_str(message),
            Self::Panic(message) => write!(f, "panic: {}", message),
            Self::Timeout(limit) => write!(f, "超过 {}ms 未完成", limit.as_millis()),
        }
    }
}

/// 运行钩子；`limit` 为空时不设超时
pub async fn guarded<F>(limit: Option<Duration>, hook: F) -> Result<(), HookFailure>
where
    F: Future<Output = anyhow::Result<()>>,
{
    let call = AssertUnwindSafe(hook).catch_unwind();
    let outcome = match limit {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(HookFailure::Timeout(limit)),
        },
        None => call.await,
    };

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(HookFailure::Error(format!("{:#}", err))),
        Err(panic) => Err(HookFailure::Panic(panic_message(panic.as_ref()))),
    }
}

pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "未知 panic".to_string()
    }
}
