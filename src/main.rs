use std::path::PathBuf;

use nexus_core::config::ConfigLoader;
use nexus_core::core::ApplicationCore;
use nexus_core::errors::{CoreError, FailureReport};
use nexus_core::logging::LoggingSetup;
use nexus_core::plugins::{PluginManager, register_builtin_entry_points};
use nexus_core::services::register_builtin_services;
use nexus_core::bus::EventBus;

fn report(stage: &str, err: &CoreError) {
    let report = FailureReport::from_error(err);
    tracing::error!(stage, code = %report.code, failed = ?report.failed_units(), "{}", report.to_json());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 第一个参数可指定配置文件
    let config_file = std::env::args().nth(1).map(PathBuf::from);
    let config = ConfigLoader::init(config_file.as_deref())?;

    // 文件日志的写入 guard 需持有到进程退出
    let _log_guard = LoggingSetup::init(&config.logging)?;
    ConfigLoader::log_summary(&config);

    tracing::info!("🚀 启动 Nexus Core v{}", config.environment.version);

    let bus = EventBus::new(Some(config.event_bus.clone()));
    let core = ApplicationCore::new(bus.clone(), Some(config.lifecycle.clone()));
    register_builtin_services(&core, config.clone())?;

    if let Err(err) = core.start_all().await {
        report("start_all", &err);
        bus.close().await;
        return Err(err.into());
    }

    let plugins = PluginManager::new(core.clone(), Some(config.plugins.clone()));
    register_builtin_entry_points(&plugins)?;
    match plugins.discover(None).await {
        Ok(found) => tracing::info!(plugins = found.len(), "插件发现完成"),
        Err(err) => report("discover", &err),
    }
    if config.plugins.autoload {
        match plugins.load_all().await {
            Ok(loaded) => tracing::info!(loaded = ?loaded, "插件自动加载完成"),
            Err(err) => report("load_all", &err),
        }
    }

    let health = core.health().await;
    tracing::info!(status = ?health.overall_status, phase = ?health.phase, "📋 系统健康状态");

    tokio::signal::ctrl_c().await?;
    tracing::info!("收到退出信号，开始关闭");

    if let Err(err) = plugins.unload_all().await {
        report("unload_all", &err);
    }
    if let Err(err) = core.stop_all().await {
        report("stop_all", &err);
    }
    bus.close().await;

    tracing::info!("Nexus Core 已停止");
    Ok(())
}
