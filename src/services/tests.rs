// 内置服务测试

#[cfg(test)]
mod tests {
    use crate::bus::{DeliveryMode, EventBus, handler_fn};
    use crate::config::AppConfig;
    use crate::core::{ApplicationCore, Manager, ManagerHealth, ManagerState};
    use crate::services::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    async fn wait_for(condition: impl Fn() -> bool) -> bool {
        for _ in 0..300 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_config_service_publishes_and_answers_queries() {
        let core = ApplicationCore::new(EventBus::new(None), None);
        let loaded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&loaded);
        core.bus()
            .subscribe(
                "test.config",
                "config.loaded",
                handler_fn(move |event| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.lock().unwrap().push(event.payload().clone());
                        Ok(())
                    }
                }),
                DeliveryMode::Sync,
            )
            .unwrap();

        register_builtin_services(&core, AppConfig::default()).unwrap();
        let order = core.start_all().await.unwrap();
        assert_eq!(order, vec![CONFIG_SERVICE, MONITORING_SERVICE]);

        assert!(wait_for(|| loaded.lock().unwrap().len() == 1).await);
        assert_eq!(loaded.lock().unwrap()[0]["plugins_directory"], json!("plugins"));

        let config = core.manager(CONFIG_SERVICE).unwrap();
        assert_eq!(config.query("plugins.manifest_file").await, Some(json!("plugin.toml")));
        assert_eq!(config.query("plugins.missing").await, None);

        core.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_monitoring_counts_and_degrades_on_failure() {
        let core = ApplicationCore::new(EventBus::new(None), None);
        let monitoring = Arc::new(MonitoringService::new());
        core.register(CONFIG_SERVICE, Vec::<String>::new(), Arc::new(ConfigService::new(None)))
            .unwrap();
        core.register(MONITORING_SERVICE, [CONFIG_SERVICE], monitoring.clone())
            .unwrap();
        core.start_all().await.unwrap();

        // 监控服务只看得到自己启动之后的事件
        assert!(wait_for(|| monitoring.counters().manager_events("started") == 1).await);
        assert_eq!(monitoring.health().await.status, ManagerHealth::Running);

        core.bus()
            .publish("plugin.analytics.failed", "test", json!({ "error": "boom" }), None)
            .await
            .unwrap();
        assert!(wait_for(|| monitoring.counters().failures == 1).await);

        let counters = monitoring.counters();
        assert_eq!(counters.plugin_events("failed"), 1);
        assert_eq!(counters.last_failure.as_deref(), Some("plugin.analytics.failed"));
        assert_eq!(monitoring.health().await.status, ManagerHealth::Degraded);

        core.health().await;
        assert_eq!(core.state_of(MONITORING_SERVICE), Some(ManagerState::Degraded));
        assert_eq!(monitoring.query("failures").await, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_monitoring_unsubscribes_on_shutdown() {
        let bus = EventBus::new(None);
        let core = ApplicationCore::new(bus.clone(), None);
        register_builtin_services(&core, AppConfig::default()).unwrap();
        core.start_all().await.unwrap();
        assert!(bus.is_subscribed("monitoring.manager_events"));
        assert!(bus.is_subscribed("monitoring.plugin_events"));

        core.stop_all().await.unwrap();
        assert_eq!(bus.subscription_count(), 0);
    }
}
