// 插件系统测试

#[cfg(test)]
mod tests {
    use crate::bus::{DeliveryMode, EventBus, handler_fn};
    use crate::config::PluginsConfig;
    use crate::core::{ApplicationCore, HealthReport, Manager, ManagerContext};
    use crate::errors::CoreError;
    use crate::plugins::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    type Journal = Arc<Mutex<Vec<String>>>;
    type HandleSlot = Arc<Mutex<Option<PluginHandle>>>;

    #[derive(Clone, Copy, Default)]
    enum Behaviour {
        #[default]
        Normal,
        FailInit,
        PanicInit,
        FailShutdown,
    }

    struct RecordingPlugin {
        name: String,
        version: String,
        behaviour: Behaviour,
        journal: Journal,
        slot: HandleSlot,
    }

    #[async_trait]
    impl Plugin for RecordingPlugin {
        async fn initialize(&mut self, handle: PluginHandle) -> anyhow::Result<()> {
            let journal = Arc::clone(&self.journal);
            let name = self.name.clone();
            handle.bus().subscribe(
                "events",
                "order.*",
                handler_fn(move |event| {
                    let journal = Arc::clone(&journal);
                    let name = name.clone();
                    async move {
                        journal.lock().unwrap().push(format!("{}:{}", name, event.topic()));
                        Ok(())
                    }
                }),
                DeliveryMode::Sync,
            )?;
            handle
                .bus()
                .subscribe("audit", "order.**", handler_fn(|_| async { Ok(()) }), DeliveryMode::Async)?;

            *self.slot.lock().unwrap() = Some(handle);
            self.journal
                .lock()
                .unwrap()
                .push(format!("init:{}@{}", self.name, self.version));

            match self.behaviour {
                Behaviour::FailInit => anyhow::bail!("{} init failed", self.name),
                Behaviour::PanicInit => panic!("{} exploded", self.name),
                _ => Ok(()),
            }
        }

        async fn shutdown(&mut self) -> anyhow::Result<()> {
            self.journal
                .lock()
                .unwrap()
                .push(format!("stop:{}@{}", self.name, self.version));
            match self.behaviour {
                Behaviour::FailShutdown => anyhow::bail!("{} refused to stop", self.name),
                _ => Ok(()),
            }
        }
    }

    struct StaticManager;

    #[async_trait]
    impl Manager for StaticManager {
        async fn initialize(&self, _context: &ManagerContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn shutdown(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn health(&self) -> HealthReport {
            HealthReport::running()
        }
    }

    struct Fixture {
        dir: TempDir,
        core: ApplicationCore,
        plugins: PluginManager,
        journal: Journal,
        slot: HandleSlot,
    }

    impl Fixture {
        async fn new(configure: impl FnOnce(&mut PluginsConfig)) -> Self {
            let dir = TempDir::new().unwrap();
            let core = ApplicationCore::new(EventBus::new(None), None);
            core.register("config", Vec::<String>::new(), Arc::new(StaticManager)).unwrap();
            core.register("metrics", Vec::<String>::new(), Arc::new(StaticManager)).unwrap();
            core.start_all().await.unwrap();

            let mut config = PluginsConfig {
                directory: dir.path().display().to_string(),
                ..PluginsConfig::default()
            };
            configure(&mut config);
            let plugins = PluginManager::new(core.clone(), Some(config));

            Self {
                dir,
                core,
                plugins,
                journal: Journal::default(),
                slot: HandleSlot::default(),
            }
        }

        fn path(&self) -> &Path {
            self.dir.path()
        }

        fn bus(&self) -> &EventBus {
            self.core.bus()
        }

        fn entry(&self, entry_point: &str, behaviour: Behaviour) {
            let journal = Arc::clone(&self.journal);
            let slot = Arc::clone(&self.slot);
            self.plugins
                .register_entry_point(
                    entry_point,
                    factory_fn(move |manifest| {
                        Ok(Box::new(RecordingPlugin {
                            name: manifest.name.clone(),
                            version: manifest.version.to_string(),
                            behaviour,
                            journal: Arc::clone(&journal),
                            slot: Arc::clone(&slot),
                        }) as Box<dyn Plugin>)
                    }),
                )
                .unwrap();
        }

        fn manifest(&self, name: &str, version: &str, entry_point: &str, capabilities: &[&str], dependencies: &[(&str, &str)]) {
            let capabilities: Vec<String> = capabilities.iter().map(|c| format!("\"{}\"", c)).collect();
            let mut text = format!(
                "name = \"{}\"\nversion = \"{}\"\nentry_point = \"{}\"\ncapabilities_required = [{}]\n",
                name,
                version,
                entry_point,
                capabilities.join(", ")
            );
            for (dependency, requirement) in dependencies {
                text.push_str(&format!(
                    "\n[[dependencies]]\nname = \"{}\"\nversion = \"{}\"\n",
                    dependency, requirement
                ));
            }
            let plugin_dir = self.path().join(name);
            std::fs::create_dir_all(&plugin_dir).unwrap();
            std::fs::write(plugin_dir.join("plugin.toml"), text).unwrap();
        }

        fn journal(&self) -> Vec<String> {
            self.journal.lock().unwrap().clone()
        }

        fn observe(&self, pattern: &str) -> Journal {
            let topics = Journal::default();
            let sink = Arc::clone(&topics);
            self.bus()
                .subscribe(
                    "test.observer",
                    pattern,
                    handler_fn(move |event| {
                        let sink = Arc::clone(&sink);
                        async move {
                            sink.lock().unwrap().push(event.topic().to_string());
                            Ok(())
                        }
                    }),
                    DeliveryMode::Sync,
                )
                .unwrap();
            topics
        }
    }

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
    async fn test_discover_load_unload_lifecycle() {
        let fixture = Fixture::new(|_| {}).await;
        let topics = fixture.observe("plugin.**");
        fixture.entry("analytics", Behaviour::Normal);
        fixture.manifest("analytics", "1.0.0", "analytics", &["config"], &[]);

        let descriptors = fixture.plugins.discover(None).await.unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].state, PluginState::Discovered);
        assert!(descriptors[0].checksum.is_some());

        fixture.plugins.load("analytics").await.unwrap();
        assert_eq!(fixture.plugins.state_of("analytics"), Some(PluginState::Active));
        assert_eq!(
            fixture.plugins.subscriptions_of("analytics"),
            vec!["analytics.audit", "analytics.events"]
        );
        assert_eq!(fixture.plugins.active_plugins(), vec!["analytics"]);

        fixture
            .bus()
            .publish("order.created", "test", json!({ "id": 1 }), None)
            .await
            .unwrap();
        assert!(wait_for(|| fixture.journal().contains(&"analytics:order.created".to_string())).await);

        fixture.plugins.unload("analytics").await.unwrap();
        assert_eq!(fixture.plugins.state_of("analytics"), Some(PluginState::Unloaded));
        assert!(fixture.plugins.subscriptions_of("analytics").is_empty());

        let expected = vec![
            "plugin.analytics.discovered",
            "plugin.analytics.validated",
            "plugin.analytics.loading",
            "plugin.analytics.active",
            "plugin.analytics.unloading",
            "plugin.analytics.unloaded",
        ];
        assert!(wait_for(|| topics.lock().unwrap().len() == expected.len()).await);
        assert_eq!(*topics.lock().unwrap(), expected);

        let states: Vec<PluginState> = fixture.plugins.transitions("analytics").iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![
                PluginState::Validated,
                PluginState::Loading,
                PluginState::Active,
                PluginState::Unloading,
                PluginState::Unloaded
            ]
        );
    }

    #[tokio::test]
    async fn test_unload_revokes_even_when_shutdown_fails() {
        let fixture = Fixture::new(|_| {}).await;
        fixture.entry("analytics", Behaviour::FailShutdown);
        fixture.manifest("analytics", "1.0.0", "analytics", &[], &[]);
        fixture.plugins.discover(None).await.unwrap();
        fixture.plugins.load("analytics").await.unwrap();
        assert_eq!(fixture.plugins.subscriptions_of("analytics").len(), 2);

        match fixture.plugins.unload("analytics").await.unwrap_err() {
            CoreError::PluginShutdown { plugin, message } => {
                assert_eq!(plugin, "analytics");
                assert!(message.contains("refused to stop"));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(fixture.plugins.state_of("analytics"), Some(PluginState::Unloaded));
        assert!(fixture.plugins.subscriptions_of("analytics").is_empty());
        assert!(fixture.journal().contains(&"stop:analytics@1.0.0".to_string()));

        // 卸载后旧句柄失效
        let handle = fixture.slot.lock().unwrap().clone().unwrap();
        assert!(matches!(
            handle.bus().publish("analytics.ping", json!({}), None).await,
            Err(CoreError::Revoked { .. })
        ));
        assert!(matches!(
            handle.bus().subscribe("late", "order.*", handler_fn(|_| async { Ok(()) }), DeliveryMode::Sync),
            Err(CoreError::Revoked { .. })
        ));
        assert!(fixture.plugins.subscriptions_of("analytics").is_empty());
    }

    #[tokio::test]
    async fn test_load_failure_leaves_zero_subscriptions() {
        let fixture = Fixture::new(|_| {}).await;
        fixture.entry("failing", Behaviour::FailInit);
        fixture.entry("panicking", Behaviour::PanicInit);
        fixture.manifest("broken", "1.0.0", "failing", &[], &[]);
        fixture.manifest("wild", "1.0.0", "panicking", &[], &[]);
        fixture.plugins.discover(None).await.unwrap();

        let err = fixture.plugins.load("broken").await.unwrap_err();
        assert!(matches!(err, CoreError::PluginLoadFailure { .. }));
        assert!(err.to_string().contains("broken init failed"));
        assert_eq!(fixture.plugins.state_of("broken"), Some(PluginState::Failed));
        assert!(fixture.plugins.subscriptions_of("broken").is_empty());

        let err = fixture.plugins.load("wild").await.unwrap_err();
        assert!(err.to_string().contains("panic"));
        assert_eq!(fixture.plugins.state_of("wild"), Some(PluginState::Failed));
        assert!(fixture.plugins.subscriptions_of("wild").is_empty());
        assert_eq!(fixture.bus().subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_reload_swaps_version() {
        let fixture = Fixture::new(|_| {}).await;
        fixture.entry("analytics", Behaviour::Normal);
        fixture.manifest("analytics", "1.0.0", "analytics", &[], &[]);
        fixture.plugins.discover(None).await.unwrap();
        fixture.plugins.load("analytics").await.unwrap();

        fixture.manifest("analytics", "2.0.0", "analytics", &[], &[]);
        fixture.plugins.reload("analytics").await.unwrap();

        assert_eq!(fixture.plugins.state_of("analytics"), Some(PluginState::Active));
        let descriptor = fixture.plugins.descriptor("analytics").unwrap();
        assert_eq!(descriptor.version().unwrap().to_string(), "2.0.0");
        let versions: Vec<String> = fixture
            .plugins
            .version_history("analytics")
            .iter()
            .map(|v| v.version.to_string())
            .collect();
        assert_eq!(versions, vec!["1.0.0", "2.0.0"]);
        assert_eq!(
            fixture.journal(),
            vec!["init:analytics@1.0.0", "stop:analytics@1.0.0", "init:analytics@2.0.0"]
        );
        assert_eq!(fixture.plugins.subscriptions_of("analytics").len(), 2);
    }

    #[tokio::test]
    async fn test_reload_failure_does_not_roll_back() {
        let fixture = Fixture::new(|_| {}).await;
        fixture.entry("analytics_v1", Behaviour::Normal);
        fixture.entry("analytics_v2", Behaviour::FailInit);
        fixture.manifest("analytics", "1.0.0", "analytics_v1", &[], &[]);
        fixture.plugins.discover(None).await.unwrap();
        fixture.plugins.load("analytics").await.unwrap();

        fixture.manifest("analytics", "2.0.0", "analytics_v2", &[], &[]);
        let err = fixture.plugins.reload("analytics").await.unwrap_err();
        assert!(matches!(err, CoreError::PluginLoadFailure { .. }));

        assert_eq!(fixture.plugins.state_of("analytics"), Some(PluginState::Failed));
        assert!(fixture.plugins.subscriptions_of("analytics").is_empty());
        assert_eq!(
            fixture.plugins.descriptor("analytics").unwrap().version().unwrap().to_string(),
            "2.0.0"
        );
        assert_eq!(fixture.plugins.version_history("analytics").len(), 1);
        assert_eq!(fixture.plugins.active_plugins(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_capabilities_are_scoped_to_declarations() {
        let fixture = Fixture::new(|_| {}).await;
        fixture.entry("analytics", Behaviour::Normal);
        fixture.entry("reporting", Behaviour::Normal);
        fixture.manifest("analytics", "1.0.0", "analytics", &["config"], &[]);
        fixture.manifest("reporting", "1.0.0", "reporting", &["database"], &[]);
        fixture.plugins.discover(None).await.unwrap();

        fixture.plugins.load("analytics").await.unwrap();
        let handle = fixture.slot.lock().unwrap().clone().unwrap();
        assert_eq!(handle.name(), "analytics");
        assert_eq!(handle.capabilities(), vec!["config"]);
        assert!(handle.manager("config").is_some());
        assert!(handle.manager("metrics").is_none());

        match fixture.plugins.validate("reporting").await.unwrap_err() {
            CoreError::MissingCapability { plugin, capability } => {
                assert_eq!(plugin, "reporting");
                assert_eq!(capability, "database");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fixture.plugins.state_of("reporting"), Some(PluginState::Failed));
        assert!(
            fixture
                .plugins
                .descriptor("reporting")
                .unwrap()
                .last_error
                .unwrap()
                .contains("database")
        );
    }

    #[tokio::test]
    async fn test_unsatisfied_version_range() {
        let fixture = Fixture::new(|_| {}).await;
        fixture.entry("storage", Behaviour::Normal);
        fixture.entry("analytics", Behaviour::Normal);
        fixture.manifest("storage", "1.4.0", "storage", &[], &[]);
        fixture.manifest("analytics", "1.0.0", "analytics", &[], &[("storage", "^2.0")]);
        fixture.plugins.discover(None).await.unwrap();

        match fixture.plugins.validate("analytics").await.unwrap_err() {
            CoreError::UnsatisfiedDependency {
                plugin,
                dependency,
                requirement,
                found,
            } => {
                assert_eq!(plugin, "analytics");
                assert_eq!(dependency, "storage");
                assert_eq!(requirement, "^2.0");
                assert_eq!(found.as_deref(), Some("1.4.0"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fixture.plugins.state_of("analytics"), Some(PluginState::Failed));
        assert!(fixture.journal().is_empty());
    }

    #[tokio::test]
    async fn test_load_requires_active_dependency() {
        let fixture = Fixture::new(|_| {}).await;
        fixture.entry("storage", Behaviour::Normal);
        fixture.entry("analytics", Behaviour::Normal);
        fixture.manifest("storage", "2.1.0", "storage", &[], &[]);
        fixture.manifest("analytics", "1.0.0", "analytics", &[], &[("storage", "^2")]);
        fixture.plugins.discover(None).await.unwrap();

        let err = fixture.plugins.load("analytics").await.unwrap_err();
        assert!(matches!(err, CoreError::UnsatisfiedDependency { .. }));
        assert_eq!(fixture.plugins.state_of("analytics"), Some(PluginState::Failed));
        assert!(fixture.journal().is_empty());

        fixture.plugins.load("storage").await.unwrap();
        fixture.plugins.load("analytics").await.unwrap();
        assert_eq!(fixture.plugins.state_of("analytics"), Some(PluginState::Active));
    }

    #[tokio::test]
    async fn test_dependency_ordering_and_dependents_guard() {
        let fixture = Fixture::new(|_| {}).await;
        fixture.entry("storage", Behaviour::Normal);
        fixture.entry("analytics", Behaviour::Normal);
        fixture.manifest("storage", "2.1.0", "storage", &[], &[]);
        fixture.manifest("analytics", "1.0.0", "analytics", &[], &[("storage", "^2")]);
        fixture.plugins.discover(None).await.unwrap();

        let loaded = fixture.plugins.load_all().await.unwrap();
        assert_eq!(loaded, vec!["storage", "analytics"]);
        assert_eq!(fixture.journal(), vec!["init:storage@2.1.0", "init:analytics@1.0.0"]);

        match fixture.plugins.unload("storage").await.unwrap_err() {
            CoreError::DependentsActive { plugin, dependents } => {
                assert_eq!(plugin, "storage");
                assert_eq!(dependents, vec!["analytics"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fixture.plugins.state_of("storage"), Some(PluginState::Active));

        fixture.plugins.unload_all().await.unwrap();
        assert_eq!(
            fixture.journal()[2..].to_vec(),
            vec!["stop:analytics@1.0.0", "stop:storage@2.1.0"]
        );
        let status = fixture.plugins.status();
        assert_eq!(status.total, 2);
        assert_eq!(status.count(PluginState::Unloaded), 2);
        assert_eq!(status.count(PluginState::Active), 0);
    }

    #[tokio::test]
    async fn test_load_all_reports_every_failure() {
        let fixture = Fixture::new(|_| {}).await;
        fixture.entry("gamma", Behaviour::Normal);
        fixture.manifest("alpha", "1.0.0", "gamma", &["database"], &[]);
        fixture.manifest("beta", "1.0.0", "ghost", &[], &[]);
        fixture.manifest("gamma", "1.0.0", "gamma", &[], &[]);
        std::fs::write(fixture.path().join("junk.toml"), "version = [").unwrap();

        let descriptors = fixture.plugins.discover(None).await.unwrap();
        assert_eq!(descriptors.len(), 4);
        assert_eq!(fixture.plugins.state_of("junk"), Some(PluginState::Failed));

        match fixture.plugins.load_all().await.unwrap_err() {
            CoreError::Aggregate { operation, failures } => {
                assert_eq!(operation, "load_all");
                let units: Vec<&str> = failures.iter().map(|f| f.unit.as_str()).collect();
                assert_eq!(units, vec!["alpha", "beta"]);
                assert_eq!(failures[0].code, "MISSING_CAPABILITY");
                assert_eq!(failures[1].code, "PLUGIN_LOAD_FAILURE");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fixture.plugins.active_plugins(), vec!["gamma"]);
    }

    #[tokio::test]
    async fn test_disable_and_enable() {
        let fixture = Fixture::new(|config| config.disabled = vec!["analytics".to_string()]).await;
        fixture.entry("analytics", Behaviour::Normal);
        fixture.manifest("analytics", "1.0.0", "analytics", &[], &[]);
        let descriptors = fixture.plugins.discover(None).await.unwrap();
        assert!(!descriptors[0].enabled);

        assert!(matches!(
            fixture.plugins.load("analytics").await,
            Err(CoreError::PluginDisabled { .. })
        ));
        assert!(fixture.plugins.load_all().await.unwrap().is_empty());

        fixture.plugins.enable("analytics").await.unwrap();
        fixture.plugins.load("analytics").await.unwrap();
        assert_eq!(fixture.plugins.state_of("analytics"), Some(PluginState::Active));

        fixture.plugins.disable("analytics").await.unwrap();
        assert_eq!(fixture.plugins.state_of("analytics"), Some(PluginState::Unloaded));
        assert!(fixture.plugins.is_disabled("analytics"));
        assert!(fixture.plugins.subscriptions_of("analytics").is_empty());
        assert_eq!(fixture.plugins.status().disabled, vec!["analytics"]);
    }

    #[tokio::test]
    async fn test_rediscovery_keeps_active_and_drops_removed() {
        let fixture = Fixture::new(|_| {}).await;
        fixture.entry("analytics", Behaviour::Normal);
        fixture.manifest("analytics", "1.0.0", "analytics", &[], &[]);
        fixture.manifest("storage", "1.0.0", "analytics", &[], &[]);
        fixture.plugins.discover(None).await.unwrap();
        fixture.plugins.load("analytics").await.unwrap();

        fixture.manifest("analytics", "1.1.0", "analytics", &[], &[]);
        std::fs::remove_dir_all(fixture.path().join("storage")).unwrap();
        fixture.plugins.discover(None).await.unwrap();

        let analytics = fixture.plugins.descriptor("analytics").unwrap();
        assert_eq!(analytics.state, PluginState::Active);
        assert_eq!(analytics.version().unwrap().to_string(), "1.0.0");
        assert!(fixture.plugins.descriptor("storage").is_none());
        assert_eq!(fixture.plugins.list().len(), 1);
    }

    #[tokio::test]
    async fn test_builtin_event_logger() {
        let fixture = Fixture::new(|_| {}).await;
        register_builtin_entry_points(&fixture.plugins).unwrap();
        fixture.manifest("event_logger", "0.1.0", EVENT_LOGGER_ENTRY, &[], &[]);
        fixture.plugins.discover(None).await.unwrap();

        fixture.plugins.load("event_logger").await.unwrap();
        assert_eq!(
            fixture.plugins.subscriptions_of("event_logger"),
            vec!["event_logger.events"]
        );
        fixture.plugins.unload("event_logger").await.unwrap();
        assert!(fixture.plugins.subscriptions_of("event_logger").is_empty());
    }

    #[tokio::test]
    async fn test_plugin_cannot_take_manager_namespace() {
        let fixture = Fixture::new(|_| {}).await;
        fixture
            .bus()
            .subscribe("config.watch", "order.*", handler_fn(|_| async { Ok(()) }), DeliveryMode::Sync)
            .unwrap();
        fixture.entry("rogue", Behaviour::FailInit);
        fixture.manifest("config", "1.0.0", "rogue", &[], &[]);
        fixture.plugins.discover(None).await.unwrap();

        let err = fixture.plugins.load("config").await.unwrap_err();
        assert!(matches!(err, CoreError::NamespaceConflict { ref name, .. } if name == "config"));
        assert_eq!(fixture.plugins.state_of("config"), Some(PluginState::Failed));
        // 管理器的订阅不受影响，插件未被实例化
        assert!(fixture.bus().is_subscribed("config.watch"));
        assert!(fixture.journal().is_empty());
    }

    #[tokio::test]
    async fn test_manager_cannot_take_plugin_namespace() {
        let fixture = Fixture::new(|_| {}).await;
        fixture.entry("analytics", Behaviour::Normal);
        fixture.manifest("analytics", "1.0.0", "analytics", &[], &[]);
        fixture.plugins.discover(None).await.unwrap();
        fixture.plugins.load("analytics").await.unwrap();
        fixture.core.stop_all().await.unwrap();

        let err = fixture
            .core
            .register("analytics", Vec::<String>::new(), Arc::new(StaticManager))
            .unwrap_err();
        assert_eq!(err.error_code(), "NAMESPACE_CONFLICT");

        // 卸载后命名空间释放
        fixture.plugins.unload("analytics").await.unwrap();
        fixture
            .core
            .register("analytics", Vec::<String>::new(), Arc::new(StaticManager))
            .unwrap();
    }
}
