// 协调核心测试

#[cfg(test)]
mod tests {
    use crate::bus::{DeliveryMode, EventBus, handler_fn};
    use crate::core::*;
    use crate::errors::CoreError;
    use crate::health::HealthStatus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::Notify;

    type Journal = Arc<Mutex<Vec<String>>>;

    #[derive(Default, Clone, Copy)]
    enum Behaviour {
        #[default]
        Normal,
        FailInit,
        PanicInit,
        FailShutdown,
    }

    struct TestManager {
        name: String,
        journal: Journal,
        behaviour: Behaviour,
        report: Mutex<HealthReport>,
        seen_dependencies: Mutex<Vec<String>>,
    }

    impl TestManager {
        fn new(name: &str, journal: &Journal, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                journal: Arc::clone(journal),
                behaviour,
                report: Mutex::new(HealthReport::running()),
                seen_dependencies: Mutex::new(Vec::new()),
            })
        }

        fn set_report(&self, report: HealthReport) {
            *self.report.lock().unwrap() = report;
        }
    }

    #[async_trait]
    impl Manager for TestManager {
        async fn initialize(&self, context: &ManagerContext) -> anyhow::Result<()> {
            self.journal.lock().unwrap().push(format!("init:{}", self.name));
            *self.seen_dependencies.lock().unwrap() = context.dependency_names();
            match self.behaviour {
                Behaviour::FailInit => anyhow::bail!("{} cannot start", self.name),
                Behaviour::PanicInit => panic!("{} exploded", self.name),
                _ => Ok(()),
            }
        }

        async fn shutdown(&self) -> anyhow::Result<()> {
            self.journal.lock().unwrap().push(format!("stop:{}", self.name));
            match self.behaviour {
                Behaviour::FailShutdown => anyhow::bail!("{} refused to stop", self.name),
                _ => Ok(()),
            }
        }

        async fn health(&self) -> HealthReport {
            self.report.lock().unwrap().clone()
        }
    }

    /// 健康检查挂起到测试放行
    #[derive(Default)]
    struct SlowHealthManager {
        probing: AtomicBool,
        release: Notify,
    }

    #[async_trait]
    impl Manager for SlowHealthManager {
        async fn initialize(&self, _context: &ManagerContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn shutdown(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn health(&self) -> HealthReport {
            self.probing.store(true, Ordering::SeqCst);
            self.release.notified().await;
            HealthReport::degraded("slow disk")
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

    fn observe(bus: &EventBus, pattern: &str) -> Journal {
        let topics = Journal::default();
        let sink = Arc::clone(&topics);
        bus.subscribe(
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

    fn node(name: &str, deps: &[&str]) -> DependencyNode {
        DependencyNode::new(name, deps.iter().copied())
    }

    #[test]
    fn test_resolver_orders_dependencies_first() {
        let nodes = vec![node("api", &["db"]), node("db", &["config"]), node("config", &[])];
        assert_eq!(
            DependencyResolver::resolve(&nodes).unwrap(),
            vec!["config", "db", "api"]
        );
    }

    #[test]
    fn test_resolver_breaks_ties_by_declaration_order() {
        let nodes = vec![
            node("metrics", &[]),
            node("cache", &["config"]),
            node("config", &[]),
            node("auth", &[]),
        ];
        assert_eq!(
            DependencyResolver::resolve(&nodes).unwrap(),
            vec!["metrics", "config", "cache", "auth"]
        );
        assert!(DependencyResolver::resolve(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_resolver_reports_missing_dependency() {
        let nodes = vec![node("db", &["config"]), node("api", &["db", "auth"])];
        match DependencyResolver::resolve(&nodes).unwrap_err() {
            CoreError::MissingDependency { unit, dependency } => {
                assert_eq!(unit, "db");
                assert_eq!(dependency, "config");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_resolver_reports_cycle_path() {
        let nodes = vec![node("a", &["b"]), node("b", &["a"])];
        match DependencyResolver::resolve(&nodes).unwrap_err() {
            CoreError::CyclicDependency { cycle } => assert_eq!(cycle, vec!["a", "b", "a"]),
            other => panic!("unexpected error: {other}"),
        }

        let nodes = vec![node("root", &[]), node("x", &["root", "y"]), node("y", &["z"]), node("z", &["x"])];
        match DependencyResolver::resolve(&nodes).unwrap_err() {
            CoreError::CyclicDependency { cycle } => assert_eq!(cycle, vec!["x", "y", "z", "x"]),
            other => panic!("unexpected error: {other}"),
        }

        let nodes = vec![node("solo", &["solo"])];
        assert!(matches!(
            DependencyResolver::resolve(&nodes),
            Err(CoreError::CyclicDependency { cycle }) if cycle == vec!["solo", "solo"]
        ));
    }

    #[test]
    fn test_resolver_rejects_duplicates_and_finds_dependents() {
        let nodes = vec![node("a", &[]), node("a", &[])];
        assert!(matches!(
            DependencyResolver::resolve(&nodes),
            Err(CoreError::InvalidName { .. })
        ));

        let nodes = vec![node("a", &[]), node("b", &["a"]), node("c", &["a", "b"])];
        assert_eq!(DependencyResolver::dependents(&nodes, "a"), vec!["b", "c"]);
        assert!(DependencyResolver::dependents(&nodes, "c").is_empty());
    }

    #[test]
    fn test_manager_state_machine() {
        use ManagerState::*;
        assert!(Created.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Failed));
        assert!(Running.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Running));
        assert!(ShuttingDown.can_transition_to(Failed));
        assert!(!Created.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Stopped));
    }

    #[tokio::test]
    async fn test_start_all_end_to_end() {
        let bus = EventBus::new(None);
        let topics = observe(&bus, "manager.**");
        let core = ApplicationCore::new(bus.clone(), None);
        let journal = Journal::default();

        let config = TestManager::new("config", &journal, Behaviour::Normal);
        let db = TestManager::new("db", &journal, Behaviour::Normal);
        let api = TestManager::new("api", &journal, Behaviour::Normal);
        core.register("config", Vec::<String>::new(), config.clone()).unwrap();
        core.register("db", ["config"], db.clone()).unwrap();
        core.register("api", ["db"], api.clone()).unwrap();

        let order = core.start_all().await.unwrap();
        assert_eq!(order, vec!["config", "db", "api"]);
        assert_eq!(core.startup_order(), order);
        assert_eq!(core.phase(), CorePhase::Running);
        for (_, state) in core.manager_states() {
            assert_eq!(state, ManagerState::Running);
        }

        // 上下文只暴露声明的依赖
        assert_eq!(*db.seen_dependencies.lock().unwrap(), vec!["config"]);
        assert_eq!(*api.seen_dependencies.lock().unwrap(), vec!["db"]);

        let expected = vec![
            "manager.config.starting",
            "manager.config.started",
            "manager.db.starting",
            "manager.db.started",
            "manager.api.starting",
            "manager.api.started",
        ];
        assert!(wait_for(|| topics.lock().unwrap().len() == expected.len()).await);
        assert_eq!(*topics.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_cycle_fails_fast_without_side_effects() {
        let bus = EventBus::new(None);
        let core = ApplicationCore::new(bus.clone(), None);
        let journal = Journal::default();
        core.register("a", ["b"], TestManager::new("a", &journal, Behaviour::Normal)).unwrap();
        core.register("b", ["a"], TestManager::new("b", &journal, Behaviour::Normal)).unwrap();

        let err = core.start_all().await.unwrap_err();
        assert!(matches!(err, CoreError::CyclicDependency { .. }));
        assert_eq!(
            core.manager_states(),
            vec![("a".to_string(), ManagerState::Created), ("b".to_string(), ManagerState::Created)]
        );
        assert!(journal.lock().unwrap().is_empty());
        assert_eq!(bus.stats().published, 0);
        assert_eq!(core.phase(), CorePhase::Idle);
    }

    #[tokio::test]
    async fn test_missing_dependency_fails_fast() {
        let core = ApplicationCore::new(EventBus::new(None), None);
        let journal = Journal::default();
        core.register("api", ["db"], TestManager::new("api", &journal, Behaviour::Normal)).unwrap();

        assert!(matches!(
            core.start_all().await,
            Err(CoreError::MissingDependency { .. })
        ));
        assert_eq!(core.state_of("api"), Some(ManagerState::Created));
    }

    #[tokio::test]
    async fn test_partial_start_rolls_back_in_reverse() {
        let bus = EventBus::new(None);
        let topics = observe(&bus, "manager.*.failed");
        let core = ApplicationCore::new(bus, None);
        let journal = Journal::default();
        core.register("a", Vec::<String>::new(), TestManager::new("a", &journal, Behaviour::Normal)).unwrap();
        core.register("b", Vec::<String>::new(), TestManager::new("b", &journal, Behaviour::Normal)).unwrap();
        core.register("c", ["a", "b"], TestManager::new("c", &journal, Behaviour::FailInit)).unwrap();

        match core.start_all().await.unwrap_err() {
            CoreError::StartupAborted { manager, cause, rollback_failures } => {
                assert_eq!(manager, "c");
                assert!(matches!(*cause, CoreError::ManagerInitialization { .. }));
                assert!(cause.to_string().contains("c cannot start"));
                assert!(rollback_failures.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(core.state_of("a"), Some(ManagerState::Stopped));
        assert_eq!(core.state_of("b"), Some(ManagerState::Stopped));
        assert_eq!(core.state_of("c"), Some(ManagerState::Failed));
        assert!(core.descriptor("c").unwrap().last_error.unwrap().contains("c cannot start"));
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["init:a", "init:b", "init:c", "stop:b", "stop:a"]
        );
        assert_eq!(core.phase(), CorePhase::Failed);
        assert!(wait_for(|| topics.lock().unwrap().as_slice() == ["manager.c.failed"]).await);
    }

    #[tokio::test]
    async fn test_panicking_initialize_is_contained() {
        let core = ApplicationCore::new(EventBus::new(None), None);
        let journal = Journal::default();
        core.register("base", Vec::<String>::new(), TestManager::new("base", &journal, Behaviour::Normal)).unwrap();
        core.register("wild", ["base"], TestManager::new("wild", &journal, Behaviour::PanicInit)).unwrap();

        match core.start_all().await.unwrap_err() {
            CoreError::StartupAborted { manager, cause, .. } => {
                assert_eq!(manager, "wild");
                assert!(cause.to_string().contains("panic"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(core.state_of("base"), Some(ManagerState::Stopped));
    }

    #[tokio::test]
    async fn test_stop_all_is_best_effort() {
        let bus = EventBus::new(None);
        let topics = observe(&bus, "manager.*.stopped");
        let core = ApplicationCore::new(bus, None);
        let journal = Journal::default();
        core.register("a", Vec::<String>::new(), TestManager::new("a", &journal, Behaviour::Normal)).unwrap();
        core.register("b", ["a"], TestManager::new("b", &journal, Behaviour::FailShutdown)).unwrap();
        core.register("c", ["b"], TestManager::new("c", &journal, Behaviour::Normal)).unwrap();
        core.start_all().await.unwrap();
        journal.lock().unwrap().clear();

        match core.stop_all().await.unwrap_err() {
            CoreError::Aggregate { operation, failures } => {
                assert_eq!(operation, "stop_all");
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].unit, "b");
                assert_eq!(failures[0].code, "MANAGER_SHUTDOWN_ERROR");
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(*journal.lock().unwrap(), vec!["stop:c", "stop:b", "stop:a"]);
        assert_eq!(core.state_of("a"), Some(ManagerState::Stopped));
        assert_eq!(core.state_of("b"), Some(ManagerState::Failed));
        assert_eq!(core.state_of("c"), Some(ManagerState::Stopped));
        assert_eq!(core.phase(), CorePhase::Stopped);
        assert!(
            wait_for(|| topics.lock().unwrap().as_slice() == ["manager.c.stopped", "manager.a.stopped"])
                .await
        );
    }

    #[tokio::test]
    async fn test_register_validation() {
        let core = ApplicationCore::new(EventBus::new(None), None);
        let journal = Journal::default();
        core.register("db", Vec::<String>::new(), TestManager::new("db", &journal, Behaviour::Normal)).unwrap();

        assert!(matches!(
            core.register("db", Vec::<String>::new(), TestManager::new("db", &journal, Behaviour::Normal)),
            Err(CoreError::DuplicateManager { name }) if name == "db"
        ));
        assert!(matches!(
            core.register("bad name", Vec::<String>::new(), TestManager::new("x", &journal, Behaviour::Normal)),
            Err(CoreError::InvalidName { .. })
        ));

        core.start_all().await.unwrap();
        assert!(matches!(
            core.register("late", Vec::<String>::new(), TestManager::new("late", &journal, Behaviour::Normal)),
            Err(CoreError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_manager_lookup_follows_state() {
        let core = ApplicationCore::new(EventBus::new(None), None);
        let journal = Journal::default();
        core.register("cache", Vec::<String>::new(), TestManager::new("cache", &journal, Behaviour::Normal)).unwrap();

        assert!(core.manager("cache").is_none());
        core.start_all().await.unwrap();
        assert!(core.manager("cache").is_some());
        core.stop_all().await.unwrap();
        assert!(core.manager("cache").is_none());
        assert!(core.manager("unknown").is_none());
    }

    #[tokio::test]
    async fn test_health_aggregation_and_transitions() {
        let bus = EventBus::new(None);
        let topics = observe(&bus, "manager.db.*");
        let core = ApplicationCore::new(bus, None);
        let journal = Journal::default();
        let config = TestManager::new("config", &journal, Behaviour::Normal);
        let db = TestManager::new("db", &journal, Behaviour::Normal);
        core.register("config", Vec::<String>::new(), config.clone()).unwrap();
        core.register("db", ["config"], db.clone()).unwrap();

        assert_eq!(core.health().await.overall_status, HealthStatus::Unhealthy);

        core.start_all().await.unwrap();
        let health = core.health().await;
        assert_eq!(health.overall_status, HealthStatus::Healthy);
        assert_eq!(health.components.len(), 2);

        db.set_report(HealthReport::degraded("replica lag"));
        let health = core.health().await;
        assert_eq!(health.overall_status, HealthStatus::Degraded);
        assert_eq!(core.state_of("db"), Some(ManagerState::Degraded));
        assert_eq!(health.components["db"].detail.as_deref(), Some("replica lag"));

        db.set_report(HealthReport::running());
        assert_eq!(core.health().await.overall_status, HealthStatus::Healthy);
        assert_eq!(core.state_of("db"), Some(ManagerState::Running));

        config.set_report(HealthReport::failed("disk gone"));
        let health = core.health().await;
        assert_eq!(health.overall_status, HealthStatus::Unhealthy);
        assert_eq!(health.unhealthy_components(), vec!["config"]);
        assert_eq!(core.state_of("config"), Some(ManagerState::Failed));

        assert!(
            wait_for(|| topics.lock().unwrap().as_slice()
                == ["manager.db.starting", "manager.db.started", "manager.db.degraded", "manager.db.started"])
            .await
        );
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let core = ApplicationCore::new(EventBus::new(None), None);
        let journal = Journal::default();
        core.register("a", Vec::<String>::new(), TestManager::new("a", &journal, Behaviour::Normal)).unwrap();

        core.start_all().await.unwrap();
        core.stop_all().await.unwrap();
        assert_eq!(core.state_of("a"), Some(ManagerState::Stopped));

        core.start_all().await.unwrap();
        assert_eq!(core.state_of("a"), Some(ManagerState::Running));
        assert_eq!(*journal.lock().unwrap(), vec!["init:a", "stop:a", "init:a"]);
    }

    #[tokio::test]
    async fn test_slow_health_check_does_not_block_lifecycle() {
        let core = ApplicationCore::new(EventBus::new(None), None);
        let slow = Arc::new(SlowHealthManager::default());
        core.register("storage", Vec::<String>::new(), slow.clone()).unwrap();
        core.start_all().await.unwrap();

        let probe = tokio::spawn({
            let core = core.clone();
            async move { core.health().await }
        });
        assert!(wait_for(|| slow.probing.load(Ordering::SeqCst)).await);

        let stopped = tokio::time::timeout(Duration::from_secs(2), core.stop_all()).await;
        assert!(stopped.expect("stop_all must not wait for health").is_ok());

        slow.release.notify_one();
        let health = probe.await.unwrap();
        // 迟到的探测结果不会覆盖已停止的状态
        assert_eq!(health.phase, CorePhase::Stopped);
        assert_eq!(core.state_of("storage"), Some(ManagerState::Stopped));
    }

    #[tokio::test]
    async fn test_health_skips_transitions_while_gate_is_held() {
        let core = ApplicationCore::new(EventBus::new(None), None);
        let journal = Journal::default();
        let db = TestManager::new("db", &journal, Behaviour::Normal);
        core.register("db", Vec::<String>::new(), db.clone()).unwrap();
        core.start_all().await.unwrap();
        db.set_report(HealthReport::degraded("replica lag"));

        let gate = core.gate();
        let held = gate.lock().await;
        let health = core.health().await;
        assert_eq!(health.components["db"].detail.as_deref(), Some("replica lag"));
        assert_eq!(core.state_of("db"), Some(ManagerState::Running));
        drop(held);

        core.health().await;
        assert_eq!(core.state_of("db"), Some(ManagerState::Degraded));
    }
}
