//! Built-in tasks and their dependency wiring.
//!
//! | task                 | deps                                  |
//! |----------------------|---------------------------------------|
//! | `kill-backend`       |                                       |
//! | `spawn-backend`      | `backend.build_task`, `kill-backend`  |
//! | `spawn-backend:prod` | `backend.prod_build_task`, `kill-backend` |
//! | `serve:nowatch`      | `spawn-backend`                       |
//! | `serve`              | `spawn-backend` (+ watch rules)       |
//! | `serve:prod`         | `spawn-backend:prod`                  |
//!
//! Tasks from `[tasks.*]` in the config are registered alongside.

use anyhow::Context;
use futures_util::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::backend::Mode;
use crate::config::DevConfig;
use crate::serve::{self, AppState, ServeOptions};
use crate::supervisor::{BackendSupervisor, StopOutcome};
use crate::tasks::{CommandTask, TaskError, TaskGraph};
use crate::watch::{self, ReloadEvent, WatchRuleSet};

pub const KILL_BACKEND: &str = "kill-backend";
pub const SPAWN_BACKEND: &str = "spawn-backend";
pub const SPAWN_BACKEND_PROD: &str = "spawn-backend:prod";
pub const SERVE: &str = "serve";
pub const SERVE_NOWATCH: &str = "serve:nowatch";
pub const SERVE_PROD: &str = "serve:prod";

const RELOAD_CHANNEL: usize = 16;

#[derive(Clone)]
pub struct Pipeline {
    config: Arc<DevConfig>,
    supervisor: Arc<BackendSupervisor>,
    reload: broadcast::Sender<ReloadEvent>,
}

impl Pipeline {
    pub fn new(config: DevConfig) -> Self {
        let supervisor = Arc::new(BackendSupervisor::new(config.stop_timeout()));
        let (reload, _) = broadcast::channel(RELOAD_CHANNEL);
        Self {
            config: Arc::new(config),
            supervisor,
            reload,
        }
    }

    pub fn supervisor(&self) -> &Arc<BackendSupervisor> {
        &self.supervisor
    }

    /// Every task, serve tasks included.
    pub fn graph(&self) -> Result<TaskGraph, TaskError> {
        let mut graph = self.rebuild_graph()?;

        let serve_deps = |spawn: &str| vec![spawn.to_string()];
        self.register(&mut graph, SERVE_NOWATCH, serve_deps(SPAWN_BACKEND), |p| {
            async move { p.serve(Mode::Development, false).await }.boxed()
        })?;
        self.register(&mut graph, SERVE, serve_deps(SPAWN_BACKEND), |p| {
            async move { p.serve(Mode::Development, true).await }.boxed()
        })?;
        self.register(&mut graph, SERVE_PROD, serve_deps(SPAWN_BACKEND_PROD), |p| {
            async move { p.serve(Mode::Production, false).await }.boxed()
        })?;
        Ok(graph)
    }

    /// Tasks a file change may trigger: backend lifecycle + config tasks.
    pub fn rebuild_graph(&self) -> Result<TaskGraph, TaskError> {
        let mut graph = TaskGraph::new();

        self.register(&mut graph, KILL_BACKEND, Vec::new(), |p| {
            async move {
                p.supervisor.stop().await?;
                Ok(())
            }
            .boxed()
        })?;

        let spawn_deps = |build: &Option<String>| {
            build
                .iter()
                .cloned()
                .chain(std::iter::once(KILL_BACKEND.to_string()))
                .collect::<Vec<_>>()
        };
        self.register(
            &mut graph,
            SPAWN_BACKEND,
            spawn_deps(&self.config.backend.build_task),
            |p| async move { p.spawn_backend(Mode::Development).await }.boxed(),
        )?;
        self.register(
            &mut graph,
            SPAWN_BACKEND_PROD,
            spawn_deps(&self.config.backend.prod_build_task),
            |p| async move { p.spawn_backend(Mode::Production).await }.boxed(),
        )?;

        for (name, cfg) in &self.config.tasks {
            let task = CommandTask::from_config(name, cfg).map_err(|source| TaskError::Failed {
                task: name.clone(),
                source,
            })?;
            graph.register_owned(name.clone(), cfg.deps.clone(), task.into_action())?;
        }

        Ok(graph)
    }

    fn register<F>(
        &self,
        graph: &mut TaskGraph,
        name: &str,
        deps: Vec<String>,
        action: F,
    ) -> Result<(), TaskError>
    where
        F: Fn(Pipeline) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        let pipeline = self.clone();
        graph.register_owned(
            name.to_string(),
            deps,
            Arc::new(move || action(pipeline.clone())),
        )
    }

    async fn spawn_backend(&self, mode: Mode) -> anyhow::Result<()> {
        let cfg = self.config.backend_config(mode);
        tracing::info!("Launching {} backend '{}'", mode, cfg.binary_path.display());
        match self.supervisor.launch(mode, &cfg).await {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::error!("[{}] {}", e.error_code(), e);
                Err(e.into())
            }
        }
    }

    /// Serve until Ctrl+C, then stop the backend before returning.
    async fn serve(&self, mode: Mode, watch_files: bool) -> anyhow::Result<()> {
        let opts = ServeOptions::from_config(&self.config, mode);
        let state = AppState::new(self.supervisor.clone(), self.reload.clone(), opts.backend_port);

        let watch_handle = if watch_files && !self.config.watch.is_empty() {
            Some(self.start_watch()?)
        } else {
            None
        };

        let result = serve::run(opts, state, shutdown_signal()).await;
        drop(watch_handle);

        if self.supervisor.stop().await? != StopOutcome::AlreadyStopped {
            tracing::info!("Backend stopped on shutdown");
        }
        result.map_err(Into::into)
    }

    fn start_watch(&self) -> anyhow::Result<watch::WatchHandle> {
        let rules = WatchRuleSet::compile(&self.config.watch)?;
        let graph = self.rebuild_graph()?;

        // 감시 대상 태스크가 모두 정의되어 있는지 미리 확인
        let targets: Vec<&str> = self
            .config
            .watch
            .iter()
            .flat_map(|rule| rule.tasks.iter().map(String::as_str))
            .collect();
        graph.plan_many(&targets).context("invalid watch rule")?;

        let base = std::env::current_dir()?;
        let debounce = Duration::from_millis(self.config.serve.debounce_ms);
        watch::spawn(rules, base, debounce, Arc::new(graph), self.reload.clone())
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Shutdown signal received, cleaning up...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandTaskConfig;

    #[test]
    fn test_builtin_dependency_order() {
        let mut cfg = DevConfig::default();
        cfg.backend.build_task = Some("backend".to_string());
        cfg.tasks.insert(
            "backend".to_string(),
            CommandTaskConfig {
                command: vec!["go".to_string(), "build".to_string()],
                deps: Vec::new(),
                cwd: None,
            },
        );
        let graph = Pipeline::new(cfg).graph().unwrap();

        assert_eq!(
            graph.plan(SERVE).unwrap(),
            vec!["backend", KILL_BACKEND, SPAWN_BACKEND, SERVE]
        );
        assert_eq!(
            graph.plan(SERVE_PROD).unwrap(),
            vec![KILL_BACKEND, SPAWN_BACKEND_PROD, SERVE_PROD]
        );
    }

    #[test]
    fn test_missing_build_task_is_reported_on_plan() {
        let mut cfg = DevConfig::default();
        cfg.backend.build_task = Some("backend".to_string());
        let graph = Pipeline::new(cfg).graph().unwrap();
        assert!(matches!(
            graph.plan(SPAWN_BACKEND),
            Err(TaskError::UnknownTask(name)) if name == "backend"
        ));
    }

    #[test]
    fn test_config_task_cannot_shadow_builtin() {
        let mut cfg = DevConfig::default();
        cfg.tasks.insert(
            KILL_BACKEND.to_string(),
            CommandTaskConfig {
                command: vec!["true".to_string()],
                deps: Vec::new(),
                cwd: None,
            },
        );
        assert!(matches!(
            Pipeline::new(cfg).rebuild_graph(),
            Err(TaskError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_kill_backend_when_idle_is_noop() {
        let pipeline = Pipeline::new(DevConfig::default());
        pipeline.graph().unwrap().run(KILL_BACKEND).await.unwrap();
        assert!(!pipeline.supervisor().is_running());
    }

    #[tokio::test]
    async fn test_spawn_backend_missing_binary_is_fatal() {
        let mut cfg = DevConfig::default();
        cfg.paths.serve = "/definitely/not/here".into();
        let pipeline = Pipeline::new(cfg);
        let err = pipeline.graph().unwrap().run(SPAWN_BACKEND).await.unwrap_err();
        assert!(matches!(&err, TaskError::Failed { task, .. } if task == SPAWN_BACKEND));
        assert!(!pipeline.supervisor().is_running());
    }
}
