//! File events → rebuild tasks.
//!
//! `notify` delivers raw events on its own thread; they are forwarded into a
//! tokio channel, batched for the debounce window, matched against the watch
//! rules and the union of the matched tasks is run through the task graph.
//! A successful batch is announced on the reload channel.

use glob::{MatchOptions, Pattern};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::{ConfigError, WatchRule};
use crate::tasks::TaskGraph;
use crate::utils::current_timestamp;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Broadcast after a watch-triggered rebuild finished successfully.
#[derive(Debug, Clone, Serialize)]
pub struct ReloadEvent {
    pub tasks: Vec<String>,
    pub timestamp: u64,
}

struct CompiledRule {
    patterns: Vec<Pattern>,
    tasks: Vec<String>,
}

pub struct WatchRuleSet {
    rules: Vec<CompiledRule>,
}

impl WatchRuleSet {
    pub fn compile(rules: &[WatchRule]) -> Result<Self, ConfigError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let patterns = rule
                .patterns
                .iter()
                .map(|p| {
                    Pattern::new(p).map_err(|e| {
                        ConfigError::Invalid(format!("bad watch pattern '{}': {}", p, e))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            compiled.push(CompiledRule {
                patterns,
                tasks: rule.tasks.clone(),
            });
        }
        Ok(Self { rules: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Tasks triggered by a change to `path` (relative to the project root),
    /// in rule order without duplicates.
    pub fn tasks_for(&self, path: &Path) -> Vec<String> {
        let mut out = Vec::new();
        for rule in &self.rules {
            if rule.patterns.iter().any(|p| p.matches_path_with(path, MATCH_OPTIONS)) {
                for task in &rule.tasks {
                    if !out.contains(task) {
                        out.push(task.clone());
                    }
                }
            }
        }
        out
    }

    /// Directories to register with the OS watcher: the literal leading part of
    /// every pattern, deduplicated, nested roots folded into their parent.
    pub fn roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = Vec::new();
        for rule in &self.rules {
            for pattern in &rule.patterns {
                let root = literal_prefix(pattern.as_str());
                if roots.iter().any(|r| root.starts_with(r)) {
                    continue;
                }
                roots.retain(|r| !r.starts_with(&root));
                roots.push(root);
            }
        }
        roots
    }
}

fn literal_prefix(pattern: &str) -> PathBuf {
    let mut prefix = PathBuf::new();
    let components: Vec<Component> = Path::new(pattern).components().collect();
    for (i, component) in components.iter().enumerate() {
        let text = component.as_os_str().to_string_lossy();
        // 마지막 컴포넌트는 파일 이름 자리
        if i + 1 == components.len() || text.contains(['*', '?', '[']) {
            break;
        }
        prefix.push(component);
    }
    // 빈 경로 = 프로젝트 루트
    prefix
}

/// Keeps the OS watcher alive; dropping it stops watching.
pub struct WatchHandle {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start watching `rules` under `base`, running matched tasks on `graph`.
pub fn spawn(
    rules: WatchRuleSet,
    base: PathBuf,
    debounce: Duration,
    graph: Arc<TaskGraph>,
    reload: broadcast::Sender<ReloadEvent>,
) -> anyhow::Result<WatchHandle> {
    let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                for path in event.paths {
                    let _ = tx.send(path);
                }
            }
            Err(e) => tracing::warn!("Watch error: {}", e),
        },
        Config::default(),
    )?;

    for root in rules.roots() {
        let dir = base.join(&root);
        if !dir.exists() {
            tracing::warn!("Watch root '{}' does not exist, skipping", dir.display());
            continue;
        }
        watcher.watch(&dir, RecursiveMode::Recursive)?;
        tracing::info!("Watching '{}'", dir.display());
    }

    let task = tokio::spawn(run_loop(rx, rules, base, debounce, graph, reload));
    Ok(WatchHandle {
        _watcher: watcher,
        task,
    })
}

/// Batch changed paths, resolve them to tasks, run, announce.
pub async fn run_loop(
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
    rules: WatchRuleSet,
    base: PathBuf,
    debounce: Duration,
    graph: Arc<TaskGraph>,
    reload: broadcast::Sender<ReloadEvent>,
) {
    // 절대 경로 이벤트를 상대 패턴과 비교하기 위함
    let base_abs = std::fs::canonicalize(&base).unwrap_or_else(|_| base.clone());

    while let Some(first) = rx.recv().await {
        let mut tasks = Vec::new();
        collect(&rules, &base_abs, &first, &mut tasks);

        loop {
            match tokio::time::timeout(debounce, rx.recv()).await {
                Ok(Some(path)) => collect(&rules, &base_abs, &path, &mut tasks),
                Ok(None) => return,
                Err(_) => break,
            }
        }

        if tasks.is_empty() {
            continue;
        }

        tracing::info!("Change detected, running: {}", tasks.join(", "));
        match graph.run_many(&tasks).await {
            Ok(()) => {
                let _ = reload.send(ReloadEvent {
                    tasks,
                    timestamp: current_timestamp(),
                });
            }
            // 감시는 계속: 다음 변경에서 다시 시도
            Err(e) => tracing::error!("Rebuild failed: {}", e),
        }
    }
}

fn collect(rules: &WatchRuleSet, base: &Path, path: &Path, tasks: &mut Vec<String>) {
    let relative = path.strip_prefix(base).unwrap_or(path);
    for task in rules.tasks_for(relative) {
        if !tasks.contains(&task) {
            tasks.push(task);
        }
    }
}
