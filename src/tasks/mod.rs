//! Named tasks with declared dependencies and a topological runner.
//!
//! A run resolves the dependency closure of its targets, orders it so every
//! dependency precedes its dependents (ties follow declaration order), and
//! executes each task once, sequentially. The first failure aborts the run.

pub mod command;

use futures_util::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

pub use command::CommandTask;

pub type TaskAction = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task '{0}' is not defined")]
    UnknownTask(String),
    #[error("task '{0}' is already defined")]
    Duplicate(String),
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("task '{task}' failed: {source:#}")]
    Failed {
        task: String,
        #[source]
        source: anyhow::Error,
    },
}

struct TaskNode {
    deps: Vec<String>,
    action: TaskAction,
}

#[derive(Default)]
pub struct TaskGraph {
    nodes: HashMap<String, TaskNode>,
    /// 등록 순서 (목록 출력용)
    order: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. Dependencies may name tasks registered later; they are
    /// resolved when a run is planned.
    pub fn register<F>(&mut self, name: &str, deps: &[&str], action: F) -> Result<(), TaskError>
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        let deps = deps.iter().map(|d| d.to_string()).collect();
        self.register_owned(name.to_string(), deps, Arc::new(action))
    }

    pub fn register_owned(
        &mut self,
        name: String,
        deps: Vec<String>,
        action: TaskAction,
    ) -> Result<(), TaskError> {
        if self.nodes.contains_key(&name) {
            return Err(TaskError::Duplicate(name));
        }
        self.order.push(name.clone());
        self.nodes.insert(name, TaskNode { deps, action });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// `(name, deps)` in registration order.
    pub fn list(&self) -> Vec<(&str, &[String])> {
        self.order
            .iter()
            .filter_map(|name| {
                self.nodes
                    .get(name)
                    .map(|node| (name.as_str(), node.deps.as_slice()))
            })
            .collect()
    }

    /// Execution order for a single target.
    pub fn plan(&self, target: &str) -> Result<Vec<String>, TaskError> {
        self.plan_many(&[target])
    }

    /// Execution order for several targets; shared dependencies appear once.
    pub fn plan_many<S: AsRef<str>>(&self, targets: &[S]) -> Result<Vec<String>, TaskError> {
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut stack: Vec<&str> = Vec::new();
        let mut out = Vec::new();
        for target in targets {
            self.visit(target.as_ref(), &mut marks, &mut stack, &mut out)?;
        }
        Ok(out)
    }

    fn visit<'a>(
        &'a self,
        name: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
        out: &mut Vec<String>,
    ) -> Result<(), TaskError> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(name.to_string());
                return Err(TaskError::Cycle(cycle));
            }
            None => {}
        }

        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| TaskError::UnknownTask(name.to_string()))?;

        marks.insert(name, Mark::Visiting);
        stack.push(name);
        for dep in &node.deps {
            self.visit(dep, marks, stack, out)?;
        }
        stack.pop();
        marks.insert(name, Mark::Done);
        out.push(name.to_string());
        Ok(())
    }

    pub async fn run(&self, target: &str) -> Result<(), TaskError> {
        self.run_many(&[target]).await
    }

    pub async fn run_many<S: AsRef<str>>(&self, targets: &[S]) -> Result<(), TaskError> {
        let plan = self.plan_many(targets)?;
        tracing::debug!("Task plan: {}", plan.join(", "));

        for name in plan {
            let action = match self.nodes.get(&name) {
                Some(node) => node.action.clone(),
                None => return Err(TaskError::UnknownTask(name)),
            };
            tracing::info!("Starting '{}'", name);
            let started = Instant::now();
            if let Err(source) = action().await {
                tracing::error!("'{}' errored after {:?}", name, started.elapsed());
                return Err(TaskError::Failed { task: name, source });
            }
            tracing::info!("Finished '{}' after {:?}", name, started.elapsed());
        }
        Ok(())
    }
}

/// Names that appear as a dependency but are never registered.
pub fn missing_dependencies(graph: &TaskGraph) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut missing = Vec::new();
    for (_, deps) in graph.list() {
        for dep in deps {
            if !graph.contains(dep) && seen.insert(dep.clone()) {
                missing.push(dep.clone());
            }
        }
    }
    missing
}
