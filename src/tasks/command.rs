//! Tasks that run an external command (compile steps, asset builds).

use anyhow::Context;
use futures_util::future::{BoxFuture, FutureExt};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::CommandTaskConfig;
use crate::utils::inherited_command;

#[derive(Debug, Clone)]
pub struct CommandTask {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandTask {
    pub fn from_config(name: &str, cfg: &CommandTaskConfig) -> anyhow::Result<Self> {
        let (program, args) = cfg
            .command
            .split_first()
            .with_context(|| format!("task '{}' has an empty command", name))?;
        Ok(Self {
            name: name.to_string(),
            program: program.clone(),
            args: args.to_vec(),
            cwd: cfg.cwd.clone(),
        })
    }

    /// Run to completion; a non-zero exit is an error.
    pub async fn run(&self) -> anyhow::Result<()> {
        tracing::debug!("'{}': {} {:?}", self.name, self.program, self.args);
        let status = inherited_command(&self.program, &self.args, self.cwd.as_deref())
            .status()
            .await
            .with_context(|| format!("failed to run '{}'", self.program))?;
        if !status.success() {
            anyhow::bail!("'{}' {}", self.program, status);
        }
        Ok(())
    }

    /// Adapter for [`super::TaskGraph::register_owned`].
    pub fn into_action(self) -> super::TaskAction {
        let task = Arc::new(self);
        Arc::new(move || -> BoxFuture<'static, anyhow::Result<()>> {
            let task = task.clone();
            async move { task.run().await }.boxed()
        })
    }
}
