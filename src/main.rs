use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use devserve::backend::{build_args, Mode};
use devserve::config::DevConfig;
use devserve::pipeline::Pipeline;

#[derive(Parser)]
#[command(name = "devserve", version, about = "Backend supervisor + dev server with watch-driven rebuilds")]
struct Cli {
    /// Config file (default: $DEVSERVE_CONFIG or ./devserve.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the backend argument vector for a mode
    Args {
        /// development | production
        mode: String,
    },
    /// List tasks and their dependencies
    Tasks,
    /// Run one or more tasks in dependency order (serve, serve:nowatch,
    /// serve:prod, spawn-backend, ...)
    #[command(external_subcommand)]
    Run(Vec<String>),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("DEVSERVE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => DevConfig::load_from(path)?,
        None => DevConfig::load()?,
    };

    match cli.command {
        Command::Args { mode } => {
            let mode = mode.parse::<Mode>()?;
            let backend = config.backend_config(mode);
            println!("{}", backend.binary_path.display());
            for arg in build_args(mode, &backend) {
                println!("  {}", arg);
            }
        }
        Command::Tasks => {
            let pipeline = Pipeline::new(config);
            let graph = pipeline.graph()?;
            for (name, deps) in graph.list() {
                if deps.is_empty() {
                    println!("{}", name);
                } else {
                    println!("{} <- {}", name, deps.join(", "));
                }
            }
            for missing in devserve::tasks::missing_dependencies(&graph) {
                tracing::warn!("Dependency '{}' is not defined", missing);
            }
        }
        Command::Run(tasks) => {
            if let Some(flag) = tasks.iter().find(|t| t.starts_with('-')) {
                anyhow::bail!("unexpected option '{}': tasks take no arguments", flag);
            }
            let pipeline = Pipeline::new(config);
            let graph = pipeline.graph()?;
            if let Err(e) = graph.run_many(&tasks).await {
                tracing::error!("{}", e);
                return Err(e.into());
            }

            // spawn-backend 단독 실행: 백엔드가 끝날 때까지 포그라운드 유지
            let supervisor = pipeline.supervisor();
            if supervisor.is_running() {
                tracing::info!("Backend running (pid {:?}), Ctrl+C to stop", supervisor.pid());
                tokio::select! {
                    res = supervisor.wait_for_exit() => res?,
                    _ = tokio::signal::ctrl_c() => {
                        supervisor.stop().await?;
                    }
                }
            }
        }
    }

    Ok(())
}
