//! devserve.toml 로딩 + 환경 변수 오버라이드.
//!
//! The file is optional: a missing file yields the built-in defaults, but a file
//! that exists and fails to parse is reported instead of silently ignored.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::backend::{BackendConfig, Mode};

pub const DEFAULT_CONFIG_FILE: &str = "devserve.toml";

/// Environment variables consulted when a launch config is derived.
pub const ENV_CONFIG_PATH: &str = "DEVSERVE_CONFIG";
pub const ENV_KUBECONFIG: &str = "KUBECONFIG";
pub const ENV_APISERVER_HOST: &str = "DEVSERVE_APISERVER_HOST";
pub const ENV_HEAPSTER_HOST: &str = "DEVSERVE_HEAPSTER_HOST";
pub const ENV_ENABLE_HTTPS: &str = "DEVSERVE_ENABLE_HTTPS";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct DevConfig {
    pub backend: BackendSection,
    pub paths: PathsSection,
    pub serve: ServeSection,
    /// User-defined command tasks, keyed by task name.
    pub tasks: BTreeMap<String, CommandTaskConfig>,
    pub watch: Vec<WatchRule>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BackendSection {
    pub binary_name: String,
    pub heapster_host: String,
    pub tls_cert_file: String,
    pub tls_key_file: String,
    pub dev_port: u16,
    pub prod_port: u16,
    pub apiserver_host: String,
    /// Task that must finish before `spawn-backend` (e.g. a compile step).
    pub build_task: Option<String>,
    pub prod_build_task: Option<String>,
    /// Absent means `kill-backend` waits for exit without bound.
    pub stop_timeout_secs: Option<u64>,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            binary_name: "dashboard".to_string(),
            heapster_host: "http://localhost:8082".to_string(),
            tls_cert_file: String::new(),
            tls_key_file: String::new(),
            dev_port: 9090,
            prod_port: 9090,
            apiserver_host: "http://localhost:8080".to_string(),
            build_task: None,
            prod_build_task: None,
            stop_timeout_secs: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PathsSection {
    pub serve: PathBuf,
    pub dist: PathBuf,
    pub frontend_src: PathBuf,
    pub components: PathBuf,
    pub extra_serve: Vec<PathBuf>,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            serve: PathBuf::from(".tmp/serve"),
            dist: PathBuf::from("dist"),
            frontend_src: PathBuf::from("src/app/frontend"),
            components: PathBuf::from("bower_components"),
            extra_serve: Vec::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServeSection {
    pub port: u16,
    pub enable_https: bool,
    pub api_prefix: String,
    pub components_route: String,
    pub debounce_ms: u64,
}

impl Default for ServeSection {
    fn default() -> Self {
        Self {
            port: 3000,
            enable_https: false,
            api_prefix: "/api".to_string(),
            components_route: "/bower_components".to_string(),
            debounce_ms: 300,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct CommandTaskConfig {
    /// argv; the first element is the program.
    pub command: Vec<String>,
    #[serde(default)]
    pub deps: Vec<String>,
    pub cwd: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct WatchRule {
    pub patterns: Vec<String>,
    pub tasks: Vec<String>,
}

impl DevConfig {
    /// Load from `DEVSERVE_CONFIG` or `./devserve.toml`, then apply env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut cfg = if path.exists() {
            let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            Self::from_toml_str(&s).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            tracing::info!("Config '{}' not found, using defaults", path.display());
            Self::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Settings that are fixed for the whole session (the launch-time ones such as
    /// `KUBECONFIG` are read in [`DevConfig::backend_config`]).
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var(ENV_HEAPSTER_HOST) {
            self.backend.heapster_host = host;
        }
        if let Ok(flag) = std::env::var(ENV_ENABLE_HTTPS) {
            self.serve.enable_https = matches!(flag.trim(), "1" | "true" | "yes");
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.dev_port == 0 || self.backend.prod_port == 0 {
            return Err(ConfigError::Invalid("backend ports must be non-zero".into()));
        }
        if self.backend.binary_name.is_empty() {
            return Err(ConfigError::Invalid("backend.binary_name is empty".into()));
        }
        if !self.serve.api_prefix.starts_with('/')
            || self.serve.api_prefix.trim_end_matches('/').is_empty()
        {
            return Err(ConfigError::Invalid(format!(
                "serve.api_prefix '{}' must be a path below '/'",
                self.serve.api_prefix
            )));
        }
        if !self.serve.components_route.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "serve.components_route '{}' must start with '/'",
                self.serve.components_route
            )));
        }
        for (name, task) in &self.tasks {
            if task.command.is_empty() {
                return Err(ConfigError::Invalid(format!("task '{}' has an empty command", name)));
            }
        }
        for (i, rule) in self.watch.iter().enumerate() {
            if rule.patterns.is_empty() || rule.tasks.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "watch rule #{} needs at least one pattern and one task",
                    i
                )));
            }
            for pat in &rule.patterns {
                glob::Pattern::new(pat).map_err(|e| {
                    ConfigError::Invalid(format!("watch rule #{}: bad pattern '{}': {}", i, pat, e))
                })?;
            }
        }
        Ok(())
    }

    /// Base directory for the mode: the binary lives here and it is the child's cwd.
    pub fn base_dir(&self, mode: Mode) -> &Path {
        match mode {
            Mode::Development => &self.paths.serve,
            Mode::Production => &self.paths.dist,
        }
    }

    pub fn backend_port(&self, mode: Mode) -> u16 {
        match mode {
            Mode::Development => self.backend.dev_port,
            Mode::Production => self.backend.prod_port,
        }
    }

    pub fn stop_timeout(&self) -> Option<Duration> {
        self.backend.stop_timeout_secs.map(Duration::from_secs)
    }

    /// Build the immutable launch config for one spawn, reading the process
    /// environment for the kubeconfig / apiserver overrides.
    ///
    /// Relative paths are anchored at the current directory.
    pub fn backend_config(&self, mode: Mode) -> BackendConfig {
        let cfg = self.backend_config_with_env(mode, |key| std::env::var(key).ok());
        match std::env::current_dir() {
            Ok(cwd) => cfg.rooted_at(&cwd),
            Err(e) => {
                tracing::warn!("Cannot read current directory, backend paths stay relative: {}", e);
                cfg
            }
        }
    }

    /// Same as [`DevConfig::backend_config`] with an injectable env lookup.
    pub fn backend_config_with_env<F>(&self, mode: Mode, env: F) -> BackendConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        let base = self.base_dir(mode);
        BackendConfig {
            heapster_host: self.backend.heapster_host.clone(),
            tls_cert_file: self.backend.tls_cert_file.clone(),
            tls_key_file: self.backend.tls_key_file.clone(),
            dev_port: self.backend.dev_port,
            prod_port: self.backend.prod_port,
            kubeconfig_path: non_empty(ENV_KUBECONFIG).map(PathBuf::from),
            apiserver_host: self.backend.apiserver_host.clone(),
            apiserver_host_override: non_empty(ENV_APISERVER_HOST),
            binary_path: base.join(&self.backend.binary_name),
            working_dir: base.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = DevConfig::default();
        assert_eq!(cfg.serve.port, 3000);
        assert_eq!(cfg.serve.api_prefix, "/api");
        assert!(cfg.tasks.is_empty());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = DevConfig::from_toml_str(
            r#"
            [backend]
            dev_port = 8000
            build_task = "backend"

            [tasks.backend]
            command = ["go", "build", "-o", ".tmp/serve/dashboard"]

            [[watch]]
            patterns = ["src/app/backend/**/*.go"]
            tasks = ["spawn-backend"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.backend.dev_port, 8000);
        assert_eq!(cfg.backend.prod_port, 9090);
        assert_eq!(cfg.backend.build_task.as_deref(), Some("backend"));
        assert_eq!(cfg.tasks["backend"].command[0], "go");
        assert!(cfg.tasks["backend"].deps.is_empty());
        assert_eq!(cfg.watch.len(), 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_glob() {
        let mut cfg = DevConfig::default();
        cfg.watch.push(WatchRule {
            patterns: vec!["src/[".to_string()],
            tasks: vec!["x".to_string()],
        });
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_port_and_bad_prefix() {
        let mut cfg = DevConfig::default();
        cfg.backend.prod_port = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = DevConfig::default();
        cfg.serve.api_prefix = "api".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_backend_config_uses_mode_base_dir() {
        let cfg = DevConfig::default();
        let dev = cfg.backend_config_with_env(Mode::Development, |_| None);
        assert_eq!(dev.binary_path, PathBuf::from(".tmp/serve/dashboard"));
        assert_eq!(dev.working_dir, PathBuf::from(".tmp/serve"));

        let prod = cfg.backend_config_with_env(Mode::Production, |_| None);
        assert_eq!(prod.binary_path, PathBuf::from("dist/dashboard"));
        assert!(prod.kubeconfig_path.is_none());
        assert!(prod.apiserver_host_override.is_none());
    }

    #[test]
    fn test_backend_config_is_anchored_at_current_dir() {
        let cfg = DevConfig::default();
        let cwd = std::env::current_dir().unwrap();
        let dev = cfg.backend_config(Mode::Development);
        assert!(dev.binary_path.is_absolute());
        assert_eq!(dev.binary_path, cwd.join(".tmp/serve/dashboard"));
        assert_eq!(dev.working_dir, cwd.join(".tmp/serve"));

        // 절대 경로는 그대로
        let mut cfg = DevConfig::default();
        cfg.paths.dist = PathBuf::from("/opt/dashboard");
        let prod = cfg.backend_config(Mode::Production);
        assert_eq!(prod.binary_path, PathBuf::from("/opt/dashboard/dashboard"));
    }

    #[test]
    fn test_backend_config_reads_env_overrides() {
        let cfg = DevConfig::default();
        let bc = cfg.backend_config_with_env(Mode::Development, |key| match key {
            ENV_KUBECONFIG => Some("/home/me/.kube/config".to_string()),
            ENV_APISERVER_HOST => Some("https://10.0.0.1".to_string()),
            _ => None,
        });
        assert_eq!(bc.kubeconfig_path, Some(PathBuf::from("/home/me/.kube/config")));
        assert_eq!(bc.apiserver_host_override.as_deref(), Some("https://10.0.0.1"));
    }

    #[test]
    fn test_blank_env_values_are_ignored() {
        let cfg = DevConfig::default();
        let bc = cfg.backend_config_with_env(Mode::Development, |_| Some("  ".to_string()));
        assert!(bc.kubeconfig_path.is_none());
        assert!(bc.apiserver_host_override.is_none());
    }
}
