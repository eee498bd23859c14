//! Backend launch arguments.
//!
//! `build_args` is a pure function of the mode and the launch config: no disk or
//! network access happens here, the env overrides are already folded into
//! [`BackendConfig`] by the config layer.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArgsError {
    #[error("invalid mode '{0}': expected 'development' or 'production'")]
    InvalidMode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Development,
    Production,
}

impl FromStr for Mode {
    type Err = ArgsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Mode::Development),
            "production" | "prod" => Ok(Mode::Production),
            _ => Err(ArgsError::InvalidMode(s.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Development => f.write_str("development"),
            Mode::Production => f.write_str("production"),
        }
    }
}

/// Immutable input for a single backend launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendConfig {
    pub heapster_host: String,
    pub tls_cert_file: String,
    pub tls_key_file: String,
    pub dev_port: u16,
    pub prod_port: u16,
    /// From `KUBECONFIG`; takes precedence over any apiserver host.
    pub kubeconfig_path: Option<PathBuf>,
    /// Configured default, used when neither override is present.
    pub apiserver_host: String,
    pub apiserver_host_override: Option<String>,
    pub binary_path: PathBuf,
    pub working_dir: PathBuf,
}

impl BackendConfig {
    pub fn insecure_port(&self, mode: Mode) -> u16 {
        match mode {
            Mode::Development => self.dev_port,
            Mode::Production => self.prod_port,
        }
    }

    /// The API server host the backend will be told about (override first).
    pub fn effective_apiserver_host(&self) -> &str {
        self.apiserver_host_override
            .as_deref()
            .unwrap_or(&self.apiserver_host)
    }

    /// Resolve relative `binary_path` / `working_dir` against `root`.
    ///
    /// The child enters `working_dir` before the program is looked up, so a
    /// relative binary path would otherwise be resolved twice.
    pub fn rooted_at(mut self, root: &Path) -> Self {
        self.binary_path = root.join(&self.binary_path);
        self.working_dir = root.join(&self.working_dir);
        self
    }
}

/// Build the ordered backend argument vector.
///
/// Order: heapster host, TLS cert, TLS key, insecure port for `mode`, then exactly
/// one of `--kubeconfig` / `--apiserver-host`.
pub fn build_args(mode: Mode, cfg: &BackendConfig) -> Vec<String> {
    let mut args = vec![
        format!("--heapster-host={}", cfg.heapster_host),
        format!("--tls-cert-file={}", cfg.tls_cert_file),
        format!("--tls-key-file={}", cfg.tls_key_file),
        format!("--insecure-port={}", cfg.insecure_port(mode)),
    ];

    match &cfg.kubeconfig_path {
        Some(path) => args.push(format!("--kubeconfig={}", path.display())),
        None => args.push(format!("--apiserver-host={}", cfg.effective_apiserver_host())),
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BackendConfig {
        BackendConfig {
            heapster_host: "h".to_string(),
            tls_cert_file: "c.pem".to_string(),
            tls_key_file: "k.pem".to_string(),
            dev_port: 8000,
            prod_port: 9090,
            kubeconfig_path: Some(PathBuf::from("/kc")),
            apiserver_host: "api.local".to_string(),
            apiserver_host_override: None,
            binary_path: PathBuf::from(".tmp/serve/dashboard"),
            working_dir: PathBuf::from(".tmp/serve"),
        }
    }

    #[test]
    fn dev_args_with_kubeconfig() {
        assert_eq!(
            build_args(Mode::Development, &sample()),
            vec![
                "--heapster-host=h",
                "--tls-cert-file=c.pem",
                "--tls-key-file=k.pem",
                "--insecure-port=8000",
                "--kubeconfig=/kc",
            ]
        );
    }

    #[test]
    fn dev_args_without_kubeconfig_use_default_host() {
        let mut cfg = sample();
        cfg.kubeconfig_path = None;
        let args = build_args(Mode::Development, &cfg);
        assert_eq!(args.last().unwrap(), "--apiserver-host=api.local");
        assert!(!args.iter().any(|a| a.starts_with("--kubeconfig")));
    }

    #[test]
    fn apiserver_override_wins_over_default() {
        let mut cfg = sample();
        cfg.kubeconfig_path = None;
        cfg.apiserver_host_override = Some("https://10.0.0.1:6443".to_string());
        let args = build_args(Mode::Production, &cfg);
        assert_eq!(args.last().unwrap(), "--apiserver-host=https://10.0.0.1:6443");
    }

    #[test]
    fn kubeconfig_suppresses_apiserver_even_with_override() {
        let mut cfg = sample();
        cfg.apiserver_host_override = Some("ignored".to_string());
        let args = build_args(Mode::Development, &cfg);
        assert!(args.iter().any(|a| a == "--kubeconfig=/kc"));
        assert!(!args.iter().any(|a| a.starts_with("--apiserver-host")));
    }

    #[test]
    fn mode_selects_exactly_one_port() {
        let cfg = sample();
        let dev = build_args(Mode::Development, &cfg);
        assert!(dev.contains(&"--insecure-port=8000".to_string()));
        assert!(!dev.contains(&"--insecure-port=9090".to_string()));

        let prod = build_args(Mode::Production, &cfg);
        assert!(prod.contains(&"--insecure-port=9090".to_string()));
        assert!(!prod.contains(&"--insecure-port=8000".to_string()));
        assert_eq!(prod.iter().filter(|a| a.starts_with("--insecure-port")).count(), 1);
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("dev".parse::<Mode>().unwrap(), Mode::Development);
        assert_eq!("Production".parse::<Mode>().unwrap(), Mode::Production);
        assert_eq!(
            "staging".parse::<Mode>(),
            Err(ArgsError::InvalidMode("staging".to_string()))
        );
        assert!("".parse::<Mode>().is_err());
    }
}
