use proto::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level taskgate configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Worker process settings.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// WebSocket gateway settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Audit log settings.
    #[serde(default)]
    pub audit: AuditConfig,
}

/// `[worker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// TCP address the worker accepts gateway links on.
    pub listen_addr: String,
    /// Shell used as `<shell> -c <command>`.
    pub shell: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_worker_addr(),
            shell: worker::DEFAULT_SHELL.to_string(),
        }
    }
}

/// `[gateway]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP/WebSocket listen address.
    pub listen_addr: String,
    /// Worker to link to.
    pub worker_addr: String,
    /// Required `?token=` value; empty disables auth.
    pub token: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            worker_addr: default_worker_addr(),
            token: String::new(),
        }
    }
}

/// `[audit]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    /// SQLite file path; `~` is expanded.
    pub database_url: String,
    pub queue_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            enabled: true,
            database_url: format!("{home}/.taskgate/audit.db"),
            queue_capacity: worker::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

fn default_worker_addr() -> String {
    "127.0.0.1:5556".to_string()
}

impl Config {
    /// Loads configuration from explicit path, fallback locations, and env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = path.map(|p| p.to_path_buf()).or_else(|| {
            let cwd = std::env::current_dir().ok()?.join("taskgate.toml");
            if cwd.exists() {
                return Some(cwd);
            }
            let home = std::env::var("HOME").ok()?;
            let home_config = PathBuf::from(home).join(".taskgate").join("config.toml");
            if home_config.exists() {
                return Some(home_config);
            }
            None
        });
        debug!(path = ?config_path, "Config file resolved");

        let mut config = if let Some(path) = config_path {
            let content = std::fs::read_to_string(&path).map_err(ConfigError::Io)?;
            toml::from_str(&content).map_err(|e| ConfigError::Toml(e.to_string()))?
        } else {
            Config::default()
        };

        if let Ok(addr) = std::env::var("TASKGATE_WORKER_ADDR") {
            config.gateway.worker_addr = addr.clone();
            config.worker.listen_addr = addr;
        }
        if let Ok(addr) = std::env::var("TASKGATE_GATEWAY_ADDR") {
            config.gateway.listen_addr = addr;
        }
        if let Ok(token) = std::env::var("TASKGATE_GATEWAY_TOKEN") {
            config.gateway.token = token;
        }
        if let Ok(shell) = std::env::var("TASKGATE_SHELL") {
            config.worker.shell = shell;
        }
        if let Ok(db) = std::env::var("TASKGATE_AUDIT_DB") {
            config.audit.database_url = db;
        }

        config.validate()?;
        debug!(
            worker = %config.worker.listen_addr,
            gateway = %config.gateway.listen_addr,
            audit = config.audit.enabled,
            "Config loaded"
        );
        Ok(config)
    }

    /// Checks the fields that would otherwise fail late at bind time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.worker_listen_addr()?;
        self.gateway_listen_addr()?;
        if self.worker.shell.trim().is_empty() {
            return Err(invalid("worker.shell", "must not be empty"));
        }
        if self.audit.queue_capacity == 0 {
            return Err(invalid("audit.queue_capacity", "must be at least 1"));
        }
        Ok(())
    }

    pub fn worker_listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr("worker.listen_addr", &self.worker.listen_addr)
    }

    pub fn gateway_listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr("gateway.listen_addr", &self.gateway.listen_addr)
    }
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|e| invalid(field, &format!("{value:?} is not a socket address: {e}")))
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{remove_env_var, set_env_var, with_locked_env};

    const ENV_KEYS: &[&str] = &[
        "TASKGATE_WORKER_ADDR",
        "TASKGATE_GATEWAY_ADDR",
        "TASKGATE_GATEWAY_TOKEN",
        "TASKGATE_SHELL",
        "TASKGATE_AUDIT_DB",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            remove_env_var(key);
        }
    }

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        std::fs::write(path, content).expect("write config");
    }

    #[test]
    fn default_config_has_expected_values() {
        let cfg = Config::default();
        assert_eq!(cfg.worker.listen_addr, "127.0.0.1:5556");
        assert_eq!(cfg.worker.shell, "sh");
        assert_eq!(cfg.gateway.listen_addr, "0.0.0.0:8000");
        assert_eq!(cfg.gateway.worker_addr, "127.0.0.1:5556");
        assert!(cfg.gateway.token.is_empty());
        assert!(cfg.audit.enabled);
        assert!(cfg.audit.database_url.ends_with(".taskgate/audit.db"));
        assert_eq!(cfg.audit.queue_capacity, 1024);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn load_reads_explicit_file_path() {
        with_locked_env(|| {
            clear_env();
            let tmp = tempfile::tempdir().expect("tempdir");
            let config_path = tmp.path().join("custom.toml");
            write_file(
                &config_path,
                r#"
[worker]
listen_addr = "127.0.0.1:7000"
shell = "bash"

[gateway]
worker_addr = "10.0.0.2:7000"
token = "from-file"

[audit]
enabled = false
queue_capacity = 16
"#,
            );
            let cfg = Config::load(Some(&config_path)).expect("config should parse");
            assert_eq!(cfg.worker.listen_addr, "127.0.0.1:7000");
            assert_eq!(cfg.worker.shell, "bash");
            assert_eq!(cfg.gateway.listen_addr, "0.0.0.0:8000");
            assert_eq!(cfg.gateway.worker_addr, "10.0.0.2:7000");
            assert_eq!(cfg.gateway.token, "from-file");
            assert!(!cfg.audit.enabled);
            assert_eq!(cfg.audit.queue_capacity, 16);
        });
    }

    #[test]
    fn load_prefers_taskgate_toml_in_current_dir() {
        with_locked_env(|| {
            clear_env();
            let tmp = tempfile::tempdir().expect("tempdir");
            write_file(
                &tmp.path().join("taskgate.toml"),
                "[gateway]\ntoken = \"cwd\"\n",
            );
            let original = std::env::current_dir().expect("cwd");
            std::env::set_current_dir(tmp.path()).expect("chdir");
            let loaded = Config::load(None);
            std::env::set_current_dir(original).expect("restore cwd");

            assert_eq!(loaded.expect("config").gateway.token, "cwd");
        });
    }

    #[test]
    fn load_returns_toml_error_for_invalid_content() {
        with_locked_env(|| {
            clear_env();
            let tmp = tempfile::tempdir().expect("tempdir");
            let config_path = tmp.path().join("taskgate.toml");
            write_file(&config_path, "[worker\nshell = \"broken\"");
            let err = Config::load(Some(&config_path)).expect_err("invalid toml must fail");
            assert!(err.to_string().contains("TOML parse error"));
        });
    }

    #[test]
    fn load_rejects_unparseable_listen_addr() {
        with_locked_env(|| {
            clear_env();
            let tmp = tempfile::tempdir().expect("tempdir");
            let config_path = tmp.path().join("taskgate.toml");
            write_file(&config_path, "[worker]\nlisten_addr = \"localhost\"\n");
            let err = Config::load(Some(&config_path)).expect_err("bad addr must fail");
            assert!(err.to_string().contains("worker.listen_addr"));
        });
    }

    #[test]
    fn load_applies_env_overrides() {
        with_locked_env(|| {
            clear_env();
            let tmp = tempfile::tempdir().expect("tempdir");
            let config_path = tmp.path().join("taskgate.toml");
            write_file(&config_path, "[gateway]\ntoken = \"from-file\"\n");

            set_env_var("TASKGATE_WORKER_ADDR", "127.0.0.1:6001");
            set_env_var("TASKGATE_GATEWAY_ADDR", "127.0.0.1:9001");
            set_env_var("TASKGATE_GATEWAY_TOKEN", "from-env");
            set_env_var("TASKGATE_SHELL", "/bin/bash");
            set_env_var("TASKGATE_AUDIT_DB", "/tmp/taskgate-env.db");

            let cfg = Config::load(Some(&config_path)).expect("config load");
            clear_env();

            assert_eq!(cfg.worker.listen_addr, "127.0.0.1:6001");
            assert_eq!(cfg.gateway.worker_addr, "127.0.0.1:6001");
            assert_eq!(cfg.gateway.listen_addr, "127.0.0.1:9001");
            assert_eq!(cfg.gateway.token, "from-env");
            assert_eq!(cfg.worker.shell, "/bin/bash");
            assert_eq!(cfg.audit.database_url, "/tmp/taskgate-env.db");
        });
    }

    #[test]
    fn validate_rejects_zero_queue_capacity_and_empty_shell() {
        let mut cfg = Config::default();
        cfg.audit.queue_capacity = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.worker.shell = "  ".to_string();
        let err = cfg.validate().expect_err("empty shell");
        assert!(err.to_string().contains("worker.shell"));
    }
}
