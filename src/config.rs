use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::capability::HttpSettings;
use crate::manifest::LimitOverrides;
use crate::runtime::HostLimits;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub app: AppConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub attestation: Option<AttestationConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Entry point: `.lua` for the Lua engine, `.wasm`/`.wat` for WebAssembly
    pub entry: PathBuf,
    /// Root of every filesystem capability
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default = "default_statement_cache")]
    pub statement_cache: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            statement_cache: default_statement_cache(),
        }
    }
}

/// Operator overrides; anything set here beats the manifest.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitsConfig {
    pub heap_bytes: Option<usize>,
    pub stack_bytes: Option<usize>,
    pub instruction_budget: Option<u64>,
    pub drain_iterations: Option<usize>,
    pub scratch_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AttestationConfig {
    /// Hex Ed25519 key the application must be signed with.
    /// Supports ${ENV_VAR} substitution
    pub public_key: String,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./db/app.db")
}

fn default_statement_cache() -> usize {
    64
}

impl LimitsConfig {
    fn apply(&self, mut limits: HostLimits) -> HostLimits {
        if let Some(v) = self.heap_bytes {
            limits.heap_bytes = v;
        }
        if let Some(v) = self.stack_bytes {
            limits.stack_bytes = v;
        }
        if let Some(v) = self.instruction_budget {
            limits.instruction_budget = v;
        }
        if let Some(v) = self.drain_iterations {
            limits.drain_iterations = v;
        }
        if let Some(v) = self.scratch_bytes {
            limits.scratch_bytes = v;
        }
        limits
    }

    /// Limits for engine start-up, before any manifest is known.
    pub fn initial(&self) -> HostLimits {
        self.apply(HostLimits::default())
    }

    /// Built-in defaults, then the manifest, then this config.
    pub fn resolve(&self, manifest: &LimitOverrides) -> HostLimits {
        self.apply(HostLimits::default().with_overrides(manifest))
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${CAPSULE_SIGNING_KEY}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// Directory holding the entry point and its modules
    pub fn app_dir(&self) -> &Path {
        match self.app.entry.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Config {
        toml::from_str(toml_src).unwrap()
    }

    // ── Parsing ─────────────────────────────────────────

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse(
            r#"
            [server]
            [app]
            entry = "app/app.lua"
            "#,
        );
        assert_eq!(config.server.listen, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.app.data_dir, PathBuf::from("./data"));
        assert_eq!(config.database.path, PathBuf::from("./db/app.db"));
        assert_eq!(config.database.statement_cache, 64);
        assert_eq!(config.limits, LimitsConfig::default());
        assert_eq!(config.http.timeout_secs, 30);
        assert!(config.attestation.is_none());
        assert_eq!(config.app_dir(), Path::new("app"));
    }

    #[test]
    fn test_full_config() {
        let config = parse(
            r#"
            [server]
            listen = "0.0.0.0:9000"

            [app]
            entry = "main.wasm"
            data_dir = "/srv/data"

            [database]
            path = "/srv/db/app.sqlite"
            statement_cache = 8

            [limits]
            heap_bytes = 1048576
            instruction_budget = 1000

            [http]
            timeout_secs = 5
            max_response_bytes = 1024

            [attestation]
            public_key = "abcd"
            "#,
        );
        assert_eq!(config.server.listen.port(), 9000);
        assert_eq!(config.database.statement_cache, 8);
        assert_eq!(config.limits.heap_bytes, Some(1_048_576));
        assert_eq!(config.http.max_response_bytes, 1024);
        assert_eq!(config.http.connect_timeout_secs, 10);
        assert_eq!(config.attestation.as_ref().unwrap().public_key, "abcd");
        assert_eq!(config.app_dir(), Path::new("."));
    }

    #[test]
    fn test_missing_entry_rejected() {
        assert!(toml::from_str::<Config>("[server]\n[app]\n").is_err());
    }

    #[test]
    fn test_load_expands_env() {
        std::env::set_var("CAPSULE_CONFIG_TEST_KEY", "feedbeef");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.toml");
        std::fs::write(
            &path,
            "[server]\n[app]\nentry = \"app.lua\"\n[attestation]\npublic_key = \"${CAPSULE_CONFIG_TEST_KEY}\"\n",
        )
        .unwrap();
        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.attestation.unwrap().public_key, "feedbeef");
    }

    // ── Limit resolution ────────────────────────────────

    #[test]
    fn test_limits_precedence() {
        let operator = LimitsConfig {
            heap_bytes: Some(2048),
            drain_iterations: Some(3),
            ..Default::default()
        };
        let declared = LimitOverrides {
            heap_bytes: Some(1024),
            instruction_budget: Some(500),
            ..Default::default()
        };
        let limits = operator.resolve(&declared);
        // Operator wins over the manifest
        assert_eq!(limits.heap_bytes, 2048);
        // Manifest wins over the built-in default
        assert_eq!(limits.instruction_budget, 500);
        assert_eq!(limits.drain_iterations, 3);
        assert_eq!(limits.stack_bytes, HostLimits::default().stack_bytes);
    }

    #[test]
    fn test_initial_limits_ignore_manifest() {
        let limits = LimitsConfig::default().initial();
        assert_eq!(limits, HostLimits::default());
    }
}
