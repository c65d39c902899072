//! Configuration: runtime config (admin-editable) plus static startup config.

use std::net::SocketAddr;
use std::path::PathBuf;

use common::Secret;
use serde::{Deserialize, Serialize};

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:8787".parse().unwrap()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_max_flow_entries() -> u32 {
    500
}

/// Startup configuration, loaded once from TOML and overridden by env vars.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub upstream_base_url: Option<String>,
    /// Shared secret for `X-Admin-Key`. Absent ⇒ admin endpoints are open
    /// (§6: "missing secret ⇒ the admin key is absent from config ⇒ open access").
    #[serde(skip)]
    pub admin_key: Option<Secret<String>>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

fn default_upstream_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

impl Config {
    /// Resolve the config file path: `--config` CLI flag, else `./config.toml`.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        cli_path
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./config.toml"))
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist (first-run cold start). Environment variables
    /// `PORT` / `ANTIGRAVITY_PORT` / `ANTIGRAVITY_HOST` override the listen
    /// address afterward.
    pub fn load(path: &PathBuf) -> common::Result<Self> {
        let mut config: Config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)?
        } else {
            toml::from_str("")?
        };

        if let Some(admin_key) = std::env::var("ADMIN_KEY").ok().filter(|v| !v.is_empty()) {
            config.admin_key = Some(Secret::new(admin_key));
        }

        let mut host = config.listen_addr.ip().to_string();
        let mut port = config.listen_addr.port();

        if let Ok(p) = std::env::var("ANTIGRAVITY_PORT").or_else(|_| std::env::var("PORT"))
            && let Ok(parsed) = p.parse()
        {
            port = parsed;
        }
        if let Ok(h) = std::env::var("ANTIGRAVITY_HOST") {
            host = h;
        }
        if let Ok(addr) = format!("{host}:{port}").parse() {
            config.listen_addr = addr;
        }

        Ok(config)
    }

    pub fn upstream_base_url(&self) -> String {
        self.upstream_base_url
            .clone()
            .unwrap_or_else(default_upstream_base_url)
    }

    pub fn credential_store_path(&self) -> PathBuf {
        self.state_dir.join("accounts.json")
    }

    pub fn runtime_config_path(&self) -> PathBuf {
        self.state_dir.join("config.json")
    }

    pub fn flow_log_dir(&self) -> PathBuf {
        self.state_dir.join("flows")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.state_dir.join("backups")
    }
}

/// Admin-editable subset (§6 `GET/POST /api/admin/config`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub allow_lan_access: bool,
    #[serde(default = "default_max_flow_entries")]
    pub max_flow_entries: u32,
    #[serde(default)]
    pub telemetry: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            allow_lan_access: false,
            max_flow_entries: default_max_flow_entries(),
            telemetry: false,
        }
    }
}

impl RuntimeConfig {
    /// Clamp `max_flow_entries` into the valid range and report whether a
    /// LAN-access toggle requires a restart to take effect.
    pub fn apply_patch(&mut self, patch: RuntimeConfigPatch) -> bool {
        let mut requires_restart = false;
        if let Some(allow_lan_access) = patch.allow_lan_access
            && allow_lan_access != self.allow_lan_access
        {
            self.allow_lan_access = allow_lan_access;
            requires_restart = true;
        }
        if let Some(max_flow_entries) = patch.max_flow_entries {
            self.max_flow_entries = max_flow_entries.clamp(50, 2000);
        }
        if let Some(telemetry) = patch.telemetry {
            self.telemetry = telemetry;
        }
        requires_restart
    }
}

#[derive(Debug, Deserialize)]
pub struct RuntimeConfigPatch {
    pub allow_lan_access: Option<bool>,
    pub max_flow_entries: Option<u32>,
    pub telemetry: Option<bool>,
}
