//! Shared application state (§9 Design Notes: "a single root owns the pool,
//! flow monitor, and config; no ambient/global state").
//!
//! `App` is constructed once at startup and handed to every handler behind
//! an `Arc`. `init_once` implements the "shared once-or-wait latch" from §5:
//! concurrent first requests block on the same initialization instead of
//! racing to build the credential store twice.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anthropic_auth::{CredentialStore, TokenResolver};
use anthropic_pool::Pool;
use common::Secret;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::{Mutex, OnceCell, RwLock};

use crate::config::{Config, RuntimeConfig};
use crate::flow::FlowLog;

pub struct App {
    pub pool: Arc<Pool>,
    pub token_resolver: Arc<TokenResolver>,
    pub http_client: reqwest::Client,
    pub runtime_config: RwLock<RuntimeConfig>,
    pub flow_log: Arc<FlowLog>,
    pub admin_key: Option<Secret<String>>,
    pub upstream_base_url: String,
    pub state_dir: PathBuf,
    pub started_at: Instant,
    pub prometheus_handle: PrometheusHandle,
    init_latch: OnceCell<()>,
    init_lock: Mutex<()>,
}

impl App {
    pub async fn build(config: Config, prometheus_handle: PrometheusHandle) -> common::Result<Arc<Self>> {
        std::fs::create_dir_all(&config.state_dir)
            .map_err(|e| common::Error::Config(format!("failed to create state dir: {e}")))?;

        let store = CredentialStore::load(config.credential_store_path())
            .await
            .map_err(|e| common::Error::Config(format!("failed to load credential store: {e}")))?;
        let pool = Arc::new(Pool::new(Arc::new(store)));

        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| common::Error::Config(format!("failed to build http client: {e}")))?;
        let token_resolver = Arc::new(TokenResolver::new(http_client.clone()));

        let runtime_config = load_runtime_config(&config.runtime_config_path())
            .unwrap_or_else(|| config.runtime.clone());

        let flow_log = FlowLog::spawn(
            config.flow_log_dir(),
            runtime_config.max_flow_entries as usize,
        );

        Ok(Arc::new(Self {
            pool,
            token_resolver,
            http_client,
            runtime_config: RwLock::new(runtime_config),
            flow_log,
            admin_key: config.admin_key.clone(),
            upstream_base_url: config.upstream_base_url(),
            state_dir: config.state_dir.clone(),
            started_at: Instant::now(),
            prometheus_handle,
            init_latch: OnceCell::new(),
            init_lock: Mutex::new(()),
        }))
    }

    /// Run `init` exactly once across all concurrent callers. Callers that
    /// arrive after initialization has started wait on the same latch
    /// rather than racing a second initialization.
    pub async fn init_once<F, Fut>(&self, init: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        if self.init_latch.initialized() {
            return;
        }
        let _guard = self.init_lock.lock().await;
        self.init_latch.get_or_init(init).await;
    }

    pub fn runtime_config_path(&self) -> PathBuf {
        self.state_dir.join("config.json")
    }

    pub async fn persist_runtime_config(&self) {
        let snapshot = self.runtime_config.read().await.clone();
        let path = self.runtime_config_path();
        if let Ok(json) = serde_json::to_string_pretty(&snapshot)
            && let Err(e) = atomic_write(&path, json.as_bytes())
        {
            tracing::warn!(error = %e, "failed to persist runtime config");
        }
    }
}

fn load_runtime_config(path: &PathBuf) -> Option<RuntimeConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

/// Temp-file-then-rename write with restrictive permissions, matching the
/// credential store's durability guarantee for the runtime config document.
fn atomic_write(path: &PathBuf, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle()
    }

    #[tokio::test]
    async fn init_once_runs_underlying_init_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::load(&PathBuf::from("/nonexistent")).unwrap();
        config.state_dir = dir.path().to_path_buf();
        let app = App::build(config, test_handle()).await.unwrap();

        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let app = app.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                app.init_once(|| async {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persist_and_reload_runtime_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::load(&PathBuf::from("/nonexistent")).unwrap();
        config.state_dir = dir.path().to_path_buf();
        let app = App::build(config, test_handle()).await.unwrap();

        {
            let mut runtime = app.runtime_config.write().await;
            runtime.allow_lan_access = true;
        }
        app.persist_runtime_config().await;

        let reloaded = load_runtime_config(&app.runtime_config_path()).unwrap();
        assert!(reloaded.allow_lan_access);
    }
}
