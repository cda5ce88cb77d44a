//! Environment probe — active backend sensing.
//!
//! Collects system stats, GPU/VRAM, installed models, queue depth, and
//! node index stats into an [`EnvironmentSnapshot`]. Each sub-collection
//! is independent: one API failure is recorded in `errors` and never
//! aborts the probe. Only the health check gates the remote collectors.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use gp_backend::{GraphClient, NodeIndex};
use gp_domain::context::EnvironmentSnapshot;
use gp_domain::error::Result;

/// Refresh the cached snapshot after this many seconds.
const REFRESH_INTERVAL_SECS: f64 = 300.0;

/// The slice of the backend API the probe needs. A trait seam so tests
/// can fail sub-collectors independently.
#[async_trait::async_trait]
pub trait BackendPort: Send + Sync {
    async fn health_check(&self) -> bool;
    async fn get_system_stats(&self) -> Result<Value>;
    async fn list_models(&self, folder: &str) -> Result<Vec<String>>;
    async fn get_queue(&self) -> Result<Value>;
}

#[async_trait::async_trait]
impl BackendPort for GraphClient {
    async fn health_check(&self) -> bool {
        GraphClient::health_check(self).await
    }
    async fn get_system_stats(&self) -> Result<Value> {
        GraphClient::get_system_stats(self).await
    }
    async fn list_models(&self, folder: &str) -> Result<Vec<String>> {
        GraphClient::list_models(self, folder).await
    }
    async fn get_queue(&self) -> Result<Value> {
        GraphClient::get_queue(self).await
    }
}

/// Probes the backend for runtime environment information.
pub struct EnvironmentProbe {
    backend: Arc<dyn BackendPort>,
    node_index: Arc<NodeIndex>,
    refresh_interval: f64,
    cached: Mutex<Option<EnvironmentSnapshot>>,
}

impl EnvironmentProbe {
    pub fn new(backend: Arc<dyn BackendPort>, node_index: Arc<NodeIndex>) -> Self {
        Self {
            backend,
            node_index,
            refresh_interval: REFRESH_INTERVAL_SECS,
            cached: Mutex::new(None),
        }
    }

    pub fn with_refresh_interval(mut self, secs: f64) -> Self {
        self.refresh_interval = secs;
        self
    }

    /// Collect a full snapshot. Never fails — failures land in `errors`.
    pub async fn collect(&self) -> EnvironmentSnapshot {
        let mut snap = EnvironmentSnapshot {
            collected_at: now_secs(),
            ..Default::default()
        };

        snap.connection_ok = self.backend.health_check().await;

        if snap.connection_ok {
            self.collect_system_stats(&mut snap).await;
            self.collect_models(&mut snap).await;
            self.collect_queue(&mut snap).await;
        }

        // Node index is local — no API call, no gate.
        if self.node_index.is_built() {
            snap.node_count = self.node_index.node_count();
            snap.node_categories = self.node_index.categories();
        }

        *self.cached.lock() = Some(snap.clone());
        snap
    }

    /// Cached snapshot if fresh, otherwise re-collect.
    pub async fn get_snapshot(&self) -> EnvironmentSnapshot {
        if let Some(cached) = self.cached.lock().clone() {
            if now_secs() - cached.collected_at < self.refresh_interval {
                return cached;
            }
        }
        self.collect().await
    }

    /// Force re-collect and update the cache.
    pub async fn refresh(&self) {
        self.collect().await;
    }

    // ── Sub-collectors ─────────────────────────────────────────────

    async fn collect_system_stats(&self, snap: &mut EnvironmentSnapshot) {
        match self.backend.get_system_stats().await {
            Ok(stats) => {
                if let Some(system) = stats.get("system") {
                    snap.backend_version = system
                        .get("comfyui_version")
                        .or_else(|| system.get("version"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_owned();
                }
                if let Some(dev) = stats
                    .get("devices")
                    .and_then(|v| v.as_array())
                    .and_then(|devs| devs.first())
                {
                    snap.gpu_name = dev
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_owned();
                    snap.vram_total_mb = bytes_to_mib(dev.get("vram_total"));
                    snap.vram_free_mb = bytes_to_mib(dev.get("vram_free"));
                }
            }
            Err(e) => snap.errors.push(format!("system_stats: {e}")),
        }
    }

    async fn collect_models(&self, snap: &mut EnvironmentSnapshot) {
        match self.backend.list_models("checkpoints").await {
            Ok(models) => snap.checkpoint_models = models,
            Err(e) => snap.errors.push(format!("list_models: {e}")),
        }
    }

    async fn collect_queue(&self, snap: &mut EnvironmentSnapshot) {
        match self.backend.get_queue().await {
            Ok(queue) => {
                snap.queue_running = queue
                    .get("queue_running")
                    .and_then(|v| v.as_array())
                    .map(Vec::len)
                    .unwrap_or(0);
                snap.queue_pending = queue
                    .get("queue_pending")
                    .and_then(|v| v.as_array())
                    .map(Vec::len)
                    .unwrap_or(0);
            }
            Err(e) => snap.errors.push(format!("get_queue: {e}")),
        }
    }
}

fn bytes_to_mib(v: Option<&Value>) -> f64 {
    v.and_then(|v| v.as_f64()).unwrap_or(0.0) / (1024.0 * 1024.0)
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use gp_domain::error::Error;
    use serde_json::json;

    /// Mock backend with per-collector failure switches.
    struct FlakyBackend {
        healthy: bool,
        stats_ok: bool,
        models_ok: bool,
        queue_ok: bool,
    }

    #[async_trait::async_trait]
    impl BackendPort for FlakyBackend {
        async fn health_check(&self) -> bool {
            self.healthy
        }

        async fn get_system_stats(&self) -> Result<Value> {
            if !self.stats_ok {
                return Err(Error::Backend("stats down".into()));
            }
            Ok(json!({
                "system": { "comfyui_version": "0.3.26" },
                "devices": [{
                    "name": "NVIDIA RTX 4090",
                    "vram_total": 25_769_803_776u64,
                    "vram_free": 12_884_901_888u64
                }]
            }))
        }

        async fn list_models(&self, _folder: &str) -> Result<Vec<String>> {
            if !self.models_ok {
                return Err(Error::Backend("models down".into()));
            }
            Ok(vec!["sdxl.safetensors".into()])
        }

        async fn get_queue(&self) -> Result<Value> {
            if !self.queue_ok {
                return Err(Error::Backend("queue down".into()));
            }
            Ok(json!({ "queue_running": [1], "queue_pending": [1, 2] }))
        }
    }

    fn probe(backend: FlakyBackend) -> EnvironmentProbe {
        EnvironmentProbe::new(Arc::new(backend), Arc::new(NodeIndex::new()))
    }

    #[tokio::test]
    async fn all_collectors_healthy() {
        let probe = probe(FlakyBackend {
            healthy: true,
            stats_ok: true,
            models_ok: true,
            queue_ok: true,
        });
        let snap = probe.collect().await;
        assert!(snap.connection_ok);
        assert_eq!(snap.backend_version, "0.3.26");
        assert_eq!(snap.gpu_name, "NVIDIA RTX 4090");
        assert_eq!(snap.vram_total_mb, 24_576.0);
        assert_eq!(snap.vram_free_mb, 12_288.0);
        assert_eq!(snap.checkpoint_models, vec!["sdxl.safetensors"]);
        assert_eq!(snap.queue_running, 1);
        assert_eq!(snap.queue_pending, 2);
        assert!(snap.errors.is_empty());
    }

    #[tokio::test]
    async fn each_failing_collector_adds_one_error() {
        for (stats_ok, models_ok, queue_ok) in [
            (false, true, true),
            (true, false, true),
            (true, true, false),
            (false, false, true),
            (false, false, false),
        ] {
            let probe = probe(FlakyBackend {
                healthy: true,
                stats_ok,
                models_ok,
                queue_ok,
            });
            let snap = probe.collect().await;
            let expected = [stats_ok, models_ok, queue_ok]
                .iter()
                .filter(|ok| !**ok)
                .count();
            assert_eq!(snap.errors.len(), expected);
            assert!(snap.connection_ok);
        }
    }

    #[tokio::test]
    async fn health_gate_skips_remote_collectors() {
        let probe = probe(FlakyBackend {
            healthy: false,
            stats_ok: false,
            models_ok: false,
            queue_ok: false,
        });
        let snap = probe.collect().await;
        assert!(!snap.connection_ok);
        // Gated collectors never ran, so no errors accumulated.
        assert!(snap.errors.is_empty());
        assert!(snap.checkpoint_models.is_empty());
    }

    #[tokio::test]
    async fn snapshot_is_cached() {
        let probe = probe(FlakyBackend {
            healthy: true,
            stats_ok: true,
            models_ok: true,
            queue_ok: true,
        });
        let first = probe.get_snapshot().await;
        let second = probe.get_snapshot().await;
        assert_eq!(first.collected_at, second.collected_at);
    }

    #[tokio::test]
    async fn expired_cache_recollects() {
        let probe = probe(FlakyBackend {
            healthy: true,
            stats_ok: true,
            models_ok: true,
            queue_ok: true,
        })
        .with_refresh_interval(0.0);
        let first = probe.get_snapshot().await;
        let second = probe.get_snapshot().await;
        assert!(second.collected_at >= first.collected_at);
    }
}
