//! HTTP + WebSocket client for the graph execution backend.
//!
//! The backend exposes a ComfyUI-compatible API: queue/history/object-info
//! endpoints over HTTP, plus a WebSocket that pushes execution progress.
//! The WS listener relays backend frames onto the event bus as
//! `backend.*` events so UI clients see generation progress live.

use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use gp_domain::bus::EventBus;
use gp_domain::config::BackendConfig;
use gp_domain::error::{Error, Result};
use gp_domain::events::{Event, EventType};

/// Client for the graph execution backend.
pub struct GraphClient {
    base_url: String,
    ws_url: String,
    client_id: String,
    client: reqwest::Client,
    bus: Option<Arc<EventBus>>,
    ws_task: Mutex<Option<JoinHandle<()>>>,
}

impl GraphClient {
    pub fn from_config(cfg: &BackendConfig, bus: Option<Arc<EventBus>>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_owned(),
            ws_url: cfg.ws_url.trim_end_matches('/').to_owned(),
            client_id: uuid::Uuid::new_v4().to_string(),
            client,
            bus,
            ws_task: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // ── HTTP plumbing ──────────────────────────────────────────────

    async fn get_json(&self, path: &str) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("GET {path}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Backend(format!("GET {path}: HTTP {status} - {body}")));
        }
        resp.json()
            .await
            .map_err(|e| Error::Backend(format!("GET {path}: {e}")))
    }

    async fn post_json(&self, path: &str, body: Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("POST {path}: {e}")))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Error::Backend(format!(
                "POST {path}: HTTP {status} - {text}"
            )));
        }
        if text.trim().is_empty() {
            return Ok(json!({ "status": "ok" }));
        }
        Ok(serde_json::from_str(&text).unwrap_or(json!({ "status": "ok", "raw": text })))
    }

    // ── Backend API ────────────────────────────────────────────────

    /// System statistics: version, devices, VRAM.
    pub async fn get_system_stats(&self) -> Result<Value> {
        self.get_json("/api/system_stats").await
    }

    /// Node definitions; a class name narrows to one node.
    pub async fn get_object_info(&self, node_class: Option<&str>) -> Result<Value> {
        match node_class {
            Some(class) => self.get_json(&format!("/api/object_info/{class}")).await,
            None => self.get_json("/api/object_info").await,
        }
    }

    /// Current queue: running and pending entries.
    pub async fn get_queue(&self) -> Result<Value> {
        self.get_json("/api/queue").await
    }

    /// Execution history, optionally for one prompt id.
    pub async fn get_history(&self, prompt_id: Option<&str>) -> Result<Value> {
        match prompt_id {
            Some(id) => self.get_json(&format!("/api/history/{id}")).await,
            None => self.get_json("/api/history?max_items=200").await,
        }
    }

    /// Submit a workflow for execution. Returns the backend response
    /// (including `prompt_id`).
    pub async fn queue_prompt(&self, workflow: &Value) -> Result<Value> {
        let result = self
            .post_json(
                "/api/prompt",
                json!({ "prompt": workflow, "client_id": self.client_id }),
            )
            .await?;
        tracing::info!(
            prompt_id = result.get("prompt_id").and_then(|v| v.as_str()).unwrap_or("unknown"),
            "workflow queued"
        );
        Ok(result)
    }

    /// Interrupt the currently running execution.
    pub async fn interrupt(&self) -> Result<()> {
        self.post_json("/api/interrupt", Value::Null).await?;
        tracing::info!("execution interrupted");
        Ok(())
    }

    /// Clear all pending queue items.
    pub async fn clear_queue(&self) -> Result<()> {
        self.post_json("/api/queue", json!({ "clear": true })).await?;
        Ok(())
    }

    /// Delete specific items from the queue.
    pub async fn delete_queue_items(&self, prompt_ids: &[String]) -> Result<()> {
        self.post_json("/api/queue", json!({ "delete": prompt_ids }))
            .await?;
        Ok(())
    }

    /// List model files in a folder (checkpoints, loras, vae, …).
    pub async fn list_models(&self, folder: &str) -> Result<Vec<String>> {
        let result = self.get_json(&format!("/api/models/{folder}")).await?;
        Ok(result
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Upload an image into the backend's input directory.
    pub async fn upload_image(
        &self,
        image_data: Vec<u8>,
        filename: &str,
        subfolder: &str,
        overwrite: bool,
    ) -> Result<Value> {
        let mut form = reqwest::multipart::Form::new().part(
            "image",
            reqwest::multipart::Part::bytes(image_data)
                .file_name(filename.to_owned())
                .mime_str("image/png")
                .map_err(|e| Error::Backend(e.to_string()))?,
        );
        if !subfolder.is_empty() {
            form = form.text("subfolder", subfolder.to_owned());
        }
        form = form.text("overwrite", overwrite.to_string());

        let url = format!("{}/api/upload/image", self.base_url);
        let resp = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("upload_image: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Backend(format!("upload_image: HTTP {status} - {body}")));
        }
        resp.json()
            .await
            .map_err(|e| Error::Backend(format!("upload_image: {e}")))
    }

    /// Download an image produced by the backend.
    pub async fn get_image(
        &self,
        filename: &str,
        subfolder: &str,
        folder_type: &str,
    ) -> Result<Vec<u8>> {
        let url = format!("{}/api/view", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("filename", filename),
                ("subfolder", subfolder),
                ("type", folder_type),
            ])
            .send()
            .await
            .map_err(|e| Error::Backend(format!("get_image: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Backend(format!("get_image: HTTP {status}")));
        }
        Ok(resp
            .bytes()
            .await
            .map_err(|e| Error::Backend(e.to_string()))?
            .to_vec())
    }

    /// URL an image can be fetched from without auth.
    pub fn get_image_url(&self, filename: &str, subfolder: &str, folder_type: &str) -> String {
        format!(
            "{}/api/view?filename={filename}&subfolder={subfolder}&type={folder_type}",
            self.base_url
        )
    }

    /// Storage directory configuration (models, outputs, inputs).
    pub async fn get_folder_paths(&self) -> Result<Value> {
        self.get_json("/internal/folder_paths").await
    }

    /// Release VRAM by unloading models and clearing caches.
    pub async fn free_memory(&self, unload_models: bool, free_memory: bool) -> Result<()> {
        self.post_json(
            "/api/free",
            json!({ "unload_models": unload_models, "free_memory": free_memory }),
        )
        .await?;
        tracing::info!(unload_models, free_memory, "backend memory freed");
        Ok(())
    }

    /// True when the backend answers a stats request.
    pub async fn health_check(&self) -> bool {
        self.get_system_stats().await.is_ok()
    }

    /// Poll history until the prompt completes (or the deadline passes).
    pub async fn wait_for_prompt(&self, prompt_id: &str, timeout_secs: u64) -> Result<Value> {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(timeout_secs);

        while tokio::time::Instant::now() < deadline {
            let history = self.get_history(Some(prompt_id)).await?;
            if let Some(entry) = history.get(prompt_id) {
                let status = entry.get("status").cloned().unwrap_or(Value::Null);
                let completed = status
                    .get("completed")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if completed || entry.get("outputs").is_some() {
                    return Ok(entry.clone());
                }
                if status.get("status_str").and_then(|v| v.as_str()) == Some("error") {
                    return Err(Error::Backend(format!(
                        "prompt {prompt_id} failed: {}",
                        status.get("messages").cloned().unwrap_or(Value::Null)
                    )));
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }

        Err(Error::Timeout(format!(
            "prompt {prompt_id} did not complete within {timeout_secs}s"
        )))
    }

    // ── WebSocket relay ────────────────────────────────────────────

    /// Connect to the backend WebSocket and relay frames onto the bus.
    pub async fn connect_ws(&self) -> Result<()> {
        let url = format!("{}?clientId={}", self.ws_url, self.client_id);
        let (stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| Error::Backend(format!("ws connect: {e}")))?;
        tracing::info!(url = %url, "backend websocket connected");

        let bus = self.bus.clone();
        let task = tokio::spawn(async move {
            let (_, mut reader) = stream.split();
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        if let Ok(value) = serde_json::from_str::<Value>(&text) {
                            relay_backend_frame(&bus, value).await;
                        }
                    }
                    Ok(WsMessage::Binary(data)) => {
                        // Binary frames are preview images.
                        if let Some(bus) = &bus {
                            bus.emit(Event::with_data(
                                EventType::BackendPreview,
                                json!({ "size": data.len() }),
                            ))
                            .await;
                        }
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            tracing::info!("backend websocket closed");
        });

        // A reconnect replaces the previous listener.
        if let Some(old) = self.ws_task.lock().replace(task) {
            old.abort();
        }
        Ok(())
    }

    pub fn disconnect_ws(&self) {
        if let Some(task) = self.ws_task.lock().take() {
            task.abort();
        }
    }

    pub fn close(&self) {
        self.disconnect_ws();
    }
}

/// Map a backend WS frame to a `backend.*` event and emit it.
async fn relay_backend_frame(bus: &Option<Arc<EventBus>>, frame: Value) {
    let Some(bus) = bus else { return };

    let frame_type = frame.get("type").and_then(|v| v.as_str()).unwrap_or("");
    let data = frame.get("data").cloned().unwrap_or(Value::Null);

    let event_type = match frame_type {
        "progress" => EventType::BackendProgress,
        "executing" => EventType::BackendExecuting,
        "executed" => EventType::BackendExecuted,
        "execution_error" => EventType::BackendError,
        "status" => EventType::BackendQueueUpdate,
        _ => return,
    };

    bus.emit(Event::with_data(event_type, data)).await;
}
