//! Management tools — uploads, model downloads, custom node installs,
//! memory, storage paths, index refresh.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};

use gp_backend::{GraphClient, NodeIndex, WebClient};
use gp_domain::tool::ToolResult;

use crate::{Tool, ToolInfo};

/// First configured directory for a model folder. Folder-path entries
/// come back as either `[path, ...]` or `[[path, meta], ...]`.
fn first_folder_path(folder_paths: &Value, folder: &str) -> Option<PathBuf> {
    let entry = folder_paths.get(folder)?.as_array()?.first()?;
    let path = match entry {
        Value::Array(inner) => inner.first()?.as_str()?,
        Value::String(s) => s.as_str(),
        _ => return None,
    };
    Some(PathBuf::from(path))
}

fn available_folders(folder_paths: &Value) -> Vec<String> {
    let Some(map) = folder_paths.as_object() else {
        return Vec::new();
    };
    let mut folders: Vec<String> = map
        .iter()
        .filter(|(_, v)| v.is_array())
        .map(|(k, _)| k.clone())
        .collect();
    folders.sort();
    folders
}

/// Pull a reasonable filename out of a download URL. HuggingFace and
/// Civitai URLs carry the filename in predictable positions; anything
/// else falls back to the last path segment when it has an extension.
fn extract_filename_from_url(url: &str) -> String {
    let parts: Vec<&str> = url.split('/').collect();
    if url.contains("huggingface.co") {
        if parts.iter().any(|p| *p == "resolve" || *p == "blob") {
            if let Some(last) = parts.last() {
                return last.split('?').next().unwrap_or("").to_owned();
            }
        }
    }
    if url.contains("civitai.com") {
        for p in parts.iter().rev() {
            if p.contains('.') {
                return p.split('?').next().unwrap_or("").to_owned();
            }
        }
    }
    let name = url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("")
        .split('?')
        .next()
        .unwrap_or("");
    if name.contains('.') {
        name.to_owned()
    } else {
        String::new()
    }
}

/// Repository directory name from a git URL (`.git` suffix stripped).
fn repo_name_from_git_url(git_url: &str) -> String {
    git_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("")
        .trim_end_matches(".git")
        .to_owned()
}

/// The Python executable the backend runs under: a venv next to
/// custom_nodes/ when present, the system python3 otherwise.
fn find_backend_python(custom_nodes_dir: &Path) -> String {
    if let Some(root) = custom_nodes_dir.parent() {
        for venv in [".venv", "venv"] {
            let python = root.join(venv).join("bin").join("python");
            if python.exists() {
                return python.display().to_string();
            }
        }
    }
    "python3".to_owned()
}

/// Upload an image into the backend's input directory, from a URL or a
/// local file path.
pub struct UploadImageTool {
    client: Arc<GraphClient>,
    web: Arc<WebClient>,
}

impl UploadImageTool {
    pub fn new(client: Arc<GraphClient>, web: Arc<WebClient>) -> Self {
        Self { client, web }
    }
}

#[async_trait::async_trait]
impl Tool for UploadImageTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "graph_upload_image".into(),
            description: (
                "Upload an image to the backend's input directory for img2img, \
                 ControlNet, or other image-input workflows. Provide either a URL \
                 (downloaded automatically) or a local filepath. Returns the \
                 filename to reference in workflow inputs."
            )
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "Image URL to download and upload" },
                    "filepath": { "type": "string", "description": "Local image file path" },
                    "filename": { "type": "string", "description": "Target filename (optional)" }
                },
                "required": []
            }),
        }
    }

    async fn run(&self, params: Value) -> ToolResult {
        let url = params.get("url").and_then(|v| v.as_str());
        let filepath = params.get("filepath").and_then(|v| v.as_str());

        let (data, default_name) = if let Some(url) = url {
            let data = match self.web.fetch_bytes(url).await {
                Ok(d) => d,
                Err(e) => return ToolResult::error(format!("Failed to download image: {e}")),
            };
            let name = url.rsplit('/').next().unwrap_or("upload.png").to_owned();
            (data, name)
        } else if let Some(path) = filepath {
            match tokio::fs::read(path).await {
                Ok(data) => {
                    let name = std::path::Path::new(path)
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or("upload.png")
                        .to_owned();
                    (data, name)
                }
                Err(e) => return ToolResult::error(format!("Failed to read {path}: {e}")),
            }
        } else {
            return ToolResult::error("Either url or filepath is required");
        };

        let filename = params
            .get("filename")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .unwrap_or(default_name);

        match self.client.upload_image(data, &filename, "", false).await {
            Ok(result) => {
                let stored = result
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or(&filename);
                ToolResult::success(format!("Image uploaded as '{stored}'."))
            }
            Err(e) => ToolResult::error(format!("Upload failed: {e}")),
        }
    }
}

/// Download a model file from a URL into one of the backend's model
/// directories.
pub struct DownloadModelTool {
    client: Arc<GraphClient>,
    web: Arc<WebClient>,
}

impl DownloadModelTool {
    pub fn new(client: Arc<GraphClient>, web: Arc<WebClient>) -> Self {
        Self { client, web }
    }
}

#[async_trait::async_trait]
impl Tool for DownloadModelTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "graph_download_model".into(),
            description: (
                "Download a model file from a URL to the backend's model directory. \
                 Supports HuggingFace, Civitai, and direct download URLs. \
                 Use get_folder_paths first to see available model folders."
            )
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "Download URL for the model file" },
                    "folder": { "type": "string", "description": "Target model folder (e.g., 'checkpoints', 'loras')" },
                    "filename": { "type": "string", "description": "Filename to save as (optional)" }
                },
                "required": ["url", "folder"]
            }),
        }
    }

    async fn run(&self, params: Value) -> ToolResult {
        let url = params.get("url").and_then(|v| v.as_str()).unwrap_or("");
        let folder = params.get("folder").and_then(|v| v.as_str()).unwrap_or("");
        if url.is_empty() || folder.is_empty() {
            return ToolResult::error("'url' and 'folder' are required");
        }

        let folder_paths = match self.client.get_folder_paths().await {
            Ok(paths) => paths,
            Err(e) => return ToolResult::error(format!("Failed to download model: {e}")),
        };
        let Some(target_dir) = first_folder_path(&folder_paths, folder) else {
            return ToolResult::error(format!(
                "Unknown folder '{folder}'. Available: {}",
                available_folders(&folder_paths).join(", ")
            ));
        };
        if let Err(e) = tokio::fs::create_dir_all(&target_dir).await {
            return ToolResult::error(format!(
                "Failed to create {}: {e}",
                target_dir.display()
            ));
        }

        let filename = params
            .get("filename")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| extract_filename_from_url(url));
        if filename.is_empty() {
            return ToolResult::error(
                "Could not determine filename from URL. Please provide 'filename' parameter.",
            );
        }

        let target_path = target_dir.join(&filename);
        if let Ok(meta) = tokio::fs::metadata(&target_path).await {
            let size_mb = meta.len() as f64 / (1024.0 * 1024.0);
            return ToolResult::success(format!(
                "Model already exists: {} ({size_mb:.1} MB)",
                target_path.display()
            ));
        }

        match self.web.download_to_file(url, &target_path).await {
            Ok(written) => {
                let size_mb = written as f64 / (1024.0 * 1024.0);
                ToolResult::success(format!(
                    "Model downloaded: {filename} ({size_mb:.1} MB)\nSaved to: {}\nFolder: {folder}",
                    target_path.display()
                ))
            }
            Err(e) => ToolResult::error(format!("Failed to download model: {e}")),
        }
    }
}

/// Install a custom node package from a git repository.
pub struct InstallCustomNodeTool {
    client: Arc<GraphClient>,
}

impl InstallCustomNodeTool {
    pub fn new(client: Arc<GraphClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for InstallCustomNodeTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "graph_install_custom_node".into(),
            description: (
                "Install a custom node package from a git repository URL. \
                 Clones the repo into the backend's custom_nodes/ directory and \
                 installs its dependencies. Requires a backend restart to take \
                 effect; after restart, call refresh_index."
            )
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "git_url": { "type": "string", "description": "Git repository URL" }
                },
                "required": ["git_url"]
            }),
        }
    }

    async fn run(&self, params: Value) -> ToolResult {
        let git_url = params.get("git_url").and_then(|v| v.as_str()).unwrap_or("");
        if git_url.is_empty() {
            return ToolResult::error("'git_url' is required");
        }
        if !git_url.starts_with("http://") && !git_url.starts_with("https://") {
            return ToolResult::error("git_url must start with http:// or https://");
        }

        let folder_paths = match self.client.get_folder_paths().await {
            Ok(paths) => paths,
            Err(e) => return ToolResult::error(format!("Failed to install custom node: {e}")),
        };
        let Some(custom_nodes_dir) = first_folder_path(&folder_paths, "custom_nodes") else {
            return ToolResult::error("Could not determine custom_nodes directory.");
        };

        let repo_name = repo_name_from_git_url(git_url);
        if repo_name.is_empty() {
            return ToolResult::error("Could not determine repository name from git_url.");
        }
        let target_dir = custom_nodes_dir.join(&repo_name);
        if target_dir.exists() {
            return ToolResult::success(format!(
                "Custom node '{repo_name}' already installed at {}",
                target_dir.display()
            ));
        }

        let clone = run_command(
            "git",
            &["clone", git_url, &target_dir.display().to_string()],
            120,
        )
        .await;
        match clone {
            Ok((true, _)) => {}
            Ok((false, stderr)) => {
                return ToolResult::error(format!("git clone failed: {}", stderr.trim()));
            }
            Err(e) => return ToolResult::error(format!("Failed to install custom node: {e}")),
        }

        // Dependencies install into the backend's own environment.
        let mut pip_msg = String::new();
        let req_file = target_dir.join("requirements.txt");
        if req_file.exists() {
            let python = find_backend_python(&custom_nodes_dir);
            match run_command(
                &python,
                &["-m", "pip", "install", "-r", &req_file.display().to_string()],
                300,
            )
            .await
            {
                Ok((true, _)) => {
                    pip_msg = "\nDependencies installed from requirements.txt".into();
                }
                Ok((false, stderr)) => {
                    let capped: String = stderr.chars().take(200).collect();
                    pip_msg = format!("\nWarning: pip install failed: {capped}");
                }
                Err(e) => pip_msg = format!("\nWarning: pip install failed: {e}"),
            }
        }

        ToolResult::success(format!(
            "Custom node '{repo_name}' installed at {}{pip_msg}\n\
             Note: Restart the backend for the new nodes to be available.",
            target_dir.display()
        ))
    }
}

/// Run a subprocess with a timeout; returns (succeeded, stderr).
async fn run_command(
    program: &str,
    args: &[&str],
    timeout_secs: u64,
) -> Result<(bool, String), String> {
    let output = tokio::time::timeout(
        std::time::Duration::from_secs(timeout_secs),
        tokio::process::Command::new(program).args(args).output(),
    )
    .await
    .map_err(|_| "Installation timed out".to_owned())?
    .map_err(|e| format!("{program}: {e}"))?;

    Ok((
        output.status.success(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    ))
}

/// Release backend VRAM.
pub struct FreeMemoryTool {
    client: Arc<GraphClient>,
}

impl FreeMemoryTool {
    pub fn new(client: Arc<GraphClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for FreeMemoryTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "graph_free_memory".into(),
            description: (
                "Release GPU VRAM by unloading models and clearing caches. \
                 Useful before loading large models or when VRAM is running low."
            )
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "unload_models": { "type": "boolean", "default": true },
                    "free_memory": { "type": "boolean", "default": true }
                },
                "required": []
            }),
        }
    }

    async fn run(&self, params: Value) -> ToolResult {
        let unload = params
            .get("unload_models")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let free = params
            .get("free_memory")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        match self.client.free_memory(unload, free).await {
            Ok(()) => ToolResult::success("Memory freed."),
            Err(e) => ToolResult::error(format!("Failed to free memory: {e}")),
        }
    }
}

/// Storage directory layout.
pub struct GetFolderPathsTool {
    client: Arc<GraphClient>,
}

impl GetFolderPathsTool {
    pub fn new(client: Arc<GraphClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for GetFolderPathsTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "graph_get_folder_paths".into(),
            description: "List backend storage directories: where models, outputs, and inputs live on disk."
                .into(),
            parameters: json!({"type": "object", "properties": {}, "required": []}),
        }
    }

    async fn run(&self, _params: Value) -> ToolResult {
        match self.client.get_folder_paths().await {
            Ok(paths) => ToolResult::success(
                serde_json::to_string_pretty(&paths).unwrap_or_else(|_| paths.to_string()),
            ),
            Err(e) => ToolResult::error(format!("Failed to get folder paths: {e}")),
        }
    }
}

/// Rebuild the node index from the backend's current registry.
pub struct RefreshNodeIndexTool {
    client: Arc<GraphClient>,
    index: Arc<NodeIndex>,
}

impl RefreshNodeIndexTool {
    pub fn new(client: Arc<GraphClient>, index: Arc<NodeIndex>) -> Self {
        Self { client, index }
    }
}

#[async_trait::async_trait]
impl Tool for RefreshNodeIndexTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "graph_refresh_index".into(),
            description: (
                "Rebuild the node search index from the backend's current node \
                 registry. Required after new custom nodes become available."
            )
                .into(),
            parameters: json!({"type": "object", "properties": {}, "required": []}),
        }
    }

    async fn run(&self, _params: Value) -> ToolResult {
        match self.index.build(&self.client).await {
            Ok(()) => ToolResult::success(format!(
                "Node index rebuilt: {} nodes in {} categories.",
                self.index.node_count(),
                self.index.categories().len()
            )),
            Err(e) => ToolResult::error(format!("Failed to refresh index: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_from_huggingface_resolve_url() {
        assert_eq!(
            extract_filename_from_url(
                "https://huggingface.co/org/model/resolve/main/sdxl.safetensors?download=true"
            ),
            "sdxl.safetensors"
        );
    }

    #[test]
    fn filename_from_civitai_url() {
        assert_eq!(
            extract_filename_from_url(
                "https://civitai.com/api/download/models/12345/dream.safetensors?type=Model"
            ),
            "dream.safetensors"
        );
    }

    #[test]
    fn filename_from_direct_url_needs_extension() {
        assert_eq!(
            extract_filename_from_url("https://example.com/files/upscaler.pth"),
            "upscaler.pth"
        );
        // No extension in the last segment means no guess.
        assert_eq!(extract_filename_from_url("https://example.com/files/latest"), "");
    }

    #[test]
    fn repo_name_strips_git_suffix() {
        assert_eq!(
            repo_name_from_git_url("https://github.com/org/graph-nodes.git"),
            "graph-nodes"
        );
        assert_eq!(
            repo_name_from_git_url("https://github.com/org/graph-nodes/"),
            "graph-nodes"
        );
    }

    #[test]
    fn folder_path_handles_both_entry_shapes() {
        let nested = serde_json::json!({
            "checkpoints": [["/models/checkpoints", [".safetensors"]]],
            "loras": ["/models/loras"],
            "total": 12
        });
        assert_eq!(
            first_folder_path(&nested, "checkpoints"),
            Some(PathBuf::from("/models/checkpoints"))
        );
        assert_eq!(
            first_folder_path(&nested, "loras"),
            Some(PathBuf::from("/models/loras"))
        );
        assert_eq!(first_folder_path(&nested, "vae"), None);
        assert_eq!(first_folder_path(&nested, "total"), None);
    }

    #[test]
    fn available_folders_lists_array_entries_only() {
        let paths = serde_json::json!({
            "checkpoints": [["/a"]],
            "loras": ["/b"],
            "total": 12
        });
        assert_eq!(available_folders(&paths), vec!["checkpoints", "loras"]);
    }

    #[test]
    fn backend_python_falls_back_to_system() {
        let dir = std::env::temp_dir().join("no-venv-here/custom_nodes");
        assert_eq!(find_backend_python(&dir), "python3");
    }
}
