//! Config API — masked reads, persisted writes.
//!
//! `PUT /api/config` updates the in-memory configuration and rewrites
//! the TOML file, editing only the submitted keys so unknown entries in
//! the file survive.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// Show last 4 chars of a key only.
fn mask_key(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    if value.len() <= 4 {
        return "****".into();
    }
    format!("****{}", &value[value.len() - 4..])
}

pub async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.config.read();
    let api_key = config.llm.resolve_api_key();
    let tavily_key = config.web.resolve_tavily_key();

    Json(json!({
        "llm": {
            "provider": config.llm.provider,
            "model": config.llm.model,
            "max_tokens": config.llm.max_tokens,
            "base_url": config.llm.base_url,
            "api_key_set": !api_key.is_empty(),
            "api_key_masked": mask_key(&api_key),
        },
        "web": {
            "tavily_api_key_set": !tavily_key.is_empty(),
            "tavily_api_key_masked": mask_key(&tavily_key),
        },
        "backend": {
            "base_url": config.backend.base_url,
        },
    }))
}

pub async fn put_config(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    // Load the current file to preserve structure and unknown keys.
    let path = state.config_path.as_ref();
    let mut raw: toml::Value = match std::fs::read_to_string(path) {
        Ok(text) => text.parse().unwrap_or(empty_table()),
        Err(_) => empty_table(),
    };

    let mut updated: Vec<String> = Vec::new();

    {
        let mut config = state.config.write();

        if let Some(llm) = body.get("llm") {
            if let Some(api_key) = non_empty_str(llm, "api_key") {
                config.llm.api_key = api_key.to_owned();
                set_toml(&mut raw, "llm", "api_key", api_key.into());
                updated.push("llm.api_key".into());
            }
            if let Some(model) = llm.get("model").and_then(Value::as_str) {
                config.llm.model = model.to_owned();
                set_toml(&mut raw, "llm", "model", model.into());
                updated.push("llm.model".into());
            }
            if let Some(base_url) = llm.get("base_url").and_then(Value::as_str) {
                config.llm.base_url = base_url.to_owned();
                set_toml(&mut raw, "llm", "base_url", base_url.into());
                updated.push("llm.base_url".into());
            }
            if let Some(max_tokens) = llm.get("max_tokens").and_then(Value::as_u64) {
                config.llm.max_tokens = max_tokens as u32;
                set_toml(&mut raw, "llm", "max_tokens", (max_tokens as i64).into());
                updated.push("llm.max_tokens".into());
            }
        }

        if let Some(web) = body.get("web") {
            if let Some(key) = non_empty_str(web, "tavily_api_key") {
                config.web.tavily_api_key = key.to_owned();
                set_toml(&mut raw, "web", "tavily_api_key", key.into());
                updated.push("web.tavily_api_key".into());
            }
        }

        if let Some(backend) = body.get("backend") {
            if let Some(base_url) = backend.get("base_url").and_then(Value::as_str) {
                config.backend.base_url = base_url.to_owned();
                set_toml(&mut raw, "backend", "base_url", base_url.into());
                updated.push("backend.base_url".into());
            }
        }
    }

    let rendered = match toml::to_string_pretty(&raw) {
        Ok(s) => s,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("config render failed: {e}") })),
            )
                .into_response();
        }
    };
    if let Err(e) = std::fs::write(path, rendered) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("config write failed: {e}") })),
        )
            .into_response();
    }

    tracing::info!(updated = ?updated, "config updated");
    Json(json!({ "status": "ok", "updated": updated })).into_response()
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

fn non_empty_str<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn set_toml(raw: &mut toml::Value, section: &str, key: &str, value: toml::Value) {
    let Some(table) = raw.as_table_mut() else {
        return;
    };
    let entry = table
        .entry(section.to_owned())
        .or_insert_with(empty_table);
    if let Some(section_table) = entry.as_table_mut() {
        section_table.insert(key.to_owned(), value);
    }
}
