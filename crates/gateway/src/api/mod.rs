//! HTTP + WebSocket API.
//!
//! - `GET    /api/health`                — agent + backend status
//! - `GET    /api/sessions`              — list top-level sessions
//! - `POST   /api/sessions`              — create session
//! - `DELETE /api/sessions/{id}`         — delete session (cascades)
//! - `GET    /api/sessions/{id}/messages`— UI-friendly message log
//! - `POST   /api/chat`                  — blocking chat
//! - `GET    /api/chat/ws`               — bidirectional WebSocket
//! - `GET/PUT /api/config`               — masked read / persisted update

pub mod config;
mod ws;

use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;

use gp_core::convert::messages_to_chat_items;

use crate::state::AppState;

/// Build the API router with CORS from the configuration.
pub fn router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config.read().server.cors_origins);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route(
            "/api/sessions/:session_id",
            axum::routing::delete(delete_session),
        )
        .route("/api/sessions/:session_id/messages", get(session_messages))
        .route("/api/chat", post(chat))
        .route("/api/chat/ws", get(ws::chat_ws))
        .route("/api/config", get(config::get_config).put(config::put_config))
        .layer(cors)
        .with_state(state)
}

fn build_cors_layer(origins: &[String]) -> tower_http::cors::CorsLayer {
    use tower_http::cors::{AllowOrigin, Any, CorsLayer};

    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
    ];

    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any);
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parse_origins(origins)))
        .allow_methods(methods)
        .allow_headers([axum::http::header::CONTENT_TYPE])
}

/// Parse the configured origin list, skipping (with a warning) anything
/// that is not a valid header value.
fn parse_origins(origins: &[String]) -> Vec<HeaderValue> {
    origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(hv) => Some(hv),
            Err(_) => {
                tracing::warn!(origin = %o, "invalid CORS origin, skipping");
                None
            }
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let connected = state.backend.health_check().await;
    let stats = if connected {
        state.backend.get_system_stats().await.ok()
    } else {
        None
    };
    let (backend_url, model) = {
        let config = state.config.read();
        (config.backend.base_url.clone(), config.llm.model.clone())
    };

    Json(json!({
        "status": "ok",
        "backend": {
            "connected": connected,
            "url": backend_url,
            "stats": stats,
        },
        "llm": { "model": model },
        "node_index": {
            "built": state.node_index.is_built(),
            "node_count": state.node_index.node_count(),
            "categories": state.node_index.categories().len(),
        },
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    match state.sessions.list_sessions() {
        Ok(sessions) => Json(json!({ "sessions": sessions })).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

#[derive(Debug, Deserialize, Default)]
struct CreateSessionRequest {
    #[serde(default)]
    title: Option<String>,
}

async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<CreateSessionRequest>>,
) -> impl IntoResponse {
    let title = body
        .and_then(|Json(b)| b.title)
        .unwrap_or_else(|| "New Session".to_owned());
    match state.sessions.create_session(&title) {
        Ok(session_id) => {
            Json(json!({ "session_id": session_id, "title": title })).into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.sessions.delete_session(&session_id) {
        Ok(()) => Json(json!({ "deleted": session_id })).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn session_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.sessions.load_messages(&session_id) {
        Ok(messages) => Json(json!({
            "session_id": session_id,
            "items": messages_to_chat_items(&messages),
        }))
        .into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chat (blocking)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    message: String,
}

async fn chat(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> impl IntoResponse {
    if body.message.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "message is required" })),
        )
            .into_response();
    }

    let session_id = match body.session_id {
        Some(id) => id,
        None => match state.sessions.create_session("API Session") {
            Ok(id) => id,
            Err(e) => return internal_error(e).into_response(),
        },
    };

    match state.agent.run(&session_id, &body.message).await {
        Ok(response) => Json(json!({
            "session_id": session_id,
            "response": response,
        }))
        .into_response(),
        Err(e) => {
            tracing::error!(session_id, error = %e, "chat failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string(), "session_id": session_id })),
            )
                .into_response()
        }
    }
}

fn internal_error(e: gp_domain::Error) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_origins_skips_invalid_entries() {
        let origins = vec![
            "http://localhost:5200".to_owned(),
            "not a valid header value\n".to_owned(),
            "https://studio.example.com".to_owned(),
        ];
        let parsed = parse_origins(&origins);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], "http://localhost:5200");
        assert_eq!(parsed[1], "https://studio.example.com");
    }

    #[test]
    fn parse_origins_empty_when_all_invalid() {
        let origins = vec!["bad\norigin".to_owned()];
        assert!(parse_origins(&origins).is_empty());
    }

    #[test]
    fn wildcard_builds_permissive_layer() {
        // A lone "*" takes the Any path regardless of other entries.
        let _ = build_cors_layer(&["*".to_owned()]);
        let _ = build_cors_layer(&["http://localhost:5200".to_owned(), "*".to_owned()]);
    }

    #[test]
    fn invalid_origin_does_not_panic_layer_build() {
        let origins = vec![
            "http://localhost:5200".to_owned(),
            "not a valid header value\n".to_owned(),
        ];
        let _ = build_cors_layer(&origins);
    }
}
