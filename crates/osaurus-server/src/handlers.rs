//! Request handlers: chat endpoints on three dialects, model listings, the
//! MCP HTTP surface, and liveness probes.

use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;

use osaurus_core::{CallerContext, ChatRequest, CoreError, Dialect};
use osaurus_pipeline::{PipelineOptions, run};

use crate::dialect::{anthropic, error_envelope, ollama, openai};
use crate::state::AppState;
use crate::writers;

/// Dialect-correct error response, used only before the first body byte.
fn error_response(dialect: Option<Dialect>, error: &CoreError) -> Response {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(error_envelope(dialect, error))).into_response()
}

// ── Liveness ──

pub async fn banner() -> &'static str {
    "Osaurus is running.\n"
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

// ── Model catalog ──

pub async fn models(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(openai::models_response(&state.model_ids().await))
}

pub async fn tags(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(ollama::tags_response(&state.model_ids().await))
}

#[derive(serde::Deserialize)]
pub struct ShowRequest {
    pub model: Option<String>,
    pub name: Option<String>,
}

pub async fn show(State(state): State<AppState>, body: Bytes) -> Response {
    let request: ShowRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return error_response(
                Some(Dialect::Ollama),
                &CoreError::InvalidRequest(e.to_string()),
            );
        }
    };
    let Some(model) = request.model.or(request.name) else {
        return error_response(
            Some(Dialect::Ollama),
            &CoreError::InvalidRequest("missing model name".into()),
        );
    };
    if state.resolve_backend(&model).await.is_none() {
        return error_response(Some(Dialect::Ollama), &CoreError::UnknownModel(model));
    }
    Json(ollama::show_response(&model)).into_response()
}

// ── Chat ──

pub async fn chat_openai(State(state): State<AppState>, body: Bytes) -> Response {
    let parsed: openai::OpenAiChatRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            return error_response(
                Some(Dialect::OpenAi),
                &CoreError::InvalidRequest(e.to_string()),
            );
        }
    };
    match openai::decode(parsed) {
        Ok(request) => run_chat(state, request).await,
        Err(e) => error_response(Some(Dialect::OpenAi), &e),
    }
}

pub async fn chat_anthropic(State(state): State<AppState>, body: Bytes) -> Response {
    let parsed: anthropic::AnthropicRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            return error_response(
                Some(Dialect::Anthropic),
                &CoreError::InvalidRequest(e.to_string()),
            );
        }
    };
    match anthropic::decode(parsed) {
        Ok(request) => run_chat(state, request).await,
        Err(e) => error_response(Some(Dialect::Anthropic), &e),
    }
}

pub async fn chat_ollama(State(state): State<AppState>, body: Bytes) -> Response {
    let parsed: ollama::OllamaChatRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            return error_response(
                Some(Dialect::Ollama),
                &CoreError::InvalidRequest(e.to_string()),
            );
        }
    };
    match ollama::decode(parsed) {
        Ok(request) => run_chat(state, request).await,
        Err(e) => error_response(Some(Dialect::Ollama), &e),
    }
}

/// The shared decode-pipeline-write chain behind all three chat endpoints.
async fn run_chat(state: AppState, request: ChatRequest) -> Response {
    let dialect = request.dialect;
    let guard = state.active.begin();

    let Some(backend) = state.resolve_backend(&request.model_id).await else {
        return error_response(
            Some(dialect),
            &CoreError::UnknownModel(request.model_id.clone()),
        );
    };

    // One token chain per request: shutdown cancels all children, a writer
    // disconnect cancels just this one.
    let cancel = state.shutdown.child_token();

    let mut opts = PipelineOptions::from_request(&request);
    if !request.params.stream {
        opts = opts.with_deadline(Duration::from_secs(
            state.config.server.request_timeout_secs,
        ));
    }

    let backend_rx = match backend.generate(request.clone(), cancel.clone()).await {
        Ok(backend_rx) => backend_rx,
        Err(e) => {
            return error_response(Some(dialect), &CoreError::UpstreamFailure(e.to_string()));
        }
    };

    let (events_tx, events_rx) = mpsc::channel(64);
    tokio::spawn(run(backend_rx, opts, events_tx, cancel));

    if request.params.stream {
        return writers::streaming_response(dialect, request.model_id, events_rx, guard);
    }

    let collected = match writers::collect_response(events_rx).await {
        Ok(collected) => collected,
        Err(e) => return error_response(Some(dialect), &e),
    };
    drop(guard);

    let body = match dialect {
        Dialect::OpenAi => openai::CompletionIdentity::new(&request.model_id).completion(
            &collected.content,
            &collected.tool_calls,
            collected.reason,
            collected.usage,
        ),
        Dialect::Anthropic => anthropic::MessageIdentity::new(&request.model_id).message(
            &collected.content,
            &collected.tool_calls,
            collected.reason,
            collected.usage,
        ),
        Dialect::Ollama => ollama::chat_response(
            &request.model_id,
            &collected.content,
            collected.reason,
            collected.usage,
        ),
    };
    Json(body).into_response()
}

// ── MCP over HTTP ──

pub async fn mcp_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "transport": "http",
        "tools": state.registry.list().await.len(),
    }))
}

pub async fn mcp_tools(State(state): State<AppState>) -> Json<serde_json::Value> {
    let tools: Vec<serde_json::Value> = state
        .registry
        .list()
        .await
        .into_iter()
        .map(|spec| {
            serde_json::json!({
                "name": spec.name,
                "description": spec.description,
                "inputSchema": spec.parameters,
            })
        })
        .collect();
    Json(serde_json::json!({ "tools": tools }))
}

#[derive(serde::Deserialize)]
pub struct McpCallRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// `POST /mcp/call` — invoke one tool. Errors come back as
/// `isError: true` with the message as text content, mirroring the stdio
/// transport.
pub async fn mcp_call(State(state): State<AppState>, body: Bytes) -> Response {
    let request: McpCallRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return error_response(None, &CoreError::InvalidRequest(e.to_string())),
    };

    let arguments = match &request.arguments {
        serde_json::Value::Null => "{}".to_string(),
        other => other.to_string(),
    };

    match state
        .registry
        .execute(&request.name, &arguments, &CallerContext::mcp())
        .await
    {
        Ok(result) => Json(serde_json::json!({
            "content": [{ "type": "text", "text": result }],
            "isError": false,
        }))
        .into_response(),
        Err(e) => Json(serde_json::json!({
            "content": [{ "type": "text", "text": e.to_string() }],
            "isError": true,
        }))
        .into_response(),
    }
}
