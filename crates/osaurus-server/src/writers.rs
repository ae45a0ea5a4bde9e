//! Response writers: re-encode the pipeline's generation events in the
//! dialect's streaming framing, or aggregate them into one body for
//! non-streaming requests.
//!
//! A writer owns the receiving half of the generation channel. When the
//! client disconnects, the body channel closes, the writer returns, and
//! dropping the generation receiver is what the pipeline observes as
//! cancellation. The request's active-count guard is moved into the writer
//! task so the counter drops exactly at the final flush.

use axum::body::{Body, Bytes};
use axum::http::{StatusCode, header};
use axum::response::Response;
use tokio::sync::mpsc;

use osaurus_core::{CoreError, Dialect, FinishReason, GenerationEvent, ToolCall, UsageInfo};

use crate::dialect::{anthropic, error_envelope, ollama, openai};
use crate::state::ActiveGuard;

const TIMEOUT_TAG: &str = "timeout";

fn finish_error(diagnostic: Option<String>) -> CoreError {
    let diagnostic = diagnostic.unwrap_or_else(|| "generation failed".into());
    if diagnostic.starts_with(TIMEOUT_TAG) {
        CoreError::Timeout(diagnostic)
    } else {
        CoreError::UpstreamFailure(diagnostic)
    }
}

/// Build the streamed HTTP response for one chat request and spawn the
/// writer task that feeds it.
pub fn streaming_response(
    dialect: Dialect,
    model_id: String,
    events: mpsc::Receiver<GenerationEvent>,
    guard: ActiveGuard,
) -> Response {
    let (frames_tx, frames_rx) = mpsc::channel::<Bytes>(32);

    match dialect {
        Dialect::OpenAi => {
            tokio::spawn(openai_writer(model_id, events, frames_tx, guard));
        }
        Dialect::Anthropic => {
            tokio::spawn(anthropic_writer(model_id, events, frames_tx, guard));
        }
        Dialect::Ollama => {
            tokio::spawn(ollama_writer(model_id, events, frames_tx, guard));
        }
    }

    let stream = futures::stream::unfold(frames_rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|bytes| (Ok::<_, std::convert::Infallible>(bytes), rx))
    });

    let content_type = match dialect {
        Dialect::Ollama => "application/x-ndjson",
        _ => "text/event-stream",
    };
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static(content_type),
    );
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        axum::http::HeaderValue::from_static("no-cache, no-transform"),
    );
    response
}

fn sse(data: &serde_json::Value) -> Bytes {
    Bytes::from(format!("data: {data}\n\n"))
}

fn sse_event(name: &str, data: &serde_json::Value) -> Bytes {
    Bytes::from(format!("event: {name}\ndata: {data}\n\n"))
}

fn ndjson(line: &serde_json::Value) -> Bytes {
    Bytes::from(format!("{line}\n"))
}

async fn openai_writer(
    model: String,
    mut events: mpsc::Receiver<GenerationEvent>,
    frames: mpsc::Sender<Bytes>,
    _guard: ActiveGuard,
) {
    let identity = openai::CompletionIdentity::new(&model);
    let mut usage: Option<UsageInfo> = None;

    while let Some(event) = events.recv().await {
        let frame = match event {
            GenerationEvent::RoleStart { .. } => sse(&identity.role_chunk()),
            GenerationEvent::ContentDelta { text } => sse(&identity.content_chunk(&text)),
            GenerationEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => sse(&identity.tool_call_chunk(
                index,
                id.as_deref(),
                name.as_deref(),
                arguments.as_deref(),
            )),
            GenerationEvent::Usage(u) => {
                usage = Some(u);
                continue;
            }
            GenerationEvent::Finish { reason, diagnostic } => {
                if reason == FinishReason::Error {
                    let error = finish_error(diagnostic);
                    let payload = error_envelope(Some(Dialect::OpenAi), &error);
                    let _ = frames.send(sse(&payload)).await;
                } else {
                    let chunk = identity.finish_chunk(reason, usage.take());
                    let _ = frames.send(sse(&chunk)).await;
                }
                let _ = frames.send(Bytes::from_static(b"data: [DONE]\n\n")).await;
                return;
            }
        };
        if frames.send(frame).await.is_err() {
            return; // client gone; dropping `events` cancels the pipeline
        }
    }
}

async fn anthropic_writer(
    model: String,
    mut events: mpsc::Receiver<GenerationEvent>,
    frames: mpsc::Sender<Bytes>,
    _guard: ActiveGuard,
) {
    let identity = anthropic::MessageIdentity::new(&model);
    let mut usage: Option<UsageInfo> = None;
    // Block 0 is the text block, opened with the message; tool_use blocks
    // follow it.
    let mut open_block: Option<usize> = None;
    let mut next_block = 0usize;

    let send = |frames: &mpsc::Sender<Bytes>, ev: anthropic::AnthropicEvent| {
        let bytes = sse_event(ev.name, &ev.data);
        let frames = frames.clone();
        async move { frames.send(bytes).await.is_ok() }
    };

    while let Some(event) = events.recv().await {
        match event {
            GenerationEvent::RoleStart { .. } => {
                if !send(&frames, identity.message_start()).await {
                    return;
                }
                if !send(&frames, identity.text_block_start(0)).await {
                    return;
                }
                open_block = Some(0);
                next_block = 1;
            }
            GenerationEvent::ContentDelta { text } => {
                if !send(&frames, identity.text_delta(0, &text)).await {
                    return;
                }
            }
            GenerationEvent::ToolCallDelta {
                id,
                name,
                arguments,
                ..
            } => {
                if let (Some(id), Some(name)) = (id.as_deref(), name.as_deref()) {
                    // A new call: close whatever block is open, open tool_use.
                    if let Some(open) = open_block.take() {
                        if !send(&frames, identity.block_stop(open)).await {
                            return;
                        }
                    }
                    let index = next_block;
                    next_block += 1;
                    open_block = Some(index);
                    if !send(&frames, identity.tool_block_start(index, id, name)).await {
                        return;
                    }
                }
                if let (Some(arguments), Some(open)) = (arguments.as_deref(), open_block) {
                    if !send(&frames, identity.input_json_delta(open, arguments)).await {
                        return;
                    }
                }
            }
            GenerationEvent::Usage(u) => usage = Some(u),
            GenerationEvent::Finish { reason, diagnostic } => {
                if reason == FinishReason::Error {
                    let error = finish_error(diagnostic);
                    let payload = error_envelope(Some(Dialect::Anthropic), &error);
                    let _ = frames.send(sse_event("error", &payload)).await;
                    return;
                }
                if let Some(open) = open_block.take() {
                    if !send(&frames, identity.block_stop(open)).await {
                        return;
                    }
                }
                let _ = frames
                    .send(sse_event(
                        "message_delta",
                        &identity.message_delta(reason, usage.take()).data,
                    ))
                    .await;
                let _ = frames
                    .send(sse_event("message_stop", &identity.message_stop().data))
                    .await;
                return;
            }
        }
    }
}

async fn ollama_writer(
    model: String,
    mut events: mpsc::Receiver<GenerationEvent>,
    frames: mpsc::Sender<Bytes>,
    _guard: ActiveGuard,
) {
    let mut usage: Option<UsageInfo> = None;

    while let Some(event) = events.recv().await {
        match event {
            GenerationEvent::RoleStart { .. } => {}
            GenerationEvent::ContentDelta { text } => {
                if frames
                    .send(ndjson(&ollama::content_line(&model, &text)))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            // Tool-call deltas are not part of this dialect.
            GenerationEvent::ToolCallDelta { .. } => {}
            GenerationEvent::Usage(u) => usage = Some(u),
            GenerationEvent::Finish { reason, diagnostic } => {
                if reason == FinishReason::Error {
                    let error = finish_error(diagnostic);
                    let payload = error_envelope(Some(Dialect::Ollama), &error);
                    let _ = frames.send(ndjson(&payload)).await;
                    return;
                }
                // The terminal line still fires after a tool-call finish.
                let _ = frames
                    .send(ndjson(&ollama::final_line(&model, reason, usage.take())))
                    .await;
                return;
            }
        }
    }
}

/// Everything a non-streaming response needs, pulled off the event channel.
pub struct CollectedResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub reason: FinishReason,
    pub usage: Option<UsageInfo>,
}

/// Drain the generation stream into one aggregate. Errors mid-generation
/// surface as the mapped `CoreError` so the handler can pick a status
/// (nothing has been written yet on this path).
pub async fn collect_response(
    mut events: mpsc::Receiver<GenerationEvent>,
) -> Result<CollectedResponse, CoreError> {
    let mut content = String::new();
    let mut calls: Vec<(usize, ToolCall)> = Vec::new();
    let mut usage = None;
    let mut reason = FinishReason::Stop;

    while let Some(event) = events.recv().await {
        match event {
            GenerationEvent::RoleStart { .. } => {}
            GenerationEvent::ContentDelta { text } => content.push_str(&text),
            GenerationEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                let pos = match calls.iter().position(|(i, _)| *i == index) {
                    Some(pos) => pos,
                    None => {
                        calls.push((
                            index,
                            ToolCall {
                                id: String::new(),
                                name: String::new(),
                                arguments_json: String::new(),
                            },
                        ));
                        calls.len() - 1
                    }
                };
                let (_, call) = &mut calls[pos];
                if let Some(id) = id {
                    call.id = id;
                }
                if let Some(name) = name {
                    call.name = name;
                }
                if let Some(arguments) = arguments {
                    call.arguments_json.push_str(&arguments);
                }
            }
            GenerationEvent::Usage(u) => usage = Some(u),
            GenerationEvent::Finish {
                reason: r,
                diagnostic,
            } => {
                if r == FinishReason::Error {
                    return Err(finish_error(diagnostic));
                }
                reason = r;
                break;
            }
        }
    }

    calls.sort_by_key(|(i, _)| *i);
    Ok(CollectedResponse {
        content,
        tool_calls: calls.into_iter().map(|(_, c)| c).collect(),
        reason,
        usage,
    })
}
