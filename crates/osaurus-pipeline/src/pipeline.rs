//! The pipeline driver: backend events in, generation events out.
//!
//! Single-threaded cooperative producer. Every iteration suspends on the
//! next backend event (or the deadline, or cancellation), so a writer
//! disconnect is observed within one backend-event suspension and the
//! backend is cancelled through the shared token.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use osaurus_core::{ChatRequest, FinishReason, GenerationEvent, Role, ToolCall, UsageInfo};

use crate::backend::{BackendEvent, BackendFinish};
use crate::buffer::RollingBuffer;
use crate::detect::{DETECT_WINDOW, ToolCallDetector};

/// What the pipeline needs to know about one request.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Stop sequences, in request order.
    pub stop: Vec<String>,
    /// Names of the tools inline detection watches for. Empty disables
    /// detection (and content streams eagerly).
    pub tool_names: Vec<String>,
    /// Upper bound on total wall-clock time. `None` means unbounded.
    pub deadline: Option<Duration>,
}

impl PipelineOptions {
    pub fn from_request(request: &ChatRequest) -> Self {
        Self {
            stop: request.params.stop.clone(),
            tool_names: request
                .active_tools()
                .into_iter()
                .map(|t| t.name)
                .collect(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Sends generation events, converting a closed receiver (writer gone) into
/// upstream cancellation.
struct Emitter {
    tx: mpsc::Sender<GenerationEvent>,
    cancel: CancellationToken,
}

impl Emitter {
    async fn send(&self, event: GenerationEvent) -> Result<(), ()> {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("Writer dropped; cancelling backend");
            self.cancel.cancel();
            return Err(());
        }
        Ok(())
    }
}

/// Drive one generation to completion.
///
/// Consumes `backend_rx` until a terminal condition (backend finish, stop
/// sequence, tool call, timeout, cancellation) and emits the corresponding
/// event sequence on `tx`. Always emits `RoleStart` first and at most one
/// `Finish`; cancels `cancel` whenever it stops consuming early so the
/// backend can stop generating.
pub async fn run(
    mut backend_rx: mpsc::Receiver<BackendEvent>,
    opts: PipelineOptions,
    tx: mpsc::Sender<GenerationEvent>,
    cancel: CancellationToken,
) {
    let out = Emitter {
        tx,
        cancel: cancel.clone(),
    };

    if out
        .send(GenerationEvent::RoleStart {
            role: Role::Assistant,
        })
        .await
        .is_err()
    {
        return;
    }

    let detector = ToolCallDetector::new(&opts.tool_names);
    let max_stop_len = opts
        .stop
        .iter()
        .map(|s| s.chars().count())
        .max()
        .unwrap_or(0);
    // With tools in play, content is withheld until we know the text is not
    // a tool call. With stops, emission lags by max_stop_len - 1 characters
    // so a stop split across tokens can never be partially emitted.
    let withhold_all = detector.is_some();
    let holdback = max_stop_len.saturating_sub(1);

    let mut buffer = RollingBuffer::new();
    let mut emitted = 0usize; // global chars already sent as ContentDelta
    let mut usage: Option<UsageInfo> = None;
    let mut native_calls = 0usize;

    let deadline = opts
        .deadline
        .map(|d| tokio::time::Instant::now() + d);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                let diag = format!(
                    "timeout: generation exceeded the {:?} deadline",
                    opts.deadline.unwrap_or_default()
                );
                tracing::warn!(%diag, "Request timed out");
                let _ = out.send(GenerationEvent::error(diag)).await;
                cancel.cancel();
                return;
            }
            ev = backend_rx.recv() => ev,
        };

        let Some(event) = event else {
            // Backend hung up without a Finish.
            let _ = flush_text(&out, &buffer, &mut emitted).await;
            let _ = out
                .send(GenerationEvent::error("backend stream ended unexpectedly"))
                .await;
            return;
        };

        match event {
            BackendEvent::TokenChunk(text) => {
                let token_chars = text.chars().count();
                buffer.push(&text);

                if max_stop_len > 0 {
                    if let Some(stop_global) =
                        find_stop(&buffer, &opts.stop, max_stop_len, token_chars)
                    {
                        if stop_global > emitted {
                            let slice = buffer.slice_global(emitted, stop_global).to_string();
                            emitted = stop_global;
                            if !slice.is_empty()
                                && out.send(GenerationEvent::content_delta(slice)).await.is_err()
                            {
                                return;
                            }
                        }
                        if let Some(u) = usage.take() {
                            let _ = out.send(GenerationEvent::Usage(u)).await;
                        }
                        let _ = out.send(GenerationEvent::finish(FinishReason::Stop)).await;
                        cancel.cancel();
                        return;
                    }
                }

                if let Some(detector) = &detector {
                    // Cheap gate: a call can only have completed on a token
                    // that closes an object.
                    if text.contains('}') {
                        let (window, _) = buffer.tail_window(DETECT_WINDOW);
                        if let Some(call) = detector.scan(window) {
                            let call = ToolCall::fresh(call.name, call.arguments_json);
                            if out
                                .send(GenerationEvent::ToolCallDelta {
                                    index: 0,
                                    id: Some(call.id),
                                    name: Some(call.name),
                                    arguments: Some(call.arguments_json),
                                })
                                .await
                                .is_err()
                            {
                                return;
                            }
                            if let Some(u) = usage.take() {
                                let _ = out.send(GenerationEvent::Usage(u)).await;
                            }
                            let _ = out
                                .send(GenerationEvent::finish(FinishReason::ToolCalls))
                                .await;
                            cancel.cancel();
                            return;
                        }
                    }
                }

                if !withhold_all {
                    let safe = buffer.total_chars().saturating_sub(holdback);
                    if safe > emitted {
                        let slice = buffer.slice_global(emitted, safe).to_string();
                        emitted = safe;
                        if !slice.is_empty()
                            && out.send(GenerationEvent::content_delta(slice)).await.is_err()
                        {
                            return;
                        }
                    }
                }
            }

            BackendEvent::NativeToolCall {
                name,
                arguments_json,
            } => {
                let call = ToolCall::fresh(name, arguments_json);
                if out
                    .send(GenerationEvent::ToolCallDelta {
                        index: native_calls,
                        id: Some(call.id),
                        name: Some(call.name),
                        arguments: Some(call.arguments_json),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                native_calls += 1;
            }

            BackendEvent::Usage(u) => usage = Some(u),

            BackendEvent::Finish(reason) => {
                if native_calls == 0 && flush_text(&out, &buffer, &mut emitted).await.is_err() {
                    return;
                }
                if let Some(u) = usage.take() {
                    let _ = out.send(GenerationEvent::Usage(u)).await;
                }
                let finish = if native_calls > 0 {
                    GenerationEvent::finish(FinishReason::ToolCalls)
                } else {
                    match reason {
                        BackendFinish::Stop => GenerationEvent::finish(FinishReason::Stop),
                        BackendFinish::Length => GenerationEvent::finish(FinishReason::Length),
                        BackendFinish::Error(diag) => GenerationEvent::error(diag),
                    }
                };
                let _ = out.send(finish).await;
                return;
            }
        }
    }
}

/// Emit everything appended but not yet sent, as one delta.
async fn flush_text(
    out: &Emitter,
    buffer: &RollingBuffer,
    emitted: &mut usize,
) -> Result<(), ()> {
    let total = buffer.total_chars();
    if total > *emitted {
        let slice = buffer.slice_global(*emitted, total).to_string();
        *emitted = total;
        if !slice.is_empty() {
            out.send(GenerationEvent::content_delta(slice)).await?;
        }
    }
    Ok(())
}

/// Global char offset of the earliest-starting stop-sequence occurrence in
/// the scan window, if any.
fn find_stop(
    buffer: &RollingBuffer,
    stops: &[String],
    max_stop_len: usize,
    token_chars: usize,
) -> Option<usize> {
    let window_chars = max_stop_len + token_chars + 1;
    let (window, window_start) = buffer.tail_window(window_chars);

    let mut best: Option<usize> = None;
    for stop in stops {
        if stop.is_empty() {
            continue;
        }
        if let Some(byte) = window.find(stop.as_str()) {
            best = Some(best.map_or(byte, |b| b.min(byte)));
        }
    }
    best.map(|byte| window_start + window[..byte].chars().count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendEvent, BackendFinish};

    async fn run_collect(
        script: Vec<BackendEvent>,
        opts: PipelineOptions,
    ) -> Vec<GenerationEvent> {
        let (btx, brx) = mpsc::channel(32);
        for ev in script {
            btx.send(ev).await.unwrap();
        }
        drop(btx);

        let (tx, mut rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        tokio::spawn(run(brx, opts, tx, cancel));

        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    fn content_of(events: &[GenerationEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::ContentDelta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn tokens_stream_eagerly_without_stops_or_tools() {
        let events = run_collect(
            vec![
                BackendEvent::TokenChunk("hel".into()),
                BackendEvent::TokenChunk("lo".into()),
                BackendEvent::Finish(BackendFinish::Stop),
            ],
            PipelineOptions::default(),
        )
        .await;

        assert!(matches!(events[0], GenerationEvent::RoleStart { role: Role::Assistant }));
        assert_eq!(events[1], GenerationEvent::content_delta("hel"));
        assert_eq!(events[2], GenerationEvent::content_delta("lo"));
        assert_eq!(events[3], GenerationEvent::finish(FinishReason::Stop));
        assert_eq!(events.len(), 4);
    }

    #[tokio::test]
    async fn stop_sequence_truncates_within_one_token() {
        let events = run_collect(
            vec![
                BackendEvent::TokenChunk("abcENDxyz".into()),
                BackendEvent::Finish(BackendFinish::Stop),
            ],
            PipelineOptions {
                stop: vec!["END".into()],
                ..Default::default()
            },
        )
        .await;

        assert_eq!(content_of(&events), "abc");
        assert!(matches!(
            events.last(),
            Some(GenerationEvent::Finish { reason: FinishReason::Stop, .. })
        ));
    }

    #[tokio::test]
    async fn stop_sequence_split_across_tokens_never_leaks() {
        let events = run_collect(
            vec![
                BackendEvent::TokenChunk("abcEN".into()),
                BackendEvent::TokenChunk("Dxyz".into()),
                BackendEvent::Finish(BackendFinish::Stop),
            ],
            PipelineOptions {
                stop: vec!["END".into()],
                ..Default::default()
            },
        )
        .await;

        let content = content_of(&events);
        assert_eq!(content, "abc");
        assert!(!content.contains("END"));
        assert!(!content.contains("xyz"));
    }

    #[tokio::test]
    async fn earliest_stop_wins() {
        let events = run_collect(
            vec![
                BackendEvent::TokenChunk("one TWO three ONE".into()),
                BackendEvent::Finish(BackendFinish::Stop),
            ],
            PipelineOptions {
                stop: vec!["ONE".into(), "TWO".into()],
                ..Default::default()
            },
        )
        .await;
        assert_eq!(content_of(&events), "one ");
    }

    #[tokio::test]
    async fn held_tail_is_flushed_on_finish() {
        let events = run_collect(
            vec![
                BackendEvent::TokenChunk("hello".into()),
                BackendEvent::Finish(BackendFinish::Stop),
            ],
            PipelineOptions {
                stop: vec!["LONGSTOP".into()],
                ..Default::default()
            },
        )
        .await;
        assert_eq!(content_of(&events), "hello");
    }

    #[tokio::test]
    async fn inline_tool_call_suppresses_content() {
        let events = run_collect(
            vec![
                BackendEvent::TokenChunk("thinking…".into()),
                BackendEvent::TokenChunk(r#"{"name":"get_weather","#.into()),
                BackendEvent::TokenChunk(r#""arguments":{"city":"SF"}}"#.into()),
                BackendEvent::Finish(BackendFinish::Stop),
            ],
            PipelineOptions {
                tool_names: vec!["get_weather".into()],
                ..Default::default()
            },
        )
        .await;

        assert!(content_of(&events).is_empty());
        let call = events
            .iter()
            .find_map(|e| match e {
                GenerationEvent::ToolCallDelta {
                    name, arguments, id, ..
                } => Some((name.clone(), arguments.clone(), id.clone())),
                _ => None,
            })
            .expect("expected a tool call delta");
        assert_eq!(call.0.as_deref(), Some("get_weather"));
        assert_eq!(call.1.as_deref(), Some(r#"{"city":"SF"}"#));
        assert!(call.2.unwrap().starts_with("call_"));
        assert!(matches!(
            events.last(),
            Some(GenerationEvent::Finish { reason: FinishReason::ToolCalls, .. })
        ));
    }

    #[tokio::test]
    async fn withheld_text_flushes_when_no_tool_call_appears() {
        let events = run_collect(
            vec![
                BackendEvent::TokenChunk("plain ".into()),
                BackendEvent::TokenChunk("answer".into()),
                BackendEvent::Finish(BackendFinish::Stop),
            ],
            PipelineOptions {
                tool_names: vec!["get_weather".into()],
                ..Default::default()
            },
        )
        .await;

        assert_eq!(content_of(&events), "plain answer");
        assert!(matches!(
            events.last(),
            Some(GenerationEvent::Finish { reason: FinishReason::Stop, .. })
        ));
    }

    #[tokio::test]
    async fn native_tool_calls_bypass_detection() {
        let events = run_collect(
            vec![
                BackendEvent::NativeToolCall {
                    name: "search".into(),
                    arguments_json: r#"{"q":"rust"}"#.into(),
                },
                BackendEvent::Finish(BackendFinish::Stop),
            ],
            PipelineOptions::default(),
        )
        .await;

        assert!(matches!(
            events[1],
            GenerationEvent::ToolCallDelta { index: 0, .. }
        ));
        assert!(matches!(
            events.last(),
            Some(GenerationEvent::Finish { reason: FinishReason::ToolCalls, .. })
        ));
    }

    #[tokio::test]
    async fn usage_is_emitted_before_finish() {
        let events = run_collect(
            vec![
                BackendEvent::TokenChunk("hi".into()),
                BackendEvent::Usage(UsageInfo {
                    prompt_tokens: 3,
                    completion_tokens: 1,
                }),
                BackendEvent::Finish(BackendFinish::Stop),
            ],
            PipelineOptions::default(),
        )
        .await;

        let n = events.len();
        assert!(matches!(events[n - 2], GenerationEvent::Usage(_)));
        assert!(events[n - 1].is_finish());
    }

    #[tokio::test]
    async fn backend_hangup_surfaces_as_error() {
        let events = run_collect(
            vec![BackendEvent::TokenChunk("partial".into())],
            PipelineOptions::default(),
        )
        .await;

        assert!(matches!(
            events.last(),
            Some(GenerationEvent::Finish { reason: FinishReason::Error, .. })
        ));
    }

    #[tokio::test]
    async fn backend_error_carries_diagnostic() {
        let events = run_collect(
            vec![BackendEvent::Finish(BackendFinish::Error("model exploded".into()))],
            PipelineOptions::default(),
        )
        .await;

        match events.last() {
            Some(GenerationEvent::Finish {
                reason: FinishReason::Error,
                diagnostic,
            }) => assert_eq!(diagnostic.as_deref(), Some("model exploded")),
            other => panic!("expected error finish, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_cancels_backend_and_reports_timeout() {
        // A backend that never finishes.
        let (btx, brx) = mpsc::channel(4);
        btx.send(BackendEvent::TokenChunk("spin".into())).await.unwrap();

        let (tx, mut rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let opts = PipelineOptions::default().with_deadline(Duration::from_millis(50));
        tokio::spawn(run(brx, opts, tx, cancel.clone()));

        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        assert!(matches!(
            events.last(),
            Some(GenerationEvent::Finish { reason: FinishReason::Error, .. })
        ));
        assert!(cancel.is_cancelled());
        drop(btx);
    }

    #[tokio::test]
    async fn writer_disconnect_cancels_upstream() {
        let (btx, brx) = mpsc::channel(4);
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(brx, PipelineOptions::default(), tx, cancel.clone()));

        // Drop the receiving half: the next send observes the closed channel.
        drop(rx);
        btx.send(BackendEvent::TokenChunk("x".into())).await.unwrap();

        handle.await.unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn emitted_content_is_prefix_of_generated_text() {
        // Slice-uniqueness: concatenated deltas equal the generated prefix.
        let tokens = ["alpha ", "beta ", "gamma ", "delta"];
        let mut script: Vec<BackendEvent> = tokens
            .iter()
            .map(|t| BackendEvent::TokenChunk(t.to_string()))
            .collect();
        script.push(BackendEvent::Finish(BackendFinish::Stop));

        let events = run_collect(
            script,
            PipelineOptions {
                stop: vec!["zzz".into()],
                ..Default::default()
            },
        )
        .await;

        assert_eq!(content_of(&events), tokens.concat());
    }
}
