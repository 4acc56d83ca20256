//! WebSocket session driver.
//!
//! One session owns one connection: it accepts a single request at a time,
//! submits it to the orchestrator, relays progress and exactly one terminal
//! frame, and keeps the connection open for the next request. A client that
//! disconnects mid-job detaches; the job is cancelled only when its result
//! would be unreachable (inline delivery, or never admitted).

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info};

use visage_core::{GenerationRequest, JobEvent, JobHandle, JobResult, ResponseMode};

use crate::protocol::{decode_payload, ClientMessage, ServerMessage};
use crate::state::AppState;

pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

struct ActiveJob {
    handle: JobHandle,
    /// Set once the first stage event arrives; a job that never ran is
    /// always cancelled on disconnect.
    admitted: bool,
}

/// One resolved wait: either the next inbound frame or the next job event.
enum Step {
    Inbound(Option<Result<Message, axum::Error>>),
    Event(Option<JobEvent>),
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let mut active: Option<ActiveJob> = None;

    loop {
        let step = match active.as_mut() {
            Some(job) => tokio::select! {
                inbound = stream.next() => Step::Inbound(inbound),
                event = job.handle.next_event() => Step::Event(event),
            },
            None => Step::Inbound(stream.next().await),
        };

        match step {
            Step::Inbound(Some(Ok(Message::Text(text)))) => {
                if let Some(reply) = handle_request(&state, &mut active, text.as_str()).await {
                    if sink.send(Message::Text(reply.to_json().into())).await.is_err() {
                        break;
                    }
                }
            }
            Step::Inbound(Some(Ok(Message::Ping(payload)))) => {
                let _ = sink.send(Message::Pong(payload)).await;
            }
            Step::Inbound(Some(Ok(Message::Close(_)))) | Step::Inbound(None) => break,
            Step::Inbound(Some(Ok(_))) => {
                // binary frames are not part of the protocol
            }
            Step::Inbound(Some(Err(err))) => {
                debug!(error = %err, "websocket receive error");
                break;
            }
            Step::Event(Some(event)) => {
                let job = active.as_mut().expect("event step implies an active job");
                let (reply, terminal) = relay_event(job, event);
                if terminal {
                    active = None;
                }
                if let Some(reply) = reply {
                    if sink.send(Message::Text(reply.to_json().into())).await.is_err() {
                        break;
                    }
                }
            }
            Step::Event(None) => {
                // event channel closed without a terminal frame; report it
                // rather than leaving the client hanging
                let request_id = active
                    .take()
                    .map(|job| job.handle.request_id)
                    .unwrap_or_default();
                let reply = ServerMessage::error(
                    Some(request_id),
                    "internal_error",
                    "job ended unexpectedly",
                );
                if sink.send(Message::Text(reply.to_json().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // transport closed: detach
    if let Some(job) = active {
        if job.handle.response_mode == ResponseMode::Inline || !job.admitted {
            info!(request_id = %job.handle.request_id, "client disconnected, cancelling job");
            job.handle.cancel();
        } else {
            info!(
                request_id = %job.handle.request_id,
                "client disconnected, job continues for later retrieval"
            );
        }
    }
}

/// Parse and submit one request frame. Returns a frame to send back, if
/// any; a successful submission replies through job events instead.
async fn handle_request(
    state: &AppState,
    active: &mut Option<ActiveJob>,
    text: &str,
) -> Option<ServerMessage> {
    let parsed: ClientMessage = match serde_json::from_str(text) {
        Ok(parsed) => parsed,
        Err(err) => {
            return Some(ServerMessage::error(
                None,
                "validation_error",
                format!("invalid request frame: {err}"),
            ));
        }
    };

    if active.is_some() {
        return Some(ServerMessage::error(
            parsed.request_id,
            "busy",
            "a job is already in flight on this connection",
        ));
    }

    let image = match decode_payload("image_data", &parsed.image_data) {
        Ok(bytes) => bytes,
        Err(err) => return Some(ServerMessage::error(parsed.request_id, err.kind(), err.to_string())),
    };
    let audio = match decode_payload("audio_data", &parsed.audio_data) {
        Ok(bytes) => bytes,
        Err(err) => return Some(ServerMessage::error(parsed.request_id, err.kind(), err.to_string())),
    };

    let mut request = GenerationRequest::new(image, audio)
        .with_options(parsed.options)
        .with_response_mode(parsed.response_mode);
    if let Some(id) = parsed.request_id {
        request = request.with_id(id);
    }
    let request_id = request.request_id.clone();

    match state.orchestrator.submit(request).await {
        Ok(handle) => {
            info!(request_id = %request_id, "job submitted");
            *active = Some(ActiveJob {
                handle,
                admitted: false,
            });
            None
        }
        Err(err) => Some(ServerMessage::error(
            Some(request_id),
            err.kind(),
            err.to_string(),
        )),
    }
}

/// Translate a job event into an outbound frame; the bool marks terminals.
fn relay_event(job: &mut ActiveJob, event: JobEvent) -> (Option<ServerMessage>, bool) {
    let request_id = job.handle.request_id.clone();
    match event {
        JobEvent::Queued { position } => (
            Some(ServerMessage::status(request_id, "queued", Some(position))),
            false,
        ),
        JobEvent::Stage { state } => {
            job.admitted = true;
            (
                Some(ServerMessage::status(request_id, state.as_str(), None)),
                false,
            )
        }
        JobEvent::Succeeded { result, elapsed } => {
            let elapsed_ms = elapsed.as_millis() as u64;
            let reply = match result {
                JobResult::Inline(bytes) => {
                    ServerMessage::success_inline(request_id, &bytes, elapsed_ms)
                }
                JobResult::Reference { reference_id } => {
                    ServerMessage::success_reference(request_id, reference_id, elapsed_ms)
                }
            };
            (Some(reply), true)
        }
        JobEvent::Failed { error } => (
            Some(ServerMessage::error(
                Some(request_id),
                error.kind(),
                error.to_string(),
            )),
            true,
        ),
        JobEvent::Cancelled => (
            Some(ServerMessage::error(
                Some(request_id),
                "cancelled",
                "job cancelled",
            )),
            true,
        ),
    }
}
