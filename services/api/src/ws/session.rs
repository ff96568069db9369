//! Manages one relay session: a caller connection bridged to an upstream
//! realtime AI connection.
//!
//! A session runs two read loops (caller and upstream) plus one writer task per
//! connection. Every outbound frame goes through its connection's writer queue,
//! so producers never interleave partial frames. Turn and tool-call state live
//! behind a single mutex that is never held while a frame is enqueued.

use super::{
    codec::{DecodeError, WireCodec},
    protocol::CallerCodec,
    provider::{UpstreamConnector, openai::OpenAiCodec},
    transport::{Frame, FrameSink, FrameStream, Link, TransportError},
};
use crate::{error::RelayError, models::SessionState, state::AppState};
use axum::{
    extract::{State, ws::WebSocketUpgrade},
    response::Response,
};
use chrono::{DateTime, Utc};
use concierge_core::{
    ControlSignal, Envelope, EnvelopeKind, SessionConfig, SideChannelNotifier, ToolCallRequest,
    ToolCallResult, ToolContext, ToolError, ToolInvocation, ToolRegistry,
};
use futures::{SinkExt, StreamExt};
use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
    time::{Instant, sleep_until, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

/// Outbound queue depth per connection.
const CHANNEL_BUFFER: usize = 256;

/// How many cancelled response ids are remembered for dropping late output.
const CANCELLED_RESPONSES_KEPT: usize = 8;

const IMAGE_READY_MESSAGE: &str =
    "Image received. Ask me to find products that look like it.";

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| async move {
        match state.sessions.accept(Link::from_axum(socket)) {
            Ok(handle) => info!(session_id = %handle.id(), "Caller connected"),
            Err(e) => warn!(error = %e, "Rejected caller connection"),
        }
    })
}

/// Timing and handshake parameters shared by every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub connect_timeout: Duration,
    pub configure_timeout: Duration,
    pub drain_grace: Duration,
    pub config: SessionConfig,
}

/// Collaborators a session is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub settings: Arc<SessionSettings>,
    pub registry: Arc<ToolRegistry>,
    pub connector: Arc<dyn UpstreamConnector>,
    pub notifier: Arc<dyn SideChannelNotifier>,
}

/// An item in a connection's writer queue.
#[derive(Debug)]
pub enum Outbound {
    Envelope(Envelope),
    Close,
}

/// Cheap, clonable view of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Uuid,
    started_at: DateTime<Utc>,
    state: watch::Receiver<SessionState>,
    shutdown: CancellationToken,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Every state change is published here.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Asks the session to drain. Calling it again has no further effect.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once the session reached `Closed`.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }
}

/// The in-flight AI response.
#[derive(Debug)]
struct ActiveTurn {
    response_id: Option<String>,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct PendingCall {
    call_id: String,
    cancel: CancellationToken,
    result: Option<ToolCallResult>,
}

#[derive(Debug, Default)]
struct TurnState {
    active: Option<ActiveTurn>,
    /// Admitted tool calls in issue order; results leave from the front.
    pending: VecDeque<PendingCall>,
    seen_call_ids: HashSet<String>,
    /// All pending results went out while a response was still running; ask
    /// for the continuation once it finishes.
    continuation_due: bool,
    /// Responses cancelled by a barge-in, newest last.
    cancelled_responses: VecDeque<String>,
}

impl TurnState {
    /// Makes `turn` the only active turn, cancelling any stale one.
    fn begin(&mut self, turn: ActiveTurn) -> Option<ActiveTurn> {
        let stale = self.active.replace(turn);
        if let Some(stale) = &stale {
            stale.cancel.cancel();
        }
        stale
    }

    /// Cancels the active turn and every tool call it issued. Calls admitted
    /// outside of it keep running.
    fn cancel_active(&mut self) -> Option<ActiveTurn> {
        let turn = self.active.take()?;
        turn.cancel.cancel();
        self.continuation_due = false;
        if let Some(id) = &turn.response_id {
            if self.cancelled_responses.len() == CANCELLED_RESPONSES_KEPT {
                self.cancelled_responses.pop_front();
            }
            self.cancelled_responses.push_back(id.clone());
        }
        Some(turn)
    }

    fn was_cancelled(&self, response_id: &str) -> bool {
        self.cancelled_responses.iter().any(|id| id == response_id)
    }

    /// Clears the active turn if `response_id` refers to it.
    fn finish(&mut self, response_id: Option<&str>) -> bool {
        let matches = match &self.active {
            Some(active) => match (active.response_id.as_deref(), response_id) {
                (Some(current), Some(done)) => current == done,
                _ => true,
            },
            None => false,
        };
        if matches {
            self.active = None;
        }
        matches
    }

    /// Pops every leading call that has a result, preserving issue order.
    fn release_ready(&mut self) -> (Vec<ToolCallResult>, bool) {
        let mut released = Vec::new();
        let mut interrupted = false;
        while self.pending.front().is_some_and(|call| call.result.is_some()) {
            let Some(call) = self.pending.pop_front() else {
                break;
            };
            interrupted |= call.cancel.is_cancelled();
            released.extend(call.result);
        }
        (released, interrupted)
    }
}

/// Who noticed the user barging in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interruption {
    /// The caller; the upstream has to be told to stop.
    Caller,
    /// Server-side voice detection; the upstream already stopped.
    Upstream,
}

#[derive(Debug)]
enum ExitReason {
    CallerClosed,
    CallerFailed(TransportError),
    UpstreamClosed,
    UpstreamFailed(TransportError),
    Shutdown,
}

impl ExitReason {
    /// The terminal message for the caller, if it is still listening.
    fn caller_notice(&self) -> Option<(&'static str, String)> {
        match self {
            ExitReason::CallerClosed | ExitReason::CallerFailed(_) => None,
            ExitReason::UpstreamClosed => Some((
                "upstream_unavailable",
                "The voice service disconnected.".to_string(),
            )),
            ExitReason::UpstreamFailed(e) => Some(("upstream_unavailable", e.to_string())),
            ExitReason::Shutdown => Some((
                RelayError::ShuttingDown.code(),
                "The relay is shutting down.".to_string(),
            )),
        }
    }
}

/// State shared by the loops of one session.
struct SessionCore {
    id: Uuid,
    deps: SessionDeps,
    state: watch::Sender<SessionState>,
    shutdown: CancellationToken,
    /// Parent of every tool-call token; cancelled when the session gives up
    /// on pending calls.
    tools_root: CancellationToken,
    caller: mpsc::Sender<Outbound>,
    upstream: mpsc::Sender<Outbound>,
    completions: mpsc::Sender<ToolInvocation>,
    turn: Mutex<TurnState>,
    caller_codec: CallerCodec,
    upstream_codec: OpenAiCodec,
}

pub struct Session {
    core: SessionCore,
    caller: Link,
    caller_queue: mpsc::Receiver<Outbound>,
    upstream_queue: mpsc::Receiver<Outbound>,
    completions: mpsc::Receiver<ToolInvocation>,
}

impl Session {
    pub fn new(id: Uuid, caller: Link, deps: SessionDeps) -> (Self, SessionHandle) {
        let (state, state_rx) = watch::channel(SessionState::Connecting);
        let (caller_tx, caller_queue) = mpsc::channel(CHANNEL_BUFFER);
        let (upstream_tx, upstream_queue) = mpsc::channel(CHANNEL_BUFFER);
        let (completions_tx, completions) = mpsc::channel(CHANNEL_BUFFER);
        let shutdown = CancellationToken::new();

        let handle = SessionHandle {
            id,
            started_at: Utc::now(),
            state: state_rx,
            shutdown: shutdown.clone(),
        };
        let core = SessionCore {
            id,
            deps,
            state,
            shutdown,
            tools_root: CancellationToken::new(),
            caller: caller_tx,
            upstream: upstream_tx,
            completions: completions_tx,
            turn: Mutex::new(TurnState::default()),
            caller_codec: CallerCodec,
            upstream_codec: OpenAiCodec,
        };
        let session = Self {
            core,
            caller,
            caller_queue,
            upstream_queue,
            completions,
        };
        (session, handle)
    }

    /// A producer handle onto the caller writer queue.
    pub fn caller_sender(&self) -> mpsc::Sender<Outbound> {
        self.core.caller.clone()
    }

    /// Drives the session until it is `Closed`.
    pub async fn run(self) {
        let span = info_span!("session", session_id = %self.core.id);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) {
        let Session {
            core,
            caller,
            caller_queue,
            upstream_queue,
            mut completions,
        } = self;
        let Link {
            inbound: mut caller_in,
            outbound: caller_out,
        } = caller;
        let caller_writer = tokio::spawn(
            write_frames(caller_out, caller_queue, core.caller_codec, "caller").in_current_span(),
        );
        info!("Session started");

        let upstream = match core.connect_upstream().await {
            Ok(link) => link,
            Err(e) => {
                core.fail(&e).await;
                core.finish_writer(caller_writer, "caller").await;
                core.transition(SessionState::Closed);
                return;
            }
        };

        core.transition(SessionState::Configuring);
        let Link {
            inbound: mut upstream_in,
            outbound: upstream_out,
        } = upstream;
        let upstream_writer = tokio::spawn(
            write_frames(upstream_out, upstream_queue, core.upstream_codec, "upstream")
                .in_current_span(),
        );

        if let Err(e) = core.configure(&mut upstream_in).await {
            core.fail(&e).await;
            let _ = core.upstream.send(Outbound::Close).await;
            core.finish_writer(caller_writer, "caller").await;
            core.finish_writer(upstream_writer, "upstream").await;
            core.transition(SessionState::Closed);
            return;
        }

        core.transition(SessionState::Active);
        core.send_caller(EnvelopeKind::Control(ControlSignal::SessionReady {
            session_id: core.id.to_string(),
        }))
        .await;

        let reason = tokio::select! {
            reason = core.caller_loop(&mut caller_in) => reason,
            reason = core.upstream_loop(&mut upstream_in, &mut completions) => reason,
            _ = core.shutdown.cancelled() => ExitReason::Shutdown,
        };
        info!(?reason, "Session ending");
        core.transition(SessionState::Draining);

        core.drain(&mut completions).await;
        if let Some((code, message)) = reason.caller_notice() {
            core.send_caller(EnvelopeKind::Control(ControlSignal::Error {
                code: Some(code.to_string()),
                message,
            }))
            .await;
        }
        let _ = core.caller.send(Outbound::Close).await;
        let _ = core.upstream.send(Outbound::Close).await;
        drop(caller_in);
        drop(upstream_in);
        core.finish_writer(caller_writer, "caller").await;
        core.finish_writer(upstream_writer, "upstream").await;
        core.transition(SessionState::Closed);
        info!("Session closed");
    }
}

impl SessionCore {
    fn settings(&self) -> &SessionSettings {
        &self.deps.settings
    }

    fn transition(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if !current.can_transition_to(next) {
                debug!(from = %current, to = %next, "Ignoring invalid state transition");
                return false;
            }
            info!(from = %current, to = %next, "Session state changed");
            *current = next;
            true
        });
    }

    async fn send_caller(&self, kind: EnvelopeKind) {
        if self
            .caller
            .send(Outbound::Envelope(Envelope::caller_bound(kind)))
            .await
            .is_err()
        {
            debug!("Caller writer has stopped; dropping message");
        }
    }

    async fn send_upstream(&self, kind: EnvelopeKind) {
        if self
            .upstream
            .send(Outbound::Envelope(Envelope::upstream_bound(kind)))
            .await
            .is_err()
        {
            debug!("Upstream writer has stopped; dropping message");
        }
    }

    /// Reports a failure to reach `Active` and closes the caller.
    async fn fail(&self, err: &RelayError) {
        let code = if self.shutdown.is_cancelled() {
            RelayError::ShuttingDown.code()
        } else {
            err.code()
        };
        warn!(error = %err, "Session could not start");
        self.send_caller(EnvelopeKind::Control(ControlSignal::Error {
            code: Some(code.to_string()),
            message: err.to_string(),
        }))
        .await;
        let _ = self.caller.send(Outbound::Close).await;
    }

    async fn finish_writer(&self, writer: JoinHandle<()>, side: &'static str) {
        let abort = writer.abort_handle();
        if timeout(self.settings().drain_grace, writer).await.is_err() {
            warn!(side, "Writer did not finish within the grace period; aborting");
            abort.abort();
        }
    }

    async fn connect_upstream(&self) -> Result<Link, RelayError> {
        let limit = self.settings().connect_timeout;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(RelayError::UpstreamUnavailable(
                "session shut down before the upstream connected".to_string(),
            )),
            connected = timeout(limit, self.deps.connector.connect(self.id)) => match connected {
                Ok(result) => result,
                Err(_) => Err(RelayError::UpstreamUnavailable(format!(
                    "connect timed out after {} ms",
                    limit.as_millis()
                ))),
            },
        }
    }

    /// Sends the handshake and waits for the upstream to acknowledge it.
    async fn configure(&self, upstream_in: &mut FrameStream) -> Result<(), RelayError> {
        self.send_upstream(EnvelopeKind::Configure(self.settings().config.clone()))
            .await;

        let acknowledged = async {
            loop {
                let frame = match upstream_in.next().await {
                    None | Some(Ok(Frame::Close)) => {
                        return Err(RelayError::UpstreamUnavailable(
                            "upstream closed during configuration".to_string(),
                        ));
                    }
                    Some(Err(e)) => return Err(RelayError::UpstreamUnavailable(e.to_string())),
                    Some(Ok(frame)) => frame,
                };
                match self.upstream_codec.decode(&frame) {
                    Ok(Some(Envelope {
                        kind: EnvelopeKind::Control(ControlSignal::ConfigApplied),
                        ..
                    })) => return Ok(()),
                    Ok(Some(Envelope {
                        kind: EnvelopeKind::Control(ControlSignal::Error { message, .. }),
                        ..
                    })) => {
                        return Err(RelayError::UpstreamUnavailable(format!(
                            "configuration rejected: {message}"
                        )));
                    }
                    Ok(_) => debug!("Ignoring upstream event while configuring"),
                    Err(e) => {
                        warn!(error = %e, raw = e.raw_preview(), "Dropping undecodable upstream frame")
                    }
                }
            }
        };

        let limit = self.settings().configure_timeout;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(RelayError::UpstreamUnavailable(
                "session shut down during configuration".to_string(),
            )),
            result = timeout(limit, acknowledged) => result.unwrap_or_else(|_| {
                Err(RelayError::UpstreamUnavailable(format!(
                    "no configuration acknowledgment within {} ms",
                    limit.as_millis()
                )))
            }),
        }
    }

    // --- Caller side ---

    async fn caller_loop(&self, caller_in: &mut FrameStream) -> ExitReason {
        loop {
            let frame = match caller_in.next().await {
                None | Some(Ok(Frame::Close)) => return ExitReason::CallerClosed,
                Some(Err(e)) => return ExitReason::CallerFailed(e),
                Some(Ok(frame)) => frame,
            };
            match self.caller_codec.decode(&frame) {
                Ok(Some(envelope)) => self.on_caller_message(envelope.kind).await,
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, raw = e.raw_preview(), "Dropping undecodable caller frame")
                }
            }
        }
    }

    async fn on_caller_message(&self, kind: EnvelopeKind) {
        match kind {
            EnvelopeKind::AudioChunk { .. } => self.send_upstream(kind).await,
            EnvelopeKind::TextInput { .. } => {
                self.interrupt(Interruption::Caller).await;
                self.send_upstream(kind).await;
                self.send_upstream(EnvelopeKind::Control(ControlSignal::CreateResponse))
                    .await;
            }
            EnvelopeKind::Control(signal) => match signal {
                ControlSignal::SpeechStarted => {
                    self.interrupt(Interruption::Caller).await;
                }
                ControlSignal::CancelResponse => {
                    if !self.interrupt(Interruption::Caller).await {
                        debug!("Cancel requested with no response in flight");
                    }
                }
                ControlSignal::CommitAudio => {
                    self.send_upstream(EnvelopeKind::Control(ControlSignal::CommitAudio))
                        .await
                }
                ControlSignal::SpeechStopped => debug!("Caller reported end of speech"),
                ControlSignal::ImageUploaded { image_id } => {
                    info!(%image_id, "Caller uploaded an image");
                    self.send_caller(EnvelopeKind::Control(ControlSignal::ImageReady {
                        image_id,
                        message: IMAGE_READY_MESSAGE.to_string(),
                    }))
                    .await;
                }
                ControlSignal::ClientConfig => {
                    info!("Ignoring caller session.update; server configuration applies")
                }
                other @ (ControlSignal::CreateResponse
                | ControlSignal::ResponseStarted { .. }
                | ControlSignal::ResponseDone { .. }
                | ControlSignal::SessionCreated
                | ControlSignal::ConfigApplied
                | ControlSignal::SessionReady { .. }
                | ControlSignal::ImageReady { .. }
                | ControlSignal::Error { .. }) => {
                    warn!(signal = ?other, "Unexpected control signal from caller")
                }
            },
            other @ (EnvelopeKind::ToolCallRequest(_)
            | EnvelopeKind::ToolCallResult(_)
            | EnvelopeKind::Transcript(_)
            | EnvelopeKind::SideChannel(_)
            | EnvelopeKind::Configure(_)) => {
                warn!(kind = ?other, "Unexpected message kind from caller")
            }
        }
    }

    /// Cancels the in-flight response and the tool calls it issued. Returns
    /// whether a response was in flight.
    async fn interrupt(&self, origin: Interruption) -> bool {
        let Some(cancelled) = self.turn.lock().await.cancel_active() else {
            return false;
        };
        info!(response_id = ?cancelled.response_id, ?origin, "Barge-in: cancelled active response");
        if origin == Interruption::Caller {
            self.send_upstream(EnvelopeKind::Control(ControlSignal::CancelResponse))
                .await;
        }
        true
    }

    // --- Upstream side ---

    async fn upstream_loop(
        &self,
        upstream_in: &mut FrameStream,
        completions: &mut mpsc::Receiver<ToolInvocation>,
    ) -> ExitReason {
        loop {
            tokio::select! {
                frame = upstream_in.next() => {
                    let frame = match frame {
                        None | Some(Ok(Frame::Close)) => return ExitReason::UpstreamClosed,
                        Some(Err(e)) => return ExitReason::UpstreamFailed(e),
                        Some(Ok(frame)) => frame,
                    };
                    match self.upstream_codec.decode(&frame) {
                        Ok(Some(envelope)) => self.on_upstream_message(envelope.kind).await,
                        Ok(None) => {}
                        Err(DecodeError::MalformedToolCall { call_id, tool_name, raw_arguments, reason }) => {
                            warn!(%call_id, tool = %tool_name, %reason, "Tool call arguments are not usable");
                            let request = ToolCallRequest {
                                call_id,
                                tool_name,
                                arguments: raw_arguments,
                            };
                            self.reject_tool_call(request, ToolError::invalid_arguments(reason))
                                .await;
                        }
                        Err(e) => {
                            warn!(error = %e, raw = e.raw_preview(), "Dropping undecodable upstream frame")
                        }
                    }
                }
                Some(invocation) = completions.recv() => {
                    self.on_tool_completed(invocation, true).await;
                }
            }
        }
    }

    async fn on_upstream_message(&self, kind: EnvelopeKind) {
        match kind {
            EnvelopeKind::AudioChunk { .. } | EnvelopeKind::Transcript(_) => {
                if let Some(response_id) = kind.response_id() {
                    if self.turn.lock().await.was_cancelled(response_id) {
                        debug!(response_id, "Dropping output of a cancelled response");
                        return;
                    }
                }
                self.send_caller(kind).await
            }
            EnvelopeKind::ToolCallRequest(request) => self.admit_tool_call(request).await,
            EnvelopeKind::Control(signal) => match signal {
                ControlSignal::ResponseStarted { response_id } => {
                    self.begin_turn(response_id.clone()).await;
                    self.send_caller(EnvelopeKind::Control(ControlSignal::ResponseStarted {
                        response_id,
                    }))
                    .await;
                }
                ControlSignal::ResponseDone {
                    response_id,
                    status,
                } => {
                    self.end_turn(response_id.as_deref()).await;
                    self.send_caller(EnvelopeKind::Control(ControlSignal::ResponseDone {
                        response_id,
                        status,
                    }))
                    .await;
                }
                ControlSignal::SpeechStarted => {
                    self.interrupt(Interruption::Upstream).await;
                    self.send_caller(EnvelopeKind::Control(ControlSignal::SpeechStarted))
                        .await;
                }
                ControlSignal::SpeechStopped => {
                    self.send_caller(EnvelopeKind::Control(ControlSignal::SpeechStopped))
                        .await
                }
                ControlSignal::Error { code, message } => {
                    warn!(?code, %message, "Upstream reported an error");
                    self.send_caller(EnvelopeKind::Control(ControlSignal::Error { code, message }))
                        .await;
                }
                ControlSignal::SessionCreated | ControlSignal::ConfigApplied => {
                    debug!("Ignoring late handshake event")
                }
                other @ (ControlSignal::CommitAudio
                | ControlSignal::CancelResponse
                | ControlSignal::CreateResponse
                | ControlSignal::SessionReady { .. }
                | ControlSignal::ClientConfig
                | ControlSignal::ImageUploaded { .. }
                | ControlSignal::ImageReady { .. }) => {
                    warn!(signal = ?other, "Unexpected control signal from upstream")
                }
            },
            other @ (EnvelopeKind::TextInput { .. }
            | EnvelopeKind::ToolCallResult(_)
            | EnvelopeKind::SideChannel(_)
            | EnvelopeKind::Configure(_)) => {
                warn!(kind = ?other, "Unexpected message kind from upstream")
            }
        }
    }

    async fn begin_turn(&self, response_id: Option<String>) {
        let turn = ActiveTurn {
            response_id,
            cancel: self.tools_root.child_token(),
        };
        if let Some(stale) = self.turn.lock().await.begin(turn) {
            warn!(stale = ?stale.response_id, "Response started before the previous one finished; cancelled it");
        }
    }

    async fn end_turn(&self, response_id: Option<&str>) {
        let continue_now = {
            let mut turn = self.turn.lock().await;
            if !turn.finish(response_id) {
                debug!(?response_id, "Response finished after it was cancelled");
                return;
            }
            let due = turn.continuation_due && turn.pending.is_empty();
            if due {
                turn.continuation_due = false;
            }
            due
        };
        if continue_now {
            self.send_upstream(EnvelopeKind::Control(ControlSignal::CreateResponse))
                .await;
        }
    }

    // --- Tool dispatch ---

    /// Adds the call to the pending queue. Calls issued during a response
    /// are cancelled with it. Returns `None` for a duplicate call id.
    async fn admit(&self, request: &ToolCallRequest) -> Option<CancellationToken> {
        let mut turn = self.turn.lock().await;
        if !turn.seen_call_ids.insert(request.call_id.clone()) {
            warn!(call_id = %request.call_id, "Ignoring duplicate tool call id");
            return None;
        }
        let cancel = match &turn.active {
            Some(active) => active.cancel.child_token(),
            None => self.tools_root.child_token(),
        };
        turn.pending.push_back(PendingCall {
            call_id: request.call_id.clone(),
            cancel: cancel.clone(),
            result: None,
        });
        Some(cancel)
    }

    /// Queues the call and runs it on its own task. The result comes back
    /// through `completions`.
    async fn admit_tool_call(&self, request: ToolCallRequest) {
        let Some(cancel) = self.admit(&request).await else {
            return;
        };
        info!(call_id = %request.call_id, tool = %request.tool_name, "Dispatching tool call");

        let registry = Arc::clone(&self.deps.registry);
        let completions = self.completions.clone();
        let ctx = ToolContext::new(
            self.id,
            request.call_id.clone(),
            cancel,
            Arc::clone(&self.deps.notifier),
        );
        tokio::spawn(
            async move {
                let invocation = registry.dispatch(ctx, &request).await;
                if completions.send(invocation).await.is_err() {
                    debug!(call_id = %request.call_id, "Session ended before the tool result was delivered");
                }
            }
            .in_current_span(),
        );
    }

    /// Answers a call that cannot run, in issue order with the others.
    async fn reject_tool_call(&self, request: ToolCallRequest, err: ToolError) {
        if self.admit(&request).await.is_none() {
            return;
        }
        let invocation = self.deps.registry.reject(&request, err);
        self.on_tool_completed(invocation, true).await;
    }

    /// Emits side effects to the caller, then releases finished results
    /// upstream in issue order.
    async fn on_tool_completed(&self, invocation: ToolInvocation, continue_turn: bool) {
        let (result, side_effects) = invocation.into_result();
        for event in side_effects {
            self.send_caller(EnvelopeKind::SideChannel(event)).await;
        }

        let mut outbound = Vec::new();
        {
            let mut turn = self.turn.lock().await;
            let Some(call) = turn
                .pending
                .iter_mut()
                .find(|call| call.call_id == result.call_id)
            else {
                debug!(call_id = %result.call_id, "Discarding result of an abandoned tool call");
                return;
            };
            call.result = Some(result);

            let (released, interrupted) = turn.release_ready();
            let any_released = !released.is_empty();
            outbound.extend(released.into_iter().map(EnvelopeKind::ToolCallResult));

            if any_released && turn.pending.is_empty() && !interrupted && continue_turn {
                if turn.active.is_some() {
                    turn.continuation_due = true;
                } else {
                    outbound.push(EnvelopeKind::Control(ControlSignal::CreateResponse));
                }
            }
        }

        for kind in outbound {
            if let EnvelopeKind::ToolCallResult(result) = &kind {
                info!(call_id = %result.call_id, ok = result.outcome.is_ok(), "Sending tool result upstream");
            }
            self.send_upstream(kind).await;
        }
    }

    /// Gives pending tool calls the grace period to finish, then abandons them.
    async fn drain(&self, completions: &mut mpsc::Receiver<ToolInvocation>) {
        let deadline = Instant::now() + self.settings().drain_grace;
        loop {
            let outstanding = self.turn.lock().await.pending.len();
            if outstanding == 0 {
                break;
            }
            tokio::select! {
                received = completions.recv() => match received {
                    Some(invocation) => self.on_tool_completed(invocation, false).await,
                    None => break,
                },
                _ = sleep_until(deadline) => {
                    warn!(abandoned = outstanding, "Abandoning pending tool calls after the drain grace period");
                    self.turn.lock().await.pending.clear();
                    break;
                }
            }
        }
        self.tools_root.cancel();
    }
}

/// Single writer for one connection.
async fn write_frames<C: WireCodec>(
    mut sink: FrameSink,
    mut queue: mpsc::Receiver<Outbound>,
    codec: C,
    side: &'static str,
) {
    while let Some(outbound) = queue.recv().await {
        match outbound {
            Outbound::Envelope(envelope) => {
                let frame = match codec.encode(&envelope) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(side, error = %e, "Dropping message that cannot be encoded");
                        continue;
                    }
                };
                if let Err(e) = sink.send(frame).await {
                    debug!(side, error = %e, "Connection is no longer writable");
                    break;
                }
            }
            Outbound::Close => {
                let _ = sink.send(Frame::Close).await;
                break;
            }
        }
    }
    if let Err(e) = sink.close().await {
        debug!(side, error = %e, "Error while closing connection");
    }
}
