//! The live-session table.
//!
//! `SessionManager` admits caller connections, runs one `Session` per
//! connection on its own task and forgets it once it reaches `Closed`. It is
//! also the `SideChannelNotifier` tools use to reach a session's caller.

use super::{
    protocol::CallerCodec,
    provider::UpstreamConnector,
    session::{Outbound, Session, SessionDeps, SessionHandle, SessionSettings},
    transport::{Frame, Link},
};
use crate::{error::RelayError, models::SessionSummary};
use concierge_core::{Envelope, EnvelopeKind, SideChannelEvent, SideChannelNotifier, ToolRegistry};
use futures::SinkExt;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Notify, mpsc},
    task::AbortHandle,
    time::{Instant, timeout_at},
};
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

/// Extra time granted on top of the per-session drain budget before a
/// shutdown force-closes stragglers.
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(1);

struct LiveSession {
    handle: SessionHandle,
    caller: mpsc::Sender<Outbound>,
    task: AbortHandle,
}

pub struct SessionManager {
    settings: Arc<SessionSettings>,
    registry: Arc<ToolRegistry>,
    connector: Arc<dyn UpstreamConnector>,
    max_sessions: usize,
    live: Mutex<HashMap<Uuid, LiveSession>>,
    removed: Notify,
    accepting: AtomicBool,
}

impl SessionManager {
    pub fn new(
        settings: Arc<SessionSettings>,
        registry: Arc<ToolRegistry>,
        connector: Arc<dyn UpstreamConnector>,
        max_sessions: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            registry,
            connector,
            max_sessions,
            live: Mutex::new(HashMap::new()),
            removed: Notify::new(),
            accepting: AtomicBool::new(true),
        })
    }

    fn lock_live(&self) -> MutexGuard<'_, HashMap<Uuid, LiveSession>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn live_count(&self) -> usize {
        self.lock_live().len()
    }

    /// Starts a session for `caller` and registers it as live.
    ///
    /// When the table is full (or shutting down) the caller is sent a single
    /// error message and closed; no upstream connection is attempted.
    pub fn accept(self: &Arc<Self>, caller: Link) -> Result<SessionHandle, RelayError> {
        let mut live = self.lock_live();
        let refusal = if !self.accepting.load(Ordering::Acquire) {
            Some(RelayError::ShuttingDown)
        } else if live.len() >= self.max_sessions {
            Some(RelayError::ResourceExhausted {
                limit: self.max_sessions,
            })
        } else {
            None
        };
        if let Some(err) = refusal {
            drop(live);
            warn!(error = %err, "Refusing caller connection");
            reject(caller, &err);
            return Err(err);
        }

        let id = Uuid::new_v4();
        let deps = SessionDeps {
            settings: Arc::clone(&self.settings),
            registry: Arc::clone(&self.registry),
            connector: Arc::clone(&self.connector),
            notifier: Arc::clone(self) as Arc<dyn SideChannelNotifier>,
        };
        let (session, handle) = Session::new(id, caller, deps);
        let caller_tx = session.caller_sender();

        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            session.run().await;
            manager.remove(id);
        });
        live.insert(
            id,
            LiveSession {
                handle: handle.clone(),
                caller: caller_tx,
                task: task.abort_handle(),
            },
        );
        info!(session_id = %id, live = live.len(), "Session accepted");
        Ok(handle)
    }

    fn remove(&self, id: Uuid) {
        let remaining = {
            let mut live = self.lock_live();
            live.remove(&id);
            live.len()
        };
        debug!(session_id = %id, remaining, "Session removed");
        self.removed.notify_waiters();
    }

    /// Live sessions, oldest first.
    pub fn status(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> =
            self.lock_live().values().map(summarize).collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    pub fn get(&self, id: Uuid) -> Option<SessionSummary> {
        self.lock_live().get(&id).map(summarize)
    }

    /// Drains every live session, waits a bounded time for them to close and
    /// then aborts whatever is left. New connections are refused from the
    /// first call on; later calls only repeat the (empty) wait.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        let handles: Vec<SessionHandle> =
            self.lock_live().values().map(|s| s.handle.clone()).collect();
        if !handles.is_empty() {
            info!(count = handles.len(), "Draining live sessions");
        }
        for handle in &handles {
            handle.shutdown();
        }

        let deadline = Instant::now() + self.settings.drain_grace * 3 + SHUTDOWN_MARGIN;
        loop {
            let notified = self.removed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.live_count() == 0 {
                break;
            }
            if timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let stragglers: Vec<(Uuid, LiveSession)> = self.lock_live().drain().collect();
        if !stragglers.is_empty() {
            warn!(count = stragglers.len(), "Force-closing sessions that did not drain in time");
        }
        for (id, session) in stragglers {
            debug!(session_id = %id, state = %session.handle.state(), "Aborting session");
            session.task.abort();
        }
    }
}

fn summarize(session: &LiveSession) -> SessionSummary {
    SessionSummary {
        id: session.handle.id(),
        state: session.handle.state(),
        started_at: session.handle.started_at(),
    }
}

/// Tells a refused caller why, then closes it.
fn reject(caller: Link, err: &RelayError) {
    let frame = CallerCodec::error_frame(err.code(), err.to_string());
    let Link { mut outbound, .. } = caller;
    tokio::spawn(
        async move {
            match frame {
                Ok(frame) => {
                    let _ = outbound.send(frame).await;
                }
                Err(e) => warn!(error = %e, "Could not encode refusal message"),
            }
            let _ = outbound.send(Frame::Close).await;
            let _ = outbound.close().await;
        }
        .in_current_span(),
    );
}

impl SideChannelNotifier for SessionManager {
    fn emit(&self, session_id: Uuid, event: SideChannelEvent) {
        let caller = self
            .lock_live()
            .get(&session_id)
            .map(|s| s.caller.clone());
        let Some(caller) = caller else {
            debug!(%session_id, kind = ?event.kind, "Dropping side-channel event for unknown session");
            return;
        };
        let outbound = Outbound::Envelope(Envelope::caller_bound(EnvelopeKind::SideChannel(event)));
        if let Err(e) = caller.try_send(outbound) {
            warn!(%session_id, error = %e, "Dropping side-channel event");
        }
    }
}
