//! Session manager: the authoritative table of live agent sessions and the
//! per-connection handlers that feed it. One spawned task per connection;
//! a fault in one handler closes only its own session.

use crate::audit::Direction;
use crate::sink::status_record;
use crate::{ControllerConfig, Engine};
use chrono::Utc;
use pncp_core::auth::{self, AuthError};
use pncp_core::wire::{
    encode_frame, AuthChallenge, AuthResponse, ErrorNotice, FrameReader, Message, ReadError,
    DEFAULT_MAX_FRAME_BYTES,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time as tokio_time;
use tracing::{debug, info, warn};

/// Lifecycle of one agent connection. Only `Active` and `Closing` ever
/// appear in the session table; the other states live in the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Open,
    Superseded,
    Stale,
    Shutdown,
}

impl CloseReason {
    fn as_str(self) -> &'static str {
        match self {
            CloseReason::Open => "open",
            CloseReason::Superseded => "superseded",
            CloseReason::Stale => "stale",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

pub(crate) struct SessionHandle {
    agent_id: String,
    conn_id: String,
    state: SessionState,
    last_seen: Instant,
    sender: mpsc::Sender<Message>,
    close: watch::Sender<CloseReason>,
}

/// agent id -> live session. Exclusive owner of session lifetimes; handlers
/// hold only their own connection halves.
pub(crate) struct Sessions {
    table: RwLock<HashMap<String, SessionHandle>>,
}

impl Sessions {
    pub(crate) fn new() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Last writer wins: returns the superseded handle, if any, for the
    /// caller to close.
    pub(crate) async fn register(&self, handle: SessionHandle) -> Option<SessionHandle> {
        self.table
            .write()
            .await
            .insert(handle.agent_id.clone(), handle)
    }

    /// Removes the entry only if it still belongs to `conn_id`; a
    /// superseded handler must not evict its replacement.
    pub(crate) async fn remove_if(&self, agent_id: &str, conn_id: &str) -> Option<SessionHandle> {
        let mut table = self.table.write().await;
        if table.get(agent_id).is_some_and(|entry| entry.conn_id == conn_id) {
            table.remove(agent_id)
        } else {
            None
        }
    }

    pub(crate) async fn touch(&self, agent_id: &str) {
        if let Some(entry) = self.table.write().await.get_mut(agent_id) {
            entry.last_seen = Instant::now();
        }
    }

    /// Queue a frame for the agent's writer task. `false` when there is no
    /// session or its queue is unusable; a full queue fails the send rather
    /// than stalling the caller behind a slow connection.
    pub(crate) async fn try_send(&self, agent_id: &str, message: Message) -> bool {
        let table = self.table.read().await;
        let Some(entry) = table.get(agent_id) else {
            return false;
        };
        if entry.state != SessionState::Active {
            return false;
        }
        match entry.sender.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = "session_queue_full", agent_id = agent_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub(crate) async fn list_active(&self) -> Vec<String> {
        let table = self.table.read().await;
        let mut agents = table
            .values()
            .filter(|entry| entry.state == SessionState::Active)
            .map(|entry| entry.agent_id.clone())
            .collect::<Vec<_>>();
        agents.sort();
        agents
    }

    pub(crate) async fn stale_agents(&self, stale_after: Duration) -> Vec<String> {
        let table = self.table.read().await;
        table
            .values()
            .filter(|entry| {
                entry.state == SessionState::Active && entry.last_seen.elapsed() > stale_after
            })
            .map(|entry| entry.agent_id.clone())
            .collect()
    }

    pub(crate) async fn signal_close(&self, agent_id: &str, reason: CloseReason) {
        if let Some(entry) = self.table.write().await.get_mut(agent_id) {
            entry.state = SessionState::Closing;
            let _ = entry.close.send(reason);
        }
    }

    pub(crate) async fn close_all(&self, reason: CloseReason) {
        for entry in self.table.write().await.values_mut() {
            entry.state = SessionState::Closing;
            let _ = entry.close.send(reason);
        }
    }

    pub(crate) async fn is_empty(&self) -> bool {
        self.table.read().await.is_empty()
    }
}

/// Full verification of an auth response against the challenge we issued.
/// The replay window is checked before the MAC: a stale challenge fails
/// regardless of signature correctness.
pub(crate) fn verify_auth(
    config: &ControllerConfig,
    challenge: &AuthChallenge,
    response: &AuthResponse,
    now: i64,
) -> Result<(), AuthError> {
    auth::validate_agent_id(&response.agent_id)?;
    if let Some(roster) = &config.roster {
        if !roster.contains(&response.agent_id) {
            return Err(AuthError::UnknownAgent(response.agent_id.clone()));
        }
    }
    auth::check_replay_window(challenge.issued_at, now, config.replay_window_secs)?;
    auth::verify(
        &config.shared_secret,
        &challenge.nonce,
        challenge.issued_at,
        &response.agent_id,
        &response.mac,
    )
}

impl Engine {
    /// Accept loop. Runs until the shutdown signal flips.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_ok() && *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            let engine = self.clone();
                            tokio::spawn(async move {
                                engine.handle_connection(stream, remote).await;
                            });
                        }
                        Err(err) => {
                            warn!(event = "accept_error", error = %err);
                        }
                    }
                }
            }
        }
        info!(event = "listener_stopped");
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let conn_id = self.next_conn_id();
        debug!(event = "session_state", conn_id = %conn_id, state = ?SessionState::Connecting);
        if let Err(err) = stream.set_nodelay(true) {
            debug!(event = "nodelay_failed", conn_id = %conn_id, error = %err);
        }
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let (tx, rx) = mpsc::channel::<Message>(self.config.session_queue_capacity);
        let writer_conn = conn_id.clone();
        let write_timeout = self.config.write_timeout;
        let writer_task = tokio::spawn(async move {
            writer_loop(writer_conn, write_half, rx, write_timeout).await;
        });

        self.audit.append(
            &conn_id,
            Direction::Local,
            "connection_accepted",
            &remote.to_string(),
        );

        debug!(event = "session_state", conn_id = %conn_id, state = ?SessionState::Authenticating);
        let agent_id = match self.authenticate(&conn_id, &mut reader, &tx).await {
            Ok(agent_id) => agent_id,
            Err(reason) => {
                self.audit
                    .append(&conn_id, Direction::Local, "auth_failed", &reason);
                warn!(event = "auth_failed", conn_id = %conn_id, remote = %remote, reason = %reason);
                let _ = tx
                    .send(Message::Error(ErrorNotice {
                        code: "auth_failed".to_string(),
                        message: reason,
                    }))
                    .await;
                drop(tx);
                let _ = writer_task.await;
                return;
            }
        };

        let (close_tx, mut close_rx) = watch::channel(CloseReason::Open);
        let handle = SessionHandle {
            agent_id: agent_id.clone(),
            conn_id: conn_id.clone(),
            state: SessionState::Active,
            last_seen: Instant::now(),
            sender: tx.clone(),
            close: close_tx,
        };
        if let Some(previous) = self.sessions.register(handle).await {
            self.audit.append(
                &agent_id,
                Direction::Local,
                "session_superseded",
                &format!("old={} new={}", previous.conn_id, conn_id),
            );
            info!(
                event = "session_superseded",
                agent_id = %agent_id,
                old_conn = %previous.conn_id,
                new_conn = %conn_id
            );
            let _ = previous.close.send(CloseReason::Superseded);
            self.fail_pending_for(&agent_id, "superseded").await;
            self.sink.enqueue(status_record(&agent_id, "superseded"));
        }
        self.audit.append(
            &agent_id,
            Direction::Local,
            "session_active",
            &format!("conn={conn_id} remote={remote}"),
        );
        info!(event = "session_active", agent_id = %agent_id, conn_id = %conn_id, remote = %remote);
        debug!(event = "session_state", conn_id = %conn_id, state = ?SessionState::Active);
        self.sink.enqueue(status_record(&agent_id, "connected"));

        let reason: &str = loop {
            tokio::select! {
                changed = close_rx.changed() => {
                    match changed {
                        Ok(()) => {
                            let reason = *close_rx.borrow();
                            if reason != CloseReason::Open {
                                break reason.as_str();
                            }
                        }
                        Err(_) => break "closed",
                    }
                }
                next = reader.next() => {
                    match next {
                        Ok(Some(message)) => {
                            self.sessions.touch(&agent_id).await;
                            if let Err(violation) = self.handle_frame(&agent_id, message).await {
                                self.audit.append(
                                    &agent_id,
                                    Direction::In,
                                    "protocol_violation",
                                    violation,
                                );
                                warn!(
                                    event = "protocol_violation",
                                    agent_id = %agent_id,
                                    conn_id = %conn_id,
                                    detail = violation
                                );
                                break "protocol_violation";
                            }
                        }
                        Ok(None) => break "disconnect",
                        Err(ReadError::Frame(err)) => {
                            self.audit.append(
                                &agent_id,
                                Direction::In,
                                "protocol_error",
                                &err.to_string(),
                            );
                            warn!(event = "protocol_error", agent_id = %agent_id, conn_id = %conn_id, error = %err);
                            break "protocol_error";
                        }
                        Err(ReadError::Io(err)) => {
                            self.audit.append(
                                &agent_id,
                                Direction::Local,
                                "transport_error",
                                &err.to_string(),
                            );
                            warn!(event = "transport_error", agent_id = %agent_id, conn_id = %conn_id, error = %err);
                            break "transport_error";
                        }
                    }
                }
            }
        };

        debug!(event = "session_state", conn_id = %conn_id, state = ?SessionState::Closing);
        self.teardown(&agent_id, &conn_id, reason).await;
        drop(tx);
        let _ = writer_task.await;
        debug!(event = "session_state", conn_id = %conn_id, state = ?SessionState::Closed);
    }

    /// Challenge, then verify the response. Produces the authenticated
    /// agent id or a human-readable failure reason; no session exists until
    /// this returns `Ok`.
    async fn authenticate(
        &self,
        conn_id: &str,
        reader: &mut FrameReader<OwnedReadHalf>,
        tx: &mpsc::Sender<Message>,
    ) -> Result<String, String> {
        let challenge = AuthChallenge {
            nonce: auth::generate_nonce(),
            issued_at: Utc::now().timestamp(),
        };
        tx.send(Message::AuthChallenge(challenge.clone()))
            .await
            .map_err(|_| "writer closed before challenge".to_string())?;
        self.audit.append(
            conn_id,
            Direction::Out,
            "auth_challenge",
            &format!("nonce={}", challenge.nonce),
        );

        let response = match tokio_time::timeout(self.config.auth_timeout, reader.next()).await {
            Err(_) => return Err("auth timeout".to_string()),
            Ok(Err(err)) => return Err(format!("stream failed during auth: {err}")),
            Ok(Ok(None)) => return Err("connection closed during auth".to_string()),
            Ok(Ok(Some(Message::AuthResponse(response)))) => response,
            Ok(Ok(Some(other))) => {
                return Err(format!("expected auth_response, got {}", other.tag()))
            }
        };
        self.audit.append(
            conn_id,
            Direction::In,
            "auth_response",
            &format!("agent={}", response.agent_id),
        );

        verify_auth(&self.config, &challenge, &response, Utc::now().timestamp())
            .map_err(|err| err.to_string())?;
        Ok(response.agent_id)
    }

    /// Inbound traffic for an active session. `Err` is a protocol violation
    /// that tears the session down.
    async fn handle_frame(&self, agent_id: &str, message: Message) -> Result<(), &'static str> {
        match message {
            Message::Heartbeat(beat) => {
                if beat.agent_id != agent_id {
                    return Err("heartbeat identity mismatch");
                }
                self.audit.append(
                    agent_id,
                    Direction::In,
                    "heartbeat",
                    &format!("sent_at={}", beat.sent_at),
                );
                debug!(event = "heartbeat", agent_id = agent_id);
                Ok(())
            }
            Message::Result(result) => {
                self.apply_result(agent_id, result).await;
                Ok(())
            }
            Message::Metric(update) => {
                if update.agent_id != agent_id {
                    return Err("metric identity mismatch");
                }
                self.audit.append(
                    agent_id,
                    Direction::In,
                    "metric",
                    &format!(
                        "cpu={:.1}% mem={:.1}% disk={:.1}%",
                        update.report.cpu_percent,
                        update.report.memory.percent,
                        update.report.disk.percent
                    ),
                );
                self.sink.enqueue(crate::sink::metric_record(agent_id, &update));
                Ok(())
            }
            Message::Error(notice) => {
                self.audit.append(
                    agent_id,
                    Direction::In,
                    "error",
                    &format!("{}: {}", notice.code, notice.message),
                );
                warn!(event = "agent_error", agent_id = agent_id, code = %notice.code);
                Ok(())
            }
            Message::AuthChallenge(_) | Message::AuthResponse(_) | Message::Command(_) => {
                Err("unexpected message for an active session")
            }
        }
    }

    async fn teardown(&self, agent_id: &str, conn_id: &str, reason: &str) {
        let Some(_handle) = self.sessions.remove_if(agent_id, conn_id).await else {
            // Superseded: the table already points at the replacement.
            debug!(event = "session_handler_exit", agent_id = agent_id, conn_id = conn_id, reason = reason);
            return;
        };
        self.fail_pending_for(agent_id, reason).await;
        self.sink.enqueue(status_record(agent_id, "disconnected"));
        self.audit
            .append(agent_id, Direction::Local, "session_closed", reason);
        info!(event = "session_closed", agent_id = agent_id, conn_id = conn_id, reason = reason);
    }

    /// Liveness sweep: sessions silent past the timeout get the same
    /// teardown as a disconnect.
    pub fn spawn_stale_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let engine = self;
        let stale_after = engine.config.liveness_timeout;
        let tick = std::cmp::max(Duration::from_millis(100), stale_after / 2);
        tokio::spawn(async move {
            let mut ticker = tokio_time::interval(tick);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_ok() && *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        for agent_id in engine.sessions.stale_agents(stale_after).await {
                            engine.audit.append(
                                &agent_id,
                                Direction::Local,
                                "session_stale",
                                "liveness timeout",
                            );
                            warn!(event = "session_stale", agent_id = %agent_id);
                            engine.sessions.signal_close(&agent_id, CloseReason::Stale).await;
                        }
                    }
                }
            }
        });
    }

    /// Fire every session's close signal and wait (bounded) for handlers to
    /// drain.
    pub async fn shutdown_sessions(&self, grace: Duration) {
        self.sessions.close_all(CloseReason::Shutdown).await;
        let deadline = tokio_time::Instant::now() + grace;
        while !self.sessions.is_empty().await && tokio_time::Instant::now() < deadline {
            tokio_time::sleep(Duration::from_millis(25)).await;
        }
    }
}

/// Owns the write half. Frames leave in queue order, each through a single
/// `write_all`, so teardown can never leave a half-frame on the wire.
async fn writer_loop(
    conn_id: String,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Message>,
    write_timeout: Duration,
) {
    while let Some(message) = rx.recv().await {
        let frame = match encode_frame(&message, DEFAULT_MAX_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "encode_error", conn_id = %conn_id, error = %err);
                continue;
            }
        };
        let send = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match tokio_time::timeout(write_timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(event = "write_error", conn_id = %conn_id, error = %err);
                break;
            }
            Err(_) => {
                warn!(event = "write_timeout", conn_id = %conn_id);
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ControllerConfig {
        ControllerConfig::new(b"super-secret".to_vec())
    }

    fn signed_response(challenge: &AuthChallenge, agent_id: &str) -> AuthResponse {
        AuthResponse {
            agent_id: agent_id.to_string(),
            mac: auth::sign(
                b"super-secret",
                &challenge.nonce,
                challenge.issued_at,
                agent_id,
            ),
        }
    }

    #[test]
    fn valid_response_within_window_is_accepted() {
        let config = test_config();
        let challenge = AuthChallenge {
            nonce: auth::generate_nonce(),
            issued_at: 1_700_000_000,
        };
        let response = signed_response(&challenge, "pi-1");
        assert!(verify_auth(&config, &challenge, &response, 1_700_000_030).is_ok());
    }

    #[test]
    fn stale_challenge_fails_even_with_a_valid_mac() {
        let config = test_config();
        let challenge = AuthChallenge {
            nonce: auth::generate_nonce(),
            issued_at: 1_700_000_000,
        };
        let response = signed_response(&challenge, "pi-1");
        let result = verify_auth(&config, &challenge, &response, 1_700_000_061);
        assert!(matches!(result, Err(AuthError::StaleTimestamp { .. })));
    }

    #[test]
    fn wrong_mac_is_rejected() {
        let config = test_config();
        let challenge = AuthChallenge {
            nonce: auth::generate_nonce(),
            issued_at: 1_700_000_000,
        };
        let mut response = signed_response(&challenge, "pi-1");
        response.mac = auth::sign(b"wrong-secret", &challenge.nonce, challenge.issued_at, "pi-1");
        assert_eq!(
            verify_auth(&config, &challenge, &response, 1_700_000_000),
            Err(AuthError::MacMismatch)
        );
    }

    #[test]
    fn roster_limits_which_agents_may_authenticate() {
        let mut config = test_config();
        config.roster = Some(["pi-1".to_string()].into_iter().collect());
        let challenge = AuthChallenge {
            nonce: auth::generate_nonce(),
            issued_at: 1_700_000_000,
        };
        let response = signed_response(&challenge, "pi-2");
        assert_eq!(
            verify_auth(&config, &challenge, &response, 1_700_000_000),
            Err(AuthError::UnknownAgent("pi-2".to_string()))
        );
    }
}
