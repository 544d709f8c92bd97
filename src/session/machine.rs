//! Session state machine.
//!
//! Each session is one task consuming a per-session event queue: socket
//! events and lifecycle requests (watchdog, eviction) are matched against the
//! current state in a single place, instead of scattering condition checks
//! across independent handlers. Every terminal transition funnels through one
//! cleanup path, so the socket, watchdog, working directory, and registry
//! entry are released exactly once no matter how the session ends.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::archive::CredentialArchive;
use crate::config::Config;
use crate::error::SessionError;
use crate::socket::{AuthSocket, CloseReason, SocketEvent, SocketProvider};

use super::registry::SessionRegistry;
use super::{SessionEvent, SessionState, Watchdog, handoff};

/// Which kind of pairing token the caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenMode {
    /// A short code typed into the remote account.
    PairingCode,
    /// A scannable token.
    Qr,
}

/// The token delivered to the HTTP caller.
#[derive(Debug, Clone)]
pub enum TokenReply {
    /// Formatted pairing code (`XXXX-XXXX`).
    Code(String),
    /// Raw scannable token payload.
    Qr(String),
}

/// Everything a session needs from its environment.
pub struct SessionContext {
    /// Normalized number; the registry key.
    pub key: String,
    /// Distinguishes this session from later ones for the same key.
    pub session_id: Uuid,
    /// Exclusively owned credential scope; purged on the terminal transition.
    pub work_dir: PathBuf,
    pub config: Arc<Config>,
    pub provider: Arc<dyn SocketProvider>,
    pub archive: Arc<dyn CredentialArchive>,
    pub registry: SessionRegistry,
}

/// Channel set wiring one session to its owner.
pub(crate) struct SessionChannels {
    pub control_tx: mpsc::Sender<SessionEvent>,
    pub control_rx: mpsc::Receiver<SessionEvent>,
    pub released_tx: watch::Sender<bool>,
    pub state_tx: watch::Sender<SessionState>,
    pub reply_tx: oneshot::Sender<Result<TokenReply, SessionError>>,
}

/// Spawn the session task. The machine owns the socket and working directory
/// from here on; the caller keeps only the channel ends.
pub(crate) fn spawn(
    ctx: SessionContext,
    mode: TokenMode,
    channels: SessionChannels,
) -> JoinHandle<()> {
    let span = tracing::info_span!("session", number = %ctx.key);
    let machine = SessionMachine {
        control_tx: channels.control_tx,
        released_tx: channels.released_tx,
        state_tx: channels.state_tx,
        reply: Some(channels.reply_tx),
        ctx,
        mode,
        state: SessionState::Created,
        attempt: 0,
        open: false,
        registered: false,
        finished: false,
        socket: None,
        watchdog: None,
    };
    tokio::spawn(machine.run(channels.control_rx).instrument(span))
}

struct SessionMachine {
    ctx: SessionContext,
    mode: TokenMode,
    state: SessionState,
    /// Reconnect counter, bounded by `config.max_reconnects`.
    attempt: u32,
    open: bool,
    registered: bool,
    /// Guards the single terminal transition; late events become no-ops.
    finished: bool,
    /// `Some` until the HTTP caller has been answered.
    reply: Option<oneshot::Sender<Result<TokenReply, SessionError>>>,
    socket: Option<Arc<dyn AuthSocket>>,
    watchdog: Option<Watchdog>,
    control_tx: mpsc::Sender<SessionEvent>,
    released_tx: watch::Sender<bool>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionMachine {
    async fn run(mut self, mut control_rx: mpsc::Receiver<SessionEvent>) {
        self.watchdog = Some(Watchdog::arm(
            self.ctx.config.link_budget,
            self.control_tx.clone(),
        ));

        let mut socket_rx = match self.connect().await {
            Ok(rx) => rx,
            Err(e) => {
                self.finish(
                    SessionState::Failed,
                    Some(SessionError::SocketInit {
                        reason: e.to_string(),
                    }),
                )
                .await;
                return;
            }
        };

        while !self.finished {
            tokio::select! {
                event = control_rx.recv() => {
                    let event = event.unwrap_or(SessionEvent::Evicted);
                    if let Some(rx) = self.on_event(event, &mut control_rx).await {
                        socket_rx = rx;
                    }
                }
                event = socket_rx.recv() => {
                    // A stream ending without a close event is treated as a
                    // transient close.
                    let event = event.unwrap_or(SocketEvent::Closed(CloseReason::STREAM_ENDED));
                    if let Some(rx) = self.on_event(SessionEvent::Socket(event), &mut control_rx).await {
                        socket_rx = rx;
                    }
                }
            }
        }
    }

    /// Dispatch one event against the current state. Returns a replacement
    /// socket stream after a reconnect.
    async fn on_event(
        &mut self,
        event: SessionEvent,
        control_rx: &mut mpsc::Receiver<SessionEvent>,
    ) -> Option<mpsc::Receiver<SocketEvent>> {
        if self.finished {
            return None;
        }
        match event {
            SessionEvent::WatchdogFired => {
                let budget = self.ctx.config.link_budget;
                self.finish(
                    SessionState::Abandoned,
                    Some(SessionError::WatchdogExpiry { budget }),
                )
                .await;
                None
            }
            SessionEvent::Evicted => {
                self.finish(SessionState::Abandoned, Some(SessionError::Superseded))
                    .await;
                None
            }
            SessionEvent::Socket(event) => self.on_socket_event(event, control_rx).await,
        }
    }

    async fn on_socket_event(
        &mut self,
        event: SocketEvent,
        control_rx: &mut mpsc::Receiver<SessionEvent>,
    ) -> Option<mpsc::Receiver<SocketEvent>> {
        match event {
            SocketEvent::Connecting => {
                if self.state == SessionState::Created {
                    self.begin_token_phase(None).await;
                }
                None
            }
            SocketEvent::QrToken(payload) => {
                match self.state {
                    SessionState::Created => self.begin_token_phase(Some(payload)).await,
                    SessionState::AwaitingToken if self.mode == TokenMode::Qr => {
                        self.deliver(Ok(TokenReply::Qr(payload)));
                        self.set_state(SessionState::Linking);
                        // Open and registered may already have been latched
                        // while the token was still pending.
                        self.maybe_registered().await;
                    }
                    _ => {}
                }
                None
            }
            SocketEvent::Open => {
                self.open = true;
                self.maybe_registered().await;
                None
            }
            SocketEvent::Registered => {
                self.registered = true;
                self.maybe_registered().await;
                None
            }
            SocketEvent::Closed(reason) => self.on_closed(reason, control_rx).await,
        }
    }

    /// The connecting phase has begun: wait out the grace period, then obtain
    /// and deliver the token.
    async fn begin_token_phase(&mut self, qr: Option<String>) {
        self.set_state(SessionState::AwaitingToken);
        match self.mode {
            TokenMode::PairingCode => {
                // The transport mints an unusable code if asked too early.
                tokio::time::sleep(self.ctx.config.grace_period).await;
                let Some(socket) = self.socket.clone() else {
                    self.finish(
                        SessionState::Failed,
                        Some(SessionError::Internal {
                            reason: "no socket in token phase".to_string(),
                        }),
                    )
                    .await;
                    return;
                };
                match socket.request_pairing_code(&self.ctx.key).await {
                    Ok(code) => {
                        let code = format_pairing_code(&code);
                        tracing::info!("pairing code issued");
                        self.deliver(Ok(TokenReply::Code(code)));
                        self.set_state(SessionState::Linking);
                        self.maybe_registered().await;
                    }
                    Err(e) => {
                        self.finish(
                            SessionState::Failed,
                            Some(SessionError::TokenRequest {
                                reason: e.to_string(),
                            }),
                        )
                        .await;
                    }
                }
            }
            TokenMode::Qr => {
                if let Some(payload) = qr {
                    self.deliver(Ok(TokenReply::Qr(payload)));
                    self.set_state(SessionState::Linking);
                    self.maybe_registered().await;
                }
                // Otherwise the token arrives as a later event.
            }
        }
    }

    /// Linking completes only once the connection is open AND the remote side
    /// has registered the credentials; either alone is insufficient.
    async fn maybe_registered(&mut self) {
        if self.state != SessionState::Linking || !self.open || !self.registered {
            return;
        }
        self.set_state(SessionState::Registered);
        // The link budget is met; the artifact budget governs from here.
        if let Some(watchdog) = self.watchdog.as_mut() {
            watchdog.cancel();
        }
        self.run_handoff().await;
    }

    async fn run_handoff(&mut self) {
        self.set_state(SessionState::Archiving);
        let Some(socket) = self.socket.clone() else {
            self.finish(
                SessionState::Failed,
                Some(SessionError::Internal {
                    reason: "no socket during handoff".to_string(),
                }),
            )
            .await;
            return;
        };

        let result = handoff::run(
            socket.as_ref(),
            self.ctx.archive.as_ref(),
            &self.ctx.key,
            &self.ctx.work_dir,
            self.ctx.config.artifact_poll,
            self.ctx.config.artifact_budget,
        )
        .await;

        match result {
            Ok(outcome) => {
                tracing::info!(
                    uploaded = outcome.locator.is_some(),
                    notified = outcome.notified,
                    "credential handoff finished"
                );
                self.finish(SessionState::Done, None).await;
            }
            Err(e) => self.finish(SessionState::Failed, Some(e)).await,
        }
    }

    async fn on_closed(
        &mut self,
        reason: CloseReason,
        control_rx: &mut mpsc::Receiver<SessionEvent>,
    ) -> Option<mpsc::Receiver<SocketEvent>> {
        if self.ctx.config.close_policy.is_terminal(reason) {
            self.finish(
                SessionState::Abandoned,
                Some(SessionError::LoggedOut { code: reason.0 }),
            )
            .await;
            return None;
        }

        if self.attempt >= self.ctx.config.max_reconnects {
            self.finish(
                SessionState::Abandoned,
                Some(SessionError::RetriesExhausted {
                    attempts: self.attempt,
                }),
            )
            .await;
            return None;
        }

        self.attempt += 1;
        let delay = backoff_delay(
            self.ctx.config.backoff_base,
            self.ctx.config.backoff_cap,
            self.attempt,
        );
        tracing::info!(
            reason = %reason,
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "connection closed, reconnecting"
        );

        if let Some(socket) = self.socket.take() {
            socket.close().await;
        }

        // The backoff wait must not block lifecycle requests: eviction and
        // watchdog expiry still interrupt a session waiting to reconnect.
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                event = control_rx.recv() => match event {
                    Some(SessionEvent::WatchdogFired) => {
                        let budget = self.ctx.config.link_budget;
                        self.finish(
                            SessionState::Abandoned,
                            Some(SessionError::WatchdogExpiry { budget }),
                        )
                        .await;
                        return None;
                    }
                    Some(SessionEvent::Evicted) | None => {
                        self.finish(SessionState::Abandoned, Some(SessionError::Superseded))
                            .await;
                        return None;
                    }
                    // Leftovers from the socket just torn down.
                    Some(SessionEvent::Socket(_)) => {}
                },
            }
        }

        match self.connect().await {
            Ok(rx) => {
                // Directory reused across attempts. Re-enter the token phase
                // only if the caller has not received a token yet.
                if self.reply.is_some() {
                    self.set_state(SessionState::Created);
                } else {
                    self.set_state(SessionState::Linking);
                }
                Some(rx)
            }
            Err(e) => {
                self.finish(
                    SessionState::Failed,
                    Some(SessionError::SocketInit {
                        reason: e.to_string(),
                    }),
                )
                .await;
                None
            }
        }
    }

    async fn connect(&mut self) -> Result<mpsc::Receiver<SocketEvent>, crate::error::SocketError> {
        let (socket, rx) = self
            .ctx
            .provider
            .connect(&self.ctx.work_dir, &self.ctx.config.device_profile)
            .await?;
        self.socket = Some(socket);
        self.open = false;
        self.registered = false;
        Ok(rx)
    }

    /// Answer the HTTP caller. At most one reply is ever sent.
    fn deliver(&mut self, result: Result<TokenReply, SessionError>) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(result);
        }
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        let _ = self.state_tx.send(state);
    }

    /// The single terminal transition: cancel the watchdog, close the socket,
    /// purge the working directory, release the registry slot, answer a still
    /// pending caller, then publish the terminal state.
    async fn finish(&mut self, state: SessionState, error: Option<SessionError>) {
        if self.finished {
            return;
        }
        self.finished = true;

        if let Some(watchdog) = self.watchdog.as_mut() {
            watchdog.cancel();
        }
        if let Some(socket) = self.socket.take() {
            socket.close().await;
        }
        match tokio::fs::remove_dir_all(&self.ctx.work_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                error = %e,
                dir = %self.ctx.work_dir.display(),
                "failed to purge working directory"
            ),
        }
        self.ctx
            .registry
            .release(&self.ctx.key, self.ctx.session_id)
            .await;

        if let Some(error) = error.clone() {
            self.deliver(Err(error));
        }
        self.set_state(state);
        let _ = self.released_tx.send(true);

        match error {
            Some(e) => tracing::warn!(state = %state, error = %e, "session finished"),
            None => tracing::info!(state = %state, "session finished"),
        }
    }
}

/// Group a raw pairing code into `XXXX-XXXX` form. Codes that already carry
/// separators pass through unchanged.
pub fn format_pairing_code(raw: &str) -> String {
    if raw.contains('-') {
        return raw.to_string();
    }
    let chars: Vec<char> = raw.chars().collect();
    chars
        .chunks(4)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

/// Exponential backoff with a cap and up to 25% additive jitter.
pub(crate) fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1);
    let base_ms = base.as_millis() as u64;
    let exp_ms = base_ms.saturating_mul(1u64.checked_shl(shift).unwrap_or(u64::MAX));
    let capped_ms = exp_ms.min(cap.as_millis() as u64);
    let jitter_range = capped_ms / 4;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..=jitter_range)
    } else {
        0
    };
    Duration::from_millis(capped_ms.saturating_add(jitter))
}
