//! Trait seam for the authentication-protocol socket.
//!
//! The wire protocol itself lives in an external provider; this module
//! defines the handle and event vocabulary the session state machine consumes,
//! plus the configurable split between retryable and terminal close reasons.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SocketError;

/// Device identity presented to the remote side during linking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Browser name announced by the linked device.
    pub browser: String,
    /// Platform name announced by the linked device.
    pub platform: String,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            browser: "Chrome".to_string(),
            platform: "Windows".to_string(),
        }
    }
}

/// Numeric close reason reported by the transport.
///
/// The taxonomy is external and versioned independently of this crate; only
/// [`ClosePolicy`] decides what a given code means for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CloseReason(pub u16);

impl CloseReason {
    /// The conventional logged-out code. Retrying after this is guaranteed
    /// to fail the same way.
    pub const LOGGED_OUT: CloseReason = CloseReason(401);

    /// Synthetic code used when the event stream ends without a close event.
    pub const STREAM_ENDED: CloseReason = CloseReason(0);
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Events emitted by an authentication socket, delivered serially per socket.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// The transport has begun its connecting phase.
    Connecting,
    /// A scannable linking token is available.
    QrToken(String),
    /// The connection is open.
    Open,
    /// The remote side has registered the credentials.
    Registered,
    /// The connection closed with the given reason.
    Closed(CloseReason),
}

/// Decides which close reasons are terminal (never retried).
#[derive(Debug, Clone)]
pub struct ClosePolicy {
    terminal: Vec<u16>,
}

impl ClosePolicy {
    /// Build a policy from an explicit list of terminal codes.
    pub fn new(terminal: Vec<u16>) -> Self {
        Self { terminal }
    }

    /// Whether a close with this reason should abandon the session.
    pub fn is_terminal(&self, reason: CloseReason) -> bool {
        self.terminal.contains(&reason.0)
    }
}

impl Default for ClosePolicy {
    /// Retry unless logged-out.
    fn default() -> Self {
        Self {
            terminal: vec![CloseReason::LOGGED_OUT.0],
        }
    }
}

/// Handle to one authentication-protocol connection.
#[async_trait]
pub trait AuthSocket: Send + Sync {
    /// Request a pairing code for `number`. Fails if called before the
    /// connecting phase has begun.
    async fn request_pairing_code(&self, number: &str) -> Result<String, SocketError>;

    /// Send a short text message to the account identified by `number`.
    /// Fails unless the connection is open.
    async fn send_message(&self, number: &str, text: &str) -> Result<(), SocketError>;

    /// Flush in-memory credential state to the working directory.
    async fn save_credentials(&self) -> Result<(), SocketError>;

    /// Release the transport. Idempotent.
    async fn close(&self);
}

/// Constructs authentication sockets bound to a working directory.
#[async_trait]
pub trait SocketProvider: Send + Sync + 'static {
    /// Open a connection whose credential state lives under `auth_dir`.
    /// Returns the handle and the serial event stream for this connection.
    async fn connect(
        &self,
        auth_dir: &Path,
        profile: &DeviceProfile,
    ) -> Result<(Arc<dyn AuthSocket>, mpsc::Receiver<SocketEvent>), SocketError>;
}

/// Development provider that simulates the pre-linking phase of a transport:
/// it connects, emits a scannable token, and issues pairing codes, but no
/// remote account ever completes the link. Useful for exercising the HTTP
/// surface and timeout paths without the external protocol stack.
#[derive(Debug, Default)]
pub struct DevSocketProvider;

impl DevSocketProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SocketProvider for DevSocketProvider {
    async fn connect(
        &self,
        _auth_dir: &Path,
        _profile: &DeviceProfile,
    ) -> Result<(Arc<dyn AuthSocket>, mpsc::Receiver<SocketEvent>), SocketError> {
        let (tx, rx) = mpsc::channel(8);
        let socket = Arc::new(DevSocket {
            connecting: AtomicBool::new(false),
        });

        let events = Arc::clone(&socket);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            events.connecting.store(true, Ordering::Relaxed);
            if tx.send(SocketEvent::Connecting).await.is_err() {
                return;
            }
            let _ = tx.send(SocketEvent::QrToken(random_token())).await;
        });

        Ok((socket, rx))
    }
}

/// Socket handle produced by [`DevSocketProvider`].
struct DevSocket {
    connecting: AtomicBool,
}

#[async_trait]
impl AuthSocket for DevSocket {
    async fn request_pairing_code(&self, _number: &str) -> Result<String, SocketError> {
        if !self.connecting.load(Ordering::Relaxed) {
            return Err(SocketError::NotConnecting);
        }
        Ok(random_code())
    }

    async fn send_message(&self, _number: &str, _text: &str) -> Result<(), SocketError> {
        Err(SocketError::NotOpen)
    }

    async fn save_credentials(&self) -> Result<(), SocketError> {
        Ok(())
    }

    async fn close(&self) {}
}

fn random_code() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn random_token() -> String {
    let mut rng = rand::thread_rng();
    let raw: u128 = rng.r#gen();
    format!("dev-link:{raw:032x}")
}
