//! Pairing session lifecycle.
//!
//! One session per normalized number, driven by an explicit state machine
//! ([`machine`]) over a per-session event queue. The registry ([`registry`])
//! enforces single-flight per key, the watchdog ([`watchdog`]) bounds overall
//! progress, and the handoff ([`handoff`]) archives captured credentials.

pub mod handoff;
pub mod machine;
pub mod registry;
pub mod watchdog;

pub use handoff::HandoffOutcome;
pub use machine::{TokenMode, TokenReply};
pub use registry::{SessionRegistry, SessionSlot};
pub use watchdog::Watchdog;

use crate::socket::SocketEvent;

/// States a pairing session moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session exists, socket constructed, no protocol activity yet.
    Created,
    /// Connecting phase began; waiting to deliver the pairing token.
    AwaitingToken,
    /// Token delivered; waiting for the remote account to complete linking.
    Linking,
    /// Connection open and credentials registered.
    Registered,
    /// Credential handoff in progress.
    Archiving,
    /// Terminal: handoff finished without dangling resources.
    Done,
    /// Terminal: unrecoverable failure.
    Failed,
    /// Terminal: watchdog expiry, terminal close, or eviction.
    Abandoned,
}

impl SessionState {
    /// Whether this state ends the session.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Abandoned)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::AwaitingToken => "awaiting_token",
            Self::Linking => "linking",
            Self::Registered => "registered",
            Self::Archiving => "archiving",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        };
        f.write_str(name)
    }
}

/// Events a session reacts to. Socket events and lifecycle requests share one
/// queue per session, so every event is matched against the current state in
/// one place.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// An event from the current socket.
    Socket(SocketEvent),
    /// The watchdog requests abandonment.
    WatchdogFired,
    /// The registry evicted this session in favor of a newer request.
    Evicted,
}
