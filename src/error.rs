//! Error types for pairgate.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid identifier: {0}")]
    Phone(#[from] PhoneError),

    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identifier validation errors. Reported immediately; no session is created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhoneError {
    #[error("number is empty")]
    Empty,

    #[error("number contains non-digit characters: {input}")]
    NotNumeric { input: String },

    #[error("number has {digits} digits, minimum is {min}")]
    TooShort { digits: usize, min: usize },

    #[error("number has {digits} digits, maximum is {max}")]
    TooLong { digits: usize, max: usize },

    #[error("international numbers cannot start with 0")]
    LeadingZero,
}

/// Authentication-socket errors surfaced by a provider implementation.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("socket construction failed: {reason}")]
    InitFailed { reason: String },

    #[error("pairing code requested before the connecting phase began")]
    NotConnecting,

    #[error("socket is not open")]
    NotOpen,

    #[error("pairing code request failed: {reason}")]
    CodeRequestFailed { reason: String },

    #[error("transport error: {reason}")]
    Transport { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Credential-archive errors. Upload failure is non-fatal to a session.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("artifact not readable at {path}: {reason}")]
    MissingArtifact { path: String, reason: String },

    #[error("upload of {name} rejected: {reason}")]
    Upload { name: String, reason: String },

    #[error("invalid archive URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Session lifecycle errors. All of these are handled by the state machine;
/// they reach the HTTP caller only when the pairing token was never delivered.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("socket initialization failed: {reason}")]
    SocketInit { reason: String },

    #[error("pairing token request failed: {reason}")]
    TokenRequest { reason: String },

    #[error("no pairing token within {waited:?}")]
    TokenTimeout { waited: Duration },

    #[error("credential artifact did not appear within {budget:?}")]
    ArtifactTimeout { budget: Duration },

    #[error("connection closed with terminal reason {code}, not retrying")]
    LoggedOut { code: u16 },

    #[error("gave up after {attempts} reconnect attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("watchdog expired after {budget:?}")]
    WatchdogExpiry { budget: Duration },

    #[error("superseded by a newer request for the same number")]
    Superseded,

    #[error("internal session fault: {reason}")]
    Internal { reason: String },
}

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {reason}")]
    BindFailed { addr: String, reason: String },
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
