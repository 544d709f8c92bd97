//! Pairing service for linking a client device to a remote messaging account.
//!
//! A caller asks for a one-time pairing credential over HTTP, either an
//! eight-character code or a scannable token. Behind that request sits a
//! single-flight session per phone number: an explicit state machine that
//! drives the authentication socket through linking, bounds progress with a
//! watchdog, retries transient disconnects, and on success archives the
//! captured credentials off-box exactly once before releasing everything it
//! holds.

pub mod archive;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod phone;
pub mod server;
pub mod session;
pub mod socket;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
pub use server::HttpServer;
