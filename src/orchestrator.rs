//! Pairing orchestrator.
//!
//! Front door for the HTTP layer: normalizes the requested number, enforces
//! single-flight through the session registry, spawns the session state
//! machine, and waits (bounded) for the pairing token. All session lifecycle
//! beyond token delivery is the machine's business.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use qrcode::QrCode;
use qrcode::render::svg;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::archive::CredentialArchive;
use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::phone;
use crate::session::machine::{self, SessionChannels, SessionContext};
use crate::session::{SessionRegistry, SessionSlot, SessionState, TokenMode, TokenReply};
use crate::socket::SocketProvider;

/// Depth of the per-session event queue.
const CONTROL_QUEUE_DEPTH: usize = 16;

/// Owns the session registry and spawns sessions on demand.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<Config>,
    provider: Arc<dyn SocketProvider>,
    archive: Arc<dyn CredentialArchive>,
    registry: SessionRegistry,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        provider: Arc<dyn SocketProvider>,
        archive: Arc<dyn CredentialArchive>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            provider,
            archive,
            registry: SessionRegistry::new(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Start (or restart) a session for `raw` and wait for its pairing code.
    pub async fn pair_code(&self, raw: &str) -> Result<String> {
        match self.begin(raw, TokenMode::PairingCode).await? {
            TokenReply::Code(code) => Ok(code),
            TokenReply::Qr(_) => Err(SessionError::Internal {
                reason: "expected a pairing code, got a scannable token".to_string(),
            }
            .into()),
        }
    }

    /// Start (or restart) a session for `raw` and wait for its scannable
    /// token, rendered as an SVG data URL.
    pub async fn qr_data_url(&self, raw: &str) -> Result<String> {
        match self.begin(raw, TokenMode::Qr).await? {
            TokenReply::Qr(payload) => render_qr_data_url(&payload),
            TokenReply::Code(_) => Err(SessionError::Internal {
                reason: "expected a scannable token, got a pairing code".to_string(),
            }
            .into()),
        }
    }

    /// Observe the state of the live session for `raw`, if one exists.
    pub async fn watch_session(&self, raw: &str) -> Option<watch::Receiver<SessionState>> {
        let key = phone::normalize(raw).ok()?;
        self.registry.watch(&key).await
    }

    async fn begin(&self, raw: &str, mode: TokenMode) -> Result<TokenReply> {
        let key = phone::normalize(raw)?;
        let session_id = Uuid::new_v4();
        tracing::info!(number = %key, %session_id, ?mode, "pairing requested");

        let work_dir = self.config.session_root.join(format!("{key}-{session_id}"));
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| SessionError::Internal {
                reason: format!("creating working directory: {e}"),
            })?;

        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        let (released_tx, released_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SessionState::Created);
        let (reply_tx, reply_rx) = oneshot::channel();

        // Reserving the slot evicts and drains any previous session for this
        // number before the new machine starts, so the working directory and
        // socket are never contended.
        self.registry
            .acquire(
                &key,
                SessionSlot {
                    session_id,
                    control: control_tx.clone(),
                    released: released_rx,
                    state: state_rx,
                },
            )
            .await;

        let ctx = SessionContext {
            key: key.clone(),
            session_id,
            work_dir,
            config: Arc::clone(&self.config),
            provider: Arc::clone(&self.provider),
            archive: Arc::clone(&self.archive),
            registry: self.registry.clone(),
        };
        let _task = machine::spawn(
            ctx,
            mode,
            SessionChannels {
                control_tx,
                control_rx,
                released_tx,
                state_tx,
                reply_tx,
            },
        );

        match tokio::time::timeout(self.config.token_wait, reply_rx).await {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(session_err))) => Err(session_err.into()),
            Ok(Err(_)) => Err(SessionError::Internal {
                reason: "session ended without a reply".to_string(),
            }
            .into()),
            // The session keeps running; only the caller gives up.
            Err(_) => Err(SessionError::TokenTimeout {
                waited: self.config.token_wait,
            }
            .into()),
        }
    }
}

/// Render a token payload as a scannable SVG, base64-wrapped for direct use
/// in an `<img>` source.
fn render_qr_data_url(payload: &str) -> Result<String> {
    let code = QrCode::new(payload.as_bytes()).map_err(|e| SessionError::Internal {
        reason: format!("rendering token: {e}"),
    })?;
    let image = code
        .render::<svg::Color>()
        .min_dimensions(256, 256)
        .build();
    Ok(format!(
        "data:image/svg+xml;base64,{}",
        BASE64.encode(image.as_bytes())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::error::{ArchiveError, Error, PhoneError};
    use crate::socket::DevSocketProvider;

    struct NullArchive;

    #[async_trait]
    impl CredentialArchive for NullArchive {
        async fn upload(
            &self,
            _local_path: &Path,
            remote_name: &str,
        ) -> std::result::Result<String, ArchiveError> {
            Ok(format!("https://example.com/file/{remote_name}#stub"))
        }
    }

    fn test_orchestrator(root: &Path) -> Orchestrator {
        let config = Config {
            grace_period: Duration::from_millis(10),
            token_wait: Duration::from_secs(2),
            session_root: root.to_path_buf(),
            ..Config::default()
        };
        Orchestrator::new(
            config,
            Arc::new(DevSocketProvider::new()),
            Arc::new(NullArchive),
        )
    }

    #[tokio::test]
    async fn issues_grouped_pairing_code() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path());

        let code = orchestrator.pair_code("+94 71 234 5678").await.unwrap();
        assert_eq!(code.len(), 9);
        assert_eq!(&code[4..5], "-");
    }

    #[tokio::test]
    async fn issues_scannable_token_as_data_url() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path());

        let qr = orchestrator.qr_data_url("94712345678").await.unwrap();
        assert!(qr.starts_with("data:image/svg+xml;base64,"));
    }

    #[tokio::test]
    async fn rejects_invalid_number_before_any_session_work() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path());

        let err = orchestrator.pair_code("abc").await.unwrap_err();
        assert!(matches!(err, Error::Phone(PhoneError::NotNumeric { .. })));
        assert!(orchestrator.registry().is_empty().await);
    }

    #[tokio::test]
    async fn second_request_for_same_number_replaces_the_first() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path());

        orchestrator.pair_code("94712345678").await.unwrap();
        assert_eq!(orchestrator.registry().len().await, 1);

        orchestrator.pair_code("94712345678").await.unwrap();
        assert_eq!(orchestrator.registry().len().await, 1);
    }

    #[test]
    fn renders_svg_data_url() {
        let url = render_qr_data_url("dev-link:00ff").unwrap();
        let encoded = url.strip_prefix("data:image/svg+xml;base64,").unwrap();
        let svg = BASE64.decode(encoded).unwrap();
        assert!(String::from_utf8(svg).unwrap().contains("<svg"));
    }
}
