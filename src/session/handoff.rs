//! Credential handoff.
//!
//! Runs once per session, after the remote side registers the credentials:
//! flush credential state to disk, wait for the artifact to materialize,
//! ship it to the archive, and tell the linked account where it landed.
//! Only a missing artifact fails the session; a failed upload or
//! confirmation message degrades the outcome but the link itself stands.

use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;

use crate::archive::{self, CredentialArchive};
use crate::error::SessionError;
use crate::socket::AuthSocket;

/// Name of the credential artifact inside a session's working directory.
pub const ARTIFACT_NAME: &str = "creds.json";

/// What the handoff managed to do.
#[derive(Debug, Clone, Default)]
pub struct HandoffOutcome {
    /// Locator of the archived artifact, if the upload succeeded.
    pub locator: Option<String>,
    /// Whether the confirmation message reached the linked account.
    pub notified: bool,
}

/// Run the handoff for `number`, polling `work_dir` for the artifact.
pub async fn run(
    socket: &dyn AuthSocket,
    archive: &dyn CredentialArchive,
    number: &str,
    work_dir: &Path,
    poll: Duration,
    budget: Duration,
) -> Result<HandoffOutcome, SessionError> {
    if let Err(e) = socket.save_credentials().await {
        // The transport usually persists on registration anyway; keep polling.
        tracing::warn!(error = %e, "credential flush failed");
    }

    let artifact = work_dir.join(ARTIFACT_NAME);
    wait_for_artifact(&artifact, poll, budget).await?;

    let remote_name = format!(
        "creds_{number}_{}.json",
        chrono::Utc::now().timestamp_millis()
    );
    let locator = match archive.upload(&artifact, &remote_name).await {
        Ok(locator) => locator,
        Err(e) => {
            tracing::warn!(error = %e, name = %remote_name, "artifact upload failed");
            return Ok(HandoffOutcome::default());
        }
    };
    tracing::info!(name = %remote_name, "artifact archived");

    // Prefer the short reference; fall back to the full locator.
    let reference = archive::file_reference(&locator).unwrap_or_else(|| locator.clone());
    let notified = match socket.send_message(number, &reference).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "confirmation message failed");
            false
        }
    };

    Ok(HandoffOutcome {
        locator: Some(locator),
        notified,
    })
}

/// Poll until the artifact exists or the budget runs out.
async fn wait_for_artifact(
    path: &Path,
    poll: Duration,
    budget: Duration,
) -> Result<(), SessionError> {
    let deadline = Instant::now() + budget;
    loop {
        if tokio::fs::metadata(path).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(SessionError::ArtifactTimeout { budget });
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::{ArchiveError, SocketError};

    struct StubSocket {
        sent: Mutex<Vec<(String, String)>>,
        fail_send: bool,
    }

    impl StubSocket {
        fn new(fail_send: bool) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_send,
            }
        }
    }

    #[async_trait]
    impl AuthSocket for StubSocket {
        async fn request_pairing_code(&self, _number: &str) -> Result<String, SocketError> {
            Ok("ABCD1234".to_string())
        }

        async fn send_message(&self, number: &str, text: &str) -> Result<(), SocketError> {
            if self.fail_send {
                return Err(SocketError::NotOpen);
            }
            self.sent
                .lock()
                .unwrap()
                .push((number.to_string(), text.to_string()));
            Ok(())
        }

        async fn save_credentials(&self) -> Result<(), SocketError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    struct StubArchive {
        locator: Result<String, ()>,
    }

    #[async_trait]
    impl CredentialArchive for StubArchive {
        async fn upload(
            &self,
            _local_path: &Path,
            remote_name: &str,
        ) -> Result<String, ArchiveError> {
            self.locator.clone().map_err(|_| ArchiveError::Upload {
                name: remote_name.to_string(),
                reason: "store unavailable".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn archives_and_notifies_with_short_reference() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(ARTIFACT_NAME), b"{}").unwrap();

        let socket = StubSocket::new(false);
        let store = StubArchive {
            locator: Ok("https://mega.nz/file/AbC123#k3y".to_string()),
        };

        let outcome = run(
            &socket,
            &store,
            "94712345678",
            dir.path(),
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(outcome.locator.as_deref(), Some("https://mega.nz/file/AbC123#k3y"));
        assert!(outcome.notified);
        let sent = socket.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "94712345678");
        assert_eq!(sent[0].1, "AbC123#k3y");
    }

    #[tokio::test]
    async fn sends_full_locator_when_no_share_reference() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(ARTIFACT_NAME), b"{}").unwrap();

        let socket = StubSocket::new(false);
        let store = StubArchive {
            locator: Ok("https://blobs.example.com/creds/x.json".to_string()),
        };

        let outcome = run(
            &socket,
            &store,
            "94712345678",
            dir.path(),
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert!(outcome.notified);
        let sent = socket.sent.lock().unwrap();
        assert_eq!(sent[0].1, "https://blobs.example.com/creds/x.json");
    }

    #[tokio::test]
    async fn failed_upload_degrades_but_does_not_fail() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(ARTIFACT_NAME), b"{}").unwrap();

        let socket = StubSocket::new(false);
        let store = StubArchive { locator: Err(()) };

        let outcome = run(
            &socket,
            &store,
            "94712345678",
            dir.path(),
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert!(outcome.locator.is_none());
        assert!(!outcome.notified);
        assert!(socket.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_notification_still_reports_locator() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(ARTIFACT_NAME), b"{}").unwrap();

        let socket = StubSocket::new(true);
        let store = StubArchive {
            locator: Ok("https://mega.nz/file/AbC#k".to_string()),
        };

        let outcome = run(
            &socket,
            &store,
            "94712345678",
            dir.path(),
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert!(outcome.locator.is_some());
        assert!(!outcome.notified);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_artifact_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let socket = StubSocket::new(false);
        let store = StubArchive { locator: Err(()) };

        let err = run(
            &socket,
            &store,
            "94712345678",
            dir.path(),
            Duration::from_millis(300),
            Duration::from_secs(25),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SessionError::ArtifactTimeout { .. }));
    }
}
