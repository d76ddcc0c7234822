//! One-shot session verification

use tracing::{info, warn};

use crate::request::{AuthenticatedClient, RequestOptions};
use crate::session::SessionStatus;
use crate::store::{DeviceStore, StateUpdate};

/// Establishes the initial session status by probing the verify endpoint
#[derive(Clone)]
pub struct SessionVerifier {
    client: AuthenticatedClient,
    store: DeviceStore,
    verify_path: String,
}

impl SessionVerifier {
    pub fn new(
        client: AuthenticatedClient,
        store: DeviceStore,
        verify_path: impl Into<String>,
    ) -> Self {
        Self {
            client,
            store,
            verify_path: verify_path.into(),
        }
    }

    /// Verify the session if it has never been verified.
    ///
    /// Only the first call on an `Unset` session issues a request; every
    /// other call returns the current status untouched.
    pub async fn verify(&self) -> SessionStatus {
        let session = self.client.session();
        if !session.begin_verification() {
            return session.status();
        }

        let outcome = match self
            .client
            .fetch(&self.verify_path, RequestOptions::post())
            .await
        {
            Ok(response) if response.is_success() => match response.json() {
                Ok(profile) => {
                    self.store.apply_batch(vec![StateUpdate::SetProfile(profile)]);
                    SessionStatus::Authenticated
                }
                Err(e) => {
                    warn!("Verification succeeded but the profile was unreadable: {}", e);
                    SessionStatus::Unauthenticated
                }
            },
            Ok(response) => {
                info!("Session not verified (HTTP {})", response.status);
                SessionStatus::Unauthenticated
            }
            Err(e) => {
                warn!("Session verification failed: {}", e);
                SessionStatus::Unauthenticated
            }
        };

        session.set(outcome);
        session.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::error::RemoteError;
    use crate::io::{HttpMethod, HttpResponse, MockHttpClient};
    use crate::session::SessionState;
    use serde_json::json;
    use std::sync::Arc;

    fn verifier(mock: MockHttpClient) -> (SessionVerifier, SessionState, DeviceStore) {
        let session = SessionState::new();
        let store = DeviceStore::new();
        let client = AuthenticatedClient::new(
            Arc::new(mock),
            ServerConfig::default(),
            session.clone(),
        );
        (
            SessionVerifier::new(client, store.clone(), "/token/verify"),
            session,
            store,
        )
    }

    fn respond(status: u16, body: &'static str) -> MockHttpClient {
        let mut mock = MockHttpClient::new();
        mock.expect_send()
            .withf(|request| {
                request.method == HttpMethod::Post
                    && request.url == "http://localhost:8080/token/verify"
                    && request.body.is_none()
            })
            .times(1)
            .returning(move |_| {
                Box::pin(async move {
                    Ok(HttpResponse {
                        status,
                        body: body.to_string(),
                    })
                })
            });
        mock
    }

    #[tokio::test]
    async fn success_authenticates_and_stores_profile() {
        let (verifier, session, store) = verifier(respond(200, r#"{"name": "kim"}"#));

        assert_eq!(verifier.verify().await, SessionStatus::Authenticated);
        assert_eq!(session.status(), SessionStatus::Authenticated);
        assert_eq!(store.snapshot().profile, Some(json!({"name": "kim"})));
    }

    #[tokio::test]
    async fn rejection_is_unauthenticated() {
        let (verifier, session, store) = verifier(respond(401, ""));

        assert_eq!(verifier.verify().await, SessionStatus::Unauthenticated);
        assert_eq!(session.status(), SessionStatus::Unauthenticated);
        assert_eq!(store.snapshot().profile, None);
    }

    #[tokio::test]
    async fn server_error_is_unauthenticated() {
        let (verifier, session, _) = verifier(respond(503, "down"));
        verifier.verify().await;
        assert_eq!(session.status(), SessionStatus::Unauthenticated);
    }

    #[tokio::test]
    async fn unreadable_profile_is_unauthenticated() {
        let (verifier, session, store) = verifier(respond(200, "<html>"));
        verifier.verify().await;
        assert_eq!(session.status(), SessionStatus::Unauthenticated);
        assert_eq!(store.snapshot().profile, None);
    }

    #[tokio::test]
    async fn network_failure_is_unauthenticated() {
        let mut mock = MockHttpClient::new();
        mock.expect_send()
            .times(1)
            .returning(|_| Box::pin(async { Err(RemoteError::Http("refused".to_string())) }));
        let (verifier, session, _) = verifier(mock);

        assert_eq!(verifier.verify().await, SessionStatus::Unauthenticated);
        assert_eq!(session.status(), SessionStatus::Unauthenticated);
    }

    #[tokio::test]
    async fn runs_only_once() {
        // times(1) on the mock fails the test if a second request is made
        let (verifier, session, _) = verifier(respond(200, "{}"));

        assert_eq!(verifier.verify().await, SessionStatus::Authenticated);
        session.set(SessionStatus::Unauthenticated);
        assert_eq!(verifier.verify().await, SessionStatus::Unauthenticated);
    }

    #[tokio::test]
    async fn does_not_run_when_already_verifying() {
        let mut mock = MockHttpClient::new();
        mock.expect_send().times(0);
        let (verifier, session, _) = verifier(mock);
        session.begin_verification();

        assert_eq!(verifier.verify().await, SessionStatus::Verifying);
    }
}
