//! Authenticated requests against the backend
//!
//! Every request goes through [`AuthenticatedClient::fetch`], which carries
//! credentials (the shared cookie jar), merges the configured default headers
//! with the caller's, and demotes the session when the backend answers 401.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::error::{RemoteError, Result};
use crate::io::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use crate::session::{SessionState, SessionStatus};

const UNAUTHORIZED: u16 = 401;

/// Per-request options
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: HttpMethod,
    /// Headers added to the defaults; these win on conflict
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: HttpMethod::Get,
            headers: Vec::new(),
            body: None,
        }
    }
}

impl RequestOptions {
    pub fn post() -> Self {
        Self {
            method: HttpMethod::Post,
            ..Default::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// HTTP client that keeps the session status in step with the backend
#[derive(Clone)]
pub struct AuthenticatedClient {
    http: Arc<dyn HttpClient>,
    server: ServerConfig,
    session: SessionState,
}

impl AuthenticatedClient {
    pub fn new(http: Arc<dyn HttpClient>, server: ServerConfig, session: SessionState) -> Self {
        Self {
            http,
            server,
            session,
        }
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Perform a request and return the raw response.
    ///
    /// A 401 response moves the session to `Unauthenticated` before the
    /// response is handed back. Nothing is retried.
    pub async fn fetch(&self, path: &str, options: RequestOptions) -> Result<HttpResponse> {
        let url = self.server.resolve(path)?;
        let request = HttpRequest {
            method: options.method,
            url,
            headers: merge_headers(&self.server, options.headers),
            body: options.body,
        };

        let response = self.http.send(request).await?;
        if response.status == UNAUTHORIZED {
            warn!("{} rejected with 401, session is no longer authenticated", path);
            self.session.set(SessionStatus::Unauthenticated);
        }
        Ok(response)
    }

    /// POST a JSON body
    pub async fn post_json(&self, path: &str, body: &Value) -> Result<HttpResponse> {
        let options = RequestOptions::post()
            .header("Content-Type", "application/json")
            .body(serde_json::to_string(body)?);
        self.fetch(path, options).await
    }

    /// POST an application command, turning a non-2xx answer into an error
    pub async fn send_command(&self, path: &str, command: &Value) -> Result<HttpResponse> {
        let response = self.post_json(path, command).await?;
        if response.is_success() {
            debug!("Command to {} accepted ({})", path, response.status);
            return Ok(response);
        }

        let message = failure_message(&response);
        warn!("Command to {} failed ({}): {}", path, response.status, message);
        Err(RemoteError::CommandFailed {
            status: response.status,
            message,
        })
    }
}

/// Defaults first, then the caller's headers replacing any with the same
/// name (compared case-insensitively)
fn merge_headers(
    server: &ServerConfig,
    overrides: Vec<(String, String)>,
) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = server
        .headers
        .iter()
        .filter(|(name, _)| {
            !overrides
                .iter()
                .any(|(other, _)| other.eq_ignore_ascii_case(name))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    headers.sort();
    headers.extend(overrides);
    headers
}

fn failure_message(response: &HttpResponse) -> String {
    let from_json = response.json().ok().and_then(|body| {
        ["message", "error"]
            .iter()
            .find_map(|key| body.get(*key).and_then(Value::as_str).map(str::to_string))
    });
    match from_json {
        Some(message) => message,
        None if response.body.trim().is_empty() => format!("HTTP {}", response.status),
        None => response.body.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MockHttpClient;
    use serde_json::json;
    use std::collections::HashMap;

    fn authenticated_session() -> SessionState {
        let session = SessionState::new();
        session.begin_verification();
        session.set(SessionStatus::Authenticated);
        session
    }

    fn server() -> ServerConfig {
        ServerConfig {
            base_url: "http://home.local".to_string(),
            headers: HashMap::from([
                ("X-Client".to_string(), "remote".to_string()),
                ("Accept".to_string(), "*/*".to_string()),
            ]),
            ..Default::default()
        }
    }

    fn respond(status: u16, body: &str) -> MockHttpClient {
        let body = body.to_string();
        let mut mock = MockHttpClient::new();
        mock.expect_send().times(1).returning(move |_| {
            let response = HttpResponse {
                status,
                body: body.clone(),
            };
            Box::pin(async move { Ok(response) })
        });
        mock
    }

    #[test]
    fn caller_headers_win() {
        let merged = merge_headers(
            &server(),
            vec![("accept".to_string(), "application/json".to_string())],
        );
        assert_eq!(
            merged,
            vec![
                ("X-Client".to_string(), "remote".to_string()),
                ("accept".to_string(), "application/json".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn fetch_resolves_path_and_sends_headers() {
        let mut mock = MockHttpClient::new();
        mock.expect_send()
            .withf(|request| {
                request.url == "http://home.local/api/devices"
                    && request.method == HttpMethod::Get
                    && request
                        .headers
                        .contains(&("X-Client".to_string(), "remote".to_string()))
            })
            .times(1)
            .returning(|_| {
                Box::pin(async {
                    Ok(HttpResponse {
                        status: 200,
                        body: "[]".to_string(),
                    })
                })
            });

        let client = AuthenticatedClient::new(Arc::new(mock), server(), authenticated_session());
        let response = client
            .fetch("/api/devices", RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn unauthorized_response_demotes_session() {
        let session = authenticated_session();
        let client =
            AuthenticatedClient::new(Arc::new(respond(401, "")), server(), session.clone());

        let response = client
            .fetch("/api/devices", RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(response.status, 401);
        assert_eq!(session.status(), SessionStatus::Unauthenticated);
    }

    #[tokio::test]
    async fn other_failures_keep_session() {
        let session = authenticated_session();
        let client =
            AuthenticatedClient::new(Arc::new(respond(500, "")), server(), session.clone());

        let response = client
            .fetch("/api/devices", RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(session.status(), SessionStatus::Authenticated);
    }

    #[tokio::test]
    async fn transport_errors_are_returned() {
        let mut mock = MockHttpClient::new();
        mock.expect_send()
            .returning(|_| Box::pin(async { Err(RemoteError::Http("refused".to_string())) }));

        let session = authenticated_session();
        let client = AuthenticatedClient::new(Arc::new(mock), server(), session.clone());
        let err = client
            .fetch("/api/devices", RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Http(_)));
        assert_eq!(session.status(), SessionStatus::Authenticated);
    }

    #[tokio::test]
    async fn post_json_sets_content_type() {
        let mut mock = MockHttpClient::new();
        mock.expect_send()
            .withf(|request| {
                request.method == HttpMethod::Post
                    && request.body.as_deref() == Some(r#"{"power":"on"}"#)
                    && request
                        .headers
                        .contains(&("Content-Type".to_string(), "application/json".to_string()))
            })
            .times(1)
            .returning(|_| {
                Box::pin(async {
                    Ok(HttpResponse {
                        status: 204,
                        body: String::new(),
                    })
                })
            });

        let client = AuthenticatedClient::new(Arc::new(mock), server(), authenticated_session());
        client
            .post_json("/api/remote", &json!({"power": "on"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn send_command_reports_json_message() {
        let client = AuthenticatedClient::new(
            Arc::new(respond(400, r#"{"message": "unknown mode"}"#)),
            server(),
            authenticated_session(),
        );
        let err = client
            .send_command("/api/remote", &json!({"mode": "x"}))
            .await
            .unwrap_err();
        match err {
            RemoteError::CommandFailed { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "unknown mode");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_command_falls_back_to_raw_body() {
        let client = AuthenticatedClient::new(
            Arc::new(respond(502, "Bad Gateway")),
            server(),
            authenticated_session(),
        );
        let err = client
            .send_command("/api/remote", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RemoteError::CommandFailed { status: 502, ref message } if message == "Bad Gateway"
        ));
    }

    #[tokio::test]
    async fn send_command_unauthorized_demotes_and_fails() {
        let session = authenticated_session();
        let client = AuthenticatedClient::new(
            Arc::new(respond(401, r#"{"error": "expired"}"#)),
            server(),
            session.clone(),
        );
        let err = client
            .send_command("/api/remote", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::CommandFailed { status: 401, .. }));
        assert_eq!(session.status(), SessionStatus::Unauthenticated);
    }

    #[tokio::test]
    async fn send_command_success_returns_response() {
        let client = AuthenticatedClient::new(
            Arc::new(respond(200, r#"{"ok": true}"#)),
            server(),
            authenticated_session(),
        );
        let response = client
            .send_command("/api/remote", &json!({"power": "off"}))
            .await
            .unwrap();
        assert_eq!(response.json().unwrap()["ok"], true);
    }
}
