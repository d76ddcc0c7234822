//! I/O traits and implementations for the home remote client
//!
//! The HTTP client and the live socket are both hidden behind traits so the
//! session and connection logic can be exercised with fakes. The default
//! implementations use reqwest and tokio-tungstenite and share one cookie jar,
//! so a session cookie set by the backend during verification is also sent
//! when the live socket is opened.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::{RemoteError, Result};

// ============================================================================
// HttpClient trait and implementations
// ============================================================================

/// HTTP method of an outgoing request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Put => write!(f, "PUT"),
            HttpMethod::Delete => write!(f, "DELETE"),
        }
    }
}

/// A fully resolved HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// HTTP response from a request
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    /// True for any 2xx status
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON
    pub fn json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Abstraction over HTTP client for dependency injection
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait HttpClient: Send + Sync {
    /// Send the request and return the raw response, whatever its status
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Production HTTP client using reqwest with a cookie store
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Create a client that stores and replays cookies through `jar`
    pub fn new(timeout: Duration, jar: Arc<Jar>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .cookie_provider(jar)
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Http(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
        } = request;
        debug!("{} {}", method, url);

        let mut builder = match method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Put => self.client.put(&url),
            HttpMethod::Delete => self.client.delete(&url),
        };
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RemoteError::Http(format!("{} {} failed: {}", method, url, e)))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| RemoteError::Http(format!("Reading response body: {}", e)))?;

        debug!("{} {} -> {} ({} bytes)", method, url, status, body.len());
        Ok(HttpResponse { status, body })
    }
}

// ============================================================================
// Live socket traits
// ============================================================================

/// A frame received from the live socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// A text payload
    Text(String),
    /// The connection ended; `code` is the close code when the peer sent one
    Closed { code: Option<u16>, reason: String },
}

/// Reader half of a live socket
#[async_trait]
pub trait FrameReader: Send {
    /// Wait for the next text frame or the end of the connection
    async fn read_frame(&mut self) -> Result<InboundFrame>;
}

/// Writer half of a live socket
#[async_trait]
pub trait FrameWriter: Send {
    /// Send a text frame
    async fn send_text(&mut self, text: &str) -> Result<()>;

    /// Close the connection normally
    async fn close(&mut self) -> Result<()>;
}

/// Connection pair containing a reader and writer
pub struct ConnectionPair {
    pub reader: Box<dyn FrameReader>,
    pub writer: Box<dyn FrameWriter>,
}

/// Trait for opening live socket connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a connection to `url`, sending `headers` with the upgrade request
    async fn connect(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<ConnectionPair>;
}

// ============================================================================
// tokio-tungstenite implementation
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reader half of a tungstenite WebSocket
pub struct WsFrameReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameReader for WsFrameReader {
    async fn read_frame(&mut self) -> Result<InboundFrame> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(InboundFrame::Text(text)),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Ok(InboundFrame::Text(text)),
                    Err(e) => debug!("Dropping non-UTF-8 binary frame: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                        None => (None, String::new()),
                    };
                    return Ok(InboundFrame::Closed { code, reason });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(RemoteError::WebSocket(e.to_string())),
                None => {
                    return Ok(InboundFrame::Closed {
                        code: None,
                        reason: "Stream ended".to_string(),
                    })
                }
            }
        }
    }
}

/// Writer half of a tungstenite WebSocket
pub struct WsFrameWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameWriter for WsFrameWriter {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(Message::Text(text.to_string()))
            .await
            .map_err(|e| RemoteError::WebSocket(format!("Failed to send frame: {}", e)))
    }

    async fn close(&mut self) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| RemoteError::WebSocket(format!("Failed to send close: {}", e)))?;
        self.sink
            .close()
            .await
            .map_err(|e| RemoteError::WebSocket(format!("Failed to close socket: {}", e)))
    }
}

/// WebSocket connection factory backed by tokio-tungstenite
#[derive(Clone)]
pub struct TungsteniteConnectionFactory {
    jar: Arc<Jar>,
}

impl TungsteniteConnectionFactory {
    /// Create a factory that attaches cookies from `jar` to the upgrade request
    pub fn new(jar: Arc<Jar>) -> Self {
        Self { jar }
    }

    /// Cookies are stored against http(s) URLs, so look them up under the
    /// equivalent scheme of the socket URL
    fn cookie_header(&self, url: &str) -> Option<String> {
        let mut lookup = Url::parse(url).ok()?;
        let scheme = if lookup.scheme() == "wss" { "https" } else { "http" };
        lookup.set_scheme(scheme).ok()?;
        let value = self.jar.cookies(&lookup)?;
        value.to_str().ok().map(str::to_string)
    }
}

#[async_trait]
impl ConnectionFactory for TungsteniteConnectionFactory {
    async fn connect(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<ConnectionPair> {
        debug!("Connecting to {} with timeout {:?}", url, timeout);

        let mut request = url
            .into_client_request()
            .map_err(|e| RemoteError::WebSocket(format!("Invalid socket request: {}", e)))?;

        let cookie = self.cookie_header(url);
        let extra = cookie.iter().map(|c| ("Cookie", c.as_str()));
        for (name, value) in headers
            .iter()
            .map(|(n, v)| (n.as_str(), v.as_str()))
            .chain(extra)
        {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| RemoteError::Config(format!("Invalid header name: {}", e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| RemoteError::Config(format!("Invalid header value: {}", e)))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| RemoteError::Timeout(format!("Connection to {} timed out", url)))?
            .map_err(|e| {
                RemoteError::ConnectionFailed(format!("Failed to connect to {}: {}", url, e))
            })?;

        debug!("WebSocket connection established to {}", url);

        let (sink, stream) = stream.split();
        Ok(ConnectionPair {
            reader: Box::new(WsFrameReader { stream }),
            writer: Box::new(WsFrameWriter { sink }),
        })
    }
}
