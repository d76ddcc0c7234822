//! Client context tying the session, requests, device state and live
//! connection together

use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{RemoteError, Result};
use crate::io::{
    ConnectionFactory, HttpClient, HttpResponse, ReqwestHttpClient, TungsteniteConnectionFactory,
};
use crate::machine::ManagerPhase;
use crate::manager::{ConnectionEvent, LiveConnectionManager, ManagerSettings};
use crate::request::{AuthenticatedClient, RequestOptions};
use crate::session::{SessionState, SessionStatus};
use crate::store::{DeviceState, DeviceStore};
use crate::verifier::SessionVerifier;

/// Builder for [`RemoteClient`]
///
/// The HTTP client and connection factory default to the reqwest and
/// tokio-tungstenite implementations sharing one cookie jar.
pub struct RemoteClientBuilder {
    config: Config,
    http: Option<Arc<dyn HttpClient>>,
    factory: Option<Arc<dyn ConnectionFactory>>,
}

impl RemoteClientBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            http: None,
            factory: None,
        }
    }

    pub fn with_http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn with_connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<RemoteClient> {
        let settings = ManagerSettings::from_config(&self.config)?;
        let jar = Arc::new(Jar::default());

        let http = match self.http {
            Some(http) => http,
            None => Arc::new(ReqwestHttpClient::new(
                Duration::from_secs(self.config.server.request_timeout_seconds),
                Arc::clone(&jar),
            )?),
        };
        let factory = match self.factory {
            Some(factory) => factory,
            None => Arc::new(TungsteniteConnectionFactory::new(jar)),
        };

        let session = SessionState::new();
        let store = DeviceStore::new();
        let requests = AuthenticatedClient::new(http, self.config.server.clone(), session.clone());
        let verifier = SessionVerifier::new(
            requests.clone(),
            store.clone(),
            self.config.server.verify_path.clone(),
        );

        Ok(RemoteClient {
            session,
            store,
            requests,
            verifier,
            settings,
            factory,
            manager: Mutex::new(None),
        })
    }
}

/// The running client: one per process
pub struct RemoteClient {
    session: SessionState,
    store: DeviceStore,
    requests: AuthenticatedClient,
    verifier: SessionVerifier,
    settings: ManagerSettings,
    factory: Arc<dyn ConnectionFactory>,
    manager: Mutex<Option<Arc<LiveConnectionManager>>>,
}

impl RemoteClient {
    pub fn builder(config: Config) -> RemoteClientBuilder {
        RemoteClientBuilder::new(config)
    }

    /// Start the live connection manager, then verify the session once.
    ///
    /// The manager follows the session from here on, so a successful
    /// verification opens the live connection.
    pub async fn start(&self) -> Result<SessionStatus> {
        {
            let mut manager = self.manager.lock().await;
            if manager.is_some() {
                return Err(RemoteError::InvalidState("Client already started".to_string()));
            }
            *manager = Some(Arc::new(LiveConnectionManager::start(
                self.settings.clone(),
                self.session.clone(),
                self.store.clone(),
                Arc::clone(&self.factory),
            )));
        }
        debug!("Live connection manager started");

        let status = self.verifier.verify().await;
        info!("Session status after verification: {}", status);
        Ok(status)
    }

    /// Dispose the live connection manager
    pub async fn shutdown(&self) {
        let manager = self.manager.lock().await.take();
        if let Some(manager) = manager {
            manager.dispose().await;
        }
    }

    pub fn session_status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn subscribe_session(&self) -> watch::Receiver<SessionStatus> {
        self.session.subscribe()
    }

    pub fn device_state(&self) -> DeviceState {
        self.store.snapshot()
    }

    pub fn subscribe_devices(&self) -> watch::Receiver<DeviceState> {
        self.store.subscribe()
    }

    /// Phase of the live connection; `Idle` before `start`
    pub async fn connection_phase(&self) -> ManagerPhase {
        match self.manager.lock().await.as_ref() {
            Some(manager) => manager.phase(),
            None => ManagerPhase::Idle,
        }
    }

    /// Subscribe to live connection events
    pub async fn subscribe_connection(&self) -> Result<broadcast::Receiver<ConnectionEvent>> {
        self.running_manager().await.map(|manager| manager.subscribe())
    }

    /// Send a JSON message over the live connection
    pub async fn send_live(&self, payload: &Value) -> Result<()> {
        let manager = self.running_manager().await?;
        manager.send(payload).await
    }

    /// Authenticated request with credentials and default headers
    pub async fn fetch(&self, path: &str, options: RequestOptions) -> Result<HttpResponse> {
        self.requests.fetch(path, options).await
    }

    /// POST an application command such as a remote control action
    pub async fn send_command(&self, path: &str, command: &Value) -> Result<HttpResponse> {
        self.requests.send_command(path, command).await
    }

    async fn running_manager(&self) -> Result<Arc<LiveConnectionManager>> {
        self.manager
            .lock()
            .await
            .as_ref()
            .cloned()
            .ok_or_else(|| RemoteError::InvalidState("Client not started".to_string()))
    }
}
