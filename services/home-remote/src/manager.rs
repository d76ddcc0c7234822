//! Live connection manager
//!
//! Owns the single live socket to the backend. A driver task follows the
//! session status: it opens the socket once the session is authenticated,
//! closes it on logout, reconnects after a fixed delay when the connection
//! drops, and stops reconnecting when the backend rejects the client with
//! close code 1003. Every lifecycle decision is made by [`ConnectionMachine`];
//! this module only carries those decisions out.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{RemoteError, Result};
use crate::io::{ConnectionFactory, ConnectionPair, FrameWriter, InboundFrame};
use crate::machine::{Action, ConnectionMachine, ManagerEvent, ManagerPhase};
use crate::reconciler::UpdateReconciler;
use crate::session::{SessionState, SessionStatus};
use crate::store::DeviceStore;

/// Method name of the registration message sent when a socket opens
pub const JOIN_METHOD: &str = "JOIN_CLIENT";

/// Lifecycle notifications published by the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting { generation: u64 },
    Opened { generation: u64 },
    Closed {
        generation: u64,
        code: Option<u16>,
        reason: String,
    },
    ReconnectScheduled { delay: Duration },
    /// The backend refused the client; the session was demoted
    Unauthorized,
    Disposed,
}

/// Settings the manager needs to open connections
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub socket_url: String,
    pub headers: Vec<(String, String)>,
    pub connection_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut headers: Vec<(String, String)> = config
            .server
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        headers.sort();
        Ok(Self {
            socket_url: config.server.socket_url()?,
            headers,
            connection_timeout: Duration::from_secs(config.connection.connection_timeout_seconds),
            reconnect_delay: Duration::from_millis(config.connection.reconnect_delay_ms),
        })
    }
}

/// Build the registration message
pub fn join_message() -> String {
    serde_json::json!({ "method": JOIN_METHOD }).to_string()
}

/// Messages delivered to the driver by connection and timer tasks
enum DriverEvent {
    Opened {
        generation: u64,
        writer: Box<dyn FrameWriter>,
    },
    Frame {
        generation: u64,
        text: String,
    },
    Closed {
        generation: u64,
        code: Option<u16>,
        reason: String,
    },
    ReconnectDue {
        timer: u64,
    },
}

/// Requests from manager handles
enum Command {
    Send {
        payload: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handle to the running connection manager
pub struct LiveConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    phase: watch::Receiver<ManagerPhase>,
    event_sender: broadcast::Sender<ConnectionEvent>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl LiveConnectionManager {
    /// Spawn the driver task. It immediately acts on the current session
    /// status, so an already authenticated session connects right away.
    pub fn start(
        settings: ManagerSettings,
        session: SessionState,
        store: DeviceStore,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(ManagerPhase::Idle);
        let (event_sender, _) = broadcast::channel(64);
        let cancel = CancellationToken::new();

        let session_rx = session.subscribe();
        let driver = Driver {
            machine: ConnectionMachine::new(),
            settings,
            session,
            reconciler: UpdateReconciler::new(store),
            factory,
            event_tx,
            phase_tx,
            event_sender: event_sender.clone(),
            connection_task: None,
            writer: None,
            staged: None,
            timer: None,
        };
        let handle = tokio::spawn(driver.run(session_rx, event_rx, command_rx, cancel.clone()));

        Self {
            commands: command_tx,
            phase: phase_rx,
            event_sender,
            cancel,
            driver: Mutex::new(Some(handle)),
        }
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> ManagerPhase {
        *self.phase.borrow()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.phase(), ManagerPhase::Open { .. })
    }

    /// Watch lifecycle phase changes
    pub fn subscribe_phase(&self) -> watch::Receiver<ManagerPhase> {
        self.phase.clone()
    }

    /// Subscribe to lifecycle notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_sender.subscribe()
    }

    /// Send a JSON message over the open socket
    pub async fn send(&self, payload: &Value) -> Result<()> {
        let payload = serde_json::to_string(payload)?;
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Send { payload, reply })
            .map_err(|_| RemoteError::NotConnected)?;
        response.await.map_err(|_| RemoteError::NotConnected)?
    }

    /// Close the connection, cancel any pending reconnect and stop the
    /// driver. Waits until teardown has finished.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        let handle = self.driver.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Connection driver ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for LiveConnectionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Driver
// ============================================================================

struct Driver {
    machine: ConnectionMachine,
    settings: ManagerSettings,
    session: SessionState,
    reconciler: UpdateReconciler,
    factory: Arc<dyn ConnectionFactory>,
    event_tx: mpsc::UnboundedSender<DriverEvent>,
    phase_tx: watch::Sender<ManagerPhase>,
    event_sender: broadcast::Sender<ConnectionEvent>,
    connection_task: Option<(u64, JoinHandle<()>)>,
    writer: Option<(u64, Box<dyn FrameWriter>)>,
    /// Writer of a socket that just opened, until the machine accepts it
    staged: Option<(u64, Box<dyn FrameWriter>)>,
    timer: Option<(u64, JoinHandle<()>)>,
}

impl Driver {
    async fn run(
        mut self,
        mut session_rx: watch::Receiver<SessionStatus>,
        mut event_rx: mpsc::UnboundedReceiver<DriverEvent>,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
    ) {
        let initial = *session_rx.borrow_and_update();
        self.dispatch(ManagerEvent::Session(initial)).await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = session_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = *session_rx.borrow_and_update();
                    self.dispatch(ManagerEvent::Session(status)).await;
                }
                Some(event) = event_rx.recv() => self.handle_driver_event(event).await,
                Some(command) = command_rx.recv() => self.handle_command(command).await,
            }
        }

        self.dispatch(ManagerEvent::Dispose).await;
        self.abort_tasks();
        info!("Live connection manager disposed");
        let _ = self.event_sender.send(ConnectionEvent::Disposed);
    }

    async fn handle_driver_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Opened { generation, writer } => {
                self.staged = Some((generation, writer));
                self.dispatch(ManagerEvent::Opened { generation }).await;
                if let Some((generation, mut writer)) = self.staged.take() {
                    debug!("Closing superseded connection {}", generation);
                    let limit = self.settings.connection_timeout;
                    if let Err(e) = bounded(limit, writer.close()).await {
                        debug!("Error closing superseded connection: {}", e);
                    }
                }
            }
            DriverEvent::Frame { generation, text } => {
                self.dispatch(ManagerEvent::Frame { generation, text }).await;
            }
            DriverEvent::Closed {
                generation,
                code,
                reason,
            } => {
                if self.machine.is_current(generation) {
                    info!(
                        "Live connection {} closed (code {:?}): {}",
                        generation, code, reason
                    );
                    let _ = self.event_sender.send(ConnectionEvent::Closed {
                        generation,
                        code,
                        reason,
                    });
                } else {
                    debug!("Ignoring close of stale connection {}", generation);
                }
                self.dispatch(ManagerEvent::Closed { generation, code }).await;
            }
            DriverEvent::ReconnectDue { timer } => {
                if self.timer.as_ref().is_some_and(|(id, _)| *id == timer) {
                    self.timer = None;
                }
                self.dispatch(ManagerEvent::ReconnectDue { timer }).await;
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send { payload, reply } => {
                let limit = self.settings.connection_timeout;
                let result = match (&mut self.writer, self.machine.phase()) {
                    (Some((current, writer)), ManagerPhase::Open { generation })
                        if *current == generation =>
                    {
                        bounded(limit, writer.send_text(&payload)).await
                    }
                    _ => Err(RemoteError::NotConnected),
                };
                let _ = reply.send(result);
            }
        }
    }

    async fn dispatch(&mut self, event: ManagerEvent) {
        let actions = self.machine.handle(event);
        for action in actions {
            self.execute(action).await;
        }
        self.phase_tx.send_replace(self.machine.phase());
    }

    async fn execute(&mut self, action: Action) {
        match action {
            Action::Connect { generation } => {
                if let Some((previous, handle)) = self.connection_task.take() {
                    debug!("Aborting connection task {}", previous);
                    handle.abort();
                }
                info!(
                    "Opening live connection {} to {}",
                    generation, self.settings.socket_url
                );
                let _ = self
                    .event_sender
                    .send(ConnectionEvent::Connecting { generation });
                let handle = spawn_connection_task(
                    generation,
                    self.settings.clone(),
                    self.factory.clone(),
                    self.event_tx.clone(),
                );
                self.connection_task = Some((generation, handle));
            }
            Action::SendJoin { generation } => {
                let Some((staged, mut writer)) = self.staged.take() else {
                    return;
                };
                if staged != generation {
                    self.staged = Some((staged, writer));
                    return;
                }
                info!("Live connection {} open", generation);
                let _ = self
                    .event_sender
                    .send(ConnectionEvent::Opened { generation });
                let join = join_message();
                let limit = self.settings.connection_timeout;
                if let Err(e) = bounded(limit, writer.send_text(&join)).await {
                    warn!("Failed to send join message: {}", e);
                }
                self.writer = Some((generation, writer));
            }
            Action::Reconcile { text } => {
                self.reconciler.reconcile(&text);
            }
            Action::Close { generation } => {
                let limit = self.settings.connection_timeout;
                for slot in [&mut self.writer, &mut self.staged] {
                    if slot.as_ref().is_some_and(|(id, _)| *id == generation) {
                        if let Some((_, mut writer)) = slot.take() {
                            if let Err(e) = bounded(limit, writer.close()).await {
                                debug!("Error closing connection {}: {}", generation, e);
                            }
                        }
                    }
                }
                if self
                    .connection_task
                    .as_ref()
                    .is_some_and(|(id, _)| *id == generation)
                {
                    if let Some((_, handle)) = self.connection_task.take() {
                        handle.abort();
                    }
                }
                debug!("Connection {} released", generation);
            }
            Action::ScheduleReconnect { timer } => {
                if let Some((_, handle)) = self.timer.take() {
                    handle.abort();
                }
                let delay = self.settings.reconnect_delay;
                info!("Reconnecting in {:?}", delay);
                let _ = self
                    .event_sender
                    .send(ConnectionEvent::ReconnectScheduled { delay });
                let handle = spawn_reconnect_timer(timer, delay, self.event_tx.clone());
                self.timer = Some((timer, handle));
            }
            Action::CancelReconnect { timer } => {
                if self.timer.as_ref().is_some_and(|(id, _)| *id == timer) {
                    if let Some((_, handle)) = self.timer.take() {
                        debug!("Cancelled pending reconnect");
                        handle.abort();
                    }
                }
            }
            Action::DemoteSession => {
                warn!("Backend rejected the live connection as unauthorized");
                let _ = self.event_sender.send(ConnectionEvent::Unauthorized);
                self.session.set(SessionStatus::Unauthenticated);
            }
        }
    }

    fn abort_tasks(&mut self) {
        if let Some((_, handle)) = self.connection_task.take() {
            handle.abort();
        }
        if let Some((_, handle)) = self.timer.take() {
            handle.abort();
        }
        self.writer = None;
        self.staged = None;
    }
}

/// Open a connection and forward everything it produces to the driver
fn spawn_connection_task(
    generation: u64,
    settings: ManagerSettings,
    factory: Arc<dyn ConnectionFactory>,
    events: mpsc::UnboundedSender<DriverEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ConnectionPair { mut reader, writer } = match factory
            .connect(
                &settings.socket_url,
                &settings.headers,
                settings.connection_timeout,
            )
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Live connection {} failed: {}", generation, e);
                let _ = events.send(DriverEvent::Closed {
                    generation,
                    code: None,
                    reason: e.to_string(),
                });
                return;
            }
        };

        if events
            .send(DriverEvent::Opened { generation, writer })
            .is_err()
        {
            return;
        }

        loop {
            match reader.read_frame().await {
                Ok(InboundFrame::Text(text)) => {
                    debug!("Received frame on connection {}: {}", generation, text);
                    if events.send(DriverEvent::Frame { generation, text }).is_err() {
                        return;
                    }
                }
                Ok(InboundFrame::Closed { code, reason }) => {
                    let _ = events.send(DriverEvent::Closed {
                        generation,
                        code,
                        reason,
                    });
                    return;
                }
                Err(e) => {
                    let _ = events.send(DriverEvent::Closed {
                        generation,
                        code: None,
                        reason: format!("Read error: {}", e),
                    });
                    return;
                }
            }
        }
    })
}

/// Bound a socket write so a peer that stops reading cannot stall the driver
async fn bounded<F>(limit: Duration, write: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    tokio::time::timeout(limit, write)
        .await
        .map_err(|_| RemoteError::Timeout(format!("Socket write exceeded {:?}", limit)))?
}

fn spawn_reconnect_timer(
    timer: u64,
    delay: Duration,
    events: mpsc::UnboundedSender<DriverEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = events.send(DriverEvent::ReconnectDue { timer });
    })
}
