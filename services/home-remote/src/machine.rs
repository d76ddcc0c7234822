//! Live connection state machine
//!
//! [`ConnectionMachine`] decides what the connection manager should do in
//! response to each event. It performs no I/O: every decision comes back as a
//! list of [`Action`]s for the driver to execute, which keeps the lifecycle
//! rules testable without a socket.
//!
//! Each connection attempt is tagged with a generation number and each
//! reconnect timer with a timer id. Events carry the tag they were created
//! for, and anything that does not match the current attempt is discarded.

use serde::{Deserialize, Serialize};

use crate::session::SessionStatus;

/// Close code the backend uses to reject an unauthorized client
pub const UNAUTHORIZED_CLOSE_CODE: u16 = 1003;

/// Where the manager currently is in the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ManagerPhase {
    /// No connection and nothing scheduled
    Idle,
    Connecting { generation: u64 },
    Open { generation: u64 },
    /// A dropped connection will be retried when `timer` fires
    ReconnectScheduled { timer: u64 },
    /// Disposed; no further connections will be made
    Closed,
}

impl ManagerPhase {
    /// Connecting or open
    pub fn is_alive(self) -> bool {
        matches!(
            self,
            ManagerPhase::Connecting { .. } | ManagerPhase::Open { .. }
        )
    }

    /// Generation of the alive connection, if any
    pub fn generation(self) -> Option<u64> {
        match self {
            ManagerPhase::Connecting { generation } | ManagerPhase::Open { generation } => {
                Some(generation)
            }
            _ => None,
        }
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    Session(SessionStatus),
    Opened { generation: u64 },
    Frame { generation: u64, text: String },
    Closed { generation: u64, code: Option<u16> },
    ReconnectDue { timer: u64 },
    Dispose,
}

/// Side effects requested by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Connect { generation: u64 },
    SendJoin { generation: u64 },
    Reconcile { text: String },
    /// Close the connection and forget every reference to it
    Close { generation: u64 },
    ScheduleReconnect { timer: u64 },
    CancelReconnect { timer: u64 },
    DemoteSession,
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    phase: ManagerPhase,
    session: SessionStatus,
    last_generation: u64,
    last_timer: u64,
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMachine {
    pub fn new() -> Self {
        Self {
            phase: ManagerPhase::Idle,
            session: SessionStatus::Unset,
            last_generation: 0,
            last_timer: 0,
        }
    }

    pub fn phase(&self) -> ManagerPhase {
        self.phase
    }

    pub fn session(&self) -> SessionStatus {
        self.session
    }

    /// Whether `generation` is the connection currently connecting or open
    pub fn is_current(&self, generation: u64) -> bool {
        self.phase.generation() == Some(generation)
    }

    pub fn handle(&mut self, event: ManagerEvent) -> Vec<Action> {
        if self.phase == ManagerPhase::Closed {
            return Vec::new();
        }

        match event {
            ManagerEvent::Session(status) => {
                self.session = status;
                if status.is_authenticated() {
                    self.open_if_idle()
                } else {
                    self.teardown()
                }
            }
            ManagerEvent::Opened { generation } => match self.phase {
                ManagerPhase::Connecting { generation: current } if current == generation => {
                    self.phase = ManagerPhase::Open { generation };
                    vec![Action::SendJoin { generation }]
                }
                _ if self.is_current(generation) => Vec::new(),
                // superseded while the handshake was in flight
                _ => vec![Action::Close { generation }],
            },
            ManagerEvent::Frame { generation, text } => {
                if self.phase == (ManagerPhase::Open { generation }) {
                    vec![Action::Reconcile { text }]
                } else {
                    Vec::new()
                }
            }
            ManagerEvent::Closed { generation, code } => {
                if !self.is_current(generation) {
                    return Vec::new();
                }
                self.phase = ManagerPhase::Idle;
                let mut actions = vec![Action::Close { generation }];
                if code == Some(UNAUTHORIZED_CLOSE_CODE) {
                    self.session = SessionStatus::Unauthenticated;
                    actions.push(Action::DemoteSession);
                } else if self.session.is_authenticated() {
                    actions.push(self.schedule_reconnect());
                }
                actions
            }
            ManagerEvent::ReconnectDue { timer } => {
                if self.phase != (ManagerPhase::ReconnectScheduled { timer }) {
                    return Vec::new();
                }
                self.phase = ManagerPhase::Idle;
                if self.session.is_authenticated() {
                    vec![self.connect()]
                } else {
                    Vec::new()
                }
            }
            ManagerEvent::Dispose => {
                let actions = self.teardown();
                self.phase = ManagerPhase::Closed;
                actions
            }
        }
    }

    fn open_if_idle(&mut self) -> Vec<Action> {
        match self.phase {
            ManagerPhase::Idle => vec![self.connect()],
            ManagerPhase::ReconnectScheduled { timer } => {
                vec![Action::CancelReconnect { timer }, self.connect()]
            }
            ManagerPhase::Connecting { .. } | ManagerPhase::Open { .. } | ManagerPhase::Closed => {
                Vec::new()
            }
        }
    }

    fn teardown(&mut self) -> Vec<Action> {
        match self.phase {
            ManagerPhase::Connecting { generation } | ManagerPhase::Open { generation } => {
                self.phase = ManagerPhase::Idle;
                vec![Action::Close { generation }]
            }
            ManagerPhase::ReconnectScheduled { timer } => {
                self.phase = ManagerPhase::Idle;
                vec![Action::CancelReconnect { timer }]
            }
            ManagerPhase::Idle | ManagerPhase::Closed => Vec::new(),
        }
    }

    fn connect(&mut self) -> Action {
        self.last_generation += 1;
        let generation = self.last_generation;
        self.phase = ManagerPhase::Connecting { generation };
        Action::Connect { generation }
    }

    fn schedule_reconnect(&mut self) -> Action {
        self.last_timer += 1;
        let timer = self.last_timer;
        self.phase = ManagerPhase::ReconnectScheduled { timer };
        Action::ScheduleReconnect { timer }
    }
}
