//! Session status tracking
//!
//! The session status is the single source of truth that the live connection
//! manager derives its lifecycle from. It is published through a `watch`
//! channel so any number of readers can observe changes.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// The client's belief about its authentication with the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Initial value, before any verification ran
    Unset,
    Verifying,
    Unauthenticated,
    Authenticated,
}

impl SessionStatus {
    pub fn is_authenticated(self) -> bool {
        self == SessionStatus::Authenticated
    }

    /// Whether moving from `self` to `next` is a defined transition
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Unset, Verifying)
                | (Verifying, Authenticated)
                | (Verifying, Unauthenticated)
                | (Authenticated, Unauthenticated)
                | (Unauthenticated, Authenticated)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Unset => write!(f, "Unset"),
            SessionStatus::Verifying => write!(f, "Verifying"),
            SessionStatus::Unauthenticated => write!(f, "Unauthenticated"),
            SessionStatus::Authenticated => write!(f, "Authenticated"),
        }
    }
}

/// Shared handle to the session status
#[derive(Debug, Clone)]
pub struct SessionState {
    sender: Arc<watch::Sender<SessionStatus>>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    /// Create a session handle in the `Unset` state
    pub fn new() -> Self {
        let (sender, _) = watch::channel(SessionStatus::Unset);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Current status
    pub fn status(&self) -> SessionStatus {
        *self.sender.borrow()
    }

    /// Subscribe to status changes
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.sender.subscribe()
    }

    /// Move to `next`, returning true if the status changed.
    ///
    /// Setting the current value is a silent no-op. Undefined transitions
    /// (including any attempt to return to `Unset`) are ignored.
    pub fn set(&self, next: SessionStatus) -> bool {
        let mut previous = next;
        let changed = self.sender.send_if_modified(|current| {
            previous = *current;
            if *current == next || !current.can_transition_to(next) {
                return false;
            }
            *current = next;
            true
        });

        if changed {
            info!("Session status: {} -> {}", previous, next);
        } else if previous != next {
            warn!("Ignoring session transition {} -> {}", previous, next);
        }
        changed
    }

    /// Atomically move `Unset -> Verifying`.
    ///
    /// Returns true exactly once per session handle.
    pub fn begin_verification(&self) -> bool {
        let started = self.sender.send_if_modified(|current| {
            if *current != SessionStatus::Unset {
                return false;
            }
            *current = SessionStatus::Verifying;
            true
        });
        if started {
            debug!("Session verification started");
        }
        started
    }
}
