//! Home Remote - session and live-update client for a home remote-control backend
//!
//! Verifies the user's session against the backend, keeps a live socket open
//! while the session is authenticated, and folds the sensor and device
//! updates pushed over that socket into a shared [`DeviceState`].

pub mod client;
pub mod config;
pub mod error;
pub mod io;
pub mod machine;
pub mod manager;
pub mod reconciler;
pub mod request;
pub mod session;
pub mod store;
pub mod verifier;

pub use client::{RemoteClient, RemoteClientBuilder};
pub use config::{load_config, Config, ConnectionConfig, ServerConfig};
pub use error::{RemoteError, Result};
pub use machine::{ConnectionMachine, ManagerPhase};
pub use manager::{ConnectionEvent, LiveConnectionManager, ManagerSettings};
pub use reconciler::UpdateReconciler;
pub use request::{AuthenticatedClient, RequestOptions};
pub use session::{SessionState, SessionStatus};
pub use store::{DeviceCollection, DeviceRecord, DeviceState, DeviceStore, StateUpdate};
pub use verifier::SessionVerifier;
