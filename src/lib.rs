//! Stores VPN connection profiles and toggles them by supervising the
//! external VPN client process for each connection.
//!
//! [`core::controller::ConnectionController`] is the entry point; UIs
//! register a [`core::observer::ConnectionObserver`] and call `connect` /
//! `disconnect` by profile name.

pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod logger;
pub mod state;

pub use crate::core::controller::{ConnectionController, ControllerOptions};
pub use crate::core::observer::ConnectionObserver;
pub use crate::core::store::{CredentialStore, SecretPrompt};
pub use crate::core::supervisor::ProcessSupervisor;
pub use crate::error::{ErrorKind, Result, VpnError};
pub use crate::state::{ConnectionProfile, ConnectionState, VpnKind};
