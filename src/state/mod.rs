//! Profile and connection state types shared across the core.

mod connection;
mod profile;

pub use connection::{ConnectionRecord, ConnectionState};
pub use profile::{ConnectionProfile, Endpoint, VpnKind};
