//! Application-wide constants and default configuration values.
//!
//! This module defines the static values used throughout vpn-toggle,
//! including timing defaults, file names, client binaries, and the output
//! markers the classifier looks for.

use std::time::Duration;

// === Application Metadata ===

/// Application name (from Cargo.toml).
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
/// Current application version (from Cargo.toml).
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

// === Timing Configuration ===

/// Wall-clock budget for a connect attempt to reach `Connected`.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Time a client gets to exit after the graceful stop signal.
pub const DEFAULT_GRACE_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound for a single blocking read on the client output.
pub const DEFAULT_READ_POLL: Duration = Duration::from_millis(250);
/// Interval between exit checks while waiting for a stopped process.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

// === Path Configuration ===

/// Name of the application directory under the user config dir.
pub const CONFIG_DIR_NAME: &str = "vpn-toggle";
/// Name of the settings file.
pub const SETTINGS_FILE_NAME: &str = "config.toml";
/// Name of the persisted connection record.
pub const STORE_FILE_NAME: &str = "connections.json";
/// Prefix for transient credential files.
pub const AUTH_FILE_PREFIX: &str = "vpn-toggle-auth-";

// === Client Binaries ===

/// Default `OpenVPN` client binary (resolved through `PATH`).
pub const DEFAULT_OPENVPN_BINARY: &str = "openvpn";
/// Default IPsec client binary (strongSwan front-end).
pub const DEFAULT_IPSEC_BINARY: &str = "ipsec";
/// Elevation tool used when not already running as root.
pub const SUDO_BINARY: &str = "sudo";
/// Process-matching kill tool used by the kill-by-name fallback.
pub const PKILL_BINARY: &str = "pkill";
/// Process lookup tool used to confirm a kill-by-name took effect.
pub const PGREP_BINARY: &str = "pgrep";
/// Default `OpenVPN` log verbosity passed with `--verb`.
pub const DEFAULT_OPENVPN_VERBOSITY: u8 = 4;

// === Diagnostics ===

/// Default number of output lines retained per connection.
pub const DEFAULT_DIAGNOSTICS_CAPACITY: usize = 200;
/// Lines of client output quoted when the client exits unexpectedly.
pub const EXIT_OUTPUT_LINES: usize = 10;
/// Longest output line kept; the rest of a longer line is dropped.
pub const MAX_OUTPUT_LINE_BYTES: usize = 8 * 1024;
/// Number of characters left visible on each side of a masked secret.
pub const MASK_VISIBLE_CHARS: usize = 4;

// === OpenVPN Output Markers ===

/// Tunnel is up.
pub const OVPN_COMPLETION_MARKERS: &[&str] = &["Initialization Sequence Completed"];
/// Server rejected the username/password.
pub const OVPN_AUTH_FAILED_MARKERS: &[&str] = &["AUTH_FAILED"];
/// sudo rejected the elevated secret.
pub const ELEVATION_REJECTED_MARKERS: &[&str] =
    &["incorrect password attempt", "Sorry, try again"];
/// Client gave up for a reason other than credentials.
pub const OVPN_FATAL_MARKERS: &[&str] = &[
    "Exiting due to fatal error",
    "Options error",
    "Cannot open TUN/TAP dev",
    "Permission denied",
];
/// Server asked for additional authentication.
pub const OVPN_PENDING_AUTH_MARKERS: &[&str] = &["PENDING"];
/// Transport is being set up.
pub const OVPN_CONNECTING_MARKERS: &[&str] = &[
    "Attempting to establish TCP connection",
    "UDP link remote",
    "TCP connection established",
];

// === Messages ===

pub const MSG_CONNECTING: &str = "Connecting to ";
pub const MSG_CONNECTED: &str = "Connected to ";
pub const MSG_DISCONNECTED: &str = "Disconnected from ";
pub const MSG_NO_PROFILES: &str = "No VPN profiles configured";
pub const MSG_PRESS_ENTER: &str = "Press [Enter] to disconnect";
pub const PROMPT_ELEVATED_SECRET: &str = "Elevation (sudo) password: ";
pub const PROMPT_VPN_PASSWORD: &str = "VPN password: ";
pub const PROMPT_SHARED_SECRET: &str = "IPsec shared secret: ";
