//! User settings loaded from `config.toml`.
//!
//! Every field has a default, so a missing file or a partial file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Result, VpnError};

/// How client processes obtain administrative privileges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElevationMode {
    /// `sudo` unless already running as root.
    #[default]
    Auto,
    /// Always wrap the client in `sudo -S`.
    Sudo,
    /// Run the client directly.
    None,
}

impl ElevationMode {
    /// Resolves `Auto` against the current effective user.
    #[must_use]
    pub fn needs_sudo(self) -> bool {
        match self {
            Self::Auto => !is_root(),
            Self::Sudo => true,
            Self::None => false,
        }
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub connect_timeout_secs: u64,
    pub grace_timeout_secs: u64,
    pub read_poll_ms: u64,
    pub openvpn_binary: String,
    pub ipsec_binary: String,
    pub openvpn_verbosity: u8,
    pub elevation: ElevationMode,
    pub diagnostics_capacity: usize,
    /// Overrides the default location of `connections.json`.
    pub store_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: constants::DEFAULT_CONNECT_TIMEOUT.as_secs(),
            grace_timeout_secs: constants::DEFAULT_GRACE_TIMEOUT.as_secs(),
            #[allow(clippy::cast_possible_truncation)]
            read_poll_ms: constants::DEFAULT_READ_POLL.as_millis() as u64,
            openvpn_binary: constants::DEFAULT_OPENVPN_BINARY.to_string(),
            ipsec_binary: constants::DEFAULT_IPSEC_BINARY.to_string(),
            openvpn_verbosity: constants::DEFAULT_OPENVPN_VERBOSITY,
            elevation: ElevationMode::Auto,
            diagnostics_capacity: constants::DEFAULT_DIAGNOSTICS_CAPACITY,
            store_path: None,
        }
    }
}

impl Settings {
    /// Loads settings from `path`, falling back to defaults when the file
    /// does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`VpnError::Io`] if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("no settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| VpnError::io("failed to read settings", path, e))?;
        Self::from_toml(&content).map_err(|e| {
            VpnError::io(
                "failed to parse settings",
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })
    }

    /// Parses settings from TOML text.
    ///
    /// # Errors
    ///
    /// Returns the TOML decode error.
    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn grace_timeout(&self) -> Duration {
        Duration::from_secs(self.grace_timeout_secs)
    }

    #[must_use]
    pub fn read_poll(&self) -> Duration {
        Duration::from_millis(self.read_poll_ms.max(1))
    }

    /// Resolved location of the connection record.
    ///
    /// # Errors
    ///
    /// Fails when no user config directory can be determined.
    pub fn resolved_store_path(&self) -> Result<PathBuf> {
        match &self.store_path {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join(constants::STORE_FILE_NAME)),
        }
    }
}

/// `<user config dir>/vpn-toggle`.
///
/// # Errors
///
/// Fails when the platform has no user config directory.
pub fn config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join(constants::CONFIG_DIR_NAME))
        .ok_or_else(|| {
            VpnError::io(
                "failed to resolve config directory",
                PathBuf::new(),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            )
        })
}

/// Default settings file location.
///
/// # Errors
///
/// Fails when the platform has no user config directory.
pub fn default_settings_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(constants::SETTINGS_FILE_NAME))
}
