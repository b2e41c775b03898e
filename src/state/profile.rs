//! VPN profile and kind types.

use std::path::PathBuf;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Supported VPN client families.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnKind {
    /// `OpenVPN`, driven by a client configuration file.
    #[default]
    #[serde(rename = "openvpn", alias = "OpenVPN")]
    OpenVpn,
    /// IPsec/IKEv2, driven by a server address and shared secret.
    #[serde(rename = "ipsec", alias = "IPSec")]
    Ipsec,
}

impl std::fmt::Display for VpnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VpnKind::OpenVpn => write!(f, "OpenVPN"),
            VpnKind::Ipsec => write!(f, "IPsec"),
        }
    }
}

/// Where a profile connects to.
#[derive(Clone, Debug)]
pub enum Endpoint {
    /// Path to an `.ovpn` client configuration.
    OpenVpn { config_path: PathBuf },
    /// IPsec gateway address plus pre-shared key.
    Ipsec {
        server: String,
        shared_secret: SecretString,
    },
}

/// A named VPN connection configuration.
///
/// `Debug` output never contains the password or shared secret.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "ProfileRecord", into = "ProfileRecord")]
pub struct ConnectionProfile {
    /// Unique display name, also used as the connection id.
    pub name: String,
    /// Connection target.
    pub endpoint: Endpoint,
    /// VPN account name.
    pub username: String,
    /// VPN account password.
    pub password: SecretString,
}

impl ConnectionProfile {
    pub fn openvpn(
        name: impl Into<String>,
        config_path: impl Into<PathBuf>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: Endpoint::OpenVpn {
                config_path: config_path.into(),
            },
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    pub fn ipsec(
        name: impl Into<String>,
        server: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        shared_secret: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: Endpoint::Ipsec {
                server: server.into(),
                shared_secret: SecretString::from(shared_secret.into()),
            },
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    #[must_use]
    pub fn kind(&self) -> VpnKind {
        match self.endpoint {
            Endpoint::OpenVpn { .. } => VpnKind::OpenVpn,
            Endpoint::Ipsec { .. } => VpnKind::Ipsec,
        }
    }

    /// Human-readable connection target (config path or server).
    #[must_use]
    pub fn target(&self) -> String {
        match &self.endpoint {
            Endpoint::OpenVpn { config_path } => config_path.display().to_string(),
            Endpoint::Ipsec { server, .. } => server.clone(),
        }
    }

    /// Checks that every field the profile's kind needs is filled in.
    ///
    /// # Errors
    ///
    /// Returns a description of the first missing field.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name is empty".to_string());
        }
        match &self.endpoint {
            Endpoint::OpenVpn { config_path } => {
                if config_path.as_os_str().is_empty() {
                    return Err("config_path is empty".to_string());
                }
            }
            Endpoint::Ipsec {
                server,
                shared_secret,
            } => {
                if server.trim().is_empty() {
                    return Err("server is empty".to_string());
                }
                if shared_secret.expose_secret().is_empty() {
                    return Err("shared_secret is empty".to_string());
                }
            }
        }
        if self.username.is_empty() {
            return Err("username is empty".to_string());
        }
        if self.password.expose_secret().is_empty() {
            return Err("password is empty".to_string());
        }
        Ok(())
    }
}

/// On-disk shape of a profile. Records written before `kind` existed
/// default to `OpenVPN`.
#[derive(Serialize, Deserialize)]
struct ProfileRecord {
    name: String,
    #[serde(default)]
    kind: VpnKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    config_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    server: Option<String>,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    shared_secret: Option<String>,
}

impl From<ProfileRecord> for ConnectionProfile {
    fn from(record: ProfileRecord) -> Self {
        let endpoint = match record.kind {
            VpnKind::OpenVpn => Endpoint::OpenVpn {
                config_path: record.config_path.unwrap_or_default(),
            },
            VpnKind::Ipsec => Endpoint::Ipsec {
                server: record.server.unwrap_or_default(),
                shared_secret: SecretString::from(record.shared_secret.unwrap_or_default()),
            },
        };
        Self {
            name: record.name,
            endpoint,
            username: record.username,
            password: SecretString::from(record.password),
        }
    }
}

impl From<ConnectionProfile> for ProfileRecord {
    fn from(profile: ConnectionProfile) -> Self {
        let kind = profile.kind();
        let (config_path, server, shared_secret) = match profile.endpoint {
            Endpoint::OpenVpn { config_path } => (Some(config_path), None, None),
            Endpoint::Ipsec {
                server,
                shared_secret,
            } => (
                None,
                Some(server),
                Some(shared_secret.expose_secret().to_string()),
            ),
        };
        Self {
            name: profile.name,
            kind,
            config_path,
            server,
            username: profile.username,
            password: profile.password.expose_secret().to_string(),
            shared_secret,
        }
    }
}
