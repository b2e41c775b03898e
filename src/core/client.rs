//! Builds VPN client invocations from profiles.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use secrecy::{ExposeSecret, SecretString};
use tempfile::NamedTempFile;

use crate::config::{ElevationMode, Settings};
use crate::constants;
use crate::core::classifier::OutputClassifier;
use crate::core::supervisor::LaunchSpec;
use crate::error::{Result, VpnError};
use crate::state::{ConnectionProfile, Endpoint, VpnKind};

/// A ready-to-launch client process and what it needs while it runs.
pub struct PreparedLaunch {
    pub spec: LaunchSpec,
    pub classifier: OutputClassifier,
    /// Credentials file read by the client. Deleted on drop, so it must
    /// outlive the connect attempt and nothing longer.
    pub auth_file: Option<NamedTempFile>,
}

/// Client binaries and how to elevate them.
#[derive(Debug, Clone)]
pub struct ClientCommands {
    pub openvpn_binary: String,
    pub ipsec_binary: String,
    pub openvpn_verbosity: u8,
    pub elevation: ElevationMode,
}

impl Default for ClientCommands {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl ClientCommands {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            openvpn_binary: settings.openvpn_binary.clone(),
            ipsec_binary: settings.ipsec_binary.clone(),
            openvpn_verbosity: settings.openvpn_verbosity,
            elevation: settings.elevation,
        }
    }

    /// Whether launching a client needs the elevated secret.
    #[must_use]
    pub fn needs_elevation(&self) -> bool {
        self.elevation.needs_sudo()
    }

    fn binary(&self, kind: VpnKind) -> &str {
        match kind {
            VpnKind::OpenVpn => &self.openvpn_binary,
            VpnKind::Ipsec => &self.ipsec_binary,
        }
    }

    /// Executable name of the client as it appears in the process table.
    #[must_use]
    pub fn process_name(&self, kind: VpnKind) -> String {
        let binary = self.binary(kind);
        Path::new(binary)
            .file_name()
            .map_or_else(|| binary.to_string(), |n| n.to_string_lossy().into_owned())
    }

    /// Writes the auth file and assembles the command line for `profile`.
    ///
    /// `secret` is handed to the elevation tool on stdin; it is required
    /// when [`Self::needs_elevation`] is true.
    ///
    /// # Errors
    ///
    /// - [`VpnError::Unsupported`] for IPsec profiles.
    /// - [`VpnError::NoCredentials`] when elevation is needed and `secret` is `None`.
    /// - [`VpnError::Spawn`] when the config file is missing or the auth file
    ///   cannot be written.
    pub fn prepare(
        &self,
        profile: &ConnectionProfile,
        secret: Option<&SecretString>,
    ) -> Result<PreparedLaunch> {
        let config_path = match &profile.endpoint {
            Endpoint::OpenVpn { config_path } => config_path,
            Endpoint::Ipsec { .. } => return Err(VpnError::Unsupported(VpnKind::Ipsec)),
        };

        let elevated = self.needs_elevation();
        if elevated && secret.is_none() {
            return Err(VpnError::NoCredentials);
        }

        if !config_path.is_file() {
            return Err(VpnError::Spawn {
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("config file not found: {}", config_path.display()),
                ),
            });
        }

        let auth_file = write_auth_file(&profile.username, &profile.password)
            .map_err(|source| VpnError::Spawn { source })?;

        let mut args: Vec<OsString> = vec![
            "--config".into(),
            config_path.into(),
            "--auth-user-pass".into(),
            auth_file.path().into(),
            "--verb".into(),
            self.openvpn_verbosity.to_string().into(),
        ];

        let program = if elevated {
            let mut wrapped: Vec<OsString> =
                vec!["-S".into(), "-p".into(), "".into(), self.openvpn_binary.clone().into()];
            wrapped.append(&mut args);
            args = wrapped;
            OsString::from(constants::SUDO_BINARY)
        } else {
            OsString::from(&self.openvpn_binary)
        };

        Ok(PreparedLaunch {
            spec: LaunchSpec {
                program,
                args,
                stdin_secret: if elevated { secret.cloned() } else { None },
                elevated,
            },
            classifier: OutputClassifier::openvpn(),
            auth_file: Some(auth_file),
        })
    }
}

/// `username\npassword\n` in an owner-only temp file.
fn write_auth_file(username: &str, password: &SecretString) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix(constants::AUTH_FILE_PREFIX)
        .tempfile()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    writeln!(file, "{username}")?;
    writeln!(file, "{}", password.expose_secret())?;
    file.flush()?;
    Ok(file)
}

/// The server named by the first `remote` directive of an `OpenVPN` config.
#[must_use]
pub fn parse_openvpn_remote(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| line.to_lowercase().starts_with("remote "))
        .find_map(|line| line.split_whitespace().nth(1).map(ToString::to_string))
}

/// Reads `path` and returns its `remote` server, if any.
///
/// # Errors
///
/// Returns [`VpnError::Io`] if the file cannot be read.
pub fn openvpn_remote(path: &Path) -> Result<Option<String>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| VpnError::io("failed to read OpenVPN config", PathBuf::from(path), e))?;
    Ok(parse_openvpn_remote(&content))
}

/// Result of probing one external binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolStatus {
    pub name: String,
    /// Could be executed at all.
    pub found: bool,
    pub version: Option<String>,
}

/// Probes the configured client binaries (and the elevation tool, when
/// used) with `--version`.
#[must_use]
pub fn check_client_binaries(commands: &ClientCommands) -> Vec<ToolStatus> {
    let mut tools = vec![commands.openvpn_binary.as_str(), commands.ipsec_binary.as_str()];
    if commands.needs_elevation() {
        tools.push(constants::SUDO_BINARY);
    }
    tools.into_iter().map(check_tool).collect()
}

fn check_tool(name: &str) -> ToolStatus {
    // openvpn --version exits non-zero; any output still counts.
    let output = Command::new(name)
        .arg("--version")
        .stdin(Stdio::null())
        .output();
    match output {
        Ok(output) => {
            let raw = if output.stdout.is_empty() {
                String::from_utf8_lossy(&output.stderr).into_owned()
            } else {
                String::from_utf8_lossy(&output.stdout).into_owned()
            };
            ToolStatus {
                name: name.to_string(),
                found: true,
                version: parse_version_line(&raw),
            }
        }
        Err(e) => {
            log::debug!("{name} --version failed: {e}");
            ToolStatus {
                name: name.to_string(),
                found: false,
                version: None,
            }
        }
    }
}

/// First version-looking token (`2.6.8`, `v1.0.2`) of the first line.
fn parse_version_line(raw: &str) -> Option<String> {
    let first_line = raw.lines().next()?.trim();
    first_line.split_whitespace().find_map(|token| {
        let t = token.strip_prefix('v').unwrap_or(token);
        if !(t.starts_with(|c: char| c.is_ascii_digit()) && t.contains('.')) {
            return None;
        }
        let clean: String = t
            .chars()
            .take_while(|c| *c == '.' || c.is_ascii_alphanumeric())
            .collect();
        (!clean.is_empty()).then_some(clean)
    })
}
