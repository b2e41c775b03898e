//! Profile persistence and elevated-secret cache.
//!
//! The connection record on disk is the single source of truth for
//! profiles: every mutation loads it, applies the change, and writes it back
//! atomically. The elevated secret lives only in memory.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Result, VpnError};
use crate::state::ConnectionProfile;

/// Source of the elevated secret when none is cached (a password dialog,
/// a terminal prompt, a keyring lookup).
pub trait SecretPrompt: Send + Sync {
    /// Returns `None` when the user cancels.
    fn prompt(&self) -> Option<SecretString>;
}

impl<F> SecretPrompt for F
where
    F: Fn() -> Option<SecretString> + Send + Sync,
{
    fn prompt(&self) -> Option<SecretString> {
        self()
    }
}

#[derive(Default, Serialize, Deserialize)]
struct StoreRecord {
    #[serde(default)]
    connections: Vec<ConnectionProfile>,
    /// Written by older versions; read so the file still parses, never written back.
    #[serde(default, skip_serializing)]
    sudo_password: Option<String>,
}

pub struct CredentialStore {
    path: PathBuf,
    prompt: Box<dyn SecretPrompt>,
    elevated: RwLock<Option<SecretString>>,
    /// Serializes prompting so concurrent connects ask only once.
    prompt_lock: Mutex<()>,
    /// Serializes load-modify-save cycles.
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>, prompt: impl SecretPrompt + 'static) -> Self {
        Self {
            path: path.into(),
            prompt: Box::new(prompt),
            elevated: RwLock::new(None),
            prompt_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every stored profile. A missing record is an empty list.
    ///
    /// # Errors
    ///
    /// [`VpnError::Io`] if the record exists but cannot be read or parsed.
    pub fn load_profiles(&self) -> Result<Vec<ConnectionProfile>> {
        Ok(self.load_record()?.connections)
    }

    fn load_record(&self) -> Result<StoreRecord> {
        if !self.path.exists() {
            return Ok(StoreRecord::default());
        }
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| VpnError::io("failed to read connection record", &self.path, e))?;
        let record: StoreRecord = serde_json::from_str(&content).map_err(|e| {
            VpnError::io(
                "failed to parse connection record",
                &self.path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;
        if record.sudo_password.is_some() {
            log::warn!(
                "STORE: ignoring persisted elevation password in {}; it will be removed on next save",
                self.path.display()
            );
        }
        Ok(record)
    }

    /// Atomically replaces the record with `profiles`.
    ///
    /// The new content is written to a sibling temp file (owner-only on
    /// Unix), synced, and renamed over the old record, so a failed save
    /// leaves the previous record untouched.
    ///
    /// # Errors
    ///
    /// [`VpnError::Io`] on any write failure.
    pub fn save_profiles(&self, profiles: &[ConnectionProfile]) -> Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)
            .map_err(|e| VpnError::io("failed to create record directory", &parent, e))?;

        let record = StoreRecord {
            connections: profiles.to_vec(),
            sudo_password: None,
        };
        let json = serde_json::to_vec_pretty(&record).map_err(|e| {
            VpnError::io(
                "failed to encode connection record",
                &self.path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(&parent)
            .map_err(|e| VpnError::io("failed to create temp record", &parent, e))?;
        let write = |file: &mut tempfile::NamedTempFile| -> std::io::Result<()> {
            file.write_all(&json)?;
            file.write_all(b"\n")?;
            file.as_file().sync_all()
        };
        write(&mut tmp)
            .map_err(|e| VpnError::io("failed to write connection record", tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| VpnError::io("failed to replace connection record", &self.path, e.error))?;

        log::debug!("STORE: saved {} profile(s) to {}", profiles.len(), self.path.display());
        Ok(())
    }

    /// Looks up one profile by name.
    ///
    /// # Errors
    ///
    /// [`VpnError::UnknownProfile`] if absent, or a load error.
    pub fn profile(&self, name: &str) -> Result<ConnectionProfile> {
        self.load_profiles()?
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| VpnError::UnknownProfile(name.to_string()))
    }

    /// Appends a new profile.
    ///
    /// # Errors
    ///
    /// [`VpnError::InvalidProfile`], [`VpnError::DuplicateProfile`], or I/O.
    pub fn add_profile(&self, profile: ConnectionProfile) -> Result<()> {
        check_usable(&profile)?;
        self.mutate(|profiles| {
            if profiles.iter().any(|p| p.name == profile.name) {
                return Err(VpnError::DuplicateProfile(profile.name.clone()));
            }
            profiles.push(profile);
            Ok(())
        })
    }

    /// Replaces the profile called `old_name`, keeping its position.
    ///
    /// # Errors
    ///
    /// [`VpnError::UnknownProfile`], [`VpnError::DuplicateProfile`] when a
    /// rename collides, [`VpnError::InvalidProfile`], or I/O.
    pub fn update_profile(&self, old_name: &str, profile: ConnectionProfile) -> Result<()> {
        check_usable(&profile)?;
        self.mutate(|profiles| {
            if profile.name != old_name && profiles.iter().any(|p| p.name == profile.name) {
                return Err(VpnError::DuplicateProfile(profile.name.clone()));
            }
            let slot = profiles
                .iter_mut()
                .find(|p| p.name == old_name)
                .ok_or_else(|| VpnError::UnknownProfile(old_name.to_string()))?;
            *slot = profile;
            Ok(())
        })
    }

    /// Deletes the profile called `name`.
    ///
    /// # Errors
    ///
    /// [`VpnError::UnknownProfile`] or I/O.
    pub fn remove_profile(&self, name: &str) -> Result<()> {
        self.mutate(|profiles| {
            let before = profiles.len();
            profiles.retain(|p| p.name != name);
            if profiles.len() == before {
                return Err(VpnError::UnknownProfile(name.to_string()));
            }
            Ok(())
        })
    }

    fn mutate<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<ConnectionProfile>) -> Result<()>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut profiles = self.load_profiles()?;
        apply(&mut profiles)?;
        self.save_profiles(&profiles)
    }

    /// Returns the cached elevated secret, prompting once if none is cached.
    ///
    /// Returns `None` when the prompt is cancelled; nothing is cached then.
    pub fn elevated_secret(&self) -> Option<SecretString> {
        if let Some(secret) = self.cached_secret() {
            return Some(secret);
        }

        let _guard = self.prompt_lock.lock().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have prompted while we waited.
        if let Some(secret) = self.cached_secret() {
            return Some(secret);
        }

        let secret = self.prompt.prompt()?;
        if secret.expose_secret().is_empty() {
            return None;
        }
        *self.elevated.write().unwrap_or_else(PoisonError::into_inner) = Some(secret.clone());
        Some(secret)
    }

    /// The cached secret, without prompting.
    pub fn cached_secret(&self) -> Option<SecretString> {
        self.elevated
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drops the cached secret so the next request prompts again.
    pub fn forget_elevated_secret(&self) {
        *self.elevated.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

fn check_usable(profile: &ConnectionProfile) -> Result<()> {
    profile
        .validate()
        .map_err(|reason| VpnError::InvalidProfile {
            name: profile.name.clone(),
            reason,
        })
}

/// Masks a secret for display, keeping the first and last few characters of
/// long values. Short values are fully masked.
#[must_use]
pub fn mask_secret(secret: &str) -> String {
    let visible = constants::MASK_VISIBLE_CHARS;
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= visible * 2 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..visible].iter().collect();
    let tail: String = chars[chars.len() - visible..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(chars.len() - visible * 2))
}
