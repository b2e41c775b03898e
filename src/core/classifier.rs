//! Line classifier for VPN client output.
//!
//! Each line is matched on its own against a fixed-priority list of marker
//! groups; there is no state carried between lines.

use std::collections::VecDeque;

use crate::constants;

/// Lifecycle event inferred from one line of client output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    NoEvent,
    BecameConnecting,
    BecameAuthenticating,
    BecameConnected,
    AuthFailed,
    /// The elevation tool rejected the secret on stdin.
    ElevationRejected,
    FatalError,
}

/// Substrings that identify each event for one client family.
#[derive(Debug, Clone, Default)]
pub struct MarkerSet {
    pub completion: Vec<String>,
    pub auth_failed: Vec<String>,
    pub elevation_rejected: Vec<String>,
    pub fatal: Vec<String>,
    pub pending_auth: Vec<String>,
    pub connecting: Vec<String>,
}

fn owned(markers: &[&str]) -> Vec<String> {
    markers.iter().map(ToString::to_string).collect()
}

impl MarkerSet {
    /// Markers printed by the `OpenVPN` 2.x client (and `sudo` in front of it).
    #[must_use]
    pub fn openvpn() -> Self {
        Self {
            completion: owned(constants::OVPN_COMPLETION_MARKERS),
            auth_failed: owned(constants::OVPN_AUTH_FAILED_MARKERS),
            elevation_rejected: owned(constants::ELEVATION_REJECTED_MARKERS),
            fatal: owned(constants::OVPN_FATAL_MARKERS),
            pending_auth: owned(constants::OVPN_PENDING_AUTH_MARKERS),
            connecting: owned(constants::OVPN_CONNECTING_MARKERS),
        }
    }

    /// Groups in the order they are checked.
    fn prioritized(&self) -> [(&[String], Classification); 6] {
        [
            (self.completion.as_slice(), Classification::BecameConnected),
            (self.auth_failed.as_slice(), Classification::AuthFailed),
            (self.elevation_rejected.as_slice(), Classification::ElevationRejected),
            (self.fatal.as_slice(), Classification::FatalError),
            (self.pending_auth.as_slice(), Classification::BecameAuthenticating),
            (self.connecting.as_slice(), Classification::BecameConnecting),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct OutputClassifier {
    markers: MarkerSet,
}

impl OutputClassifier {
    #[must_use]
    pub fn new(markers: MarkerSet) -> Self {
        Self { markers }
    }

    #[must_use]
    pub fn openvpn() -> Self {
        Self::new(MarkerSet::openvpn())
    }

    /// Classifies one line by case-sensitive substring containment.
    ///
    /// Terminal outcomes win over transient ones when a line carries both:
    /// completion, auth failure, elevation rejection, fatal error, pending
    /// auth, connecting.
    #[must_use]
    pub fn classify(&self, line: &str) -> Classification {
        if line.is_empty() {
            return Classification::NoEvent;
        }
        self.markers
            .prioritized()
            .into_iter()
            .find(|(markers, _)| markers.iter().any(|m| line.contains(m.as_str())))
            .map_or(Classification::NoEvent, |(_, event)| event)
    }
}

impl Default for OutputClassifier {
    fn default() -> Self {
        Self::openvpn()
    }
}

/// Bounded history of recent client output, oldest first.
#[derive(Debug, Clone)]
pub struct DiagnosticsBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl DiagnosticsBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// The most recent `n` lines, newline-joined.
    #[must_use]
    pub fn tail(&self, n: usize) -> String {
        let skip = self.lines.len().saturating_sub(n);
        self.lines
            .iter()
            .skip(skip)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
