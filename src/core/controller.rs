//! Connection lifecycle orchestration.
//!
//! Each profile id gets a [`Slot`] with two locks:
//!
//! - `lifecycle` serializes `connect` and `disconnect` for that id. `connect`
//!   only tries it and rejects when busy; `disconnect` waits for it.
//! - `state` guards the state machine and is shared with the monitor thread.
//!
//! A connect attempt hands the launched process to a monitor thread that
//! reads client output with a bounded wait, classifies every line and drives
//! the state machine. Disconnect raises the attempt's cancel flag under the
//! state lock, joins the monitor, and only then terminates the process, so
//! no classification can land after a disconnect has begun.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;

use crate::config::Settings;
use crate::constants;
use crate::core::classifier::{Classification, DiagnosticsBuffer, OutputClassifier};
use crate::core::client::ClientCommands;
use crate::core::observer::{ConnectionObserver, Notifier};
use crate::core::store::CredentialStore;
use crate::core::supervisor::{ProcessHandle, ProcessSupervisor, ReadOutcome, Termination};
use crate::error::{ErrorKind, Result, VpnError};
use crate::state::{ConnectionRecord, ConnectionState, VpnKind};

/// Timing and buffering knobs for the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    /// Wall-clock budget for reaching `Connected`.
    pub connect_timeout: Duration,
    /// How long a stop signal may take before the process is force-killed.
    pub grace_timeout: Duration,
    /// Upper bound on a single output read.
    pub read_poll: Duration,
    /// Lines of client output kept per connection.
    pub diagnostics_capacity: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            connect_timeout: constants::DEFAULT_CONNECT_TIMEOUT,
            grace_timeout: constants::DEFAULT_GRACE_TIMEOUT,
            read_poll: constants::DEFAULT_READ_POLL,
            diagnostics_capacity: constants::DEFAULT_DIAGNOSTICS_CAPACITY,
        }
    }
}

impl From<&Settings> for ControllerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            grace_timeout: settings.grace_timeout(),
            read_poll: settings.read_poll(),
            diagnostics_capacity: settings.diagnostics_capacity,
        }
    }
}

struct SlotState {
    state: ConnectionState,
    record: Option<ConnectionRecord>,
    /// Cancel flag of the current (or last) attempt.
    cancel: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
    diagnostics: DiagnosticsBuffer,
}

struct Slot {
    id: String,
    lifecycle: Mutex<()>,
    state: Mutex<SlotState>,
}

impl Slot {
    fn new(id: &str, diagnostics_capacity: usize) -> Self {
        Self {
            id: id.to_string(),
            lifecycle: Mutex::new(()),
            state: Mutex::new(SlotState {
                state: ConnectionState::Disconnected,
                record: None,
                cancel: Arc::new(AtomicBool::new(false)),
                monitor: None,
                diagnostics: DiagnosticsBuffer::new(diagnostics_capacity),
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Shared {
    store: Arc<CredentialStore>,
    supervisor: ProcessSupervisor,
    commands: ClientCommands,
    options: ControllerOptions,
    notifier: Notifier,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl Shared {
    fn slot(&self, id: &str) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            slots
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Slot::new(id, self.options.diagnostics_capacity))),
        )
    }

    fn existing_slot(&self, id: &str) -> Option<Arc<Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn all_slots(&self) -> Vec<Arc<Slot>> {
        let mut slots: Vec<_> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        slots.sort_by(|a, b| a.id.cmp(&b.id));
        slots
    }

    /// Applies a transition and notifies observers if the state changed.
    /// Callers hold the slot's state lock, which keeps notifications for
    /// one id in transition order.
    fn set_state(&self, slot: &Slot, st: &mut SlotState, next: ConnectionState) {
        if st.state == next {
            return;
        }
        log::info!("VPN: '{}' {} -> {next}", slot.id, st.state);
        st.state = next;
        if let Some(record) = st.record.as_mut() {
            record.state = next;
        }
        self.notifier.state_changed(&slot.id, next);
    }

    /// Kill-by-name fallback for a client that survived termination.
    fn kill_clients_with_cached_secret(&self) -> Result<()> {
        let secret = if self.commands.needs_elevation() {
            self.store.cached_secret()
        } else {
            None
        };
        self.supervisor.kill_all_by_name(
            &self.commands.process_name(VpnKind::OpenVpn),
            secret.as_ref(),
        )
    }
}

/// Runs connect/disconnect for every profile and tracks their state.
///
/// Dropping the controller disconnects everything it started.
pub struct ConnectionController {
    shared: Arc<Shared>,
}

impl ConnectionController {
    pub fn new(
        store: Arc<CredentialStore>,
        supervisor: ProcessSupervisor,
        commands: ClientCommands,
        options: ControllerOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                supervisor,
                commands,
                options,
                notifier: Notifier::new(),
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registers an observer for every later state change and error.
    pub fn subscribe(&self, observer: Arc<dyn ConnectionObserver>) {
        self.shared.notifier.subscribe(observer);
    }

    /// Blocks until all notifications queued so far have been delivered.
    pub fn flush_notifications(&self) {
        self.shared.notifier.flush();
    }

    #[must_use]
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.shared.supervisor
    }

    #[must_use]
    pub fn store(&self) -> &CredentialStore {
        &self.shared.store
    }

    /// Starts connecting the profile named `id` and returns once the client
    /// process is running; progress is reported to observers.
    ///
    /// # Errors
    ///
    /// - [`VpnError::AlreadyConnected`] if `id` is not `Disconnected` or
    ///   another lifecycle operation for it is in flight.
    /// - [`VpnError::NoCredentials`] if the elevated secret is unavailable
    ///   (also reported to observers; the state stays `Disconnected`).
    /// - [`VpnError::Spawn`] if the client could not be started (the state
    ///   returns to `Disconnected`).
    /// - Profile lookup errors from the store.
    pub fn connect(&self, id: &str) -> Result<()> {
        let shared = &self.shared;
        let profile = shared.store.profile(id)?;
        profile
            .validate()
            .map_err(|reason| VpnError::InvalidProfile {
                name: profile.name.clone(),
                reason,
            })?;
        if profile.kind() != VpnKind::OpenVpn {
            return Err(VpnError::Unsupported(profile.kind()));
        }

        let slot = shared.slot(id);
        let _lifecycle = match slot.lifecycle.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Err(VpnError::AlreadyConnected(id.to_string()));
            }
        };

        let finished_monitor = {
            let mut st = slot.lock_state();
            if st.state != ConnectionState::Disconnected || st.record.is_some() {
                return Err(VpnError::AlreadyConnected(id.to_string()));
            }
            st.monitor.take()
        };
        if let Some(monitor) = finished_monitor {
            let _ = monitor.join();
        }

        let secret = if shared.commands.needs_elevation() {
            let Some(secret) = shared.store.elevated_secret() else {
                log::warn!("VPN: no elevated secret for '{id}'");
                let err = VpnError::NoCredentials;
                shared.notifier.error(id, err.kind(), err.to_string());
                return Err(err);
            };
            Some(secret)
        } else {
            None
        };

        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut st = slot.lock_state();
            st.cancel = Arc::clone(&cancel);
            st.diagnostics = DiagnosticsBuffer::new(shared.options.diagnostics_capacity);
            shared.set_state(&slot, &mut st, ConnectionState::Connecting);
        }

        let launched = shared
            .commands
            .prepare(&profile, secret.as_ref())
            .and_then(|prepared| {
                let handle = shared.supervisor.launch(id, &prepared.spec)?;
                Ok((prepared, handle))
            });
        let (prepared, handle) = match launched {
            Ok(launched) => launched,
            Err(err) => {
                log::error!("VPN: failed to start '{id}': {err}");
                let mut st = slot.lock_state();
                shared.set_state(&slot, &mut st, ConnectionState::Disconnected);
                shared.notifier.error(id, err.kind(), err.to_string());
                return Err(err);
            }
        };

        let started_at = Instant::now();
        {
            let mut st = slot.lock_state();
            let state = st.state;
            st.record = Some(ConnectionRecord {
                profile_id: id.to_string(),
                state,
                process_handle: handle.clone(),
                started_at,
            });
        }

        let monitor = Monitor {
            shared: Arc::clone(shared),
            slot: Arc::clone(&slot),
            handle,
            cancel,
            classifier: prepared.classifier,
            auth_file: prepared.auth_file,
            deadline: started_at + shared.options.connect_timeout,
        };
        let join = thread::spawn(move || monitor.run());
        slot.lock_state().monitor = Some(join);
        Ok(())
    }

    /// Stops the connection for `id`, waiting for an in-flight connect to
    /// finish starting first. A no-op for ids that are not connected.
    ///
    /// # Errors
    ///
    /// Only when the client survived termination and the kill-by-name
    /// fallback failed too.
    pub fn disconnect(&self, id: &str) -> Result<()> {
        let Some(slot) = self.shared.existing_slot(id) else {
            return Ok(());
        };
        let _lifecycle = slot
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.disconnect_slot(&slot)
    }

    fn disconnect_slot(&self, slot: &Slot) -> Result<()> {
        let shared = &self.shared;
        let (record, monitor) = {
            let mut st = slot.lock_state();
            st.cancel.store(true, Ordering::SeqCst);
            (st.record.take(), st.monitor.take())
        };
        if let Some(monitor) = monitor {
            if monitor.join().is_err() {
                log::warn!("VPN: monitor for '{}' panicked", slot.id);
            }
        }

        let mut result = Ok(());
        if let Some(record) = record {
            log::info!("VPN: disconnecting '{}'", slot.id);
            match shared
                .supervisor
                .terminate(&record.process_handle, shared.options.grace_timeout)
            {
                Ok(Termination::Unresponsive) => {
                    result = shared.kill_clients_with_cached_secret();
                }
                Ok(outcome) => log::debug!("VPN: '{}' termination: {outcome:?}", slot.id),
                Err(err) => log::debug!("VPN: '{}' was already gone: {err}", slot.id),
            }
        }

        let mut st = slot.lock_state();
        shared.set_state(slot, &mut st, ConnectionState::Disconnected);
        result
    }

    /// Disconnects every connection, returning the first failure.
    ///
    /// # Errors
    ///
    /// The first error from [`Self::disconnect`].
    pub fn disconnect_all(&self) -> Result<()> {
        let mut result = Ok(());
        for slot in self.shared.all_slots() {
            let _lifecycle = slot
                .lifecycle
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let outcome = self.disconnect_slot(&slot);
            if result.is_ok() {
                result = outcome;
            }
        }
        result
    }

    /// Stops every client process on the system by name, including ones
    /// this controller did not start. Prompts for the elevated secret if
    /// needed.
    ///
    /// # Errors
    ///
    /// [`VpnError::NoCredentials`] when the secret is unavailable, or the
    /// kill tool failure.
    pub fn kill_stray_clients(&self) -> Result<()> {
        let shared = &self.shared;
        let secret = if shared.commands.needs_elevation() {
            Some(shared.store.elevated_secret().ok_or(VpnError::NoCredentials)?)
        } else {
            None
        };
        shared.supervisor.kill_all_by_name(
            &shared.commands.process_name(VpnKind::OpenVpn),
            secret.as_ref(),
        )
    }

    #[must_use]
    pub fn state(&self, id: &str) -> ConnectionState {
        self.shared
            .existing_slot(id)
            .map_or(ConnectionState::Disconnected, |slot| slot.lock_state().state)
    }

    #[must_use]
    pub fn record(&self, id: &str) -> Option<ConnectionRecord> {
        self.shared
            .existing_slot(id)
            .and_then(|slot| slot.lock_state().record.clone())
    }

    /// Recent client output for `id`, oldest first.
    #[must_use]
    pub fn diagnostics(&self, id: &str) -> Vec<String> {
        self.shared
            .existing_slot(id)
            .map(|slot| slot.lock_state().diagnostics.lines())
            .unwrap_or_default()
    }

    /// Ids that are not `Disconnected`, sorted.
    #[must_use]
    pub fn active_connections(&self) -> Vec<String> {
        self.shared
            .all_slots()
            .into_iter()
            .filter(|slot| slot.lock_state().state != ConnectionState::Disconnected)
            .map(|slot| slot.id.clone())
            .collect()
    }
}

impl Drop for ConnectionController {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect_all() {
            log::warn!("VPN: disconnect on shutdown failed: {e}");
        }
        self.shared.notifier.flush();
    }
}

/// One connect attempt's output loop, run on its own thread.
struct Monitor {
    shared: Arc<Shared>,
    slot: Arc<Slot>,
    handle: ProcessHandle,
    cancel: Arc<AtomicBool>,
    classifier: OutputClassifier,
    auth_file: Option<NamedTempFile>,
    deadline: Instant,
}

impl Monitor {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn run(mut self) {
        let poll = self.shared.options.read_poll;
        // Output already buffered is drained before an exit is reported.
        let mut dead_since: Option<Instant> = None;
        loop {
            if self.cancelled() {
                return;
            }
            let pending = self.slot.lock_state().state.is_pending();
            let wait = if pending {
                let left = self.deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    self.fail(&VpnError::Timeout(self.shared.options.connect_timeout));
                    return;
                }
                left.min(poll)
            } else {
                poll
            };

            match self.shared.supervisor.read_line(&self.handle, wait) {
                Ok(ReadOutcome::Line(line)) => {
                    if !self.on_line(&line.text) {
                        return;
                    }
                }
                Ok(ReadOutcome::Timeout) => {
                    if self.shared.supervisor.is_alive(&self.handle) {
                        continue;
                    }
                    let since = *dead_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= self.shared.options.grace_timeout {
                        self.exited();
                        return;
                    }
                }
                Ok(ReadOutcome::Eof) | Err(_) => {
                    self.exited();
                    return;
                }
            }
        }
    }

    /// Returns false once the attempt is over.
    fn on_line(&mut self, text: &str) -> bool {
        let event = self.classifier.classify(text);
        let mut st = self.slot.lock_state();
        st.diagnostics.push(text);
        if self.cancelled() {
            return false;
        }
        // Once connected only process exit matters.
        if !st.state.is_pending() {
            return true;
        }

        match event {
            Classification::NoEvent | Classification::BecameConnecting => true,
            Classification::BecameAuthenticating => {
                if st.state == ConnectionState::Connecting {
                    self.shared
                        .set_state(&self.slot, &mut st, ConnectionState::Authenticating);
                }
                true
            }
            Classification::BecameConnected => {
                self.shared
                    .set_state(&self.slot, &mut st, ConnectionState::Connected);
                drop(st);
                self.auth_file.take();
                true
            }
            Classification::AuthFailed => {
                drop(st);
                self.fail(&VpnError::AuthFailed(text.to_string()));
                false
            }
            Classification::ElevationRejected => {
                drop(st);
                self.shared.store.forget_elevated_secret();
                self.fail(&VpnError::NoCredentials);
                false
            }
            Classification::FatalError => {
                drop(st);
                self.fail(&VpnError::Fatal(text.to_string()));
                false
            }
        }
    }

    fn exited(&mut self) {
        let output = self
            .slot
            .lock_state()
            .diagnostics
            .tail(constants::EXIT_OUTPUT_LINES);
        self.fail(&VpnError::UnexpectedExit(output));
    }

    /// Ends the attempt: terminate, then publish `Disconnected` and the cause.
    /// After a cancel the disconnect owns the process, so this does nothing.
    fn fail(&mut self, error: &VpnError) {
        {
            let mut st = self.slot.lock_state();
            if self.cancelled() {
                return;
            }
            st.record = None;
        }

        let id = self.slot.id.as_str();
        log::warn!("VPN: '{id}' failed: {error}");
        match self
            .shared
            .supervisor
            .terminate(&self.handle, self.shared.options.grace_timeout)
        {
            Ok(Termination::Unresponsive) => {
                if let Err(e) = self.shared.kill_clients_with_cached_secret() {
                    log::warn!("VPN: fallback kill for '{id}' failed: {e}");
                }
            }
            Ok(outcome) => log::debug!("VPN: '{id}' termination: {outcome:?}"),
            Err(e) => log::debug!("VPN: '{id}' was already gone: {e}"),
        }
        self.auth_file.take();

        let mut st = self.slot.lock_state();
        self.shared
            .set_state(&self.slot, &mut st, ConnectionState::Disconnected);
        if !self.cancelled() {
            let kind: ErrorKind = error.kind();
            self.shared.notifier.error(id, kind, error.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ElevationMode;
    use crate::core::observer::tests::{Recorder, Seen};
    use crate::core::testing::{StubBackend, StubScript};
    use crate::state::ConnectionProfile;
    use secrecy::SecretString;
    use std::ffi::OsString;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    use crate::state::ConnectionState::{Authenticating, Connected, Connecting, Disconnected};

    struct Fixture {
        dir: TempDir,
        backend: Arc<StubBackend>,
        store: Arc<CredentialStore>,
        recorder: Arc<Recorder>,
        prompts: Arc<AtomicUsize>,
        controller: ConnectionController,
    }

    impl Fixture {
        fn add_openvpn(&self, name: &str) {
            let config = self.dir.path().join(format!("{name}.ovpn"));
            std::fs::write(&config, "client\nremote vpn.example.com 1194\n").unwrap();
            self.store
                .add_profile(ConnectionProfile::openvpn(name, config, "u", "p"))
                .unwrap();
        }

        fn wait_for(&self, id: &str, state: ConnectionState) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.controller.state(id) != state {
                assert!(
                    Instant::now() < deadline,
                    "'{id}' stuck in {}",
                    self.controller.state(id)
                );
                thread::sleep(Duration::from_millis(5));
            }
        }

        fn settled(&self) -> Vec<Seen> {
            self.controller.flush_notifications();
            self.recorder.seen()
        }

        fn settled_errors(&self) -> Vec<ErrorKind> {
            self.controller.flush_notifications();
            self.recorder.errors()
        }
    }

    fn options() -> ControllerOptions {
        ControllerOptions {
            connect_timeout: Duration::from_secs(5),
            grace_timeout: Duration::from_millis(200),
            read_poll: Duration::from_millis(20),
            diagnostics_capacity: 50,
        }
    }

    fn fixture_with(secret: Option<&str>, options: ControllerOptions) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let secret = secret.map(ToString::to_string);
        let prompts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&prompts);
        let store = Arc::new(CredentialStore::new(
            dir.path().join("connections.json"),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                secret.clone().map(SecretString::from)
            },
        ));
        let backend = StubBackend::new();
        let commands = ClientCommands {
            elevation: ElevationMode::Sudo,
            ..ClientCommands::default()
        };
        let controller = ConnectionController::new(
            Arc::clone(&store),
            ProcessSupervisor::new(backend.clone()),
            commands,
            options,
        );
        let recorder = Arc::new(Recorder::default());
        controller.subscribe(recorder.clone());

        let fixture = Fixture {
            dir,
            backend,
            store,
            recorder,
            prompts,
            controller,
        };
        fixture.add_openvpn("office");
        fixture
    }

    fn fixture() -> Fixture {
        fixture_with(Some("sudo-pass"), options())
    }

    fn state(id: &str, state: ConnectionState) -> Seen {
        Seen::State(id.to_string(), state)
    }

    fn auth_file_of(backend: &StubBackend) -> PathBuf {
        let args = &backend.specs()[0].args;
        let pos = args
            .iter()
            .position(|a| a == &OsString::from("--auth-user-pass"))
            .unwrap();
        PathBuf::from(&args[pos + 1])
    }

    #[test]
    fn test_office_connects_with_two_notifications() {
        let f = fixture();
        f.backend.push_script(StubScript::lines(&[
            "Attempting to establish TCP connection with [AF_INET]1.2.3.4:443",
            "Initialization Sequence Completed",
        ]));

        f.controller.connect("office").unwrap();
        f.wait_for("office", Connected);

        assert_eq!(
            f.settled(),
            [state("office", Connecting), state("office", Connected)]
        );
        assert_eq!(f.backend.stdin_text(), "sudo-pass\n");
        let record = f.controller.record("office").unwrap();
        assert_eq!(record.profile_id, "office");
        assert_eq!(record.state, Connected);
        assert_eq!(f.controller.active_connections(), ["office"]);
    }

    #[test]
    fn test_disconnect_leaves_no_tracked_process() {
        let f = fixture();
        f.backend
            .push_script(StubScript::lines(&["Initialization Sequence Completed"]));
        f.controller.connect("office").unwrap();
        f.wait_for("office", Connected);
        let auth = auth_file_of(&f.backend);

        f.controller.disconnect("office").unwrap();

        assert_eq!(f.controller.state("office"), Disconnected);
        assert!(!f.controller.supervisor().is_tracked("office"));
        assert!(f.controller.record("office").is_none());
        assert!(!auth.exists());
        assert_eq!(f.backend.terminate_count(), 1);
        assert_eq!(
            f.settled(),
            [
                state("office", Connecting),
                state("office", Connected),
                state("office", Disconnected)
            ]
        );
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let f = fixture();
        f.controller.disconnect("office").unwrap();
        f.controller.disconnect("never-seen").unwrap();

        f.backend
            .push_script(StubScript::lines(&["Initialization Sequence Completed"]));
        f.controller.connect("office").unwrap();
        f.wait_for("office", Connected);
        f.controller.disconnect("office").unwrap();
        let before = f.settled();

        f.controller.disconnect("office").unwrap();
        assert_eq!(f.controller.state("office"), Disconnected);
        assert_eq!(f.settled(), before);
        assert_eq!(f.backend.terminate_count(), 1);
    }

    #[test]
    fn test_second_connect_is_rejected() {
        let f = fixture();
        f.controller.connect("office").unwrap();

        assert!(matches!(
            f.controller.connect("office"),
            Err(VpnError::AlreadyConnected(id)) if id == "office"
        ));
        assert_eq!(f.backend.spawn_count(), 1);
        assert_eq!(f.controller.supervisor().tracked_ids(), ["office"]);
    }

    #[test]
    fn test_concurrent_connects_spawn_once() {
        let f = fixture();
        let results: Vec<_> = thread::scope(|s| {
            let a = s.spawn(|| f.controller.connect("office"));
            let b = s.spawn(|| f.controller.connect("office"));
            vec![a.join().unwrap(), b.join().unwrap()]
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(VpnError::AlreadyConnected(_)))));
        assert_eq!(f.backend.spawn_count(), 1);
    }

    #[test]
    fn test_timeout_reports_timeout() {
        let f = fixture_with(
            Some("sudo-pass"),
            ControllerOptions {
                connect_timeout: Duration::from_millis(150),
                ..options()
            },
        );
        f.controller.connect("office").unwrap();
        f.wait_for("office", Disconnected);

        assert_eq!(f.settled_errors(), [ErrorKind::Timeout]);
        assert_eq!(f.recorder.states(), [Connecting, Disconnected]);
        assert_eq!(f.backend.terminate_count(), 1);
    }

    #[test]
    fn test_auth_failure_terminates_client() {
        let f = fixture();
        f.backend
            .push_script(StubScript::lines(&["AUTH: Received control message: AUTH_FAILED"]));
        f.controller.connect("office").unwrap();
        f.wait_for("office", Disconnected);

        assert_eq!(f.settled_errors(), [ErrorKind::AuthFailed]);
        assert_eq!(f.recorder.states(), [Connecting, Disconnected]);
        assert_eq!(f.backend.terminate_count(), 1);
        assert!(!f.controller.supervisor().is_tracked("office"));
        assert!(!auth_file_of(&f.backend).exists());
    }

    #[test]
    fn test_fatal_error_terminates_client() {
        let f = fixture();
        f.backend
            .push_script(StubScript::lines(&["Options error: --ca fails with 'ca.crt'"]));
        f.controller.connect("office").unwrap();
        f.wait_for("office", Disconnected);

        assert_eq!(f.settled_errors(), [ErrorKind::FatalError]);
        assert_eq!(f.backend.terminate_count(), 1);
    }

    #[test]
    fn test_pending_auth_path() {
        let f = fixture();
        f.backend.push_script(StubScript::lines(&[
            "Attempting to establish TCP connection",
            "SENT CONTROL [server]: 'PUSH_REQUEST' (status=1) PENDING",
            "Initialization Sequence Completed",
        ]));
        f.controller.connect("office").unwrap();
        f.wait_for("office", Connected);

        f.controller.flush_notifications();
        assert_eq!(f.recorder.states(), [Connecting, Authenticating, Connected]);
    }

    #[test]
    fn test_timeout_while_authenticating() {
        let f = fixture_with(
            Some("sudo-pass"),
            ControllerOptions {
                connect_timeout: Duration::from_millis(150),
                ..options()
            },
        );
        f.backend.push_script(StubScript::lines(&[
            "SENT CONTROL [server]: 'PUSH_REQUEST' (status=1) PENDING",
        ]));
        f.controller.connect("office").unwrap();
        f.wait_for("office", Disconnected);

        assert_eq!(f.settled_errors(), [ErrorKind::Timeout]);
        assert_eq!(f.recorder.states(), [Connecting, Authenticating, Disconnected]);
        assert_eq!(f.backend.terminate_count(), 1);
    }

    #[test]
    fn test_auth_failure_while_authenticating() {
        let f = fixture();
        f.backend.push_script(StubScript::lines(&[
            "SENT CONTROL [server]: 'PUSH_REQUEST' (status=1) PENDING",
            "AUTH: Received control message: AUTH_FAILED",
        ]));
        f.controller.connect("office").unwrap();
        f.wait_for("office", Disconnected);

        assert_eq!(f.settled_errors(), [ErrorKind::AuthFailed]);
        assert_eq!(f.recorder.states(), [Connecting, Authenticating, Disconnected]);
        assert!(!f.controller.supervisor().is_tracked("office"));
    }

    #[test]
    fn test_exit_after_connected_is_unexpected() {
        let f = fixture();
        f.backend.push_script(
            StubScript::lines(&["Initialization Sequence Completed"]).exiting(),
        );
        f.controller.connect("office").unwrap();
        f.wait_for("office", Disconnected);

        assert_eq!(f.settled_errors(), [ErrorKind::UnexpectedExit]);
        assert_eq!(f.recorder.states(), [Connecting, Connected, Disconnected]);
        assert!(!f.controller.supervisor().is_tracked("office"));
    }

    #[test]
    fn test_exit_while_connecting_is_unexpected() {
        let f = fixture();
        f.backend
            .push_script(StubScript::lines(&["Cannot resolve host address"]).exiting());
        f.controller.connect("office").unwrap();
        f.wait_for("office", Disconnected);

        assert_eq!(f.settled_errors(), [ErrorKind::UnexpectedExit]);
        assert_eq!(
            f.controller.diagnostics("office"),
            ["Cannot resolve host address"]
        );
        assert_eq!(
            f.recorder.messages(),
            ["VPN client exited unexpectedly:\nCannot resolve host address"]
        );
    }

    #[test]
    fn test_failure_markers_after_connected_are_only_buffered() {
        let f = fixture();
        f.backend.push_script(StubScript::lines(&[
            "Initialization Sequence Completed",
            "AUTH_FAILED",
        ]));
        f.controller.connect("office").unwrap();
        f.wait_for("office", Connected);

        let deadline = Instant::now() + Duration::from_secs(5);
        while f.controller.diagnostics("office").len() < 2 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(f.controller.state("office"), Connected);
        assert_eq!(f.backend.terminate_count(), 0);
        assert!(f.settled_errors().is_empty());
    }

    #[test]
    fn test_missing_secret_is_no_credentials() {
        let f = fixture_with(None, options());

        assert!(matches!(
            f.controller.connect("office"),
            Err(VpnError::NoCredentials)
        ));
        assert_eq!(f.controller.state("office"), Disconnected);
        assert_eq!(f.backend.spawn_count(), 0);
        assert_eq!(f.settled(), [Seen::Error("office".into(), ErrorKind::NoCredentials)]);
    }

    #[test]
    fn test_rejected_secret_is_forgotten() {
        let f = fixture();
        f.backend
            .push_script(StubScript::lines(&["sudo: 1 incorrect password attempt"]));
        f.controller.connect("office").unwrap();
        f.wait_for("office", Disconnected);

        assert_eq!(f.settled_errors(), [ErrorKind::NoCredentials]);
        assert!(f.store.cached_secret().is_none());

        f.controller.connect("office").unwrap();
        assert_eq!(f.prompts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_spawn_error_returns_to_disconnected() {
        let f = fixture();
        f.backend.fail_next_spawn();

        assert!(matches!(
            f.controller.connect("office"),
            Err(VpnError::Spawn { .. })
        ));
        assert_eq!(f.controller.state("office"), Disconnected);
        assert_eq!(
            f.settled(),
            [
                state("office", Connecting),
                state("office", Disconnected),
                Seen::Error("office".into(), ErrorKind::Spawn)
            ]
        );

        // Still usable afterwards.
        f.controller.connect("office").unwrap();
        assert_eq!(f.backend.spawn_count(), 1);
    }

    #[test]
    fn test_disconnect_cancels_pending_attempt() {
        let f = fixture();
        f.controller.connect("office").unwrap();
        f.controller.disconnect("office").unwrap();

        assert_eq!(f.controller.state("office"), Disconnected);
        assert_eq!(f.backend.terminate_count(), 1);
        f.backend.emit("Initialization Sequence Completed");
        thread::sleep(Duration::from_millis(50));
        assert_eq!(f.controller.state("office"), Disconnected);
        assert_eq!(
            f.settled(),
            [state("office", Connecting), state("office", Disconnected)]
        );
    }

    #[test]
    fn test_unknown_and_unsupported_profiles() {
        let f = fixture();
        assert!(matches!(
            f.controller.connect("nope"),
            Err(VpnError::UnknownProfile(_))
        ));

        f.store
            .add_profile(ConnectionProfile::ipsec("hq", "vpn.example.com", "u", "p", "psk"))
            .unwrap();
        assert!(matches!(
            f.controller.connect("hq"),
            Err(VpnError::Unsupported(VpnKind::Ipsec))
        ));
        assert_eq!(f.backend.spawn_count(), 0);
        assert!(f.settled().is_empty());
    }

    #[test]
    fn test_disconnect_all() {
        let f = fixture();
        f.add_openvpn("home");
        f.controller.connect("office").unwrap();
        f.controller.connect("home").unwrap();
        assert_eq!(f.controller.active_connections(), ["home", "office"]);

        f.controller.disconnect_all().unwrap();
        assert!(f.controller.active_connections().is_empty());
        assert!(f.controller.supervisor().tracked_ids().is_empty());
        assert_eq!(f.backend.terminate_count(), 2);
    }

    #[test]
    fn test_kill_stray_clients_uses_process_name() {
        let f = fixture();
        f.controller.kill_stray_clients().unwrap();
        assert_eq!(f.backend.kill_all_calls(), [("openvpn".to_string(), true)]);
    }

    #[test]
    fn test_disconnect_falls_back_to_kill_by_name() {
        let f = fixture();
        f.backend.push_script(
            StubScript::lines(&["Initialization Sequence Completed"]).unkillable(),
        );
        f.controller.connect("office").unwrap();
        f.wait_for("office", Connected);

        f.controller.disconnect("office").unwrap();

        assert_eq!(f.backend.kill_count(), 1);
        assert_eq!(f.backend.kill_all_calls(), [("openvpn".to_string(), true)]);
        assert_eq!(f.controller.state("office"), Disconnected);
        assert!(!f.controller.supervisor().is_tracked("office"));
    }

    #[test]
    fn test_timed_out_unkillable_client_is_killed_by_name() {
        let f = fixture_with(
            Some("sudo-pass"),
            ControllerOptions {
                connect_timeout: Duration::from_millis(100),
                ..options()
            },
        );
        f.backend.push_script(StubScript::default().unkillable());
        f.controller.connect("office").unwrap();
        f.wait_for("office", Disconnected);

        assert_eq!(f.settled_errors(), [ErrorKind::Timeout]);
        assert_eq!(f.backend.kill_all_calls(), [("openvpn".to_string(), true)]);
        assert!(!auth_file_of(&f.backend).exists());
    }

    #[test]
    fn test_options_from_settings() {
        let settings = Settings {
            connect_timeout_secs: 12,
            read_poll_ms: 0,
            ..Settings::default()
        };
        let options = ControllerOptions::from(&settings);
        assert_eq!(options.connect_timeout, Duration::from_secs(12));
        assert_eq!(options.read_poll, Duration::from_millis(1));
    }
}
