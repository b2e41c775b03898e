//! State-change notifications for the UI.
//!
//! Observers are called from a single dispatcher thread, in the order the
//! controller produced the notifications. A slow observer delays other
//! observers but never the connection core.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;

use crate::error::ErrorKind;
use crate::state::ConnectionState;

/// Receives connection lifecycle updates. Rendering is up to the implementor.
pub trait ConnectionObserver: Send + Sync {
    fn on_state_changed(&self, id: &str, state: ConnectionState);

    /// A connect attempt or live connection failed.
    fn on_error(&self, id: &str, kind: ErrorKind, message: &str) {
        let _ = (id, kind, message);
    }
}

enum Notification {
    State {
        id: String,
        state: ConnectionState,
    },
    Error {
        id: String,
        kind: ErrorKind,
        message: String,
    },
    Flush(Sender<()>),
}

type Observers = Arc<RwLock<Vec<Arc<dyn ConnectionObserver>>>>;

pub(crate) struct Notifier {
    sender: Option<Sender<Notification>>,
    observers: Observers,
    handler: Option<thread::JoinHandle<()>>,
}

impl Notifier {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        let observers: Observers = Arc::default();
        let dispatch_to = Arc::clone(&observers);

        let handler = thread::spawn(move || {
            for notification in receiver {
                let observers = dispatch_to
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                match notification {
                    Notification::State { id, state } => {
                        for observer in &observers {
                            observer.on_state_changed(&id, state);
                        }
                    }
                    Notification::Error { id, kind, message } => {
                        for observer in &observers {
                            observer.on_error(&id, kind, &message);
                        }
                    }
                    Notification::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self {
            sender: Some(sender),
            observers,
            handler: Some(handler),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn ConnectionObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    fn send(&self, notification: Notification) {
        if let Some(sender) = &self.sender {
            // The dispatcher only stops when the notifier is dropped.
            let _ = sender.send(notification);
        }
    }

    pub fn state_changed(&self, id: &str, state: ConnectionState) {
        self.send(Notification::State {
            id: id.to_string(),
            state,
        });
    }

    pub fn error(&self, id: &str, kind: ErrorKind, message: impl Into<String>) {
        self.send(Notification::Error {
            id: id.to_string(),
            kind,
            message: message.into(),
        });
    }

    /// Blocks until everything queued so far has been delivered.
    pub fn flush(&self) {
        let (done, wait) = mpsc::channel();
        self.send(Notification::Flush(done));
        let _ = wait.recv();
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handler) = self.handler.take() {
            if handler.thread().id() != thread::current().id() {
                let _ = handler.join();
            }
        }
    }
}
