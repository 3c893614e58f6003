//! Inbound connection acceptor.
//!
//! Binds a listening endpoint and keeps exactly one accept pending on the
//! runtime. Each accepted transport is handed to the listener callback
//! before the next accept is armed. `cancel` stops the loop without touching
//! transports that were already delivered.

use super::transport::{Endpoint, Listener, Transport};
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Callback receiving each accepted transport.
pub type ListenerCallback = dyn Fn(Transport) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorState {
    NotListening,
    Listening,
    Cancelled,
}

struct Inner {
    state: AcceptorState,
    local: Option<Endpoint>,
    cancel: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

pub struct Acceptor {
    callback: Arc<ListenerCallback>,
    accepted: Arc<AtomicU64>,
    inner: Mutex<Inner>,
}

impl Acceptor {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(Transport) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
            accepted: Arc::new(AtomicU64::new(0)),
            inner: Mutex::new(Inner {
                state: AcceptorState::NotListening,
                local: None,
                cancel: None,
                task: None,
            }),
        }
    }

    /// Bind `endpoint` and start accepting on the current runtime.
    ///
    /// Returns the bound endpoint, which for TCP carries the actual port.
    /// Starting an acceptor that is already listening restarts it on the new
    /// endpoint.
    pub async fn start(&self, endpoint: &Endpoint) -> Result<Endpoint> {
        let listener = Listener::bind(endpoint).await?;
        let local = listener
            .local_endpoint()
            .unwrap_or_else(|_| endpoint.clone());

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            cancel_rx,
            self.callback.clone(),
            self.accepted.clone(),
        ));

        let previous = {
            let mut inner = self.inner.lock();
            inner.state = AcceptorState::Listening;
            inner.local = Some(local.clone());
            let previous = inner.cancel.replace(cancel_tx);
            inner.task = Some(task);
            previous
        };
        if let Some(previous) = previous {
            let _ = previous.send(true);
        }

        info!(endpoint = %local, "acceptor listening");
        Ok(local)
    }

    /// Stop accepting. Transports already delivered are unaffected.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        if inner.state != AcceptorState::Listening {
            return;
        }
        inner.state = AcceptorState::Cancelled;
        if let Some(cancel) = inner.cancel.take() {
            let _ = cancel.send(true);
        }
        debug!("acceptor cancelled");
    }

    /// Wait for the accept loop to exit after `cancel`.
    pub async fn join(&self) {
        let task = self.inner.lock().task.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn state(&self) -> AcceptorState {
        self.inner.lock().state
    }

    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.inner.lock().local.clone()
    }

    /// Transports delivered to the callback so far.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if let Some(cancel) = self.inner.get_mut().cancel.take() {
            let _ = cancel.send(true);
        }
    }
}

async fn accept_loop(
    mut listener: Listener,
    mut cancel: watch::Receiver<bool>,
    callback: Arc<ListenerCallback>,
    accepted: Arc<AtomicU64>,
) {
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.changed() => break,
            result = listener.accept() => result,
        };

        // An accept that raced with cancel is dropped
        if *cancel.borrow() {
            break;
        }

        match result {
            Ok(transport) => {
                debug!(peer = %transport.peer(), "accepted");
                accepted.fetch_add(1, Ordering::Relaxed);
                callback(transport);
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
            }
        }
    }
    debug!("accept loop stopped");
}
