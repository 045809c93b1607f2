//! Serialized host execution context.
//!
//! Some work has to run on the host application's own context rather than on
//! a connection worker: updating host-owned settings after a port fallback is
//! the canonical case. Workers push closures through a [`HostDispatcher`];
//! the host drains the matching [`HostQueue`] once per tick, in FIFO order.
//!
//! There is no global instance. The owner creates the pair with
//! [`host_queue`] and hands dispatcher clones to whoever needs them.

use tokio::sync::{mpsc, oneshot};

use crate::error::{GatewayError, Result};

type Action = Box<dyn FnOnce() + Send + 'static>;

/// Create a connected dispatcher/queue pair.
pub fn host_queue() -> (HostDispatcher, HostQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (HostDispatcher { tx }, HostQueue { rx })
}

/// Sending half, cheap to clone and safe to use from any thread.
#[derive(Clone)]
pub struct HostDispatcher {
    tx: mpsc::UnboundedSender<Action>,
}

impl HostDispatcher {
    /// Queue an action without waiting for it to run.
    pub fn enqueue<F>(&self, action: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(Box::new(action))
            .map_err(|_| GatewayError::DispatcherClosed)
    }

    /// Queue a closure and wait until the host has run it.
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue(move || {
            // The waiter may have gone away; nothing to report then.
            let _ = done_tx.send(f());
        })?;

        done_rx.await.map_err(|_| GatewayError::DispatcherClosed)
    }

    /// Whether the receiving queue still exists.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for HostDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDispatcher")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receiving half, owned by the host loop.
pub struct HostQueue {
    rx: mpsc::UnboundedReceiver<Action>,
}

impl HostQueue {
    /// Run every action queued so far and return how many ran.
    ///
    /// Actions enqueued while draining are left for the next tick.
    pub fn drain(&mut self) -> usize {
        let pending = self.rx.len();
        let mut ran = 0;
        while ran < pending {
            match self.rx.try_recv() {
                Ok(action) => {
                    action();
                    ran += 1;
                }
                Err(_) => break,
            }
        }
        if ran > 0 {
            tracing::trace!(ran, "drained host queue");
        }
        ran
    }

    /// Number of actions waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
