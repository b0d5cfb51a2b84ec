//! Age-based retention worker.
//!
//! One long-lived thread per store drives the `max_age` limit. The worker
//! sleeps until the oldest live message's expiry deadline, wakes to expire
//! whatever has aged out, and reschedules against the next-oldest message.
//! While the store is empty the worker disarms and parks on its command
//! channel; the first append rearms it.
//!
//! Communication with the store is via an mpsc channel: `Rearm` after a
//! store transitions from empty to non-empty, `Shutdown` on close. Deadline
//! waits are bounded by `recv_timeout`, so a shutdown is never delayed by a
//! pending expiry sleep.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace};

use crate::store::{now_ns, StoreInner};

/// Commands accepted by the expiry worker.
pub(crate) enum ExpiryCommand {
    /// Recompute the deadline; sent when the store becomes non-empty.
    Rearm,
    /// Stop the worker.
    Shutdown,
}

/// Handle owning the expiry worker thread.
pub(crate) struct ExpiryHandle {
    command_tx: Sender<ExpiryCommand>,
    join: Option<JoinHandle<()>>,
}

impl ExpiryHandle {
    /// Spawns the worker against the shared store state.
    pub fn spawn(inner: Arc<RwLock<StoreInner>>) -> Self {
        let (command_tx, command_rx) = mpsc::channel();

        let join = thread::Builder::new()
            .name("silo-expiry".into())
            .spawn(move || run(&inner, &command_rx))
            .expect("failed to spawn expiry worker thread");

        Self {
            command_tx,
            join: Some(join),
        }
    }

    /// Wakes the worker to recompute its deadline.
    pub fn rearm(&self) {
        let _ = self.command_tx.send(ExpiryCommand::Rearm);
    }

    /// Stops the worker and waits for it to exit.
    pub fn shutdown(&mut self) {
        let _ = self.command_tx.send(ExpiryCommand::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run(inner: &Arc<RwLock<StoreInner>>, command_rx: &Receiver<ExpiryCommand>) {
    debug!("expiry worker started");

    loop {
        // Expire whatever is due and learn when the next message expires.
        let deadline_ns = {
            let Ok(mut inner) = inner.write() else { break };
            if inner.is_closed() {
                break;
            }
            let deadline = inner.expire_aged(now_ns());
            if deadline.is_none() {
                inner.disarm_expiry();
            }
            deadline
        };

        match deadline_ns {
            // Nothing live: park until an append rearms us.
            None => match command_rx.recv() {
                Ok(ExpiryCommand::Rearm) => continue,
                Ok(ExpiryCommand::Shutdown) | Err(_) => break,
            },
            Some(deadline_ns) => {
                let wait_ns = deadline_ns.saturating_sub(now_ns()).max(1) as u64;
                trace!(wait_ms = wait_ns / 1_000_000, "expiry worker sleeping");
                match command_rx.recv_timeout(Duration::from_nanos(wait_ns)) {
                    Ok(ExpiryCommand::Rearm) | Err(RecvTimeoutError::Timeout) => continue,
                    Ok(ExpiryCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }
    }

    debug!("expiry worker stopped");
}
