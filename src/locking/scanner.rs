//! Lease break scanner.
//!
//! A small timer thread that sweeps the manager for leases whose break
//! acknowledgement is overdue and force-revokes them.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};
use log::debug;

use super::manager::LockManager;

pub struct LeaseBreakScanner {
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl LeaseBreakScanner {
    /// Starts the sweep thread; the interval comes from the manager's
    /// timeout configuration.
    pub fn start(manager: Arc<LockManager>) -> Self {
        let interval = manager.timeouts().scanner_interval;
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread = std::thread::spawn(move || {
            let ticker = tick(interval);
            loop {
                select! {
                    recv(stop_rx) -> _ => return,
                    recv(ticker) -> _ => {
                        let revoked = manager.force_revoke_expired_breaks();
                        if revoked > 0 {
                            debug!("scanner force-revoked {} lease(s)", revoked);
                        }
                    }
                }
            }
        });
        Self {
            stop: stop_tx,
            thread: Some(thread),
        }
    }

    pub fn stop(mut self) {
        let _ = self.stop.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for LeaseBreakScanner {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
