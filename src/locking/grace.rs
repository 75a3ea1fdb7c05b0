//! Restart grace period.
//!
//! While active, only reclaim and test requests are admitted. The period
//! ends when the timer fires or when every expected client has reclaimed,
//! whichever comes first; both paths funnel through one idempotent exit.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use log::info;

use crate::error::{ErrorCode, StoreError};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(90);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GraceState {
    Normal,
    Active,
}

enum TimerMsg {
    /// All expected clients reclaimed; end the period now.
    EarlyExit,
    /// Tear the timer down without firing the exit callback.
    Close,
}

type ExitCallback = Box<dyn Fn() + Send + Sync>;

struct GraceInner {
    state: Mutex<GraceData>,
    fired: AtomicBool,
    callback: Mutex<Option<ExitCallback>>,
}

struct GraceData {
    state: GraceState,
    expected: HashSet<String>,
    reclaimed: HashSet<String>,
    timer: Option<Sender<TimerMsg>>,
}

pub struct GracePeriod {
    inner: Arc<GraceInner>,
}

impl Default for GracePeriod {
    fn default() -> Self {
        Self::new()
    }
}

impl GracePeriod {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GraceInner {
                state: Mutex::new(GraceData {
                    state: GraceState::Normal,
                    expected: HashSet::new(),
                    reclaimed: HashSet::new(),
                    timer: None,
                }),
                fired: AtomicBool::new(false),
                callback: Mutex::new(None),
            }),
        }
    }

    /// Registered callback runs once per grace period, on timer expiry or
    /// early exit.
    pub fn set_exit_callback<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        *self.inner.callback.lock().unwrap() = Some(Box::new(callback));
    }

    pub fn state(&self) -> GraceState {
        self.inner.state.lock().unwrap().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == GraceState::Active
    }

    /// Gatekeeper for incoming lock requests.
    pub fn check_request(&self, reclaim: bool, test: bool) -> Result<(), StoreError> {
        if self.is_active() && !reclaim && !test {
            return Err(StoreError::new(
                ErrorCode::GracePeriod,
                "server is in its grace period",
            ));
        }
        Ok(())
    }

    /// Starts the period and its timer thread.
    pub fn enter(&self, expected_clients: &[String], duration: Duration) {
        let (tx, rx) = bounded(1);
        {
            let mut data = self.inner.state.lock().unwrap();
            if let Some(old) = data.timer.take() {
                let _ = old.send(TimerMsg::Close);
            }
            data.state = GraceState::Active;
            data.expected = expected_clients.iter().cloned().collect();
            data.reclaimed.clear();
            data.timer = Some(tx);
        }
        self.inner.fired.store(false, Ordering::SeqCst);
        info!(
            "entering grace period for {:?}, {} client(s) expected",
            duration,
            expected_clients.len()
        );

        let inner = self.inner.clone();
        std::thread::spawn(move || match rx.recv_timeout(duration) {
            Ok(TimerMsg::EarlyExit) => fire_exit(&inner),
            Ok(TimerMsg::Close) => {}
            Err(_) => fire_exit(&inner),
        });
    }

    /// Records a reclaim; ends the period early once every expected
    /// client has checked in.
    pub fn mark_reclaimed(&self, client_id: &str) {
        let complete = {
            let mut data = self.inner.state.lock().unwrap();
            if data.state != GraceState::Active {
                return;
            }
            data.reclaimed.insert(client_id.to_string());
            !data.expected.is_empty() && data.expected.is_subset(&data.reclaimed)
        };
        if complete {
            let timer = self.inner.state.lock().unwrap().timer.clone();
            if let Some(timer) = timer {
                let _ = timer.send(TimerMsg::EarlyExit);
            }
        }
    }

    /// Stops the timer without firing the exit callback.
    pub fn close(&self) {
        let timer = {
            let mut data = self.inner.state.lock().unwrap();
            data.state = GraceState::Normal;
            data.timer.take()
        };
        if let Some(timer) = timer {
            let _ = timer.send(TimerMsg::Close);
        }
    }
}

fn fire_exit(inner: &Arc<GraceInner>) {
    if inner.fired.swap(true, Ordering::SeqCst) {
        return;
    }
    {
        let mut data = inner.state.lock().unwrap();
        data.state = GraceState::Normal;
        data.timer = None;
    }
    info!("grace period ended");
    if let Some(callback) = inner.callback.lock().unwrap().as_ref() {
        callback();
    }
}
