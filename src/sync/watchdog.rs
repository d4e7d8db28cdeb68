//! Long-wait watchdog
//!
//! A background thread that sweeps the wait array at a fixed interval.
//! Under [`FatalPolicy::Abort`](crate::error::FatalPolicy::Abort) a fatal
//! sweep never returns; under `Propagate` the error is logged and the thread
//! stops sweeping.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use tracing::{debug, error, info};

use super::wait_array::WaitArray;
use crate::error::Result;

/// Handle to the watchdog thread; dropping it stops the thread
pub struct Watchdog {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn(array: Arc<WaitArray>, interval: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("wait-array-watchdog".into())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "watchdog started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => match array.sweep() {
                            Ok(report) => {
                                if report.reserved > 0 {
                                    debug!(
                                        reserved = report.reserved,
                                        warnings = report.warnings,
                                        longest_wait_ms = report.longest_wait_ms,
                                        "wait array sweep"
                                    );
                                }
                            }
                            Err(e) => {
                                error!(error = %e, "watchdog stopping after fatal sweep");
                                break;
                            }
                        },
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("watchdog stopped");
            })?;

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Whether the thread is still sweeping
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}
