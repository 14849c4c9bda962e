//! The install worker: runs the install pipeline off the caller's
//! thread so a CLI or RPC front-end can poll status, per spec.md §5's
//! concurrency model.
//!
//! A bounded channel carries status updates out; a single atomic flag
//! records whether an install is in progress (only one may run at a
//! time); a cancellation flag is polled between pipeline steps, not
//! inside them, since an in-flight subprocess is killed by signal
//! rather than cooperative checks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Error, Result};

const STATUS_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone)]
pub enum StatusUpdate {
    Stage(&'static str),
    ImageStarted(String),
    ImageFinished(String),
    Failed(String),
    Done,
}

/// Shared between the worker and its caller: one install at a time,
/// cooperative cancellation between steps.
#[derive(Clone)]
pub struct WorkerHandle {
    in_progress: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn new() -> Self {
        WorkerHandle {
            in_progress: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Marks an install as started, returning an error if one is
    /// already running. The returned guard clears the flag on drop so a
    /// panicked worker doesn't wedge the system.
    fn begin(&self) -> Result<InProgressGuard> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Other("an install is already in progress".to_string()));
        }
        self.cancel.store(false, Ordering::SeqCst);
        Ok(InProgressGuard {
            flag: self.in_progress.clone(),
        })
    }
}

impl Default for WorkerHandle {
    fn default() -> Self {
        Self::new()
    }
}

struct InProgressGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// A step-sized chunk of work the pipeline reports progress against.
/// Runs `steps` in order, checking for cancellation between each and
/// forwarding status updates through a bounded channel (a slow or
/// absent receiver drops updates rather than blocking the worker).
pub fn run_steps(
    handle: &WorkerHandle,
    steps: Vec<(&'static str, Box<dyn FnOnce() -> Result<()> + Send>)>,
) -> Result<Receiver<StatusUpdate>> {
    let guard = handle.begin()?;
    let (tx, rx): (SyncSender<StatusUpdate>, Receiver<StatusUpdate>) = sync_channel(STATUS_QUEUE_DEPTH);

    let handle = handle.clone();
    std::thread::spawn(move || {
        let _guard = guard;
        for (name, step) in steps {
            if handle.cancelled() {
                send(&tx, StatusUpdate::Failed(format!("cancelled before stage '{}'", name)));
                return;
            }
            send(&tx, StatusUpdate::Stage(name));
            if let Err(e) = step() {
                warn!(stage = name, error = %e, "install step failed");
                send(&tx, StatusUpdate::Failed(e.trail()));
                return;
            }
        }
        info!("install pipeline finished");
        send(&tx, StatusUpdate::Done);
    });

    Ok(rx)
}

fn send(tx: &SyncSender<StatusUpdate>, update: StatusUpdate) {
    if let Err(TrySendError::Full(_)) = tx.try_send(update) {
        warn!("status update queue full, dropping update");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn only_one_install_runs_at_a_time() {
        let handle = WorkerHandle::new();
        let _guard = handle.begin().unwrap();
        assert!(handle.begin().is_err());
    }

    #[test]
    fn steps_run_in_order_and_report_done() {
        let handle = WorkerHandle::new();
        let order: Arc<std::sync::Mutex<Vec<&'static str>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let steps: Vec<(&'static str, Box<dyn FnOnce() -> Result<()> + Send>)> = vec![
            ("first", Box::new(move || {
                o1.lock().unwrap().push("first");
                Ok(())
            })),
            ("second", Box::new(move || {
                o2.lock().unwrap().push("second");
                Ok(())
            })),
        ];
        let rx = run_steps(&handle, steps).unwrap();
        let mut saw_done = false;
        while let Ok(update) = rx.recv_timeout(Duration::from_secs(1)) {
            if matches!(update, StatusUpdate::Done) {
                saw_done = true;
                break;
            }
        }
        assert!(saw_done);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn cancelling_mid_run_skips_remaining_steps() {
        let handle = WorkerHandle::new();
        let second_ran = Arc::new(AtomicBool::new(false));
        let second_ran_clone = second_ran.clone();
        let handle_for_first = handle.clone();
        let steps: Vec<(&'static str, Box<dyn FnOnce() -> Result<()> + Send>)> = vec![
            ("first", Box::new(move || {
                handle_for_first.request_cancel();
                Ok(())
            })),
            ("second", Box::new(move || {
                second_ran_clone.store(true, Ordering::SeqCst);
                Ok(())
            })),
        ];
        let rx = run_steps(&handle, steps).unwrap();
        let mut saw_failed = false;
        while let Ok(update) = rx.recv_timeout(Duration::from_secs(1)) {
            if matches!(update, StatusUpdate::Failed(_)) {
                saw_failed = true;
            }
            if matches!(update, StatusUpdate::Done | StatusUpdate::Failed(_)) {
                break;
            }
        }
        assert!(saw_failed);
        assert!(!second_ran.load(Ordering::SeqCst));
    }
}
