//! Suspension points of the pipeline and cooperative cancellation.
//!
//! Every deliberate pause goes through a [`Pacer`] so tests can count pauses
//! instead of sleeping through them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseKind {
    /// Between metadata pages.
    Page,
    /// After each download attempt.
    PerDownload,
    /// Extra pause after every N download attempts.
    Batch,
    /// Between two channels of a batch.
    ChannelCooldown,
    /// Scheduler poll cadence.
    SchedulePoll,
}

pub trait Pacer: Send + Sync {
    fn pause(&self, kind: PauseKind, duration: Duration);
}

/// Blocks the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn pause(&self, kind: PauseKind, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        if kind != PauseKind::SchedulePoll {
            log::debug!("pausing {:?} for {}s", kind, duration.as_secs());
        }
        thread::sleep(duration);
    }
}

/// Shared stop request. Checked at the start of each channel and each
/// download; a pause already in progress runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Raises the flag on Ctrl-C or SIGTERM. A second signal while the
    /// worker is still winding down exits the process. Only one handler can
    /// be installed per process.
    pub fn cancel_on_interrupt(&self) -> Result<()> {
        let flag = self.clone();
        ctrlc::set_handler(move || {
            if flag.is_cancelled() {
                eprintln!("Interrupted again, exiting");
                std::process::exit(130);
            }
            eprintln!("Interrupted, stopping after the current step (press Ctrl-C again to exit now)");
            flag.cancel();
        })
        .context("installing interrupt handler")
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Records pauses without sleeping.
    #[derive(Default)]
    pub(crate) struct RecordingPacer {
        pauses: Mutex<Vec<(PauseKind, Duration)>>,
    }

    impl RecordingPacer {
        pub(crate) fn count(&self, kind: PauseKind) -> usize {
            self.pauses.lock().iter().filter(|(k, _)| *k == kind).count()
        }

        pub(crate) fn kinds(&self) -> Vec<PauseKind> {
            self.pauses.lock().iter().map(|(kind, _)| *kind).collect()
        }
    }

    impl Pacer for RecordingPacer {
        fn pause(&self, kind: PauseKind, duration: Duration) {
            self.pauses.lock().push((kind, duration));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
        assert!(!CancelFlag::new().is_cancelled());
    }

    #[cfg(unix)]
    #[test]
    fn interrupt_signal_raises_the_flag() -> Result<()> {
        let flag = CancelFlag::new();
        flag.cancel_on_interrupt()?;

        let status = std::process::Command::new("kill")
            .args(["-INT", &std::process::id().to_string()])
            .status()?;
        assert!(status.success());

        for _ in 0..200 {
            if flag.is_cancelled() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("interrupt did not raise the cancel flag");
    }
}
