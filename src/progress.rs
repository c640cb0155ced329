//! Progress reporting.
//!
//! The pipeline never talks to a UI directly. It pushes human-readable status
//! lines and a percentage through a [`ProgressSink`]; whoever drives the run
//! decides how to show them. The diagnostic `log` stream stays separate so
//! tests can assert on sink calls without capturing log output.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, Receiver, Sender};

/// Receives progress updates. Implementations must not block for long; the
/// pipeline calls them inline on the worker thread.
pub trait ProgressSink: Send + Sync {
    fn message(&self, text: &str);
    fn percent(&self, value: u8);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Message(String),
    Percent(u8),
}

/// Forwards events over a one-way channel. Sends to a dropped receiver are
/// discarded.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<ProgressEvent>,
}

pub fn channel_sink() -> (ChannelSink, Receiver<ProgressEvent>) {
    let (tx, rx) = mpsc::channel();
    (ChannelSink { tx }, rx)
}

impl ProgressSink for ChannelSink {
    fn message(&self, text: &str) {
        if self.tx.send(ProgressEvent::Message(text.to_owned())).is_err() {
            log::debug!("progress receiver gone, dropped message: {text}");
        }
    }

    fn percent(&self, value: u8) {
        let _ = self.tx.send(ProgressEvent::Percent(value));
    }
}

/// Wrapper used by the pipeline: clamps percentages and contains panics
/// raised by a misbehaving sink.
#[derive(Clone, Copy)]
pub(crate) struct Reporter<'a> {
    sink: &'a dyn ProgressSink,
}

impl<'a> Reporter<'a> {
    pub(crate) fn new(sink: &'a dyn ProgressSink) -> Self {
        Self { sink }
    }

    pub(crate) fn message(&self, text: &str) {
        if catch_unwind(AssertUnwindSafe(|| self.sink.message(text))).is_err() {
            log::warn!("progress sink panicked while handling message: {text}");
        }
    }

    pub(crate) fn percent(&self, value: u8) {
        let value = value.min(100);
        if catch_unwind(AssertUnwindSafe(|| self.sink.percent(value))).is_err() {
            log::warn!("progress sink panicked while handling percent {value}");
        }
    }
}

/// `done / total` as a 0–100 percentage; an empty total counts as complete.
pub fn percent_of(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Keeps every event for later assertions.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl RecordingSink {
        pub(crate) fn messages(&self) -> Vec<String> {
            self.events
                .lock()
                .iter()
                .filter_map(|event| match event {
                    ProgressEvent::Message(text) => Some(text.clone()),
                    ProgressEvent::Percent(_) => None,
                })
                .collect()
        }

        pub(crate) fn percents(&self) -> Vec<u8> {
            self.events
                .lock()
                .iter()
                .filter_map(|event| match event {
                    ProgressEvent::Percent(value) => Some(*value),
                    ProgressEvent::Message(_) => None,
                })
                .collect()
        }
    }

    impl ProgressSink for RecordingSink {
        fn message(&self, text: &str) {
            self.events
                .lock()
                .push(ProgressEvent::Message(text.to_owned()));
        }

        fn percent(&self, value: u8) {
            self.events.lock().push(ProgressEvent::Percent(value));
        }
    }
}
