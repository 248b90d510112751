//! Progress reporting for the build phases.
//!
//! Workers never print. Each one holds a [`ProgressSender`] and reports one
//! advance per finished item; a single aggregator thread owns the counter and
//! the display. The sender is `Sync`, so one sender can be shared by
//! reference across every rayon worker.
//!
//! ```text
//! worker ─┐
//! worker ─┼─ mpsc ─→ aggregator thread ─→ ProgressSink (stderr line)
//! worker ─┘
//! ```

use crate::output::format_progress_line;
use std::io::{self, IsTerminal, Write};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgressMessage {
    Advance,
    Finish,
}

/// Clonable, shareable handle used by workers to report progress.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::Sender<ProgressMessage>,
}

impl ProgressSender {
    /// Count one finished item. Ignored after the aggregator has stopped.
    pub fn advance(&self) {
        let _ = self.tx.send(ProgressMessage::Advance);
    }
}

/// Where the aggregator sends its counter.
pub trait ProgressSink: Send {
    fn update(&mut self, done: usize, total: usize);
    fn finish(&mut self, done: usize, total: usize);
}

/// Single-line progress on stderr, redrawn on every update.
///
/// Only draws when stderr is a terminal.
pub struct TerminalSink {
    label: String,
    enabled: bool,
}

impl TerminalSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            enabled: io::stderr().is_terminal(),
        }
    }
}

impl ProgressSink for TerminalSink {
    fn update(&mut self, done: usize, total: usize) {
        if self.enabled {
            let mut err = io::stderr().lock();
            let _ = write!(err, "\r{}", format_progress_line(&self.label, done, total));
            let _ = err.flush();
        }
    }

    fn finish(&mut self, done: usize, total: usize) {
        if self.enabled {
            let _ = writeln!(
                io::stderr().lock(),
                "\r{}",
                format_progress_line(&self.label, done, total)
            );
        }
    }
}

/// Owns the progress counter for one phase.
pub struct ProgressAggregator {
    sender: ProgressSender,
    handle: JoinHandle<usize>,
}

impl ProgressAggregator {
    /// Start the aggregator thread for a phase of `total` items.
    pub fn spawn(
        label: &str,
        total: usize,
        mut sink: Box<dyn ProgressSink>,
    ) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("recitale-progress-{label}"))
            .spawn(move || {
                let mut done = 0usize;
                for message in rx {
                    match message {
                        ProgressMessage::Advance => {
                            done += 1;
                            sink.update(done, total);
                        }
                        ProgressMessage::Finish => break,
                    }
                }
                sink.finish(done, total);
                done
            })?;
        Ok(Self {
            sender: ProgressSender { tx },
            handle,
        })
    }

    pub fn sender(&self) -> &ProgressSender {
        &self.sender
    }

    /// Stop the thread and return how many items were reported.
    ///
    /// Advances sent before this call are all counted; the channel is FIFO.
    pub fn finish(self) -> usize {
        let _ = self.sender.tx.send(ProgressMessage::Finish);
        self.handle.join().unwrap_or(0)
    }
}
