//! Update sources feeding the fan-out engine.
//!
//! A source pushes decoded updates onto the engine's merged channel until it
//! runs dry, fails, or observes cancellation. The engine owns the channel:
//! sources only ever borrow the sender and never close it.

mod consumer;
mod event_log;

pub use consumer::{LogSource, LogSourceConfig, SourceStats};
pub use event_log::{LogMessage, MemoryLog, PartitionConsumer, PartitionedLog, StartOffset};

use crate::cancel::CancellationToken;
use crate::error::{NotifyError, Result};
use crate::types::Update;
use crossbeam_channel::{select, Receiver, Sender};
use tracing::debug;

/// Producer of updates for the engine.
///
/// Implementations must:
/// - return promptly once `cancel` fires, without sending anything after
///   that point ([`send_or_cancel`] does this for a single send);
/// - send updates in the order they were produced;
/// - join any internal workers before returning.
///
/// `Ok(())` and `Err(NotifyError::Cancelled)` both count as a clean stop.
pub trait UpdateSource: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    fn run(&self, cancel: &CancellationToken, out: &Sender<Update>) -> Result<()>;
}

/// Send `update`, giving up if `cancel` fires first.
///
/// Returns false if the update was not sent: cancellation, or the receiving
/// side is gone.
pub fn send_or_cancel(out: &Sender<Update>, update: Update, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    select! {
        send(out, update) -> res => res.is_ok(),
        recv(cancel.receiver()) -> _ => false,
    }
}

/// Replays a fixed list of updates, then stops.
pub struct ReplaySource {
    name: String,
    updates: Vec<Update>,
}

impl ReplaySource {
    pub fn new(name: impl Into<String>, updates: Vec<Update>) -> Self {
        Self {
            name: name.into(),
            updates,
        }
    }
}

impl UpdateSource for ReplaySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, cancel: &CancellationToken, out: &Sender<Update>) -> Result<()> {
        for update in &self.updates {
            if !send_or_cancel(out, update.clone(), cancel) {
                return Err(NotifyError::Cancelled);
            }
        }
        debug!(source = %self.name, count = self.updates.len(), "replay finished");
        Ok(())
    }
}

/// Forwards updates from an in-process producer.
///
/// Stops when every producer-side sender is dropped or on cancellation.
pub struct ChannelSource {
    name: String,
    receiver: Receiver<Update>,
}

impl ChannelSource {
    pub fn new(name: impl Into<String>, receiver: Receiver<Update>) -> Self {
        Self {
            name: name.into(),
            receiver,
        }
    }
}

impl UpdateSource for ChannelSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, cancel: &CancellationToken, out: &Sender<Update>) -> Result<()> {
        loop {
            select! {
                recv(cancel.receiver()) -> _ => return Err(NotifyError::Cancelled),
                recv(self.receiver) -> msg => match msg {
                    Ok(update) => {
                        if !send_or_cancel(out, update, cancel) {
                            return Err(NotifyError::Cancelled);
                        }
                    }
                    Err(_) => {
                        debug!(source = %self.name, "producer disconnected");
                        return Ok(());
                    }
                },
            }
        }
    }
}
