//! Exit notification delivery
//!
//! A [`NotificationDispatcher`] receives the [`ExitSignal`] of a handle that
//! was still attached when its child was reaped. Each handle calls its
//! dispatcher at most once, and only after the handle reached
//! `Terminated`.
//!
//! Implementations must return promptly: `deliver` runs on the reaper task,
//! so anything slow belongs behind a queue (see [`ChannelDispatcher`]).

use parking_lot::Mutex;
use schema::ExitSignal;
use std::fmt;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Sink for termination notifications
pub trait NotificationDispatcher: Send + Sync {
    /// Hand over the exit record of one terminated child
    fn deliver(&self, signal: ExitSignal);
}

/// Dispatcher that drops every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDispatcher;

impl NotificationDispatcher for NullDispatcher {
    fn deliver(&self, signal: ExitSignal) {
        debug!("Discarding exit notification for process {}", signal.pid);
    }
}

/// Dispatcher that queues notifications on an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<ExitSignal>,
}

impl ChannelDispatcher {
    /// Create a dispatcher together with the receiving end of its queue
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExitSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationDispatcher for ChannelDispatcher {
    fn deliver(&self, signal: ExitSignal) {
        let pid = signal.pid;
        if self.tx.send(signal).is_err() {
            warn!("Exit notification for process {} dropped: receiver closed", pid);
        }
    }
}

/// Dispatcher that fans notifications out to every subscriber
#[derive(Debug, Clone)]
pub struct BroadcastDispatcher {
    tx: broadcast::Sender<ExitSignal>,
}

impl BroadcastDispatcher {
    /// Create a dispatcher buffering up to `capacity` undelivered signals
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to notifications delivered from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ExitSignal> {
        self.tx.subscribe()
    }
}

impl NotificationDispatcher for BroadcastDispatcher {
    fn deliver(&self, signal: ExitSignal) {
        let pid = signal.pid;
        if self.tx.send(signal).is_err() {
            debug!("No subscribers for exit notification of process {}", pid);
        }
    }
}

/// Dispatcher that invokes a closure for each notification
pub struct CallbackDispatcher<F>
where
    F: Fn(ExitSignal) + Send + Sync,
{
    callback: F,
}

impl<F> CallbackDispatcher<F>
where
    F: Fn(ExitSignal) + Send + Sync,
{
    /// Wrap `callback`; it runs on the reaper task and must not block
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> fmt::Debug for CallbackDispatcher<F>
where
    F: Fn(ExitSignal) + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackDispatcher").finish_non_exhaustive()
    }
}

impl<F> NotificationDispatcher for CallbackDispatcher<F>
where
    F: Fn(ExitSignal) + Send + Sync,
{
    fn deliver(&self, signal: ExitSignal) {
        (self.callback)(signal);
    }
}

/// Dispatcher that records every notification, for tests and diagnostics
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    delivered: Mutex<Vec<ExitSignal>>,
}

impl RecordingDispatcher {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything delivered so far, in delivery order
    pub fn delivered(&self) -> Vec<ExitSignal> {
        self.delivered.lock().clone()
    }

    /// Number of notifications delivered so far
    pub fn count(&self) -> usize {
        self.delivered.lock().len()
    }

    /// Number of notifications delivered for `pid`
    pub fn count_for(&self, pid: u32) -> usize {
        self.delivered.lock().iter().filter(|s| s.pid == pid).count()
    }
}

impl NotificationDispatcher for RecordingDispatcher {
    fn deliver(&self, signal: ExitSignal) {
        self.delivered.lock().push(signal);
    }
}
