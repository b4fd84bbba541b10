//! "New task available" signal detection.
//!
//! [`EdgeDetector`] is the pure state machine: it turns a sequence of
//! disabled/enabled observations into edges and halts after the first signal.
//! [`SignalDetector`] drives it from an [`ElementLocator`], re-evaluating on
//! every marker change and re-acquiring the element on a poll tick, and sends
//! the signal through a [`SignalNotifier`] on the first rising edge.

pub mod element;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bot::BotError;
use crate::store::Store;

pub use element::{ElementLocator, ElementMarkers, SharedLocator, WatchedElement};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// disabled -> enabled. The caller sends the signal and calls
    /// [`EdgeDetector::mark_sent`].
    Rising,
    /// enabled -> disabled.
    Falling,
    Steady,
    /// The signal was already sent; nothing more is reported.
    Halted,
}

#[derive(Debug, Clone)]
pub struct EdgeDetector {
    was_disabled: bool,
    signal_sent: bool,
}

impl EdgeDetector {
    pub fn new(initially_disabled: bool) -> Self {
        Self {
            was_disabled: initially_disabled,
            signal_sent: false,
        }
    }

    pub fn observe(&mut self, is_disabled: bool) -> Edge {
        if self.signal_sent {
            return Edge::Halted;
        }
        match (self.was_disabled, is_disabled) {
            (true, false) => {
                self.was_disabled = false;
                Edge::Rising
            }
            (false, true) => {
                self.was_disabled = true;
                Edge::Falling
            }
            _ => Edge::Steady,
        }
    }

    pub fn mark_sent(&mut self) {
        self.signal_sent = true;
    }

    /// Start over from `is_disabled` after the element was replaced.
    pub fn reseed(&mut self, is_disabled: bool) {
        self.was_disabled = is_disabled;
    }

    pub fn was_disabled(&self) -> bool {
        self.was_disabled
    }

    pub fn signal_sent(&self) -> bool {
        self.signal_sent
    }
}

/// Delivers the "new task available" signal.
pub trait SignalNotifier: Send + Sync {
    fn notify<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<(), BotError>>;
}

/// Supplies the identity token the signal is sent for.
pub trait TokenSource: Send + Sync {
    fn user_id(&self) -> Option<String>;
}

impl TokenSource for Store {
    fn user_id(&self) -> Option<String> {
        Store::user_id(self)
    }
}

impl<F> TokenSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn user_id(&self) -> Option<String> {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorOutcome {
    /// The signal was attempted; `delivered` is false when sending failed.
    SignalSent { delivered: bool },
    Cancelled,
}

/// Watches one element and sends a single signal on its first
/// disabled -> enabled transition.
pub struct SignalDetector {
    tokens: Arc<dyn TokenSource>,
    locator: Arc<dyn ElementLocator>,
    notifier: Arc<dyn SignalNotifier>,
    poll_interval: Duration,
}

impl SignalDetector {
    pub fn new(
        tokens: Arc<dyn TokenSource>,
        locator: Arc<dyn ElementLocator>,
        notifier: Arc<dyn SignalNotifier>,
    ) -> Self {
        Self {
            tokens,
            locator,
            notifier,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn run(&self, cancel: CancellationToken) -> DetectorOutcome {
        let Some(user_id) = self.wait_for_user(&cancel).await else {
            return DetectorOutcome::Cancelled;
        };
        tracing::debug!(user_id = %user_id, "detector armed");

        let mut edge = EdgeDetector::new(true);

        'acquire: loop {
            let Some(mut element) = self.wait_for_element(&cancel).await else {
                return DetectorOutcome::Cancelled;
            };
            let disabled = element.is_disabled();
            edge.reseed(disabled);
            tracing::debug!(element = element.id, disabled, "observing element");

            let mut ticker = tokio::time::interval_at(
                Instant::now() + self.poll_interval,
                self.poll_interval,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let mut is_disabled = disabled;
            loop {
                match edge.observe(is_disabled) {
                    Edge::Rising => return self.fire(&mut edge, &user_id).await,
                    Edge::Falling => tracing::debug!(element = element.id, "element disabled"),
                    Edge::Steady | Edge::Halted => {}
                }

                is_disabled = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return DetectorOutcome::Cancelled,
                    changed = element.markers.changed() => {
                        if changed.is_err() {
                            tracing::debug!(element = element.id, "element replaced or removed");
                            continue 'acquire;
                        }
                        element.is_disabled()
                    }
                    _ = ticker.tick() => match self.locator.locate() {
                        None => {
                            tracing::debug!(element = element.id, "element gone");
                            continue 'acquire;
                        }
                        Some(found) if found.id != element.id => {
                            tracing::debug!(old = element.id, new = found.id, "element swapped");
                            element = found;
                            let disabled = element.is_disabled();
                            edge.reseed(disabled);
                            disabled
                        }
                        Some(_) => element.is_disabled(),
                    },
                };
            }
        }
    }

    async fn fire(&self, edge: &mut EdgeDetector, user_id: &str) -> DetectorOutcome {
        edge.mark_sent();
        let delivered = match self.notifier.notify(user_id).await {
            Ok(()) => {
                tracing::info!("new task signal sent");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to send new task signal");
                false
            }
        };
        DetectorOutcome::SignalSent { delivered }
    }

    async fn wait_for_user(&self, cancel: &CancellationToken) -> Option<String> {
        loop {
            if let Some(user_id) = self.tokens.user_id() {
                return Some(user_id);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn wait_for_element(&self, cancel: &CancellationToken) -> Option<WatchedElement> {
        loop {
            if let Some(element) = self.locator.locate() {
                return Some(element);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
