//! Subscriber handle: a private read position over a shared topic.
//!
//! Delivery is lossy. A subscriber that falls more than a ring's worth behind
//! gets a [`PollOutcome::Gap`] and continues from the oldest message still
//! held; it never sees a partially overwritten payload.

use crate::error::{BusError, Result};
use crate::frame::Message;
use crate::ring::Position;
use crate::sync::WaitOutcome;
use crate::topic::{Liveness, Topic};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, warn};

/// Where a new subscriber starts reading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StartPosition {
    /// Only messages published after subscribing.
    #[default]
    Latest,
    /// Everything the ring still holds.
    Oldest,
    /// From this sequence on; yields a gap first if it was already overwritten.
    Sequence(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// New messages in sequence order, never empty.
    Messages(Vec<Message>),
    /// Messages were overwritten before they could be read. The subscriber
    /// continues at `resync`.
    Gap { missed: u64, resync: u64 },
    TimedOut,
    Cancelled,
}

pub struct Subscriber {
    topic: Arc<Topic>,
    at: Position,
    overruns: u64,
    cancelled: Arc<AtomicBool>,
}

/// Cancels blocking polls of one subscriber from any thread. Cancellation is
/// sticky: every later `poll` returns [`PollOutcome::Cancelled`] at once.
///
/// The handle does not keep the topic attached.
#[derive(Clone)]
pub struct CancelHandle {
    topic: Weak<Topic>,
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        // a topic that is gone has no waiters left to wake
        let Some(topic) = self.topic.upgrade() else {
            return;
        };
        if let Err(e) = topic.wake_all() {
            warn!(topic = %topic.name(), error = %e, "failed to wake subscriber for cancellation");
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

impl Subscriber {
    pub(crate) fn new(topic: Arc<Topic>, start: StartPosition) -> Result<Self> {
        let cursor = topic.cursor()?;
        let at = match start {
            StartPosition::Latest => Position::at_head(&cursor),
            StartPosition::Oldest => Position::at_tail(&cursor),
            StartPosition::Sequence(seq) => Position::at_seq(seq),
        };
        debug!(topic = %topic.name(), ?start, seq = at.seq, "subscribed");
        Ok(Self {
            topic,
            at,
            overruns: 0,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Waits up to `timeout` for messages newer than the last one returned.
    ///
    /// A `timeout` too large to express as a deadline (e.g. [`Duration::MAX`])
    /// waits until data arrives or the subscriber is cancelled.
    pub fn poll(&mut self, timeout: Duration) -> Result<PollOutcome> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                return Ok(PollOutcome::Cancelled);
            }
            if let Some(outcome) = self.try_poll()? {
                return Ok(outcome);
            }
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => timeout,
            };
            if remaining.is_zero() {
                return Ok(PollOutcome::TimedOut);
            }
            match self.topic.wait(self.at.seq, remaining, Some(&self.cancelled))? {
                WaitOutcome::Ready => {}
                WaitOutcome::TimedOut => return Ok(PollOutcome::TimedOut),
                WaitOutcome::Cancelled => return Ok(PollOutcome::Cancelled),
            }
        }
    }

    /// Returns what is available right now, `None` if nothing is.
    pub fn try_poll(&mut self) -> Result<Option<PollOutcome>> {
        match self.topic.read(self.at) {
            Ok(batch) if batch.messages.is_empty() => Ok(None),
            Ok(batch) => {
                self.at = batch.next;
                Ok(Some(PollOutcome::Messages(batch.messages)))
            }
            Err(BusError::SequenceTooOld { requested, oldest }) => {
                let missed = oldest.saturating_sub(requested);
                self.overruns += missed;
                self.at = Position::at_seq(oldest);
                debug!(
                    topic = %self.topic.name(),
                    missed,
                    resync = oldest,
                    overruns = self.overruns,
                    "subscriber fell behind"
                );
                Ok(Some(PollOutcome::Gap {
                    missed,
                    resync: oldest,
                }))
            }
            Err(e) => Err(e),
        }
    }

    /// Sequence of the next message this subscriber will return.
    #[inline]
    pub fn position(&self) -> u64 {
        self.at.seq
    }

    /// Total messages lost through gaps.
    #[inline]
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            topic: Arc::downgrade(&self.topic),
            flag: Arc::clone(&self.cancelled),
        }
    }

    pub fn publisher_liveness(&self) -> Liveness {
        self.topic.publisher_liveness()
    }

    pub fn last_publish(&self) -> Option<SystemTime> {
        self.topic.last_publish()
    }

    #[inline]
    pub fn topic(&self) -> &Arc<Topic> {
        &self.topic
    }

    /// Hands the subscriber to a background thread that delivers every
    /// [`PollOutcome::Messages`] and [`PollOutcome::Gap`] to `callback`.
    ///
    /// The thread runs until the returned [`Subscription`] is stopped or
    /// dropped, or until a poll fails.
    pub fn spawn<F>(self, callback: F) -> Result<Subscription>
    where
        F: FnMut(PollOutcome) + Send + 'static,
    {
        let cancel = self.cancel_handle();
        let name = self.topic.shm_name().to_owned();
        let handle = thread::Builder::new()
            .name(format!("basalt-sub-{}", self.topic.name()))
            .spawn(move || self.deliver(callback))
            .map_err(|e| BusError::os("thread spawn", &name, e))?;
        Ok(Subscription {
            cancel,
            handle: Some(handle),
        })
    }

    fn deliver<F: FnMut(PollOutcome)>(mut self, mut callback: F) -> Result<Subscriber> {
        loop {
            match self.poll(CALLBACK_POLL_TIMEOUT) {
                Ok(PollOutcome::Cancelled) => {
                    // the subscriber handed back by `Subscription::stop` polls again
                    self.cancelled.store(false, Ordering::Release);
                    return Ok(self);
                }
                Ok(PollOutcome::TimedOut) => {}
                Ok(outcome) => callback(outcome),
                Err(e) => {
                    error!(topic = %self.topic.name(), error = %e, "subscription thread stopped");
                    return Err(e);
                }
            }
        }
    }

    /// Detaches from the topic. Equivalent to dropping the subscriber.
    ///
    /// The region's attachment count drops once the last handle sharing this
    /// mapping in the process is gone; [`CancelHandle`]s do not count.
    pub fn close(self) {}
}

/// Upper bound of one wait in a subscription thread; cancellation wakes it
/// earlier.
const CALLBACK_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// A subscriber running on its own thread, see [`Subscriber::spawn`].
///
/// Dropping it cancels the thread and joins it.
pub struct Subscription {
    cancel: CancelHandle,
    handle: Option<JoinHandle<Result<Subscriber>>>,
}

impl Subscription {
    /// Cancels the thread, waits for it and returns the subscriber, positioned
    /// after the last outcome delivered.
    ///
    /// Returns the error that stopped the thread early, if any.
    pub fn stop(mut self) -> Result<Subscriber> {
        self.cancel.cancel();
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(panic)) => std::panic::resume_unwind(panic),
            None => unreachable!("subscription joined twice"),
        }
    }

    /// Whether the thread already stopped on its own, after a poll error or
    /// a panic in the callback.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancel.cancel();
            if handle.join().is_err() {
                warn!("subscription callback panicked");
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("topic", &self.topic.name())
            .field("position", &self.at.seq)
            .field("overruns", &self.overruns)
            .finish()
    }
}
