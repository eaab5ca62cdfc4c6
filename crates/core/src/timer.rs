//! Per-client software timers.
//!
//! A [`TimerQueue`] holds at most one pending timer per [`ClientId`], kept in
//! ascending expiration order (ties in insertion order). The queue is
//! generic over the context its callbacks receive, so a callback can reach
//! back into the queue through [`HasTimers`] and schedule or cancel timers,
//! including its own, while a pump is in progress.
//!
//! ```text
//!   schedule(c, 20ms) ──┐
//!   schedule(d, 5ms)  ──┼──► [ d@5ms | c@20ms | e@20ms ] ──► pump(now) fires
//!   schedule(e, 20ms) ──┘        sorted by (expires, seq)     every entry <= now
//! ```
//!
//! The number of concurrently pending timers in the tools is small (one per
//! read-ahead slot plus a few housekeeping timers), so entries live in a
//! sorted `Vec` with an ordered insert.

use std::fmt;
use std::time::{Duration, Instant};

/// Opaque handle naming the owner of a timer.
pub type ClientId = u64;

/// Callback invoked when a timer fires.
pub type TimerCallback<C> = Box<dyn FnMut(&mut C, ClientId)>;

/// Longest relative delay honoured; longer ones are clamped to it.
pub const MAX_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// When a timer should fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Relative to the moment of scheduling. `After(Duration::ZERO)` cancels
    /// the client's pending timer instead of setting a new one.
    After(Duration),
    /// Absolute instant; an instant in the past fires on the next pump.
    At(Instant),
}

impl Deadline {
    fn resolve(self, now: Instant) -> Option<Instant> {
        match self {
            Self::After(d) if d.is_zero() => None,
            Self::After(d) => now.checked_add(d.min(MAX_DELAY)).or(Some(now)),
            Self::At(at) => Some(at),
        }
    }
}

/// A context owning a [`TimerQueue`] over itself.
pub trait HasTimers: Sized {
    fn timers(&mut self) -> &mut TimerQueue<Self>;
}

struct Entry<C> {
    client: ClientId,
    expires: Instant,
    interval: Option<Duration>,
    seq: u64,
    callback: TimerCallback<C>,
}

/// Ordered set of pending timers, at most one per client.
pub struct TimerQueue<C> {
    entries: Vec<Entry<C>>,
    next_seq: u64,
    pumping: bool,
    /// Client whose callback is running, and whether that callback
    /// replaced or cancelled its own timer.
    firing: Option<ClientId>,
    overridden: bool,
}

impl<C> TimerQueue<C> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 0,
            pumping: false,
            firing: None,
            overridden: false,
        }
    }

    /// Set the timer for `client`, replacing any pending one.
    ///
    /// Returns `false` when `deadline` is a zero delay, which only cancels.
    pub fn schedule(
        &mut self,
        client: ClientId,
        deadline: Deadline,
        callback: impl FnMut(&mut C, ClientId) + 'static,
    ) -> bool {
        self.schedule_entry(client, deadline, None, Box::new(callback))
    }

    /// Like [`schedule`](Self::schedule), but after each firing the timer is
    /// re-armed at `expiration + interval` until cancelled. The callback may
    /// cancel or reschedule its own client to end the repetition.
    pub fn schedule_repeating(
        &mut self,
        client: ClientId,
        deadline: Deadline,
        interval: Duration,
        callback: impl FnMut(&mut C, ClientId) + 'static,
    ) -> bool {
        let interval = (!interval.is_zero()).then_some(interval);
        self.schedule_entry(client, deadline, interval, Box::new(callback))
    }

    fn schedule_entry(
        &mut self,
        client: ClientId,
        deadline: Deadline,
        interval: Option<Duration>,
        callback: TimerCallback<C>,
    ) -> bool {
        self.cancel(client);
        let Some(expires) = deadline.resolve(Instant::now()) else {
            return false;
        };
        let seq = self.bump_seq();
        self.insert(Entry {
            client,
            expires,
            interval,
            seq,
            callback,
        });
        true
    }

    /// Remove the pending timer for `client`. Returns whether one existed.
    pub fn cancel(&mut self, client: ClientId) -> bool {
        if self.firing == Some(client) {
            self.overridden = true;
        }
        match self.entries.iter().position(|e| e.client == client) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, client: ClientId) -> bool {
        self.entries.iter().any(|e| e.client == client)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Expiration of the earliest pending timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|e| e.expires)
    }

    /// Time until the earliest pending timer, zero if it is already due.
    /// `None` means nothing is pending; callers should fall back to a
    /// bounded poll interval rather than block forever.
    pub fn next_wakeup(&self) -> Option<Duration> {
        self.next_wakeup_at(Instant::now())
    }

    pub fn next_wakeup_at(&self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|at| at.saturating_duration_since(now))
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn insert(&mut self, entry: Entry<C>) {
        let idx = self.entries.partition_point(|e| e.expires <= entry.expires);
        self.entries.insert(idx, entry);
    }
}

impl<C: HasTimers> TimerQueue<C> {
    /// Fire every timer due at the current instant.
    pub fn pump(ctx: &mut C) -> usize {
        Self::pump_at(ctx, Instant::now())
    }

    /// Fire every timer with expiration `<= now`, earliest first. Returns
    /// the number of callbacks invoked.
    ///
    /// Each entry is removed before its callback runs. Timers scheduled by
    /// a callback during this pump are not considered until the next pump,
    /// even if already due, so a callback that keeps re-arming itself
    /// cannot starve the loop. Nested pumps from inside a callback fire
    /// nothing.
    pub fn pump_at(ctx: &mut C, now: Instant) -> usize {
        let queue = ctx.timers();
        if queue.pumping {
            return 0;
        }
        queue.pumping = true;
        let cutoff = queue.next_seq;
        let mut fired = 0;

        loop {
            let queue = ctx.timers();
            let due = queue
                .entries
                .iter()
                .take_while(|e| e.expires <= now)
                .position(|e| e.seq < cutoff);
            let Some(idx) = due else {
                break;
            };
            let mut entry = queue.entries.remove(idx);
            queue.firing = Some(entry.client);
            queue.overridden = false;

            tracing::trace!(client = entry.client, "timer fired");
            (entry.callback)(ctx, entry.client);
            fired += 1;

            let queue = ctx.timers();
            queue.firing = None;
            if let Some(interval) = entry.interval
                && !queue.overridden
                && let Some(expires) = entry.expires.checked_add(interval)
            {
                entry.expires = expires;
                entry.seq = queue.bump_seq();
                queue.insert(entry);
            }
        }

        ctx.timers().pumping = false;
        fired
    }
}

impl<C> Default for TimerQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for TimerQueue<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| (e.client, e.expires)))
            .finish()
    }
}
