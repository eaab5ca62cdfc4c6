//! Single-threaded event reactor.
//!
//! A [`Reactor`] owns the application state `S`, a [`TimerQueue`] over
//! itself, and a bounded table of descriptor registrations. [`run`] loops:
//!
//! 1. stop if [`stop`] was requested, or if nothing is left to wait for;
//! 2. wait in `poll(2)` for at most `min(next timer, poll interval)`;
//! 3. pump due timers;
//! 4. invoke the callback of each ready descriptor once.
//!
//! Every callback receives `&mut Reactor<S>`, so it can reach the state,
//! schedule timers, register descriptors or stop the loop. Signals are
//! delivered through a self-pipe and their handlers run inside step 4 like
//! any other callback.
//!
//! [`run`]: Reactor::run
//! [`stop`]: Reactor::stop

mod signal;

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::{Result, RtpError};
use crate::timer::{HasTimers, TimerQueue};

use signal::SignalPipe;

/// Default upper bound on registrations, matching `FD_SETSIZE`.
pub const DEFAULT_MAX_DESCRIPTORS: usize = 1024;

/// Wait bound used when no timer is pending.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Readiness condition a callback is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    Except,
}

impl Interest {
    fn events(self) -> libc::c_short {
        match self {
            Self::Read => libc::POLLIN,
            Self::Write => libc::POLLOUT,
            Self::Except => libc::POLLPRI,
        }
    }

    fn is_ready(self, revents: libc::c_short) -> bool {
        let mask = match self {
            Self::Read => libc::POLLIN | libc::POLLHUP | libc::POLLERR,
            Self::Write => libc::POLLOUT | libc::POLLHUP | libc::POLLERR,
            Self::Except => libc::POLLPRI,
        };
        revents & mask != 0
    }
}

/// Lifecycle of a reactor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorState {
    Idle,
    Running,
    /// Terminal until [`Reactor::reset`].
    Stopped,
}

/// Callback for a ready descriptor.
pub type IoCallback<S> = Box<dyn FnMut(&mut Reactor<S>, RawFd)>;

/// Callback for a delivered signal.
pub type SignalHandler<S> = Box<dyn FnMut(&mut Reactor<S>, i32)>;

struct Registration<S> {
    id: u64,
    fd: RawFd,
    interest: Interest,
    /// Taken out while the callback runs.
    callback: Option<IoCallback<S>>,
}

struct SignalEntry<S> {
    signum: i32,
    handler: Option<SignalHandler<S>>,
}

pub struct Reactor<S> {
    state: S,
    timers: TimerQueue<Reactor<S>>,
    registrations: Vec<Registration<S>>,
    next_id: u64,
    max_descriptors: usize,
    poll_interval: Duration,
    signals: Option<SignalPipe>,
    signal_handlers: Vec<SignalEntry<S>>,
    status: ReactorState,
    stop_requested: bool,
}

impl<S> HasTimers for Reactor<S> {
    fn timers(&mut self) -> &mut TimerQueue<Self> {
        &mut self.timers
    }
}

impl<S> Reactor<S> {
    pub fn new(state: S) -> Self {
        Self {
            state,
            timers: TimerQueue::new(),
            registrations: Vec::new(),
            next_id: 0,
            max_descriptors: DEFAULT_MAX_DESCRIPTORS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            signals: None,
            signal_handlers: Vec::new(),
            status: ReactorState::Idle,
            stop_requested: false,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_descriptors(mut self, max: usize) -> Self {
        self.max_descriptors = max;
        self
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// Split borrow of the application state and the timer queue.
    pub fn parts_mut(&mut self) -> (&mut S, &mut TimerQueue<Self>) {
        (&mut self.state, &mut self.timers)
    }

    pub fn into_state(self) -> S {
        self.state
    }

    pub fn status(&self) -> ReactorState {
        self.status
    }

    pub fn descriptor_count(&self) -> usize {
        self.registrations.len()
    }

    // --- registration ---

    /// Set or clear the callback for `fd` becoming ready for `interest`.
    ///
    /// `Some` replaces any existing registration for the same pair; `None`
    /// removes it. A callback may re-register or remove itself.
    pub fn set_callback(
        &mut self,
        fd: RawFd,
        interest: Interest,
        callback: Option<IoCallback<S>>,
    ) -> Result<()> {
        let existing = self
            .registrations
            .iter()
            .position(|r| r.fd == fd && r.interest == interest);
        if let Some(idx) = existing {
            self.registrations.remove(idx);
        }
        let Some(callback) = callback else {
            tracing::trace!(fd, ?interest, "descriptor unregistered");
            return Ok(());
        };
        if self.registrations.len() >= self.max_descriptors {
            return Err(RtpError::TooManyDescriptors(self.max_descriptors));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.registrations.push(Registration {
            id,
            fd,
            interest,
            callback: Some(callback),
        });
        tracing::trace!(fd, ?interest, "descriptor registered");
        Ok(())
    }

    pub fn register(
        &mut self,
        fd: RawFd,
        interest: Interest,
        callback: impl FnMut(&mut Reactor<S>, RawFd) + 'static,
    ) -> Result<()> {
        self.set_callback(fd, interest, Some(Box::new(callback)))
    }

    pub fn unregister(&mut self, fd: RawFd, interest: Interest) {
        // removal never fails
        let _ = self.set_callback(fd, interest, None);
    }

    /// Run `handler` on the reactor thread whenever `signum` is raised.
    pub fn on_signal(
        &mut self,
        signum: i32,
        handler: impl FnMut(&mut Reactor<S>, i32) + 'static,
    ) -> Result<()> {
        if self.signals.is_none() {
            self.signals = Some(SignalPipe::open()?);
        }
        if let Some(pipe) = &mut self.signals {
            pipe.install(signum)?;
        }
        self.signal_handlers.retain(|h| h.signum != signum);
        self.signal_handlers.push(SignalEntry {
            signum,
            handler: Some(Box::new(handler)),
        });
        tracing::debug!(signum, "signal handler installed");
        Ok(())
    }

    // --- lifecycle ---

    /// Request the loop to end at the top of its next iteration.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// Return a stopped reactor to [`ReactorState::Idle`].
    pub fn reset(&mut self) {
        self.status = ReactorState::Idle;
        self.stop_requested = false;
    }

    /// Run until stopped, or until no descriptor and no timer is left.
    pub fn run(&mut self) -> Result<()> {
        match self.status {
            ReactorState::Stopped => return Err(RtpError::ReactorStopped),
            ReactorState::Running => return Ok(()),
            ReactorState::Idle => {}
        }
        self.status = ReactorState::Running;
        tracing::debug!(
            descriptors = self.registrations.len(),
            timers = self.timers.len(),
            "reactor running"
        );
        let result = self.run_loop();
        self.status = ReactorState::Stopped;
        tracing::debug!("reactor stopped");
        result
    }

    fn run_loop(&mut self) -> Result<()> {
        loop {
            if self.stop_requested {
                return Ok(());
            }
            if self.registrations.is_empty() && self.timers.is_empty() {
                tracing::debug!("no descriptors or timers left");
                return Ok(());
            }

            let wait = self
                .timers
                .next_wakeup()
                .map_or(self.poll_interval, |d| d.min(self.poll_interval));

            let mut ids = Vec::with_capacity(self.registrations.len());
            let mut fds = Vec::with_capacity(self.registrations.len() + 1);
            for reg in &self.registrations {
                ids.push(reg.id);
                fds.push(pollfd(reg.fd, reg.interest.events()));
            }
            if let Some(pipe) = &self.signals {
                fds.push(pollfd(pipe.fd(), libc::POLLIN));
            }

            let ready = poll(&mut fds, wait)?;
            TimerQueue::pump(self);
            if ready == 0 {
                continue;
            }

            if self.signals.is_some() && fds.len() > ids.len() {
                let pipe_fd = fds[ids.len()];
                if pipe_fd.revents & libc::POLLIN != 0 {
                    self.dispatch_signals();
                }
            }
            for (id, pfd) in ids.iter().zip(&fds) {
                if pfd.revents & libc::POLLNVAL != 0 {
                    tracing::warn!(fd = pfd.fd, "invalid descriptor, dropping registration");
                    self.registrations.retain(|r| r.id != *id);
                    continue;
                }
                self.dispatch(*id, pfd.revents);
            }
        }
    }

    fn dispatch(&mut self, id: u64, revents: libc::c_short) {
        let Some(reg) = self.registrations.iter_mut().find(|r| r.id == id) else {
            // removed by an earlier callback in this round
            return;
        };
        if !reg.interest.is_ready(revents) {
            return;
        }
        let fd = reg.fd;
        let Some(mut callback) = reg.callback.take() else {
            return;
        };
        callback(self, fd);
        if let Some(reg) = self.registrations.iter_mut().find(|r| r.id == id) {
            reg.callback = Some(callback);
        }
    }

    fn dispatch_signals(&mut self) {
        let delivered = match &mut self.signals {
            Some(pipe) => pipe.drain(),
            None => return,
        };
        for signum in delivered {
            tracing::debug!(signum, "signal delivered");
            let Some(entry) = self.signal_handlers.iter_mut().find(|h| h.signum == signum) else {
                continue;
            };
            let Some(mut handler) = entry.handler.take() else {
                continue;
            };
            handler(self, signum);
            if let Some(entry) = self
                .signal_handlers
                .iter_mut()
                .find(|h| h.signum == signum && h.handler.is_none())
            {
                entry.handler = Some(handler);
            }
        }
    }
}

fn pollfd(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

/// `poll(2)` with a timeout rounded up to whole milliseconds. An
/// interrupted wait reports no ready descriptors.
fn poll(fds: &mut [libc::pollfd], timeout: Duration) -> io::Result<usize> {
    let ms = timeout.as_micros().div_ceil(1000).min(i32::MAX as u128) as libc::c_int;
    // SAFETY: `fds` is a valid, exclusively borrowed slice of pollfd.
    let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, ms) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::Deadline;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    #[derive(Default)]
    struct Log {
        events: Vec<String>,
    }

    fn after(ms: u64) -> Deadline {
        Deadline::After(Duration::from_millis(ms))
    }

    // --- timers ---

    #[test]
    fn timer_only_loop_stops_when_drained() {
        let mut reactor = Reactor::new(Log::default());
        for (client, ms) in [(1, 30), (2, 10), (3, 20)] {
            reactor.timers().schedule(client, after(ms), |r: &mut Reactor<Log>, c| {
                r.state_mut().events.push(format!("t{c}"));
            });
        }
        reactor.run().unwrap();
        assert_eq!(reactor.status(), ReactorState::Stopped);
        assert_eq!(reactor.state().events, vec!["t2", "t3", "t1"]);
    }

    #[test]
    fn timers_fire_without_descriptor_activity() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut reactor = Reactor::new(Log::default()).with_poll_interval(Duration::from_secs(5));
        reactor
            .register(a.as_raw_fd(), Interest::Read, |_, _| {})
            .unwrap();
        let start = Instant::now();
        reactor.timers().schedule(1, after(20), |r: &mut Reactor<Log>, _| {
            r.stop();
        });
        reactor.run().unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_secs(5));
    }

    // --- lifecycle ---

    #[test]
    fn stop_is_observed_and_reset_allows_rerun() {
        let mut reactor = Reactor::new(0u32).with_poll_interval(Duration::from_millis(5));
        reactor.timers().schedule_repeating(
            1,
            after(1),
            Duration::from_millis(1),
            |r: &mut Reactor<u32>, _| {
                *r.state_mut() += 1;
                if *r.state() == 3 {
                    r.stop();
                }
            },
        );
        assert_eq!(reactor.status(), ReactorState::Idle);
        reactor.run().unwrap();
        assert_eq!(*reactor.state(), 3);
        assert!(matches!(reactor.run(), Err(RtpError::ReactorStopped)));

        reactor.reset();
        assert_eq!(reactor.status(), ReactorState::Idle);
        *reactor.state_mut() = 0;
        reactor.run().unwrap();
        assert_eq!(*reactor.state(), 3);
    }

    // --- descriptors ---

    #[test]
    fn readable_descriptor_dispatches_callback() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        tx.write_all(b"ping").unwrap();

        let mut rx = rx;
        let fd = rx.as_raw_fd();
        let mut reactor = Reactor::new(Log::default());
        reactor
            .register(fd, Interest::Read, move |r: &mut Reactor<Log>, fd| {
                let mut buf = [0u8; 16];
                let n = rx.read(&mut buf).unwrap();
                r.state_mut()
                    .events
                    .push(String::from_utf8_lossy(&buf[..n]).into_owned());
                r.unregister(fd, Interest::Read);
            })
            .unwrap();
        reactor.run().unwrap();
        assert_eq!(reactor.state().events, vec!["ping"]);
        assert_eq!(reactor.descriptor_count(), 0);
    }

    #[test]
    fn none_callback_removes_registration() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut reactor = Reactor::new(());
        reactor
            .register(a.as_raw_fd(), Interest::Read, |_, _| {})
            .unwrap();
        reactor
            .register(a.as_raw_fd(), Interest::Write, |_, _| {})
            .unwrap();
        assert_eq!(reactor.descriptor_count(), 2);
        reactor.set_callback(a.as_raw_fd(), Interest::Read, None).unwrap();
        assert_eq!(reactor.descriptor_count(), 1);
    }

    #[test]
    fn descriptor_table_is_bounded() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut reactor = Reactor::new(()).with_max_descriptors(1);
        reactor
            .register(a.as_raw_fd(), Interest::Read, |_, _| {})
            .unwrap();
        // replacing an existing registration does not count twice
        reactor
            .register(a.as_raw_fd(), Interest::Read, |_, _| {})
            .unwrap();
        let err = reactor
            .register(b.as_raw_fd(), Interest::Read, |_, _| {})
            .unwrap_err();
        assert!(matches!(err, RtpError::TooManyDescriptors(1)));
    }

    // --- signals ---

    #[test]
    fn signal_handler_runs_on_reactor_thread() {
        let mut reactor =
            Reactor::new(Log::default()).with_poll_interval(Duration::from_millis(20));
        reactor
            .on_signal(libc::SIGUSR1, |r: &mut Reactor<Log>, signum| {
                r.state_mut().events.push(format!("sig{signum}"));
                r.stop();
            })
            .unwrap();
        reactor.timers().schedule(1, after(1), |r: &mut Reactor<Log>, _| {
            r.state_mut().events.push("raise".into());
            // SAFETY: the handler for SIGUSR1 is installed above.
            unsafe {
                libc::raise(libc::SIGUSR1);
            }
        });
        // keeps the loop alive until the signal arrives
        reactor.timers().schedule(2, after(10_000), |_, _| {});
        reactor.run().unwrap();
        assert_eq!(
            reactor.state().events,
            vec!["raise".to_string(), format!("sig{}", libc::SIGUSR1)]
        );
    }
}
