//! The event loop: one logical thread multiplexing timers, fd readiness
//! and deferred work into callbacks.
//!
//! All mutable state sits behind a single mutex. Callbacks of any kind run
//! with the mutex released, so they are free to re-enter the loop API,
//! including modifying or removing the very timer or fd that is firing.
//! Producer threads may add timers, delayed callbacks and connections at
//! any time; their effects are picked up by the next iteration.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::error::Error;
use crate::poll::{default_poller, FdEvents, FdInterest, Poller};
use crate::source::{ConnectionManager, EventSource, EventSourceState, SourceId};
use crate::timer::{now_monotonic, TimerId, TimerPolicy, Timers};

/// Lifecycle of the loop itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLoopState {
    Fresh,
    Started,
    /// Stop requested; waiting for every event source to report `Stopped`
    Stopping,
    Stopped,
}

/// Callback invoked when a registered fd reports an event
pub(crate) type FdCallback = Box<dyn FnMut(RawFd, FdEvents) + Send>;

struct RegisteredFd {
    events: FdEvents,
    owner: SourceId,
    /// Set when a delayed close is pending. Further events are suppressed
    /// until the close runs from the delayed queue.
    closing: bool,
    /// Checked out (None) while the callback executes
    callback: Option<FdCallback>,
}

struct Inner {
    state: EventLoopState,
    timers: Timers,
    delayed: Vec<Box<dyn FnOnce() + Send>>,
    fds: HashMap<RawFd, RegisteredFd>,
    sources: Vec<(SourceId, Arc<dyn EventSource>)>,
    source_id_counter: SourceId,
}

pub struct EventLoop {
    poller: Box<dyn Poller>,
    inner: Mutex<Inner>,
}

impl EventLoop {
    /// Creates a loop over the default readiness backend of the platform
    /// (epoll on Linux, select elsewhere).
    pub fn new() -> Arc<EventLoop> {
        EventLoop::with_poller(default_poller())
    }

    /// Creates a loop over an explicit readiness backend
    pub fn with_poller(poller: Box<dyn Poller>) -> Arc<EventLoop> {
        Arc::new(EventLoop {
            poller,
            inner: Mutex::new(Inner {
                state: EventLoopState::Fresh,
                timers: Timers::default(),
                delayed: Vec::new(),
                fds: HashMap::new(),
                sources: Vec::new(),
                source_id_counter: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> EventLoopState {
        self.lock().state
    }

    /// Starts the loop and every registered event source. Start errors of
    /// individual sources are aggregated: the loop still moves to
    /// `Started`, the first error is returned.
    pub fn start(&self) -> Result<(), Error> {
        let sources = {
            let mut inner = self.lock();
            match inner.state {
                EventLoopState::Fresh | EventLoopState::Stopped => {}
                _ => return Err(Error::BadState("the event loop is already running")),
            }
            info!("starting the event loop");
            inner.state = EventLoopState::Started;
            inner.sources.clone()
        };

        let mut result = Ok(());
        for (_, source) in sources {
            if let Err(e) = source.start() {
                warn!("event source \"{}\" failed to start: {}", source.name(), e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Requests a stop. Every started source is asked to stop; the loop
    /// reaches `Stopped` once all of them have drained, which requires
    /// further `run` iterations.
    pub fn stop(&self) {
        let sources = {
            let mut inner = self.lock();
            info!("stopping the event loop");
            inner.state = EventLoopState::Stopping;
            inner.sources.clone()
        };

        for (_, source) in &sources {
            match source.state() {
                EventSourceState::Starting | EventSourceState::Started => source.stop(),
                _ => {}
            }
        }

        self.check_stopped();
    }

    /// One loop iteration: due timers, fd events (bounded by `timeout` or
    /// the next timer deadline, whichever is closer), delayed callbacks,
    /// stop-check.
    pub fn run(&self, timeout: Duration) -> Result<(), Error> {
        {
            let inner = self.lock();
            match inner.state {
                EventLoopState::Started | EventLoopState::Stopping => {}
                _ => {
                    warn!("cannot iterate an event loop that is not started");
                    return Err(Error::BadState("the event loop is not started"));
                }
            }
        }

        // Cyclic callbacks first; they return the next deadline
        let deadline = self.process_timers();

        let now = now_monotonic();
        let until_deadline = Duration::from_nanos(deadline.saturating_sub(now));
        let wait = until_deadline.min(timeout);

        let interests: Vec<FdInterest> = {
            let inner = self.lock();
            inner
                .fds
                .iter()
                .map(|(&fd, rfd)| FdInterest { fd, events: rfd.events })
                .collect()
        };

        let mut ready = Vec::new();
        if let Err(e) = self.poller.wait(&interests, wait, &mut ready) {
            if e.kind() == io::ErrorKind::Interrupted {
                // Retried on the next iteration
                warn!("interrupted while polling");
                return Ok(());
            }
            warn!("error while polling: {}", e);
            return Err(Error::Internal("error while polling"));
        }

        for (fd, events) in ready {
            self.dispatch_fd(fd, events);
        }

        self.process_delayed();
        self.check_stopped();
        Ok(())
    }

    /*********/
    /* Timer */
    /*********/

    /// Registers a cyclic callback. `base_time` (monotonic nanoseconds, see
    /// [`now_monotonic`]) anchors the phase; without it the first execution
    /// is one interval from now.
    pub fn add_cyclic_callback(
        &self,
        callback: impl FnMut() + Send + 'static,
        interval: Duration,
        base_time: Option<u64>,
        policy: TimerPolicy,
    ) -> Result<TimerId, Error> {
        let interval = interval.as_nanos() as u64;
        if interval == 0 {
            return Err(Error::Internal("the interval must be positive"));
        }
        let mut inner = self.lock();
        Ok(inner.timers.add(Box::new(callback), interval, base_time, policy))
    }

    /// Re-schedules an existing cyclic callback, keeping its id
    pub fn modify_cyclic_callback(
        &self,
        id: TimerId,
        interval: Duration,
        base_time: Option<u64>,
        policy: TimerPolicy,
    ) -> Result<(), Error> {
        let interval = interval.as_nanos() as u64;
        if interval == 0 {
            return Err(Error::Internal("the interval must be positive"));
        }
        self.lock().timers.modify(id, interval, base_time, policy)
    }

    pub fn remove_cyclic_callback(&self, id: TimerId) -> Result<(), Error> {
        self.lock().timers.remove(id)
    }

    /// Registers a callback that fires once after `delay` and is removed
    pub fn add_timed_callback(
        &self,
        callback: impl FnOnce() + Send + 'static,
        delay: Duration,
    ) -> Result<TimerId, Error> {
        let deadline = now_monotonic() + delay.as_nanos() as u64;
        let mut callback = Some(callback);
        let shim = Box::new(move || {
            if let Some(callback) = callback.take() {
                callback();
            }
        });
        let mut inner = self.lock();
        Ok(inner.timers.add(shim, 0, Some(deadline), TimerPolicy::CurrentTime))
    }

    /// Schedules a callback for the end of the current (or next) loop
    /// iteration, after the fd events. Used for all deferred-release work,
    /// in particular delayed closes.
    pub fn add_delayed_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.lock().delayed.push(Box::new(callback));
    }

    fn process_timers(&self) -> u64 {
        loop {
            let (id, mut callback) = {
                let mut inner = self.lock();
                let now = now_monotonic();
                match inner.timers.pop_due(now) {
                    Some(due) => due,
                    None => return inner.timers.next_deadline().unwrap_or(u64::MAX),
                }
            };

            // Execute with the mutex released; the callback may edit its
            // own timer.
            callback();
            self.lock().timers.restore_callback(id, callback);
        }
    }

    fn process_delayed(&self) {
        loop {
            let delayed = std::mem::take(&mut self.lock().delayed);
            if delayed.is_empty() {
                return;
            }
            // Callbacks may enqueue more delayed work; the loop drains
            // those in the same iteration.
            for callback in delayed {
                callback();
            }
        }
    }

    /****************************/
    /* Registered Event Sources */
    /****************************/

    /// Registers an event source. If the loop is already started, the
    /// source is started right away.
    pub fn register_event_source(self: &Arc<Self>, source: Arc<dyn EventSource>) -> Result<(), Error> {
        let id = {
            let mut inner = self.lock();
            inner.source_id_counter += 1;
            inner.source_id_counter
        };

        source.attach(Arc::downgrade(self), id)?;

        let start_now = {
            let mut inner = self.lock();
            inner.sources.push((id, source.clone()));
            inner.state == EventLoopState::Started
        };

        if start_now {
            source.start()?;
        }
        Ok(())
    }

    /// Deregisters a stopped event source
    pub fn deregister_event_source(&self, source: &Arc<dyn EventSource>) -> Result<(), Error> {
        source.detach()?;
        let mut inner = self.lock();
        inner.sources.retain(|(_, s)| !Arc::ptr_eq(s, source));
        Ok(())
    }

    /// First registered connection manager for a protocol, if any
    pub fn find_connection_manager(&self, protocol: &str) -> Option<Arc<dyn ConnectionManager>> {
        let sources: Vec<Arc<dyn EventSource>> =
            self.lock().sources.iter().map(|(_, s)| s.clone()).collect();
        for source in sources {
            if let Some(cm) = source.as_connection_manager() {
                if cm.protocol() == protocol {
                    return Some(cm);
                }
            }
        }
        None
    }

    /// Moves `Stopping` to `Stopped` once every source has drained
    fn check_stopped(&self) {
        let sources = {
            let inner = self.lock();
            if inner.state != EventLoopState::Stopping {
                return;
            }
            inner.sources.clone()
        };

        let all_stopped = sources.iter().all(|(_, s)| s.state() == EventSourceState::Stopped);
        if !all_stopped {
            return;
        }

        let mut inner = self.lock();
        if inner.state == EventLoopState::Stopping {
            info!("the event loop stopped");
            inner.state = EventLoopState::Stopped;
            inner.timers.clear();
        }
    }

    /*********************************/
    /* Registered File Descriptors   */
    /*********************************/

    /// Adds an fd to the registry. At most one registration per fd.
    pub(crate) fn register_fd(
        &self,
        fd: RawFd,
        events: FdEvents,
        owner: SourceId,
        callback: FdCallback,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.fds.contains_key(&fd) {
            return Err(Error::BadState("the fd is already registered"));
        }
        self.poller
            .register(fd, events)
            .map_err(Error::from_os("could not register the fd with the poller"))?;
        trace!("registering fd {}", fd);
        inner.fds.insert(fd, RegisteredFd { events, owner, closing: false, callback: Some(callback) });
        Ok(())
    }

    /// Changes the event mask of a registered fd in place
    pub(crate) fn modify_fd(&self, fd: RawFd, events: FdEvents) -> Result<(), Error> {
        let mut inner = self.lock();
        let rfd = inner.fds.get_mut(&fd).ok_or(Error::NotFound)?;
        self.poller
            .modify(fd, events)
            .map_err(Error::from_os("could not modify the fd with the poller"))?;
        rfd.events = events;
        Ok(())
    }

    /// Removes an fd. Legal from inside the callback of that same fd; the
    /// dispatch detects the removal and drops the checked-out callback.
    pub(crate) fn deregister_fd(&self, fd: RawFd) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.fds.remove(&fd).is_none() {
            return Err(Error::NotFound);
        }
        trace!("unregistering fd {}", fd);
        if let Err(e) = self.poller.deregister(fd) {
            warn!("could not deregister fd {} from the poller: {}", fd, e);
        }
        Ok(())
    }

    /// Marks an fd for delayed close. Events on it are suppressed from now
    /// on. Returns false if the fd is unknown or already marked.
    pub(crate) fn flag_fd_closing(&self, fd: RawFd) -> bool {
        let mut inner = self.lock();
        match inner.fds.get_mut(&fd) {
            Some(rfd) if !rfd.closing => {
                rfd.closing = true;
                true
            }
            _ => false,
        }
    }

    /// The fds registered by one event source (used during source shutdown)
    pub(crate) fn source_fds(&self, owner: SourceId) -> Vec<RawFd> {
        let inner = self.lock();
        inner
            .fds
            .iter()
            .filter(|(_, rfd)| rfd.owner == owner)
            .map(|(&fd, _)| fd)
            .collect()
    }

    fn dispatch_fd(&self, fd: RawFd, events: FdEvents) {
        // One event per fd per iteration, errors first
        let (event, mut callback) = {
            let mut inner = self.lock();
            let rfd = match inner.fds.get_mut(&fd) {
                Some(rfd) => rfd,
                // Deregistered by an earlier callback of this iteration
                None => return,
            };
            if rfd.closing {
                return;
            }

            let event = if events.contains(FdEvents::ERR) {
                FdEvents::ERR
            } else if events.contains(FdEvents::READ) && rfd.events.contains(FdEvents::READ) {
                FdEvents::READ
            } else if events.contains(FdEvents::WRITE) && rfd.events.contains(FdEvents::WRITE) {
                FdEvents::WRITE
            } else {
                return;
            };

            match rfd.callback.take() {
                Some(callback) => (event, callback),
                None => return,
            }
        };

        debug!("processing event {:?} on fd {}", event, fd);
        callback(fd, event);

        // Put the callback back unless the fd deregistered itself (or was
        // replaced by a new registration, which brings its own callback).
        let mut inner = self.lock();
        if let Some(rfd) = inner.fds.get_mut(&fd) {
            if rfd.callback.is_none() {
                rfd.callback = Some(callback);
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Late delayed callbacks (e.g. buffered closes) still run so that
        // sockets do not leak.
        let delayed = std::mem::take(&mut self.lock().delayed);
        for callback in delayed {
            callback();
        }
    }
}
