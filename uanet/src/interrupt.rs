//! The interrupt manager: POSIX signals as cooperative callbacks.
//!
//! The application callback never runs in OS signal context. On Linux each
//! registered signal is blocked and turned into a signalfd that the event
//! loop polls like any other fd. The portable fallback is the self-pipe
//! trick: the only things the signal handler touches are a per-signal
//! triggered flag and the write end of a pipe, both reachable from a
//! process-wide static because a signal handler cannot take arguments.
//! Consequently at most one self-pipe interrupt manager may be active per
//! process.
//!
//! Consecutive raises of the same signal between two loop iterations
//! coalesce into one callback under the self-pipe variant; the signalfd
//! variant delivers one callback per queued signal.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use libc::c_void;
use log::{debug, warn};

use crate::error::Error;
use crate::eventloop::{EventLoop, FdCallback};
use crate::net;
use crate::poll::FdEvents;
use crate::source::{EventSource, EventSourceState, SourceId};

/// Callback with the number of the received signal
pub type InterruptCallback = Box<dyn FnMut(i32) + Send>;

const MAX_SIGNAL: usize = 64;

static SELF_PIPE_ACTIVE: AtomicBool = AtomicBool::new(false);
static SELF_PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

#[allow(clippy::declare_interior_mutable_const)]
const UNTRIGGERED: AtomicBool = AtomicBool::new(false);
static TRIGGERED: [AtomicBool; MAX_SIGNAL] = [UNTRIGGERED; MAX_SIGNAL];

/// The self-pipe signal handler. Only async-signal-safe operations: two
/// atomic stores and a write(2).
extern "C" fn self_pipe_handler(signal: libc::c_int) {
    let idx = signal as usize;
    if idx < MAX_SIGNAL {
        TRIGGERED[idx].store(true, Ordering::Relaxed);
    }
    let fd = SELF_PIPE_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        unsafe {
            libc::write(fd, b".".as_ptr() as *const c_void, 1);
        }
    }
}

fn install_self_pipe_handler(signal: i32) -> io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = self_pipe_handler as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(signal, &sa, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn restore_default_handler(signal: i32) {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(signal, &sa, std::ptr::null_mut());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    /// One signalfd per registered signal (Linux)
    #[cfg(target_os = "linux")]
    SignalFd,
    /// One process-wide pipe written from the signal handler
    SelfPipe,
}

struct RegisteredSignal {
    callback: Arc<Mutex<InterruptCallback>>,
    /// Signals are only active while the manager is started
    active: bool,
    /// The signalfd (signalfd variant only)
    fd: Option<OwnedFd>,
}

struct InterruptInner {
    state: EventSourceState,
    el: Weak<EventLoop>,
    source_id: SourceId,
    signals: HashMap<i32, RegisteredSignal>,
    /// (read end, write end) of the self-pipe while started
    pipe: Option<(OwnedFd, OwnedFd)>,
}

pub struct InterruptManager {
    name: String,
    variant: Variant,
    weak_self: Weak<InterruptManager>,
    inner: Mutex<InterruptInner>,
}

impl InterruptManager {
    /// Creates an interrupt manager over the preferred mechanism of the
    /// platform: signalfd on Linux, the self-pipe trick elsewhere.
    pub fn new(name: &str) -> Arc<InterruptManager> {
        #[cfg(target_os = "linux")]
        let variant = Variant::SignalFd;
        #[cfg(not(target_os = "linux"))]
        let variant = Variant::SelfPipe;
        InterruptManager::with_variant(name, variant)
    }

    /// Forces the portable self-pipe variant. At most one self-pipe
    /// manager may be active per process.
    pub fn new_self_pipe(name: &str) -> Arc<InterruptManager> {
        InterruptManager::with_variant(name, Variant::SelfPipe)
    }

    fn with_variant(name: &str, variant: Variant) -> Arc<InterruptManager> {
        Arc::new_cyclic(|weak_self| InterruptManager {
            name: name.to_owned(),
            variant,
            weak_self: weak_self.clone(),
            inner: Mutex::new(InterruptInner {
                state: EventSourceState::Fresh,
                el: Weak::new(),
                source_id: 0,
                signals: HashMap::new(),
                pipe: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, InterruptInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a callback for a POSIX signal. Fails on duplicates and if
    /// the OS handler cannot be installed (the manager is started).
    pub fn register_interrupt(
        &self,
        signal: i32,
        callback: impl FnMut(i32) + Send + 'static,
    ) -> Result<(), Error> {
        if signal <= 0 || signal as usize >= MAX_SIGNAL {
            return Err(Error::Internal("signal number out of range"));
        }

        let activate = {
            let mut inner = self.lock();
            if inner.signals.contains_key(&signal) {
                warn!("interrupt | signal {} already registered", signal);
                return Err(Error::BadState("the signal is already registered"));
            }
            inner.signals.insert(
                signal,
                RegisteredSignal {
                    callback: Arc::new(Mutex::new(Box::new(callback))),
                    active: false,
                    fd: None,
                },
            );
            inner.state == EventSourceState::Started
        };

        if activate {
            if let Err(e) = self.activate_signal(signal) {
                self.lock().signals.remove(&signal);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Removes the registration of a signal, deactivating it first
    pub fn deregister_interrupt(&self, signal: i32) -> Result<(), Error> {
        if !self.lock().signals.contains_key(&signal) {
            return Err(Error::NotFound);
        }
        self.deactivate_signal(signal);
        self.lock().signals.remove(&signal);
        Ok(())
    }

    fn activate_signal(&self, signal: i32) -> Result<(), Error> {
        if self.lock().signals.get(&signal).map_or(true, |rs| rs.active) {
            return Ok(());
        }
        match self.variant {
            #[cfg(target_os = "linux")]
            Variant::SignalFd => self.activate_signalfd(signal),
            Variant::SelfPipe => {
                install_self_pipe_handler(signal).map_err(|e| {
                    warn!("interrupt | error registering signal {}: {}", signal, e);
                    Error::Internal("could not install the signal handler")
                })?;
                if let Some(rs) = self.lock().signals.get_mut(&signal) {
                    rs.active = true;
                }
                Ok(())
            }
        }
    }

    fn deactivate_signal(&self, signal: i32) {
        let fd = {
            let mut inner = self.lock();
            match inner.signals.get_mut(&signal) {
                Some(rs) if rs.active => {
                    rs.active = false;
                    rs.fd.take()
                }
                _ => return,
            }
        };

        match self.variant {
            #[cfg(target_os = "linux")]
            Variant::SignalFd => {
                if let Some(fd) = fd {
                    if let Some(el) = self.lock().el.upgrade() {
                        let _ = el.deregister_fd(fd.as_raw_fd());
                    }
                    unblock_signal(signal);
                    drop(fd);
                }
            }
            Variant::SelfPipe => {
                let _ = fd;
                restore_default_handler(signal);
                if (signal as usize) < MAX_SIGNAL {
                    TRIGGERED[signal as usize].store(false, Ordering::Relaxed);
                }
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn activate_signalfd(&self, signal: i32) -> Result<(), Error> {
        let (el, source_id) = {
            let inner = self.lock();
            let el = inner.el.upgrade().ok_or(Error::BadState("not registered in an event loop"))?;
            (el, inner.source_id)
        };

        // Block the default delivery, then receive the signal over an fd
        let fd = unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, signal);
            if libc::sigprocmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) == -1 {
                warn!("interrupt | could not block the default signal handling: {}",
                      io::Error::last_os_error());
                return Err(Error::Internal("could not block the default signal handling"));
            }
            let fd = libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC);
            if fd < 0 {
                warn!("interrupt | could not create a signal fd: {}", io::Error::last_os_error());
                libc::sigprocmask(libc::SIG_UNBLOCK, &mask, std::ptr::null_mut());
                return Err(Error::Internal("could not create a signal fd"));
            }
            OwnedFd::from_raw_fd(fd)
        };

        let raw = fd.as_raw_fd();
        let weak = self.weak_self.clone();
        let fd_callback: FdCallback = Box::new(move |fd, _event| {
            if let Some(im) = weak.upgrade() {
                im.signalfd_event(signal, fd);
            }
        });

        if let Err(e) = el.register_fd(raw, FdEvents::READ, source_id, fd_callback) {
            warn!("interrupt | could not register the signal fd in the event loop");
            unblock_signal(signal);
            return Err(e);
        }

        if let Some(rs) = self.lock().signals.get_mut(&signal) {
            rs.active = true;
            rs.fd = Some(fd);
        }
        Ok(())
    }

    /// A signalfd became readable: drain one siginfo record and dispatch
    #[cfg(target_os = "linux")]
    fn signalfd_event(&self, signal: i32, fd: RawFd) {
        let mut info: libc::signalfd_siginfo = unsafe { mem::zeroed() };
        let n = unsafe {
            libc::read(fd, &mut info as *mut libc::signalfd_siginfo as *mut c_void,
                       mem::size_of::<libc::signalfd_siginfo>())
        };
        if (n as usize) < mem::size_of::<libc::signalfd_siginfo>() {
            self.deactivate_signal(signal);
            return;
        }

        debug!("interrupt {} | received signal {}", fd, info.ssi_signo);

        let callback = match self.lock().signals.get(&signal) {
            Some(rs) => rs.callback.clone(),
            None => return,
        };
        let mut cb = callback.lock().unwrap_or_else(PoisonError::into_inner);
        (cb)(info.ssi_signo as i32);
    }

    /// The self-pipe became readable: drain it, then fire every triggered
    /// entry exactly once.
    fn pipe_event(&self, fd: RawFd) {
        let mut buf = [0u8; 128];
        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
            if n <= 0 {
                break;
            }
        }

        let fired: Vec<(i32, Arc<Mutex<InterruptCallback>>)> = {
            let inner = self.lock();
            inner
                .signals
                .iter()
                .filter(|(signal, rs)| {
                    rs.active && TRIGGERED[**signal as usize].swap(false, Ordering::Relaxed)
                })
                .map(|(signal, rs)| (*signal, rs.callback.clone()))
                .collect()
        };

        for (signal, callback) in fired {
            let mut cb = callback.lock().unwrap_or_else(PoisonError::into_inner);
            (cb)(signal);
        }
    }
}

#[cfg(target_os = "linux")]
fn unblock_signal(signal: i32) {
    unsafe {
        let mut mask: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, signal);
        libc::sigprocmask(libc::SIG_UNBLOCK, &mask, std::ptr::null_mut());
    }
}

impl EventSource for InterruptManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> EventSourceState {
        self.lock().state
    }

    fn attach(&self, el: Weak<EventLoop>, id: SourceId) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.state != EventSourceState::Fresh {
            return Err(Error::BadState("the interrupt manager is already registered"));
        }
        inner.el = el;
        inner.source_id = id;
        inner.state = EventSourceState::Stopped;
        Ok(())
    }

    fn detach(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.state != EventSourceState::Stopped {
            return Err(Error::BadState("the interrupt manager has to be stopped first"));
        }
        inner.el = Weak::new();
        inner.state = EventSourceState::Fresh;
        Ok(())
    }

    fn start(&self) -> Result<(), Error> {
        {
            let inner = self.lock();
            if inner.state != EventSourceState::Stopped {
                return Err(Error::BadState(
                    "to start, the interrupt manager has to be registered in an event loop and not started",
                ));
            }
        }
        debug!("interrupt | starting the interrupt manager");

        if self.variant == Variant::SelfPipe {
            // There can be at most one active self-pipe manager: the signal
            // handler reaches its pipe through process-wide statics.
            if SELF_PIPE_ACTIVE
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                warn!("interrupt | there can be at most one active interrupt manager at a time");
                return Err(Error::BadState("another interrupt manager is already active"));
            }

            if let Err(e) = self.open_self_pipe() {
                SELF_PIPE_ACTIVE.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        // Activate the signals registered before the start
        let signals: Vec<i32> = self.lock().signals.keys().copied().collect();
        for signal in signals {
            if let Err(e) = self.activate_signal(signal) {
                warn!("interrupt | could not activate signal {}: {}", signal, e);
            }
        }

        self.lock().state = EventSourceState::Started;
        Ok(())
    }

    fn stop(&self) {
        if self.lock().state != EventSourceState::Started {
            return;
        }
        debug!("interrupt | stopping the interrupt manager");

        let signals: Vec<i32> = self.lock().signals.keys().copied().collect();
        for signal in signals {
            self.deactivate_signal(signal);
        }

        if self.variant == Variant::SelfPipe {
            let (pipe, el) = {
                let mut inner = self.lock();
                (inner.pipe.take(), inner.el.upgrade())
            };
            if let Some((read_fd, write_fd)) = pipe {
                SELF_PIPE_WRITE_FD.store(-1, Ordering::SeqCst);
                if let Some(el) = el {
                    let _ = el.deregister_fd(read_fd.as_raw_fd());
                }
                drop(read_fd);
                drop(write_fd);
            }
            SELF_PIPE_ACTIVE.store(false, Ordering::SeqCst);
        }

        // No draining required: immediately stopped
        self.lock().state = EventSourceState::Stopped;
    }
}

impl InterruptManager {
    fn open_self_pipe(&self) -> Result<(), Error> {
        let (el, source_id) = {
            let inner = self.lock();
            let el = inner.el.upgrade().ok_or(Error::BadState("not registered in an event loop"))?;
            (el, inner.source_id)
        };

        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            warn!("interrupt | could not open the pipe for self-signaling: {}",
                  io::Error::last_os_error());
            return Err(Error::Internal("could not open the pipe for self-signaling"));
        }
        let read_fd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write_fd = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        net::set_nonblocking(read_fd.as_raw_fd())
            .and_then(|_| net::set_nonblocking(write_fd.as_raw_fd()))
            .map_err(Error::from_os("could not set the self-pipe non-blocking"))?;

        debug!(
            "interrupt | fd pair for the self-pipe: {}, {}",
            read_fd.as_raw_fd(),
            write_fd.as_raw_fd()
        );

        let raw_read = read_fd.as_raw_fd();
        let weak = self.weak_self.clone();
        let fd_callback: FdCallback = Box::new(move |fd, _event| {
            if let Some(im) = weak.upgrade() {
                im.pipe_event(fd);
            }
        });
        el.register_fd(raw_read, FdEvents::READ, source_id, fd_callback).map_err(|e| {
            warn!("interrupt | could not register the self-pipe in the event loop");
            e
        })?;

        SELF_PIPE_WRITE_FD.store(write_fd.as_raw_fd(), Ordering::SeqCst);
        self.lock().pipe = Some((read_fd, write_fd));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn out_of_range_signals_are_rejected() {
        let im = InterruptManager::new_self_pipe("im");
        match im.register_interrupt(0, |_| {}) {
            Err(Error::Internal(_)) => (),
            v => panic!("Unexpected = {:?}", v),
        }
        match im.register_interrupt(1000, |_| {}) {
            Err(Error::Internal(_)) => (),
            v => panic!("Unexpected = {:?}", v),
        }
    }

    #[test]
    fn duplicate_registration_fails() {
        let im = InterruptManager::new_self_pipe("im");
        im.register_interrupt(libc::SIGUSR2, |_| {}).unwrap();
        match im.register_interrupt(libc::SIGUSR2, |_| {}) {
            Err(Error::BadState(_)) => (),
            v => panic!("Unexpected = {:?}", v),
        }
        im.deregister_interrupt(libc::SIGUSR2).unwrap();
        match im.deregister_interrupt(libc::SIGUSR2) {
            Err(Error::NotFound) => (),
            v => panic!("Unexpected = {:?}", v),
        }
    }
}
