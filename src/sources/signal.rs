//! Signal event source
//!
//! [`SignalSource`] delivers a Unix signal through a `signalfd`, so it is handled like any
//! other readable file descriptor of the event loop. Unlike a classic signal handler, the
//! delivery carries the full `siginfo`, in particular the pid of the sending process.
//!
//! Creating the source blocks the signal for the *calling thread*, which is what makes it
//! queue up for the `signalfd` instead of running its default action. The signal is left
//! blocked when the source is dropped: the source is meant to be re-created for every cycle
//! of a single-shot registration, and unblocking in between would let a stray signal run
//! its default action (termination, for `SIGUSR1`). Create it on the event loop thread,
//! before any other thread is started, or make sure the other threads block the signal too.

use std::{
    io, mem,
    os::unix::io::{AsFd, FromRawFd, OwnedFd},
    ptr, slice,
};

use calloop::{generic::Generic, EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
use rustix::{
    io::Errno,
    process::{Pid, Signal},
};
use tracing::trace;

/// A signal delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalEvent {
    /// The received signal
    pub signal: Signal,
    /// The process that sent the signal, if the kernel reported one
    pub sender: Option<Pid>,
}

/// Event source for a single Unix signal
#[derive(Debug)]
pub struct SignalSource {
    signal: Signal,
    fd: Generic<OwnedFd>,
}

impl SignalSource {
    /// Blocks `signal` on the current thread and creates a source for it
    pub fn new(signal: Signal) -> io::Result<SignalSource> {
        let mask = sigset(signal);

        // SAFETY: `mask` is an initialized signal set, the old mask is not requested
        let ret = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &mask, ptr::null_mut()) };
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }

        // SAFETY: -1 asks for a new descriptor, `mask` is initialized
        let fd = unsafe { libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: signalfd just returned this descriptor to us
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        Ok(SignalSource {
            signal,
            fd: Generic::new(fd, Interest::READ, Mode::Level),
        })
    }

    /// The signal this source listens for
    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Discards every delivery currently pending, returning how many were dropped
    pub fn drain(&mut self) -> io::Result<usize> {
        let mut count = 0;
        while read_siginfo(self.fd.get_ref())?.is_some() {
            count += 1;
        }
        Ok(count)
    }
}

fn sigset(signal: Signal) -> libc::sigset_t {
    // SAFETY: sigset_t is plain data and sigemptyset initializes it
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signal as i32);
        set
    }
}

fn read_siginfo(fd: impl AsFd) -> io::Result<Option<libc::signalfd_siginfo>> {
    // SAFETY: signalfd_siginfo is plain data, all zeroes is a valid value
    let mut info: libc::signalfd_siginfo = unsafe { mem::zeroed() };
    let size = mem::size_of::<libc::signalfd_siginfo>();
    // SAFETY: the slice covers exactly `info`, which outlives it
    let buf = unsafe { slice::from_raw_parts_mut(ptr::addr_of_mut!(info).cast::<u8>(), size) };
    loop {
        match rustix::io::read(&fd, buf) {
            Ok(n) if n == size => return Ok(Some(info)),
            Ok(n) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("short read of {} bytes from signalfd", n),
                ))
            }
            Err(Errno::INTR) => continue,
            Err(Errno::AGAIN) => return Ok(None),
            Err(err) => return Err(err.into()),
        }
    }
}

impl EventSource for SignalSource {
    type Event = SignalEvent;
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<F>(
        &mut self,
        readiness: Readiness,
        token: Token,
        mut callback: F,
    ) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        let signal = self.signal;
        self.fd.process_events(readiness, token, |_, fd| {
            while let Some(info) = read_siginfo(&**fd)? {
                let sender = Pid::from_raw(info.ssi_pid as i32);
                trace!(signal = ?signal, sender = ?sender, "Signal received");
                callback(SignalEvent { signal, sender }, &mut ());
            }
            Ok(PostAction::Continue)
        })
    }

    fn register(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.fd.register(poll, token_factory)
    }

    fn reregister(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.fd.reregister(poll, token_factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.fd.unregister(poll)
    }
}
