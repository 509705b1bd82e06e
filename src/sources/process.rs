//! Child process supervision
//!
//! [`ChildWatch`] is an event source firing once when a child process terminates. It is
//! backed by a `pidfd`, which becomes readable when the process exits, so no `SIGCHLD`
//! handling is involved and unrelated children are never reaped by accident. On firing the
//! child is reaped with `waitpid` and its raw wait status is delivered, after which the
//! source removes itself.

use std::{io, os::unix::io::OwnedFd};

use calloop::{generic::Generic, EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
use rustix::process::{pidfd_open, waitpid, Pid, PidfdFlags, WaitOptions};
use tracing::{debug, warn};

/// Wait status reported when the child was already reaped by someone else
pub const UNKNOWN_STATUS: i32 = -1;

/// Termination of a watched child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    /// Pid of the terminated child
    pub pid: Pid,
    /// Raw wait status, see `waitpid(2)`
    pub status: i32,
}

impl ChildExit {
    /// Exit code, if the child exited normally
    pub fn exit_code(&self) -> Option<i32> {
        libc::WIFEXITED(self.status).then(|| libc::WEXITSTATUS(self.status))
    }

    /// Terminating signal, if the child was killed by one
    pub fn signal(&self) -> Option<i32> {
        libc::WIFSIGNALED(self.status).then(|| libc::WTERMSIG(self.status))
    }
}

/// Event source watching a single child process
#[derive(Debug)]
pub struct ChildWatch {
    pid: Pid,
    fd: Generic<OwnedFd>,
}

impl ChildWatch {
    /// Starts watching `pid`, which must be a child of the current process
    pub fn new(pid: Pid) -> io::Result<ChildWatch> {
        let fd = pidfd_open(pid, PidfdFlags::empty())?;
        Ok(ChildWatch {
            pid,
            fd: Generic::new(fd, Interest::READ, Mode::Level),
        })
    }

    /// Pid of the watched process
    pub fn pid(&self) -> Pid {
        self.pid
    }
}

impl EventSource for ChildWatch {
    type Event = ChildExit;
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
        let pid = self.pid;
        self.fd.process_events(readiness, token, |_, _| {
            let status = loop {
                match waitpid(Some(pid), WaitOptions::NOHANG) {
                    Ok(Some(status)) => break status.as_raw() as i32,
                    // spurious wakeup, the process is still there
                    Ok(None) => return Ok(PostAction::Continue),
                    Err(rustix::io::Errno::INTR) => continue,
                    Err(err) => {
                        warn!(pid = ?pid, error = ?err, "Failed to collect child status");
                        break UNKNOWN_STATUS;
                    }
                }
            };
            debug!(pid = ?pid, status, "Child process terminated");
            callback(ChildExit { pid, status }, &mut ());
            Ok(PostAction::Remove)
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

#[cfg(test)]
mod tests {
    use super::*;
    use calloop::EventLoop;
    use std::{
        process::Command,
        time::{Duration, Instant},
    };

    fn wait_for_exit(mut command: Command) -> ChildExit {
        let child = command.spawn().unwrap();
        let pid = Pid::from_child(&child);

        let mut event_loop = EventLoop::<Option<ChildExit>>::try_new().unwrap();
        event_loop
            .handle()
            .insert_source(ChildWatch::new(pid).unwrap(), |exit, _, slot| *slot = Some(exit))
            .unwrap();

        let mut exit = None;
        let deadline = Instant::now() + Duration::from_secs(10);
        while exit.is_none() && Instant::now() < deadline {
            event_loop
                .dispatch(Some(Duration::from_millis(100)), &mut exit)
                .unwrap();
        }
        // `child` is dropped without waiting, the watch already reaped it
        exit.expect("child did not terminate in time")
    }

    #[test]
    fn reports_exit_code() {
        let mut command = Command::new("/bin/sh");
        command.args(["-c", "exit 3"]);
        let exit = wait_for_exit(command);
        assert_eq!(exit.exit_code(), Some(3));
        assert_eq!(exit.signal(), None);
        assert_eq!(exit.status, 3 << 8);
    }

    #[test]
    fn reports_terminating_signal() {
        let mut command = Command::new("/bin/sh");
        command.args(["-c", "kill -KILL $$"]);
        let exit = wait_for_exit(command);
        assert_eq!(exit.exit_code(), None);
        assert_eq!(exit.signal(), Some(libc::SIGKILL));
    }
}
