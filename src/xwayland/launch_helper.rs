//! Launching the X server process
//!
//! Everything the child needs is prepared in the parent as C strings ([`ExecImage`]) before
//! `fork()`, down to the line reporting a failed launch. The child branch ([`exec_xserver`])
//! then only makes async-signal-safe calls: it clears the close-on-exec flag of the
//! descriptors passed to the server, resets `SIGUSR1` and calls `execve`. On failure it writes
//! the prepared line to stderr and exits. It never allocates, never takes a lock and never
//! returns.

use std::{
    ffi::{CString, OsString},
    fmt, io,
    os::unix::{
        ffi::{OsStrExt, OsStringExt},
        io::{BorrowedFd, RawFd},
    },
    path::PathBuf,
    ptr,
};

use rustix::{
    io::{fcntl_setfd, FdFlags},
    process::Pid,
};

/// Environment variable telling the server which descriptor is its wayland connection
pub const WAYLAND_SOCKET_ENV: &str = "WAYLAND_SOCKET";

/// Largest possible argument vector, not counting the terminating NULL
pub const MAX_ARGS: usize = 12;

/// Command line of an X server instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XServerArgs {
    /// Path of the server binary
    pub path: PathBuf,
    /// Display name, e.g. `":0"`
    pub display: String,
    /// Filesystem listening socket
    pub unix_fd: RawFd,
    /// Server side of the window manager connection
    pub wm_fd: RawFd,
    /// Abstract-namespace listening socket
    pub abstract_fd: Option<RawFd>,
    /// Disable host based access control
    pub disable_access_control: bool,
}

impl XServerArgs {
    /// Builds the argument vector, starting with the server path
    pub fn argv(&self) -> Vec<OsString> {
        let mut argv: Vec<OsString> = Vec::with_capacity(MAX_ARGS);
        argv.push(self.path.clone().into_os_string());
        argv.push(self.display.clone().into());
        argv.extend(
            [
                "-rootless".to_owned(),
                "-core".to_owned(),
                "-listen".to_owned(),
                self.unix_fd.to_string(),
                "-wm".to_owned(),
                self.wm_fd.to_string(),
                "-terminate".to_owned(),
            ]
            .map(OsString::from),
        );
        match self.abstract_fd {
            Some(fd) => argv.extend(["-listen".into(), fd.to_string().into()]),
            None => argv.extend(["-nolisten".into(), "local".into()]),
        }
        if self.disable_access_control {
            argv.push("-ac".into());
        }
        debug_assert!(argv.len() <= MAX_ARGS);
        argv
    }
}

/// A fully prepared `execve` call
pub(crate) struct ExecImage {
    path: CString,
    argv: Vec<CString>,
    // "... <command>: errno ", completed by the child
    failure: Vec<u8>,
    argv_ptrs: Vec<*const libc::c_char>,
    // only kept alive for `envp_ptrs`
    _envp: Vec<CString>,
    envp_ptrs: Vec<*const libc::c_char>,
}

impl fmt::Debug for ExecImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecImage")
            .field("path", &self.path)
            .field("argv", &self.argv)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ExecImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for arg in &self.argv {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            f.write_str(&arg.to_string_lossy())?;
        }
        Ok(())
    }
}

fn c_string(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes).map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

impl ExecImage {
    /// Prepares the exec of `args` with the current environment plus `WAYLAND_SOCKET`
    pub(crate) fn new(args: &XServerArgs, wayland_fd: RawFd) -> io::Result<ExecImage> {
        let argv = args
            .argv()
            .iter()
            .map(|arg| c_string(arg.as_bytes()))
            .collect::<io::Result<Vec<_>>>()?;

        let mut envp = std::env::vars_os()
            .filter(|(key, _)| key != WAYLAND_SOCKET_ENV)
            .map(|(key, value)| {
                let mut entry = key.into_vec();
                entry.push(b'=');
                entry.extend(value.into_vec());
                c_string(&entry)
            })
            .collect::<io::Result<Vec<_>>>()?;
        envp.push(c_string(format!("{}={}", WAYLAND_SOCKET_ENV, wayland_fd).as_bytes())?);

        let mut image = ExecImage {
            path: c_string(args.path.as_os_str().as_bytes())?,
            argv_ptrs: null_terminated(&argv),
            argv,
            failure: Vec::new(),
            envp_ptrs: null_terminated(&envp),
            _envp: envp,
        };
        image.failure = format!("Failed to launch Xwayland `{}`: errno ", image).into_bytes();
        Ok(image)
    }
}

/// Forks the current process
///
/// # Safety
///
/// The child must only perform async-signal-safe operations before `exec`, in a
/// multi-threaded process anything else can deadlock. This rules out logging: another thread
/// may hold the subscriber's locks at the time of the fork.
pub(crate) unsafe fn fork() -> io::Result<Option<Pid>> {
    // SAFETY: upheld by the caller
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(None),
        pid => Ok(Pid::from_raw(pid)),
    }
}

/// Child branch: replace the process image with the X server
///
/// `inherit` are the descriptors the server gets, they must be the ones referenced by the
/// arguments of `image`. On any failure the full command line and the errno are written to
/// stderr and the process exits with a failure status.
pub(crate) fn exec_xserver(image: &ExecImage, inherit: &[BorrowedFd<'_>]) -> ! {
    for fd in inherit {
        if let Err(err) = fcntl_setfd(fd, FdFlags::empty()) {
            exec_failed(image, err.raw_os_error());
        }
    }

    // SAFETY: plain signal state changes, all arguments are initialized. Ignoring SIGUSR1
    // makes the server send it to its parent once it is done initializing. It is unblocked
    // since the compositor thread keeps it blocked for its signalfd and the mask survives exec.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGUSR1);
        libc::sigprocmask(libc::SIG_UNBLOCK, &set, ptr::null_mut());
        libc::signal(libc::SIGUSR1, libc::SIG_IGN);
    }

    // SAFETY: all pointers reference NUL-terminated strings owned by `image`, both arrays
    // are NULL-terminated
    unsafe {
        libc::execve(image.path.as_ptr(), image.argv_ptrs.as_ptr(), image.envp_ptrs.as_ptr());
    }
    exec_failed(image, io::Error::last_os_error().raw_os_error().unwrap_or(0))
}

fn exec_failed(image: &ExecImage, errno: i32) -> ! {
    let mut buf = [0u8; 12];
    let errno = errno_line(errno, &mut buf);
    // SAFETY: write and _exit are async-signal-safe, both buffers are initialized and live.
    // _exit skips the destructors and atexit handlers of the parent's copy.
    unsafe {
        libc::write(libc::STDERR_FILENO, image.failure.as_ptr().cast(), image.failure.len());
        libc::write(libc::STDERR_FILENO, errno.as_ptr().cast(), errno.len());
        libc::_exit(libc::EXIT_FAILURE)
    }
}

/// Formats `errno` and a newline at the end of `buf`, without allocating
fn errno_line(errno: i32, buf: &mut [u8; 12]) -> &[u8] {
    let mut n = errno.unsigned_abs();
    let mut pos = buf.len() - 1;
    buf[pos] = b'\n';
    loop {
        pos -= 1;
        buf[pos] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    &buf[pos..]
}
