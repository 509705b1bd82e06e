/*
 * Lifecycle of the Xwayland server process
 *
 * Sockets to create, per launch:
 * - a pair for Xwayland to connect to the compositor as a wayland client, our end is
 *   inserted as a client in the display
 * - a pair for the compositor to talk to Xwayland as its window manager, our end is
 *   handed to the plugin once the server is ready
 * The listening sockets (filesystem and abstract) are created by the plugin, which owns
 * the display number.
 *
 * The Xwayland server is spawned with a single fork+exec.
 * -> the child ignores SIGUSR1, which makes Xwayland send SIGUSR1 to its parent once it is
 *    done initializing. During initialization it does a blocking roundtrip to the
 *    compositor, so nothing may block on the server before that signal arrives.
 * -> the signal is received through a signalfd, which tells us the sender, so only the
 *    server we spawned can mark itself ready
 * -> the process is watched through a pidfd, on exit the plugin is told and the readiness
 *    registration is armed again for the next launch
 */
use std::{
    fmt, io, mem,
    os::unix::{
        io::{AsFd, AsRawFd, BorrowedFd},
        net::UnixStream,
    },
    sync::Arc,
    time::Instant,
};

use calloop::{LoopHandle, RegistrationToken};
use rustix::process::{kill_process, waitpid, Pid, Signal, WaitOptions};
use tracing::{debug, error, info, instrument, warn};
use wayland_server::{
    backend::{ClientData, ClientId, DisconnectReason},
    Client, DisplayHandle,
};

use super::{
    api::{XServerHandle, XWaylandApi},
    channels::Channels,
    fail_point,
    launch_helper::{exec_xserver, fork, ExecImage, XServerArgs},
};
use crate::{
    config::{ConfigSource, XWaylandConfig},
    sources::{ChildExit, ChildWatch, Delivery, OneShot, SignalEvent, SignalSource},
};

/// Signal the X server sends to its parent once it is ready
pub const READINESS_SIGNAL: Signal = Signal::Usr1;

/// Access to the supervisor from the compositor state
///
/// Every callback of the supervisor (spawn, readiness, exit) gets the compositor state and
/// reaches the supervisor through this trait.
pub trait XWaylandHandler: Sized + 'static {
    /// Returns the X server supervisor of the compositor
    fn xwayland_supervisor(&mut self) -> &mut XServerSupervisor<Self>;
}

/// Errors of a launch attempt
///
/// None of them leaves anything behind: no process is running and the supervisor is in the
/// state it was before the attempt.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// Only one X server can run at a time
    #[error("An X server is already running with pid {0:?}")]
    AlreadyRunning(Pid),
    /// Creating the wayland connection failed
    #[error("wl connection socketpair failed")]
    WaylandSocketPair(#[source] io::Error),
    /// Creating the window manager connection failed
    #[error("X wm connection socketpair failed")]
    WmSocketPair(#[source] io::Error),
    /// The command line could not be turned into C strings
    #[error("Invalid X server command line")]
    Command(#[source] io::Error),
    /// The readiness notification could not be armed
    #[error("Failed to arm the readiness notification")]
    Readiness(#[source] io::Error),
    /// `fork()` failed
    #[error("Failed to fork to spawn xserver process")]
    Fork(#[source] io::Error),
    /// The new process could not be watched
    #[error("Failed to watch the X server process")]
    Watch(#[source] io::Error),
    /// The wayland client of the server could not be created
    #[error("Failed to create the wayland client of the X server")]
    Client(#[source] io::Error),
}

/// Client data attached to the wayland client of the X server
#[derive(Debug)]
pub struct XServerClientData {
    /// Pid of the server process
    pub pid: Pid,
    /// Display name of the server
    pub display: String,
}

impl ClientData for XServerClientData {
    fn initialized(&self, _client_id: ClientId) {}

    fn disconnected(&self, _client_id: ClientId, reason: DisconnectReason) {
        debug!(pid = ?self.pid, display = %self.display, ?reason, "X server wayland client disconnected");
    }
}

#[derive(Debug)]
enum Readiness {
    Armed(RegistrationToken),
    Consumed,
}

#[derive(Debug)]
struct XServerInstance {
    pid: Pid,
    display: String,
    client: Client,
    wm: UnixStream,
    watch: RegistrationToken,
    started_at: Instant,
    ready: bool,
}

/// Supervisor of the X server process
///
/// Created by [`load_xwayland`](super::load_xwayland) and stored in the compositor state. At
/// most one server runs at any time; between two runs the readiness notification stays armed.
pub struct XServerSupervisor<D> {
    loop_handle: LoopHandle<'static, D>,
    display: DisplayHandle,
    api: Box<dyn XWaylandApi<D>>,
    server: XServerHandle,
    config: Box<dyn ConfigSource>,
    readiness: Readiness,
    instance: Option<XServerInstance>,
}

impl<D> fmt::Debug for XServerSupervisor<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XServerSupervisor")
            .field("server", &self.server)
            .field("readiness", &self.readiness)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

/// Creates the signal source of a new readiness registration
///
/// Deliveries already pending are stale, they predate the server this registration is for.
pub(crate) fn readiness_source() -> io::Result<SignalSource> {
    let mut source = SignalSource::new(READINESS_SIGNAL)?;
    let stale = source.drain()?;
    if stale > 0 {
        debug!(count = stale, "Discarded stale readiness signals");
    }
    Ok(source)
}

/// Inserts a readiness registration into the event loop
pub(crate) fn arm_readiness<D: XWaylandHandler>(
    handle: &LoopHandle<'static, D>,
    source: SignalSource,
) -> io::Result<RegistrationToken> {
    handle
        .insert_source(OneShot::new(source), |event, _, state: &mut D| {
            state.xwayland_supervisor().xserver_ready(event)
        })
        .map_err(|err| err.error.into())
}

/// Spawn callback registered with the plugin
pub fn spawn_xserver<D: XWaylandHandler>(
    state: &mut D,
    display: &str,
    abstract_fd: Option<BorrowedFd<'_>>,
    unix_fd: BorrowedFd<'_>,
) -> Result<Pid, SpawnError> {
    state.xwayland_supervisor().spawn(display, abstract_fd, unix_fd)
}

impl<D> XServerSupervisor<D> {
    pub(crate) fn new(
        loop_handle: LoopHandle<'static, D>,
        display: DisplayHandle,
        api: Box<dyn XWaylandApi<D>>,
        server: XServerHandle,
        config: Box<dyn ConfigSource>,
    ) -> XServerSupervisor<D> {
        XServerSupervisor {
            loop_handle,
            display,
            api,
            server,
            config,
            readiness: Readiness::Consumed,
            instance: None,
        }
    }

    pub(crate) fn set_armed(&mut self, token: RegistrationToken) {
        self.readiness = Readiness::Armed(token);
    }

    /// The opaque server object of the plugin
    pub fn server(&self) -> &XServerHandle {
        &self.server
    }

    /// Pid of the running X server, if any
    pub fn pid(&self) -> Option<Pid> {
        self.instance.as_ref().map(|instance| instance.pid)
    }

    /// Wayland client of the running X server, if any
    pub fn client(&self) -> Option<&Client> {
        self.instance.as_ref().map(|instance| &instance.client)
    }

    /// Compositor side of the window manager connection of the running X server, if any
    pub fn wm_connection(&self) -> Option<&UnixStream> {
        self.instance.as_ref().map(|instance| &instance.wm)
    }

    /// Whether the running X server signalled readiness
    pub fn is_ready(&self) -> bool {
        self.instance.as_ref().map_or(false, |instance| instance.ready)
    }

    /// Whether a readiness notification is currently armed
    pub fn is_armed(&self) -> bool {
        matches!(self.readiness, Readiness::Armed(_))
    }

    /// Releases every registration and descriptor held by the supervisor
    ///
    /// A running server is not killed, it terminates on its own once its connections to the
    /// compositor are closed. This is more reliable than killing something that might no
    /// longer be our server.
    pub fn shutdown(&mut self) {
        if let Readiness::Armed(token) = mem::replace(&mut self.readiness, Readiness::Consumed) {
            self.loop_handle.remove(token);
        }
        if let Some(instance) = self.instance.take() {
            info!(pid = ?instance.pid, "Releasing the X server");
            self.loop_handle.remove(instance.watch);
        }
    }
}

impl<D> Drop for XServerSupervisor<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<D: XWaylandHandler> XServerSupervisor<D> {
    /// Hands the spawn callback to the plugin
    pub(crate) fn register_spawn(&mut self) -> io::Result<()> {
        self.api.listen(&self.server, spawn_xserver::<D>)
    }

    /// Launches the X server
    ///
    /// `abstract_fd` and `unix_fd` are the listening sockets of `display_name`, the server
    /// gets its own copy of them. Returns the pid of the new process, which is then supervised
    /// until it exits.
    #[instrument(level = "debug", skip(self, abstract_fd, unix_fd), fields(unix_fd = unix_fd.as_raw_fd()))]
    pub fn spawn(
        &mut self,
        display_name: &str,
        abstract_fd: Option<BorrowedFd<'_>>,
        unix_fd: BorrowedFd<'_>,
    ) -> Result<Pid, SpawnError> {
        if let Some(instance) = &self.instance {
            warn!(pid = ?instance.pid, "X server already running");
            return Err(SpawnError::AlreadyRunning(instance.pid));
        }

        let channels = Channels::new()?;

        let config = XWaylandConfig::from_source(&*self.config);
        let args = XServerArgs {
            path: config.path,
            display: display_name.to_owned(),
            unix_fd: unix_fd.as_raw_fd(),
            wm_fd: channels.wm.theirs.as_raw_fd(),
            abstract_fd: abstract_fd.map(|fd| fd.as_raw_fd()),
            disable_access_control: config.disable_access_control,
        };
        let image =
            ExecImage::new(&args, channels.wayland.theirs.as_raw_fd()).map_err(SpawnError::Command)?;

        let mut inherit = vec![channels.wayland.theirs.as_fd(), unix_fd];
        inherit.extend(abstract_fd);
        inherit.push(channels.wm.theirs.as_fd());

        self.ensure_armed().map_err(SpawnError::Readiness)?;

        // SAFETY: the child branch goes straight to `exec_xserver`, which only makes
        // async-signal-safe calls and never returns
        let pid = match unsafe { fork() } {
            Ok(Some(pid)) => pid,
            Ok(None) => exec_xserver(&image, &inherit),
            Err(err) => {
                error!(error = ?err, "Failed to fork to spawn xserver process");
                return Err(SpawnError::Fork(err));
            }
        };
        drop(inherit);

        let Channels { wayland, wm } = channels;
        // the server has its copies now
        drop(wayland.theirs);
        drop(wm.theirs);

        // until the process is fully registered, any failure takes it down again
        let guard = scopeguard::guard(pid, |pid| {
            warn!(pid = ?pid, "Killing the X server after a failed launch");
            let _ = kill_process(pid, Signal::Kill);
            let _ = waitpid(Some(pid), WaitOptions::empty());
        });

        let watch = self.watch(pid).map_err(|err| {
            error!(error = ?err, "Failed to watch the X server process");
            SpawnError::Watch(err)
        })?;

        let data = Arc::new(XServerClientData {
            pid,
            display: display_name.to_owned(),
        });
        let client = fail_point("client").and_then(|()| self.display.insert_client(wayland.ours, data));
        let client = match client {
            Ok(client) => client,
            Err(err) => {
                error!(error = ?err, "Failed to create the X server wayland client");
                self.loop_handle.remove(watch);
                return Err(SpawnError::Client(err));
            }
        };

        let pid = scopeguard::ScopeGuard::into_inner(guard);
        info!(pid = ?pid, display = %display_name, command = %image, "X server launched");
        self.instance = Some(XServerInstance {
            pid,
            display: display_name.to_owned(),
            client,
            wm: wm.ours,
            watch,
            started_at: Instant::now(),
            ready: false,
        });
        Ok(pid)
    }

    fn watch(&self, pid: Pid) -> io::Result<RegistrationToken> {
        fail_point("watch")?;
        let watch = ChildWatch::new(pid)?;
        self.loop_handle
            .insert_source(watch, |exit, _, state: &mut D| {
                state.xwayland_supervisor().xserver_exited(exit)
            })
            .map_err(|err| err.error.into())
    }

    fn ensure_armed(&mut self) -> io::Result<()> {
        if let Readiness::Consumed = self.readiness {
            let source = readiness_source()?;
            let token = arm_readiness(&self.loop_handle, source)?;
            self.readiness = Readiness::Armed(token);
        }
        Ok(())
    }

    /// Readiness notification, returns whether it consumed the registration
    pub(crate) fn xserver_ready(&mut self, event: SignalEvent) -> Delivery {
        let Some(instance) = self.instance.as_mut() else {
            debug!(sender = ?event.sender, "Readiness signal without a running X server, ignoring");
            return Delivery::Ignored;
        };
        if event.sender != Some(instance.pid) {
            warn!(
                sender = ?event.sender,
                pid = ?instance.pid,
                "Readiness signal not sent by the X server, ignoring"
            );
            return Delivery::Ignored;
        }

        instance.ready = true;
        self.readiness = Readiness::Consumed;
        info!(
            pid = ?instance.pid,
            display = %instance.display,
            startup = ?instance.started_at.elapsed(),
            "X server is ready"
        );
        self.api
            .xserver_loaded(&self.server, &instance.client, &instance.wm);
        Delivery::Consumed
    }

    /// Termination of the X server process
    pub(crate) fn xserver_exited(&mut self, exit: ChildExit) {
        let instance = match self.instance.take() {
            Some(instance) if instance.pid == exit.pid => instance,
            other => {
                warn!(pid = ?exit.pid, "Exit of an unknown child process");
                self.instance = other;
                return;
            }
        };

        if instance.ready {
            info!(pid = ?exit.pid, status = exit.status, "X server exited");
        } else {
            warn!(pid = ?exit.pid, status = exit.status, "X server exited before it was ready");
        }
        self.api.xserver_exited(&self.server, exit.status);

        if let Err(err) = self.ensure_armed() {
            // the next spawn tries again before forking
            error!(error = ?err, "Failed to rearm the readiness notification");
        }

        // closes our end of the wm connection and forgets the client
        drop(instance);
    }
}
