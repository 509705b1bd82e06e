//! Interface to the plugin driving the X server
//!
//! The plugin owns everything X11: it allocates the display, creates the listening sockets,
//! decides when the server has to run, and runs the window manager once it is up. The
//! supervisor only launches the process and reports back through [`XWaylandApi`].

use std::{
    any::Any,
    fmt, io,
    os::unix::{io::BorrowedFd, net::UnixStream},
    sync::Arc,
};

use rustix::process::Pid;
use wayland_server::{Client, DisplayHandle};

use super::SpawnError;

/// Spawn callback handed to the plugin
///
/// Arguments are the compositor state, the display name (e.g. `":0"`), the optional
/// abstract-namespace listening socket and the filesystem listening socket. Returns the pid
/// of the launched server.
pub type SpawnFn<D> =
    fn(&mut D, &str, Option<BorrowedFd<'_>>, BorrowedFd<'_>) -> Result<Pid, SpawnError>;

/// Opaque identity of an X server as known to the plugin
#[derive(Clone)]
pub struct XServerHandle(Arc<dyn Any + Send + Sync>);

impl XServerHandle {
    /// Wraps a plugin-defined value
    pub fn new<T: Any + Send + Sync>(inner: T) -> XServerHandle {
        XServerHandle(Arc::new(inner))
    }

    /// Access the plugin-defined value
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for XServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XServerHandle").finish_non_exhaustive()
    }
}

/// Capability table of the plugin
pub trait XWaylandApi<D> {
    /// Returns the server object this plugin manages
    fn get(&mut self) -> Option<XServerHandle>;

    /// Registers the function the plugin calls whenever it needs the server started
    fn listen(&mut self, server: &XServerHandle, spawn: SpawnFn<D>) -> io::Result<()>;

    /// The server finished its initialization
    ///
    /// `client` is the server's connection to the compositor, `wm` the compositor side of the
    /// window manager connection. The supervisor keeps ownership of `wm` and closes it once
    /// the server exits, use [`UnixStream::try_clone`] to keep a handle.
    fn xserver_loaded(&mut self, server: &XServerHandle, client: &Client, wm: &UnixStream);

    /// The server process terminated, `status` is the raw wait status
    fn xserver_exited(&mut self, server: &XServerHandle, status: i32);
}

/// A loadable plugin providing an [`XWaylandApi`]
pub trait XWaylandModule<D> {
    /// Loads the plugin into the compositor
    fn load(&mut self, display: &DisplayHandle) -> io::Result<()>;

    /// Returns the capability table of a loaded plugin
    fn api(&mut self) -> Option<Box<dyn XWaylandApi<D>>>;
}
