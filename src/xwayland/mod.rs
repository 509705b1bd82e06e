//! XWayland process supervision
//!
//! This module launches and supervises the Xwayland server on behalf of an xwayland
//! plugin. The plugin owns the X11 display (lockfile and listening sockets) and the X11
//! window manager; the compositor core owns the server process.
//!
//! The starting point is [`load_xwayland`], which loads the plugin through its
//! [`XWaylandModule`] and returns the [`XServerSupervisor`] to store in your compositor
//! state. From then on:
//!
//! - the plugin calls the spawn callback it received in [`XWaylandApi::listen`] whenever it
//!   wants a server, usually on the first X11 client connection;
//! - once the server signals readiness, the plugin gets its wayland [`Client`](wayland_server::Client)
//!   and the window manager connection in [`XWaylandApi::xserver_loaded`];
//! - when the server exits, [`XWaylandApi::xserver_exited`] gets its wait status and the
//!   supervisor is ready for the next launch.
//!
//! Everything runs on the event loop thread, no callback is ever invoked concurrently.

mod api;
mod bootstrap;
mod channels;
mod launch_helper;
mod xserver;

#[cfg(test)]
mod test_utils;

pub use self::api::{SpawnFn, XServerHandle, XWaylandApi, XWaylandModule};
pub use self::bootstrap::{load_xwayland, BootstrapError};
pub use self::launch_helper::{XServerArgs, MAX_ARGS, WAYLAND_SOCKET_ENV};
pub use self::xserver::{
    spawn_xserver, SpawnError, XServerClientData, XServerSupervisor, XWaylandHandler, READINESS_SIGNAL,
};

#[cfg(test)]
use self::test_utils::fail_point;

/// Named failure point of the spawn path, tests can make it fail
#[cfg(not(test))]
#[inline(always)]
fn fail_point(_name: &'static str) -> std::io::Result<()> {
    Ok(())
}
