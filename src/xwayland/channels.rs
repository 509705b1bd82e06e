//! Socket pairs connecting the compositor to the X server

use std::{io, os::unix::net::UnixStream};

use rustix::net::{socketpair, AddressFamily, SocketFlags, SocketType};
use tracing::error;

use super::{fail_point, SpawnError};

/// The two ends of a connection, one for each process
#[derive(Debug)]
pub(crate) struct Channel {
    /// Kept by the compositor
    pub(crate) ours: UnixStream,
    /// Handed to the X server
    pub(crate) theirs: UnixStream,
}

/// Both connections of an X server instance
#[derive(Debug)]
pub(crate) struct Channels {
    /// The server's wayland connection to the compositor
    pub(crate) wayland: Channel,
    /// The window manager connection
    pub(crate) wm: Channel,
}

fn stream_pair() -> io::Result<Channel> {
    let (ours, theirs) = socketpair(
        AddressFamily::UNIX,
        SocketType::STREAM,
        SocketFlags::CLOEXEC,
        None,
    )?;
    Ok(Channel {
        ours: UnixStream::from(ours),
        theirs: UnixStream::from(theirs),
    })
}

impl Channels {
    /// Creates both socket pairs, close-on-exec
    ///
    /// On failure nothing stays open.
    pub(crate) fn new() -> Result<Channels, SpawnError> {
        let wayland = fail_point("wayland_pair").and_then(|()| stream_pair()).map_err(|err| {
            error!(error = ?err, "wl connection socketpair failed");
            SpawnError::WaylandSocketPair(err)
        })?;
        let wm = fail_point("wm_pair").and_then(|()| stream_pair()).map_err(|err| {
            error!(error = ?err, "X wm connection socketpair failed");
            SpawnError::WmSocketPair(err)
        })?;
        Ok(Channels { wayland, wm })
    }
}
