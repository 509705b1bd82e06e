//! Event sources for the compositor event loop
//!
//! These are [`calloop`] event sources covering the few OS notifications the X server
//! supervision depends on:
//!
//! - [`SignalSource`] delivers a Unix signal, including the pid of its sender
//! - [`ChildWatch`] fires once when a child process terminates, with its wait status
//! - [`OneShot`] turns any source into a registration consumed by its first handled event

mod oneshot;
mod process;
mod signal;

pub use self::oneshot::{Delivery, OneShot};
pub use self::process::{ChildExit, ChildWatch, UNKNOWN_STATUS};
pub use self::signal::{SignalEvent, SignalSource};
