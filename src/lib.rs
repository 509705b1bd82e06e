#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # xwayland-supervisor: running Xwayland from a wayland compositor
//!
//! This crate launches the Xwayland server for a compositor and supervises it for its whole
//! lifetime: connection setup, `fork`/`exec`, the readiness handshake and exit handling. It
//! does not speak X11; an xwayland plugin (the X11 window manager) drives it through the
//! traits of the [`xwayland`] module.
//!
//! ## Structure of the crate
//!
//! - [`xwayland`] contains the supervisor itself and the plugin interface.
//! - [`sources`] contains the [`calloop`] event sources the supervisor is built on: signals
//!   through `signalfd`, child processes through `pidfd`, and single-shot registrations.
//! - [`config`] contains the configuration lookup, with a [`toml`] backed implementation.
//!
//! ## The event loop and state handling
//!
//! Like the rest of a smithay-style compositor, the supervisor is driven by a [`calloop`]
//! event loop and lives in the compositor state. Every callback gets `&mut` access to that
//! state and reaches the supervisor through
//! [`XWaylandHandler`](xwayland::XWaylandHandler), so no shared pointers or locks are
//! involved.
//!
//! ### Logging
//!
//! This crate makes extensive use of [`tracing`] for its internal logging. It never installs
//! a subscriber, that is up to the compositor.
//!
//! For release builds it is recommended to limit the log level during compile time, for
//! example:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod config;
pub mod sources;
pub mod xwayland;

pub mod reexports;
