use std::io;

use calloop::LoopHandle;
use tracing::{error, info};
use wayland_server::DisplayHandle;

use super::{
    api::XWaylandModule,
    xserver::{arm_readiness, readiness_source, XServerSupervisor, XWaylandHandler},
};
use crate::config::ConfigSource;

/// Errors of [`load_xwayland`]
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// The plugin could not be loaded
    #[error("Failed to load the xwayland module")]
    Load(#[source] io::Error),
    /// The plugin has no capability table
    #[error("Failed to get the xwayland module API")]
    MissingApi,
    /// The plugin has no server object
    #[error("Failed to get the xwayland object")]
    MissingServer,
    /// The plugin refused the spawn callback
    #[error("Failed to register the xserver spawn callback")]
    Listen(#[source] io::Error),
    /// The initial readiness notification could not be armed
    #[error("Failed to arm the readiness notification")]
    Readiness(#[source] io::Error),
}

/// Loads the xwayland plugin and sets up supervision of its X server
///
/// The returned supervisor must be stored in the compositor state and returned by
/// [`XWaylandHandler::xwayland_supervisor`]. The plugin launches the server on demand
/// through the registered spawn callback.
///
/// Must be called on the event loop thread, before any other thread is spawned: the
/// readiness signal is blocked on the calling thread and other threads must inherit that
/// mask, otherwise the server's notification could terminate the compositor.
///
/// On failure nothing stays registered with the event loop.
pub fn load_xwayland<D: XWaylandHandler>(
    module: &mut dyn XWaylandModule<D>,
    loop_handle: LoopHandle<'static, D>,
    display: DisplayHandle,
    config: Box<dyn ConfigSource>,
) -> Result<XServerSupervisor<D>, BootstrapError> {
    module.load(&display).map_err(|err| {
        error!(error = ?err, "Failed to load the xwayland module");
        BootstrapError::Load(err)
    })?;

    let mut api = module.api().ok_or_else(|| {
        error!("Failed to get the xwayland module API");
        BootstrapError::MissingApi
    })?;

    let server = api.get().ok_or_else(|| {
        error!("Failed to get the xwayland object");
        BootstrapError::MissingServer
    })?;

    let readiness = readiness_source().map_err(BootstrapError::Readiness)?;

    let mut supervisor = XServerSupervisor::new(loop_handle.clone(), display, api, server, config);
    let token = arm_readiness(&loop_handle, readiness).map_err(|err| {
        error!(error = ?err, "Failed to arm the readiness notification");
        BootstrapError::Readiness(err)
    })?;
    supervisor.set_armed(token);

    // the plugin gets the callback last, dropping `supervisor` on failure disarms again
    supervisor.register_spawn().map_err(|err| {
        error!(error = ?err, "Failed to register the xserver spawn callback");
        BootstrapError::Listen(err)
    })?;

    info!("Xwayland supervision ready");
    Ok(supervisor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::MemoryConfig,
        sources::SignalSource,
        xwayland::{
            test_utils::{queue_signal_from, ApiEvent, Failure, Fixture, TestModule, TestState},
            READINESS_SIGNAL,
        },
    };
    use calloop::EventLoop;
    use std::time::Duration;
    use wayland_server::Display;

    type Loaded = (
        Result<XServerSupervisor<TestState>, BootstrapError>,
        Vec<ApiEvent>,
        EventLoop<'static, TestState>,
    );

    fn load(failure: Option<Failure>) -> Loaded {
        let event_loop = EventLoop::<TestState>::try_new().unwrap();
        let display = Display::<TestState>::new().unwrap();
        let mut module = TestModule::new(failure);
        let events = module.events();
        let result = load_xwayland(
            &mut module,
            event_loop.handle(),
            display.handle(),
            Box::new(MemoryConfig::new()),
        );
        let events = events.borrow().clone();
        (result, events, event_loop)
    }

    #[test]
    fn loads_and_arms() {
        let fixture = Fixture::new(MemoryConfig::new());
        let supervisor = fixture.supervisor();
        assert!(supervisor.is_armed());
        assert!(supervisor.pid().is_none());
        assert_eq!(supervisor.server().downcast_ref::<&'static str>(), Some(&"test-xserver"));
        assert_eq!(fixture.events(), vec![ApiEvent::Listen]);
    }

    #[test]
    fn load_failure() {
        let (result, events, _) = load(Some(Failure::Load));
        assert!(matches!(result, Err(BootstrapError::Load(_))));
        assert!(events.is_empty());
    }

    #[test]
    fn missing_api() {
        let (result, events, _) = load(Some(Failure::Api));
        assert!(matches!(result, Err(BootstrapError::MissingApi)));
        assert!(events.is_empty());
    }

    #[test]
    fn missing_server() {
        let (result, events, _) = load(Some(Failure::Server));
        assert!(matches!(result, Err(BootstrapError::MissingServer)));
        assert!(events.is_empty());
    }

    #[test]
    fn listen_failure() {
        let (result, events, mut event_loop) = load(Some(Failure::Listen));
        assert!(matches!(result, Err(BootstrapError::Listen(_))));
        assert!(events.is_empty());

        // the readiness registration is gone with the supervisor: the signal stays pending
        // instead of reaching a callback without a supervisor
        queue_signal_from(READINESS_SIGNAL, rustix::process::getpid());
        let mut state = TestState { supervisor: None };
        event_loop
            .dispatch(Some(Duration::from_millis(50)), &mut state)
            .unwrap();
        let mut pending = SignalSource::new(READINESS_SIGNAL).unwrap();
        assert_eq!(pending.drain().unwrap(), 1);
    }
}
