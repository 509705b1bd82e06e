use std::{
    cell::{Cell, RefCell},
    io,
    os::unix::{
        io::{AsRawFd, BorrowedFd, RawFd},
        net::UnixStream,
    },
    rc::Rc,
    time::{Duration, Instant},
};

use calloop::EventLoop;
use rustix::process::{Pid, Signal};
use wayland_server::{Client, Display, DisplayHandle};

use super::{
    load_xwayland, SpawnError, SpawnFn, XServerHandle, XServerSupervisor, XWaylandApi, XWaylandHandler,
    XWaylandModule,
};
use crate::config::MemoryConfig;

/// Calls made into the plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ApiEvent {
    Listen,
    Loaded(RawFd),
    Exited(i32),
}

type Events = Rc<RefCell<Vec<ApiEvent>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Failure {
    Load,
    Api,
    Server,
    Listen,
}

struct TestApi {
    events: Events,
    failure: Option<Failure>,
}

impl XWaylandApi<TestState> for TestApi {
    fn get(&mut self) -> Option<XServerHandle> {
        (self.failure != Some(Failure::Server)).then(|| XServerHandle::new("test-xserver"))
    }

    fn listen(&mut self, _server: &XServerHandle, _spawn: SpawnFn<TestState>) -> io::Result<()> {
        if self.failure == Some(Failure::Listen) {
            return Err(io::Error::new(io::ErrorKind::Other, "listen refused"));
        }
        self.events.borrow_mut().push(ApiEvent::Listen);
        Ok(())
    }

    fn xserver_loaded(&mut self, _server: &XServerHandle, _client: &Client, wm: &UnixStream) {
        self.events.borrow_mut().push(ApiEvent::Loaded(wm.as_raw_fd()));
    }

    fn xserver_exited(&mut self, _server: &XServerHandle, status: i32) {
        self.events.borrow_mut().push(ApiEvent::Exited(status));
    }
}

pub(crate) struct TestModule {
    events: Events,
    failure: Option<Failure>,
}

impl TestModule {
    pub(crate) fn new(failure: Option<Failure>) -> TestModule {
        TestModule {
            events: Rc::default(),
            failure,
        }
    }

    pub(crate) fn events(&self) -> Events {
        self.events.clone()
    }
}

impl XWaylandModule<TestState> for TestModule {
    fn load(&mut self, _display: &DisplayHandle) -> io::Result<()> {
        if self.failure == Some(Failure::Load) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "xwayland.so"));
        }
        Ok(())
    }

    fn api(&mut self) -> Option<Box<dyn XWaylandApi<TestState>>> {
        if self.failure == Some(Failure::Api) {
            return None;
        }
        Some(Box::new(TestApi {
            events: self.events.clone(),
            failure: self.failure,
        }))
    }
}

pub(crate) struct TestState {
    pub(crate) supervisor: Option<XServerSupervisor<TestState>>,
}

impl XWaylandHandler for TestState {
    fn xwayland_supervisor(&mut self) -> &mut XServerSupervisor<Self> {
        self.supervisor.as_mut().expect("xwayland not loaded")
    }
}

/// A loaded supervisor with its event loop and display
pub(crate) struct Fixture {
    pub(crate) state: TestState,
    event_loop: EventLoop<'static, TestState>,
    _display: Display<TestState>,
    events: Events,
}

impl Fixture {
    pub(crate) fn new(config: MemoryConfig) -> Fixture {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let event_loop = EventLoop::try_new().unwrap();
        let display = Display::new().unwrap();
        let mut module = TestModule::new(None);
        let supervisor =
            load_xwayland(&mut module, event_loop.handle(), display.handle(), Box::new(config)).unwrap();

        Fixture {
            state: TestState {
                supervisor: Some(supervisor),
            },
            event_loop,
            _display: display,
            events: module.events(),
        }
    }

    pub(crate) fn supervisor(&self) -> &XServerSupervisor<TestState> {
        self.state.supervisor.as_ref().unwrap()
    }

    pub(crate) fn events(&self) -> Vec<ApiEvent> {
        self.events.borrow().clone()
    }

    /// Goes through the plugin's spawn callback
    pub(crate) fn spawn(
        &mut self,
        display: &str,
        abstract_fd: Option<BorrowedFd<'_>>,
        unix_fd: BorrowedFd<'_>,
    ) -> Result<Pid, SpawnError> {
        super::spawn_xserver(&mut self.state, display, abstract_fd, unix_fd)
    }

    pub(crate) fn dispatch(&mut self, timeout: Duration) {
        self.event_loop.dispatch(Some(timeout), &mut self.state).unwrap();
    }

    pub(crate) fn dispatch_until(&mut self, mut done: impl FnMut(&mut TestState) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done(&mut self.state) {
            assert!(Instant::now() < deadline, "timed out waiting on the event loop");
            self.dispatch(Duration::from_millis(50));
        }
    }
}

thread_local! {
    static FAIL_AT: Cell<Option<&'static str>> = Cell::new(None);
}

/// Makes the named failure point fail on this thread, `None` resets
pub(crate) fn fail_at(name: Option<&'static str>) {
    FAIL_AT.with(|fail_at| fail_at.set(name));
}

pub(crate) fn fail_point(name: &'static str) -> io::Result<()> {
    if FAIL_AT.with(Cell::get) == Some(name) {
        return Err(io::Error::from_raw_os_error(libc::EMFILE));
    }
    Ok(())
}

/// Queues `signal` for the current thread, as if sent by `sender`
///
/// Only signals to our own process may carry a made-up sender, and targeting the current
/// thread keeps the delivery away from test threads that have the signal unblocked.
pub(crate) fn queue_signal_from(signal: Signal, sender: Pid) {
    // siginfo_t is 128 bytes: signo, errno, code, then the kill() fields, pointer aligned
    let mut info = [0i32; 32];
    let fields = if cfg!(target_pointer_width = "64") { 4 } else { 3 };
    info[0] = signal as i32;
    // SI_QUEUE
    info[2] = -1;
    info[fields] = sender.as_raw_nonzero().get();
    // SAFETY: getuid has no preconditions
    info[fields + 1] = unsafe { libc::getuid() } as i32;

    // SAFETY: `info` is a properly sized siginfo_t for a queued signal
    let ret = unsafe {
        let tid = libc::syscall(libc::SYS_gettid);
        libc::syscall(
            libc::SYS_rt_tgsigqueueinfo,
            libc::getpid(),
            tid,
            signal as i32,
            info.as_ptr(),
        )
    };
    assert_eq!(ret, 0, "{}", io::Error::last_os_error());
}
