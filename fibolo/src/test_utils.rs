use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Once;

/// Records the order in which fibers reach interesting points.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tracker(Rc<RefCell<Vec<&'static str>>>);

impl Tracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, event: &'static str) {
        self.0.borrow_mut().push(event);
    }

    pub(crate) fn events(&self) -> Vec<&'static str> {
        self.0.borrow().clone()
    }
}

/// A fresh non-blocking eventfd, handy as a registrable descriptor.
pub(crate) fn eventfd() -> RawFd {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    assert!(fd >= 0, "eventfd failed: {}", std::io::Error::last_os_error());
    fd
}

/// Routes `tracing` output to the test harness, honoring `RUST_LOG`.
pub(crate) fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Abstract unix socket name unique to this process and call site.
pub(crate) fn unique_name(prefix: &str) -> String {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    format!(
        "fibolo-{prefix}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}
