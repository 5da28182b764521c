use crate::context;
use crate::error::Result;
use crate::runtime::scheduler;
use crate::task::{self, Id};
use anyhow::anyhow;
use std::convert::{Infallible, TryFrom};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Longest the loop blocks in epoll when nothing is due.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Events drained from epoll per pass.
const MAX_EVENTS: usize = 1024;

/// Raw descriptors below this index their generation in a flat table.
const FAST_FD_TABLE_SIZE: usize = 100_000;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("fibolo-{id}")
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

#[derive(Debug)]
pub struct Builder {
    /// Default stack size of spawned fibers.
    stack_size: usize,

    /// Upper bound on a single epoll wait.
    poll_interval: Duration,

    /// Capacity of the epoll event buffer.
    max_events: usize,

    /// Size of the flat generation table, see [`Fd`](crate::Fd).
    fast_fd_table_size: usize,

    /// Name fn used for threads spawned by the runtime, i.e. serve workers.
    thread_name: ThreadNameFn,

    /// Stack size of threads spawned by the runtime.
    thread_stack_size: Option<usize>,
}

impl Builder {
    /// Returns a builder for the current thread's runtime.
    ///
    /// Configuration methods can be chained on the return value.
    pub fn new_local() -> Builder {
        let cfg = RuntimeConfig::default();

        Builder {
            stack_size: cfg.stack_size,
            poll_interval: cfg.poll_interval,
            max_events: cfg.max_events,
            fast_fd_table_size: cfg.fast_fd_table_size,
            thread_name: cfg.thread_name,
            thread_stack_size: cfg.thread_stack_size,
        }
    }

    /// Default stack size of fibers spawned with [`spawn`](crate::spawn).
    ///
    /// Defaults to [`STACK_SIZE_MIN`](crate::task::STACK_SIZE_MIN).
    #[track_caller]
    pub fn stack_size(mut self, val: usize) -> Self {
        assert!(
            (task::STACK_SIZE_MIN..=task::STACK_SIZE_MAX).contains(&val),
            "stack_size must be between {} and {}",
            task::STACK_SIZE_MIN,
            task::STACK_SIZE_MAX
        );
        self.stack_size = val;
        self
    }

    /// How long the loop may block in epoll when no fiber is ready and no
    /// deadline is closer. Defaults to 100ms.
    #[track_caller]
    pub fn poll_interval(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "poll_interval must be greater than 0");
        self.poll_interval = val;
        self
    }

    #[track_caller]
    pub fn max_events(mut self, val: usize) -> Self {
        assert!(val > 0, "max_events must be greater than 0");
        self.max_events = val;
        self
    }

    pub fn fast_fd_table_size(mut self, val: usize) -> Self {
        self.fast_fd_table_size = val;
        self
    }

    /// Sets name of threads spawned by the runtime.
    ///
    /// The default name is "fibolo-{id}", where id is monotonically
    /// increasing. Thread names are truncated beyond 15 bytes according to
    /// pthread limitations.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by the
    /// runtime.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for threads spawned by the runtime.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    /// Creates the runtime of the current thread.
    ///
    /// Fails if the thread already has one: there is exactly one scheduler per
    /// thread and it lives until the thread exits.
    pub fn try_build(self) -> anyhow::Result<Runtime> {
        let cfg = RuntimeConfig::try_from(self)?;
        Runtime::try_from_config(cfg)
    }
}

#[derive(Debug)]
pub struct Runtime {
    // Bound to the thread that built it.
    _not_send: PhantomData<*const ()>,
}

impl Runtime {
    pub(crate) fn try_from_config(cfg: RuntimeConfig) -> anyhow::Result<Runtime> {
        cfg.validate()?;
        context::init_context(cfg)?;

        // Writes to a closed peer must fail with EPIPE, not kill the process.
        if unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) } == libc::SIG_ERR {
            return Err(anyhow!(
                "failed to ignore SIGPIPE: {}",
                std::io::Error::last_os_error()
            ));
        }

        tracing::debug!("runtime initialized");
        Ok(Runtime {
            _not_send: PhantomData,
        })
    }

    /// Runs `f` in a fiber and drives the scheduler until it returns.
    ///
    /// Other fibers only make progress while `f` is parked; the ones still
    /// alive when it returns stay suspended until the loop runs again.
    pub fn block_on<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + 'static,
        R: 'static,
    {
        crate::runtime::block_on(f)
    }

    /// Spawns a fiber, see [`spawn`](crate::spawn).
    pub fn spawn<F>(&self, f: F) -> Id
    where
        F: FnOnce() + 'static,
    {
        crate::runtime::spawn(f)
    }

    /// Drives the scheduler forever. Only returns if epoll itself fails.
    pub fn run(&self) -> Result<Infallible> {
        scheduler::run_forever()
    }
}

// Snapshot of the builder, kept in the thread-local context and cloned into
// threads spawned by the runtime.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) stack_size: usize,
    pub(crate) poll_interval: Duration,
    pub(crate) max_events: usize,
    pub(crate) fast_fd_table_size: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            stack_size: task::STACK_SIZE_MIN,
            poll_interval: POLL_INTERVAL,
            max_events: MAX_EVENTS,
            fast_fd_table_size: FAST_FD_TABLE_SIZE,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
        }
    }
}

impl RuntimeConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.max_events > libc::c_int::MAX as usize {
            return Err(anyhow!(
                "max_events ({}) does not fit epoll_wait",
                self.max_events
            ));
        }

        Ok(())
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let cfg = RuntimeConfig {
            stack_size: builder.stack_size,
            poll_interval: builder.poll_interval,
            max_events: builder.max_events,
            fast_fd_table_size: builder.fast_fd_table_size,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}
