//! Accept loop dispatching connections to handler fibers, optionally spread
//! over a pool of worker threads.
//!
//! With no workers every accepted connection gets a fiber on the serving
//! thread. With `n` workers the serving thread only accepts: each connection
//! is unregistered, queued to a worker in round-robin order, and the worker's
//! own runtime registers it again and runs the handler there.

use crate::context;
use crate::error::{Error, Result, fail, fail_sys, fail_with_os};
use crate::net::{Conn, Listener};
use crate::runtime::{Runtime, RuntimeConfig};
use crate::time::sleep;
use crate::utils::sys::silent_close;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

/// Pause after a failed accept, e.g. when out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

pub type Handler = Arc<dyn Fn(Conn) + Send + Sync + 'static>;
pub type ErrorHook = Arc<dyn Fn(&Error) + Send + Sync + 'static>;
pub type WorkerInitHook = Arc<dyn Fn(usize) + Send + Sync + 'static>;

/// Configuration of [`Listener::serve`].
#[derive(Clone)]
pub struct ServeOptions {
    workers: usize,
    handler: Handler,
    on_error: Option<ErrorHook>,
    on_worker_init: Option<WorkerInitHook>,
    handler_stack_size: Option<usize>,
}

impl ServeOptions {
    /// `handler` runs in its own fiber for every accepted connection. The
    /// connection is closed once it returns, unless it already was.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(Conn) + Send + Sync + 'static,
    {
        ServeOptions {
            workers: 0,
            handler: Arc::new(handler),
            on_error: None,
            on_worker_init: None,
            handler_stack_size: None,
        }
    }

    /// Number of worker threads, 0 (the default) serves on the calling
    /// thread.
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    /// Called with every non-fatal error, instead of logging it.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Called on each worker thread, with its index, once its runtime is up
    /// and before it receives connections.
    pub fn on_worker_init<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.on_worker_init = Some(Arc::new(f));
        self
    }

    /// Stack size of handler fibers, defaults to the runtime's.
    pub fn handler_stack_size(mut self, size: usize) -> Self {
        self.handler_stack_size = Some(size);
        self
    }

    fn report(&self, err: &Error) {
        match &self.on_error {
            Some(hook) => hook(err),
            None => tracing::warn!(%err, trail = %crate::error::err(), "serve"),
        }
    }

    fn spawn_handler(&self, conn: Conn) {
        let opts = self.clone();
        let run = move || {
            (opts.handler)(conn);
            if conn.valid() {
                if let Err(e) = conn.close() {
                    opts.report(&e);
                }
            }
        };

        match self.handler_stack_size {
            Some(size) => crate::spawn_with_stack(run, size),
            None => crate::spawn(run),
        };
    }
}

impl fmt::Debug for ServeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServeOptions")
            .field("workers", &self.workers)
            .field("handler", &"<function>")
            .field("on_error", &self.on_error.as_ref().map(|_| "<function>"))
            .field("on_worker_init", &self.on_worker_init.as_ref().map(|_| "<function>"))
            .field("handler_stack_size", &self.handler_stack_size)
            .finish()
    }
}

impl Listener {
    /// Accepts connections forever and hands each one to the handler.
    ///
    /// Must run in a fiber. Only returns once the listener is closed or
    /// unusable, with the error that stopped it; failed accepts are reported
    /// and retried after a short pause. Worker threads are detached and keep
    /// serving the connections they already own.
    pub fn serve(&self, opts: ServeOptions) -> Error {
        if opts.workers == 0 {
            return self.accept_loop(&opts, |conn| {
                opts.spawn_handler(conn);
            });
        }

        let cfg = context::with_context(|ctx| ctx.cfg.clone());
        let mut mailboxes = Vec::with_capacity(opts.workers);
        for index in 0..opts.workers {
            match spawn_worker(index, cfg.clone(), opts.clone()) {
                Ok(mailbox) => mailboxes.push(mailbox),
                Err(e) => return e,
            }
        }

        let mut next = 0;
        self.accept_loop(&opts, |conn| {
            let raw = conn.raw_fd();
            if let Err(e) = conn.unreg() {
                opts.report(&e);
                silent_close(raw);
                return;
            }

            let mailbox = &mailboxes[next % mailboxes.len()];
            next += 1;

            if let Err(e) = mailbox.push(raw) {
                opts.report(&e);
            }
        })
    }

    fn accept_loop(&self, opts: &ServeOptions, mut dispatch: impl FnMut(Conn)) -> Error {
        loop {
            match self.accept(None) {
                Ok(conn) => dispatch(conn),
                Err(e @ (Error::Closed(_) | Error::Invalid(_))) => {
                    tracing::debug!(%e, "serve stopped");
                    return e;
                }
                Err(e) => {
                    opts.report(&e);
                    let _ = sleep(ACCEPT_BACKOFF);
                }
            }
        }
    }
}

/// Hand-off point between the accepting thread and one worker.
struct Mailbox {
    queue: Mutex<VecDeque<RawFd>>,

    /// eventfd the worker parks on, bumped on every push.
    notify: OwnedFd,
}

impl Mailbox {
    fn try_new() -> Result<Mailbox> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return fail_sys("eventfd");
        }

        Ok(Mailbox {
            queue: Mutex::new(VecDeque::new()),
            notify: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn push(&self, raw: RawFd) -> Result<()> {
        self.queue.lock().push_back(raw);

        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.notify.as_raw_fd(),
                (&one as *const u64).cast(),
                size_of::<u64>(),
            )
        };
        if ret < 0 {
            return fail_sys("eventfd write");
        }
        Ok(())
    }

    fn drain(&self) -> Vec<RawFd> {
        self.queue.lock().drain(..).collect()
    }
}

/// Starts worker `index` and waits until its runtime is up, so that no
/// connection is ever queued to a worker that failed to start.
fn spawn_worker(index: usize, cfg: RuntimeConfig, opts: ServeOptions) -> Result<Arc<Mailbox>> {
    let mailbox = Arc::new(Mailbox::try_new()?);
    let (started_tx, started_rx) = mpsc::sync_channel(1);

    let mut builder = thread::Builder::new().name((cfg.thread_name.0)());
    if let Some(stack_size) = cfg.thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    let inbox = mailbox.clone();
    if let Err(e) = builder.spawn(move || worker_main(index, cfg, opts, inbox, started_tx)) {
        return fail_with_os(e, "spawn serve worker");
    }

    match started_rx.recv() {
        Ok(Ok(())) => Ok(mailbox),
        Ok(Err(msg)) => fail(Error::invalid(format!(
            "serve worker {index} failed to start: {msg}"
        ))),
        Err(_) => fail(Error::invalid(format!(
            "serve worker {index} exited before starting"
        ))),
    }
}

fn worker_main(
    index: usize,
    cfg: RuntimeConfig,
    opts: ServeOptions,
    mailbox: Arc<Mailbox>,
    started: mpsc::SyncSender<std::result::Result<(), String>>,
) {
    let runtime = match Runtime::try_from_config(cfg) {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(index, %e, "serve worker failed to start");
            let _ = started.send(Err(format!("{e:#}")));
            return;
        }
    };
    let _ = started.send(Ok(()));

    if let Some(init) = &opts.on_worker_init {
        init(index);
    }

    runtime.spawn(move || distribute(mailbox, opts));

    let Err(e) = runtime.run();
    tracing::error!(index, %e, "serve worker stopped");
}

// Worker side: turns queued raw descriptors back into connections.
fn distribute(mailbox: Arc<Mailbox>, opts: ServeOptions) {
    let notify = match Conn::from_raw_fd(mailbox.notify.as_raw_fd()) {
        Ok(notify) => notify,
        Err(e) => {
            opts.report(&e);
            return;
        }
    };

    let mut counter = [0u8; size_of::<u64>()];
    loop {
        if let Err(e) = notify.read(&mut counter, None) {
            opts.report(&e);
            return;
        }

        for raw in mailbox.drain() {
            match Conn::from_raw_fd(raw) {
                Ok(conn) => opts.spawn_handler(conn),
                Err(e) => {
                    opts.report(&e);
                    silent_close(raw);
                }
            }
        }
    }
}
