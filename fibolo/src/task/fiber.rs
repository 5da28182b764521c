use crate::runtime::scheduler;
use crate::sync::SemId;
use crate::task::switch::{self, EntryFn};
use crate::task::{Id, Stack};
use smallvec::SmallVec;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

pub(crate) type Entry = Box<dyn FnOnce() + 'static>;

/// Everything a parked fiber is registered on. Waking the fiber through any
/// one of them removes it from all the others.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct WaitingEvents {
    pub(crate) deadline: Option<Instant>,
    pub(crate) read_fds: SmallVec<[RawFd; 2]>,
    pub(crate) write_fds: SmallVec<[RawFd; 2]>,
    pub(crate) sems: SmallVec<[SemId; 1]>,
}

impl WaitingEvents {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub(crate) fn read(mut self, fd: RawFd) -> Self {
        self.read_fds.push(fd);
        self
    }

    pub(crate) fn write(mut self, fd: RawFd) -> Self {
        self.write_fds.push(fd);
        self
    }

    pub(crate) fn sem(mut self, sem: SemId) -> Self {
        self.sems.push(sem);
        self
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.deadline.is_none()
            && self.read_fds.is_empty()
            && self.write_fds.is_empty()
            && self.sems.is_empty()
    }
}

/// A stackful fiber. Owned by the scheduler core, boxed so its address stays
/// put for the lifetime of its stack.
///
/// All state is behind `Cell`/`RefCell`: the fiber mutates its own record
/// while running, through a shared reference.
pub(crate) struct Fiber {
    id: Id,
    entry: Cell<Option<Entry>>,
    finished: Cell<bool>,
    panic: Cell<Option<Box<dyn Any + Send>>>,
    sp: Cell<usize>,
    pub(crate) waiting: RefCell<WaitingEvents>,
    stack: Stack,
}

impl Fiber {
    pub(crate) fn new(id: Id, entry: Entry, stack_size: usize) -> Box<Fiber> {
        let fiber = Box::new(Fiber {
            id,
            entry: Cell::new(Some(entry)),
            finished: Cell::new(false),
            panic: Cell::new(None),
            sp: Cell::new(0),
            waiting: RefCell::new(WaitingEvents::default()),
            stack: Stack::new(stack_size),
        });

        let arg = &*fiber as *const Fiber as *mut u8;
        let sp = unsafe { switch::init_stack(fiber.stack.top(), fiber_main as EntryFn, arg) };
        fiber.sp.set(sp);

        fiber
    }

    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.get()
    }

    pub(crate) fn take_panic(&self) -> Option<Box<dyn Any + Send>> {
        self.panic.take()
    }

    /// Slot the saved stack pointer is written to when the fiber switches out.
    pub(crate) fn sp_slot(&self) -> *mut usize {
        self.sp.as_ptr()
    }

    pub(crate) fn saved_sp(&self) -> usize {
        self.sp.get()
    }

    fn run_entry(&self) {
        if let Some(entry) = self.entry.take() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
                self.panic.set(Some(payload));
            }
        }

        self.finished.set(true);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("finished", &self.finished.get())
            .field("waiting", &self.waiting)
            .finish_non_exhaustive()
    }
}

// Bottom frame of every fiber stack. Panics are caught inside `run_entry` so
// nothing unwinds past this frame.
extern "C" fn fiber_main(arg: *mut u8) -> ! {
    // Safety: `arg` is the boxed fiber, freed only after the scheduler sees
    // `finished`, which can only happen once we switched out below.
    let fiber = unsafe { &*(arg as *const Fiber) };
    fiber.run_entry();

    scheduler::switch_out(fiber);
    unreachable!("finished fiber {} was resumed", fiber.id);
}
