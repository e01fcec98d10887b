//! Per-hart interrupt masking and bookkeeping of held locks
//!
//! A hart enters a critical section when it acquires its first [`Mutex`](crate::Mutex) and leaves it when it
//! releases its last one.
//! While inside, interrupts stay masked on that hart so that no handler can observe or modify half-updated state.
//! The interrupt enable state that was active *before* entering is saved once and restored when leaving.

use core::cell::Cell;
use core::fmt::{Debug, Formatter};

/// How many locks a single hart may hold at the same time
pub const MAX_HELD_LOCKS: usize = 16;

/// Hardware access to the interrupt enable state of the executing hart.
///
/// Implementations must only ever influence the hart that is executing the call.
pub trait InterruptControl {
    /// Disable interrupts on the executing hart and return whether they were enabled before.
    fn disable(&self) -> bool;

    /// Set the interrupt enable state of the executing hart to `enabled`.
    fn restore(&self, enabled: bool);
}

/// Identity of a lock that is currently held by a hart
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeldLock {
    pub(crate) id: usize,
    pub name: &'static str,
}

/// State that is kept for each hart.
///
/// It is constructed once per hart during bring-up and must only ever be used by the hart it belongs to,
/// which is why it is neither `Sync` nor `Send`-shared between harts by this crate.
pub struct HartState<I: InterruptControl> {
    hart_id: usize,
    interrupts: I,
    /// Interrupt enable state from before the first lock was taken
    saved_interrupts: Cell<bool>,
    /// Stack of currently held locks, the most recently acquired one on top
    held: [Cell<Option<HeldLock>>; MAX_HELD_LOCKS],
    depth: Cell<usize>,
}

impl<I: InterruptControl> HartState<I> {
    pub const fn new(hart_id: usize, interrupts: I) -> Self {
        const NONE: Cell<Option<HeldLock>> = Cell::new(None);
        Self {
            hart_id,
            interrupts,
            saved_interrupts: Cell::new(false),
            held: [NONE; MAX_HELD_LOCKS],
            depth: Cell::new(0),
        }
    }

    /// The id of the hart this state belongs to
    pub fn hart_id(&self) -> usize {
        self.hart_id
    }

    /// Access to the interrupt controls of this hart
    pub fn interrupts(&self) -> &I {
        &self.interrupts
    }

    /// How many locks are currently held by this hart
    pub fn held_count(&self) -> usize {
        self.depth.get()
    }

    /// The most recently acquired lock which is still held
    pub fn top(&self) -> Option<HeldLock> {
        match self.depth.get() {
            0 => None,
            depth => self.held[depth - 1].get(),
        }
    }

    /// Iterate over all held locks, starting at the oldest one
    pub fn held_locks(&self) -> impl Iterator<Item = HeldLock> + '_ {
        self.held[..self.depth.get()].iter().filter_map(Cell::get)
    }

    pub(crate) fn is_full(&self) -> bool {
        self.depth.get() == MAX_HELD_LOCKS
    }

    /// Record that `lock` has been acquired.
    ///
    /// `was_enabled` is the interrupt state from right before the acquisition attempt.
    /// It is only remembered when this is the outermost lock of the hart.
    pub(crate) fn push(&self, lock: HeldLock, was_enabled: bool) {
        let depth = self.depth.get();
        assert!(depth < MAX_HELD_LOCKS, "held-lock stack overflow");
        if depth == 0 {
            self.saved_interrupts.set(was_enabled);
        }
        self.held[depth].set(Some(lock));
        self.depth.set(depth + 1);
    }

    /// Remove the topmost lock from the stack.
    ///
    /// If that leaves the hart without any held lock, the interrupt state from before the outermost acquisition is
    /// restored.
    pub(crate) fn pop(&self) {
        let depth = self.depth.get();
        assert!(depth > 0, "held-lock stack underflow");
        self.held[depth - 1].set(None);
        self.depth.set(depth - 1);
        if depth == 1 {
            self.interrupts.restore(self.saved_interrupts.get());
        }
    }
}

impl<I: InterruptControl> Debug for HartState<I> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        struct Names<'a, I: InterruptControl>(&'a HartState<I>);
        impl<I: InterruptControl> Debug for Names<'_, I> {
            fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
                f.debug_list()
                    .entries(self.0.held_locks().map(|lock| lock.name))
                    .finish()
            }
        }

        f.debug_struct("HartState")
            .field("hart_id", &self.hart_id)
            .field("saved_interrupts", &self.saved_interrupts.get())
            .field("held", &Names(self))
            .finish()
    }
}
