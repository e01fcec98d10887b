//! Interrupt-masking locks with recursion support and strict release ordering
//!
//! ```text
//!        acquire             acquire (same hart, recursive)
//! Free ───────────► Held(1) ─────────────────────────────► Held(n)
//!   ▲                  │  ▲                                   │
//!   └──────────────────┘  └───────────────────────────────────┘
//!        release                       release
//! ```
//!
//! Every acquisition, including a recursive one, is pushed onto the held-lock stack of the hart and every release
//! must pop the top of that stack.

use crate::critical_section::{HartState, HeldLock, InterruptControl};
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror_no_std::Error;

/// Owner value of a lock that is not held by any hart
const NO_OWNER: usize = usize::MAX;

/// The primitive that a [`RawMutex`] uses to wait for another hart
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LockKind {
    /// Busy-wait until the lock becomes free
    Spin,
    /// Put the waiting thread to sleep until the lock becomes free.
    ///
    /// There is no scheduler that waiters could be handed to, so these locks currently spin as well.
    Sleep,
}

/// Wrong usage of a lock.
///
/// Each of these leaves the memory management state in an undefined condition and is therefore fatal when it happens
/// through the guard based API.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum LockMisuse {
    #[error("lock {lock} is already held by hart {hart} and is not re-entrant")]
    NotRecursive { lock: &'static str, hart: usize },
    #[error("hart {hart} released lock {lock} while {top} was acquired after it")]
    OutOfOrder {
        lock: &'static str,
        top: &'static str,
        hart: usize,
    },
    #[error("hart {hart} released lock {lock} which it does not hold")]
    NotOwner { lock: &'static str, hart: usize },
    #[error("hart {hart} cannot hold lock {lock} in addition to all its other locks")]
    TooManyLocks { lock: &'static str, hart: usize },
}

/// The state machine of a lock without any protected data.
///
/// The lock is owned by a hart, not by a thread of execution.
/// While a hart holds at least one `RawMutex`, interrupts are masked on that hart.
#[derive(Debug)]
pub struct RawMutex {
    name: &'static str,
    kind: LockKind,
    recursive: bool,
    locked: AtomicBool,
    owner: AtomicUsize,
    depth: AtomicUsize,
}

impl RawMutex {
    /// Create a new lock which panics when it is acquired again by the hart that already holds it
    pub const fn new(name: &'static str, kind: LockKind) -> Self {
        Self {
            name,
            kind,
            recursive: false,
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(NO_OWNER),
            depth: AtomicUsize::new(0),
        }
    }

    /// Create a new lock which can be acquired multiple times by the hart that holds it
    pub const fn new_recursive(name: &'static str, kind: LockKind) -> Self {
        let mut lock = Self::new(name, kind);
        lock.recursive = true;
        lock
    }

    /// The human readable name given to this lock
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> LockKind {
        self.kind
    }

    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    /// Id of the hart currently holding the lock
    pub fn owner(&self) -> Option<usize> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            hart => Some(hart),
        }
    }

    /// How often the owning hart has acquired this lock without releasing it again
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    fn identity(&self) -> HeldLock {
        HeldLock {
            id: self as *const Self as usize,
            name: self.name,
        }
    }

    /// Acquire the lock on behalf of the hart described by `hart`.
    ///
    /// Interrupts on that hart are disabled before anything else happens and stay disabled until the hart has released
    /// all of its locks again.
    /// Re-entering a recursive lock pushes it onto the held-lock stack once more, so other locks acquired in between
    /// must be released before the inner acquisition is.
    pub fn acquire<I: InterruptControl>(&self, hart: &HartState<I>) -> Result<(), LockMisuse> {
        let was_enabled = hart.interrupts().disable();
        let reentry = self.owner.load(Ordering::Acquire) == hart.hart_id();

        if reentry && !self.recursive {
            hart.interrupts().restore(was_enabled);
            return Err(LockMisuse::NotRecursive {
                lock: self.name,
                hart: hart.hart_id(),
            });
        }
        if hart.is_full() {
            hart.interrupts().restore(was_enabled);
            return Err(LockMisuse::TooManyLocks {
                lock: self.name,
                hart: hart.hart_id(),
            });
        }

        if reentry {
            let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
            log::trace!("lock {} re-entered (depth {})", self.name, depth);
        } else {
            while self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                while self.locked.load(Ordering::Relaxed) {
                    spin_loop();
                }
            }
            self.owner.store(hart.hart_id(), Ordering::Release);
            self.depth.store(1, Ordering::Relaxed);
        }
        hart.push(self.identity(), was_enabled);
        Ok(())
    }

    /// Release the lock on behalf of the hart described by `hart`.
    ///
    /// The lock must be the one that the hart acquired most recently, which for a recursive lock means the latest of its
    /// acquisitions.
    /// Once the hart holds no more locks, its interrupt state from before the first acquisition is restored.
    pub fn release<I: InterruptControl>(&self, hart: &HartState<I>) -> Result<(), LockMisuse> {
        if self.owner.load(Ordering::Acquire) != hart.hart_id() {
            return Err(LockMisuse::NotOwner {
                lock: self.name,
                hart: hart.hart_id(),
            });
        }
        match hart.top() {
            Some(top) if top == self.identity() => {}
            Some(top) => {
                return Err(LockMisuse::OutOfOrder {
                    lock: self.name,
                    top: top.name,
                    hart: hart.hart_id(),
                })
            }
            None => {
                return Err(LockMisuse::NotOwner {
                    lock: self.name,
                    hart: hart.hart_id(),
                })
            }
        }

        let depth = self.depth.fetch_sub(1, Ordering::Relaxed) - 1;
        if depth > 0 {
            log::trace!("lock {} left (depth {})", self.name, depth);
        } else {
            self.owner.store(NO_OWNER, Ordering::Relaxed);
            self.locked.store(false, Ordering::Release);
        }
        hart.pop();
        Ok(())
    }
}

fn fatal(misuse: LockMisuse) -> ! {
    log::error!("{}", misuse);
    panic!("{}", misuse)
}

/// A lock protecting a value that can be modified through the returned [`MutexGuard`].
///
/// Acquiring it a second time from the same hart is a fatal error.
#[derive(Debug)]
pub struct Mutex<T> {
    raw: RawMutex,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for Mutex<T> where T: Send {}

impl<T> Mutex<T> {
    /// Create a new spinning lock
    pub const fn new(name: &'static str, value: T) -> Self {
        Self::with_kind(name, LockKind::Spin, value)
    }

    pub const fn with_kind(name: &'static str, kind: LockKind, value: T) -> Self {
        Self {
            raw: RawMutex::new(name, kind),
            value: UnsafeCell::new(value),
        }
    }

    pub fn raw(&self) -> &RawMutex {
        &self.raw
    }

    /// Acquire the lock, returning the usage error as a value instead of halting
    pub fn try_lock<'a, 'h, I: InterruptControl>(
        &'a self,
        hart: &'h HartState<I>,
    ) -> Result<MutexGuard<'a, 'h, T, I>, LockMisuse> {
        self.raw.acquire(hart)?;
        Ok(MutexGuard { lock: self, hart })
    }

    /// Acquire the lock.
    ///
    /// # Panics
    /// This panics if the executing hart already holds this lock.
    pub fn lock<'a, 'h, I: InterruptControl>(
        &'a self,
        hart: &'h HartState<I>,
    ) -> MutexGuard<'a, 'h, T, I> {
        self.try_lock(hart).unwrap_or_else(|e| fatal(e))
    }

    /// Access the protected value without locking, which is possible because `self` is exclusively borrowed
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

/// Exclusive access to the value of a [`Mutex`].
///
/// Dropping the guard releases the lock, which panics if other locks were acquired by the same hart after this one
/// and are still held.
pub struct MutexGuard<'a, 'h, T, I: InterruptControl> {
    lock: &'a Mutex<T>,
    hart: &'h HartState<I>,
}

impl<T, I: InterruptControl> MutexGuard<'_, '_, T, I> {
    /// Release the lock, returning the usage error as a value instead of halting
    pub fn try_unlock(self) -> Result<(), LockMisuse> {
        let this = core::mem::ManuallyDrop::new(self);
        this.lock.raw.release(this.hart)
    }
}

impl<T, I: InterruptControl> Deref for MutexGuard<'_, '_, T, I> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safety: The very existence of this Guard guarantees we've exclusively locked the lock
        unsafe { &*self.lock.value.get() }
    }
}

impl<T, I: InterruptControl> DerefMut for MutexGuard<'_, '_, T, I> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: The very existence of this Guard guarantees we've exclusively locked the lock
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T, I: InterruptControl> Drop for MutexGuard<'_, '_, T, I> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.raw.release(self.hart) {
            fatal(e)
        }
    }
}

/// A lock that the holding hart may acquire again.
///
/// Because several guards of the same hart can coexist, the protected value is only shared immutably.
/// Use interior mutability for anything that needs to change.
#[derive(Debug)]
pub struct ReentrantMutex<T> {
    raw: RawMutex,
    value: T,
}

unsafe impl<T> Sync for ReentrantMutex<T> where T: Send {}

impl<T> ReentrantMutex<T> {
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            raw: RawMutex::new_recursive(name, LockKind::Spin),
            value,
        }
    }

    pub fn raw(&self) -> &RawMutex {
        &self.raw
    }

    pub fn try_lock<'a, 'h, I: InterruptControl>(
        &'a self,
        hart: &'h HartState<I>,
    ) -> Result<ReentrantMutexGuard<'a, 'h, T, I>, LockMisuse> {
        self.raw.acquire(hart)?;
        Ok(ReentrantMutexGuard { lock: self, hart })
    }

    pub fn lock<'a, 'h, I: InterruptControl>(
        &'a self,
        hart: &'h HartState<I>,
    ) -> ReentrantMutexGuard<'a, 'h, T, I> {
        self.try_lock(hart).unwrap_or_else(|e| fatal(e))
    }
}

/// Shared access to the value of a [`ReentrantMutex`]
pub struct ReentrantMutexGuard<'a, 'h, T, I: InterruptControl> {
    lock: &'a ReentrantMutex<T>,
    hart: &'h HartState<I>,
}

impl<T, I: InterruptControl> Deref for ReentrantMutexGuard<'_, '_, T, I> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.lock.value
    }
}

impl<T, I: InterruptControl> Drop for ReentrantMutexGuard<'_, '_, T, I> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.raw.release(self.hart) {
            fatal(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use std::rc::Rc;

    /// Interrupt controls of a pretend hart
    #[derive(Clone, Default)]
    struct FakeInterrupts {
        enabled: Rc<Cell<bool>>,
    }

    impl InterruptControl for FakeInterrupts {
        fn disable(&self) -> bool {
            self.enabled.replace(false)
        }

        fn restore(&self, enabled: bool) {
            self.enabled.set(enabled)
        }
    }

    fn hart(id: usize, interrupts_enabled: bool) -> (HartState<FakeInterrupts>, Rc<Cell<bool>>) {
        let interrupts = FakeInterrupts::default();
        interrupts.enabled.set(interrupts_enabled);
        let flag = interrupts.enabled.clone();
        (HartState::new(id, interrupts), flag)
    }

    #[test]
    fn test_lock_masks_interrupts_until_released() {
        let (hart, interrupts) = hart(0, true);
        let lock = Mutex::new("test", 0u32);

        let mut guard = lock.lock(&hart);
        *guard += 1;
        assert!(!interrupts.get());
        assert_eq!(lock.raw().owner(), Some(0));
        assert_eq!(hart.held_count(), 1);

        drop(guard);
        assert!(interrupts.get());
        assert_eq!(lock.raw().owner(), None);
        assert_eq!(hart.held_count(), 0);
        assert_eq!(*lock.lock(&hart), 1);
    }

    #[test]
    fn test_interrupt_state_is_restored_only_by_outermost_release() {
        let (hart, interrupts) = hart(1, true);
        let outer = Mutex::new("outer", ());
        let inner = Mutex::new("inner", ());

        let outer_guard = outer.lock(&hart);
        let inner_guard = inner.lock(&hart);
        drop(inner_guard);
        assert!(!interrupts.get());
        drop(outer_guard);
        assert!(interrupts.get());
    }

    #[test]
    fn test_disabled_interrupts_stay_disabled() {
        let (hart, interrupts) = hart(0, false);
        let lock = Mutex::new("test", ());
        drop(lock.lock(&hart));
        assert!(!interrupts.get());
    }

    #[test]
    fn test_out_of_order_release_is_rejected() {
        let (hart, _) = hart(0, true);
        let first = Mutex::new("first", ());
        let second = Mutex::new("second", ());

        let first_guard = first.lock(&hart);
        let _second_guard = second.lock(&hart);
        assert_eq!(
            first_guard.try_unlock(),
            Err(LockMisuse::OutOfOrder {
                lock: "first",
                top: "second",
                hart: 0
            })
        );
        // the rejected release must not have changed anything
        assert_eq!(first.raw().owner(), Some(0));
        assert_eq!(hart.top().map(|l| l.name), Some("second"));
    }

    #[test]
    #[should_panic(expected = "released lock first while second was acquired after it")]
    fn test_out_of_order_guard_drop_is_fatal() {
        let (hart, _) = hart(0, true);
        let first = Mutex::new("first", ());
        let second = Mutex::new("second", ());

        let first_guard = first.lock(&hart);
        let _second_guard = second.lock(&hart);
        drop(first_guard);
    }

    #[test]
    fn test_every_out_of_order_release_is_rejected() {
        let (hart, _) = hart(3, true);
        let locks = [
            RawMutex::new("a", LockKind::Spin),
            RawMutex::new("b", LockKind::Spin),
            RawMutex::new("c", LockKind::Sleep),
            RawMutex::new("d", LockKind::Spin),
        ];
        for lock in locks.iter() {
            lock.acquire(&hart).unwrap();
        }

        // unwind the stack, trying every lock below the top before releasing the top one
        for top in (0..locks.len()).rev() {
            for below in 0..top {
                assert!(matches!(
                    locks[below].release(&hart),
                    Err(LockMisuse::OutOfOrder { .. })
                ));
            }
            locks[top].release(&hart).unwrap();
        }
        assert_eq!(hart.held_count(), 0);
    }

    #[test]
    fn test_non_recursive_reacquisition_is_rejected() {
        let (hart, interrupts) = hart(2, true);
        let lock = Mutex::new("plain", ());

        let _guard = lock.lock(&hart);
        assert_eq!(
            lock.try_lock(&hart).err(),
            Some(LockMisuse::NotRecursive {
                lock: "plain",
                hart: 2
            })
        );
        assert_eq!(lock.raw().depth(), 1);
        assert_eq!(hart.held_count(), 1);
        assert!(!interrupts.get());
    }

    #[test]
    #[should_panic(expected = "is not re-entrant")]
    fn test_non_recursive_reacquisition_is_fatal() {
        let (hart, _) = hart(0, true);
        let lock = Mutex::new("plain", ());
        let _first = lock.lock(&hart);
        let _second = lock.lock(&hart);
    }

    #[test]
    fn test_recursive_lock_counts_depth() {
        let (hart, interrupts) = hart(0, true);
        let lock = ReentrantMutex::new("recursive", Cell::new(0));

        let outer = lock.lock(&hart);
        outer.set(1);
        {
            let inner = lock.lock(&hart);
            inner.set(inner.get() + 1);
            assert_eq!(lock.raw().depth(), 2);
            assert_eq!(hart.held_count(), 2);
        }
        assert_eq!(lock.raw().depth(), 1);
        assert_eq!(hart.held_count(), 1);
        assert_eq!(lock.raw().owner(), Some(0));
        assert!(!interrupts.get());

        drop(outer);
        assert_eq!(lock.raw().owner(), None);
        assert!(interrupts.get());
        assert_eq!(lock.lock(&hart).get(), 2);
    }

    #[test]
    fn test_recursive_lock_nested_around_other_lock() {
        let (hart, interrupts) = hart(0, true);
        let recursive = ReentrantMutex::new("recursive", ());
        let plain = Mutex::new("plain", ());

        let outer = recursive.lock(&hart);
        let middle = plain.lock(&hart);
        let inner = recursive.lock(&hart);
        assert_eq!(hart.held_count(), 3);
        assert_eq!(hart.top().map(|l| l.name), Some("recursive"));

        drop(inner);
        assert_eq!(hart.held_count(), 2);
        assert_eq!(recursive.raw().depth(), 1);
        assert_eq!(hart.top().map(|l| l.name), Some("plain"));

        drop(middle);
        assert_eq!(hart.held_count(), 1);
        assert!(!interrupts.get());

        drop(outer);
        assert_eq!(hart.held_count(), 0);
        assert_eq!(recursive.raw().owner(), None);
        assert!(interrupts.get());
    }

    #[test]
    fn test_outer_recursive_release_before_other_lock_is_rejected() {
        let (hart, _) = hart(0, true);
        let recursive = RawMutex::new_recursive("recursive", LockKind::Spin);
        let plain = RawMutex::new("plain", LockKind::Spin);

        recursive.acquire(&hart).unwrap();
        plain.acquire(&hart).unwrap();
        recursive.acquire(&hart).unwrap();
        recursive.release(&hart).unwrap();
        assert_eq!(
            recursive.release(&hart),
            Err(LockMisuse::OutOfOrder {
                lock: "recursive",
                top: "plain",
                hart: 0
            })
        );
        plain.release(&hart).unwrap();
        recursive.release(&hart).unwrap();
        assert_eq!(hart.held_count(), 0);
    }

    #[test]
    fn test_release_by_other_hart_is_rejected() {
        let (owner, _) = hart(0, true);
        let (other, _) = hart(1, true);
        let lock = RawMutex::new("shared", LockKind::Spin);

        lock.acquire(&owner).unwrap();
        assert_eq!(
            lock.release(&other),
            Err(LockMisuse::NotOwner {
                lock: "shared",
                hart: 1
            })
        );
        lock.release(&owner).unwrap();
    }

    #[test]
    fn test_held_lock_stack_is_bounded() {
        use crate::MAX_HELD_LOCKS;
        use std::vec::Vec;

        let (hart, _) = hart(0, true);
        let locks: Vec<RawMutex> = (0..=MAX_HELD_LOCKS)
            .map(|_| RawMutex::new("nested", LockKind::Spin))
            .collect();
        for lock in &locks[..MAX_HELD_LOCKS] {
            lock.acquire(&hart).unwrap();
        }
        assert!(matches!(
            locks[MAX_HELD_LOCKS].acquire(&hart),
            Err(LockMisuse::TooManyLocks { .. })
        ));
        for lock in locks[..MAX_HELD_LOCKS].iter().rev() {
            lock.release(&hart).unwrap();
        }
    }

    #[test]
    fn test_lock_is_exclusive_between_threads() {
        use std::sync::Arc;
        use std::thread;
        use std::vec::Vec;

        let counter = Arc::new(Mutex::new("counter", 0usize));
        let threads: Vec<_> = (0..4)
            .map(|id| {
                let counter = counter.clone();
                thread::spawn(move || {
                    let (hart, _) = hart(id, true);
                    for _ in 0..1000 {
                        *counter.lock(&hart) += 1;
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let (hart, _) = hart(9, true);
        assert_eq!(*counter.lock(&hart), 4000);
    }
}
