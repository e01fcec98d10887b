//! Kernel Synchronisation Primitives
//!
//! Two kinds of locks are provided:
//!
//! - [`SpinLock`] is a bare spinning mutual exclusion primitive which knows nothing about harts or interrupts.
//! - [`Mutex`] and [`ReentrantMutex`] additionally mask interrupts on the acquiring hart for as long as any of them
//!   is held and enforce a strict acquisition/release order through the hart's [`HartState`].
//!   These are the locks that guard memory management state.
#![no_std]

#[cfg(test)]
extern crate std;

mod critical_section;
mod mutex;
mod spin_lock;

pub use critical_section::{HartState, HeldLock, InterruptControl, MAX_HELD_LOCKS};
pub use mutex::{
    LockKind, LockMisuse, Mutex, MutexGuard, RawMutex, ReentrantMutex, ReentrantMutexGuard,
};
pub use spin_lock::{Guard, SpinLock};
