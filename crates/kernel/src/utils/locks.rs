//! Lock types used throughout the runtime.
//!
//! Two families exist. [`SpinLock`] is the kernel spinlock: a raw spin with
//! no scheduler involvement, for the non-preemptible paths (run queues,
//! futex queues, the page-cache trees, pi-locks). The sleeping [`Mutex`] and
//! [`RwLock`] are built on the futex and park the calling thread; they are
//! only safe at suspension points. Both are `lock_api` raw locks so callers
//! get ordinary guarded types.
//!
//! Interrupt masking is explicit and separate: paths that must not be
//! re-entered from interrupt context hold an [`crate::arch::IrqGuard`]
//! around the spinlock.

use core::sync::atomic::{AtomicBool, Ordering};

use lock_api::{GuardSend, RawMutex, RawRwLock};

use crate::sync::mutex::RawSleepMutex;
use crate::sync::rwlock::RawSleepRwLock;

pub struct RawSpinLock(AtomicBool);

unsafe impl RawMutex for RawSpinLock {
    const INIT: Self = Self(AtomicBool::new(false));
    type GuardMarker = GuardSend;

    fn lock(&self) {
        while !self.try_lock() {
            while self.0.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    #[inline(always)]
    fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline(always)]
    fn is_locked(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    unsafe fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }
}

pub type SpinLock<T> = lock_api::Mutex<RawSpinLock, T>;
pub type SpinLockGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLock, T>;

pub type Mutex<T> = lock_api::Mutex<RawSleepMutex, T>;
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawSleepMutex, T>;

pub type RwLock<T> = lock_api::RwLock<RawSleepRwLock, T>;
pub type RwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawSleepRwLock, T>;
pub type RwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawSleepRwLock, T>;

#[derive(Debug)]
#[repr(transparent)]
pub struct LazyLock<T>(spin::Lazy<T>);

impl<T> core::ops::Deref for LazyLock<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> LazyLock<T> {
    pub const fn new(f: fn() -> T) -> Self {
        Self(spin::Lazy::new(f))
    }
}

/// Const constructor for statics holding a [`SpinLock`].
pub const fn spinlock<T>(value: T) -> SpinLock<T> {
    SpinLock::const_new(RawSpinLock::INIT, value)
}

/// Const constructor for statics holding a sleeping [`Mutex`].
pub const fn mutex<T>(value: T) -> Mutex<T> {
    Mutex::const_new(RawSleepMutex::INIT, value)
}

/// Const constructor for statics holding a sleeping [`RwLock`].
pub const fn rwlock<T>(value: T) -> RwLock<T> {
    RwLock::const_new(RawSleepRwLock::INIT, value)
}
