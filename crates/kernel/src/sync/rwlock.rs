//! Write-biased sleeping reader-writer lock.
//!
//! State word: bit 0 flags pending writers, bit 1 pending readers, bit 31
//! is the writer hold, bits 2..31 count readers. Each pending class parks
//! on its own serial-numbered futex; unlock bumps the winning class's
//! serial before waking so a racing parker re-checks instead of sleeping
//! through the handoff. A pending writer blocks new readers from taking
//! the lock.

use core::sync::atomic::{AtomicU32, Ordering};

use lock_api::{GuardSend, RawRwLock};

use storpu_abi::errors::Errno;

use super::futex::Futex;
use super::mutex::RawSleepMutex;

const RWS_PD_WRITERS: u32 = 1 << 0;
const RWS_PD_READERS: u32 = 1 << 1;
const RCNT_SHIFT: u32 = 2;
const RCNT_INC_STEP: u32 = 1 << RCNT_SHIFT;
const RWS_WRLOCKED: u32 = 1 << 31;

#[inline(always)]
fn read_locked(state: u32) -> bool {
    state & !(RWS_WRLOCKED | RWS_PD_WRITERS | RWS_PD_READERS) >= RCNT_INC_STEP
}

#[inline(always)]
fn write_locked(state: u32) -> bool {
    state & RWS_WRLOCKED != 0
}

pub struct RawSleepRwLock {
    state: AtomicU32,
    /// Guards the pending counts and serials below.
    pending_lock: RawSleepMutex,
    pending_reader_count: AtomicU32,
    pending_writer_count: AtomicU32,
    pending_reader_serial: AtomicU32,
    pending_writer_serial: AtomicU32,
    pending_reader_wq: Futex,
    pending_writer_wq: Futex,
}

impl RawSleepRwLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            pending_lock: RawSleepMutex::new(),
            pending_reader_count: AtomicU32::new(0),
            pending_writer_count: AtomicU32::new(0),
            pending_reader_serial: AtomicU32::new(0),
            pending_writer_serial: AtomicU32::new(0),
            pending_reader_wq: Futex::new(),
            pending_writer_wq: Futex::new(),
        }
    }

    fn can_read(state: u32) -> bool {
        !write_locked(state) && state & RWS_PD_WRITERS == 0
    }

    fn can_write(state: u32) -> bool {
        !write_locked(state) && !read_locked(state)
    }

    /// `EBUSY` when held by a writer or a writer is pending; `EAGAIN` on
    /// reader-count overflow.
    pub fn try_read_raw(&self) -> Result<(), Errno> {
        let mut state = self.state.load(Ordering::Relaxed);

        while Self::can_read(state) {
            let new_state = state.wrapping_add(RCNT_INC_STEP);
            if !read_locked(new_state) {
                return Err(Errno::EAGAIN);
            }

            match self.state.compare_exchange_weak(
                state,
                new_state,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(s) => state = s,
            }
        }

        Err(Errno::EBUSY)
    }

    pub fn read_raw(&self) -> Result<(), Errno> {
        loop {
            match self.try_read_raw() {
                Ok(()) => return Ok(()),
                Err(Errno::EAGAIN) => return Err(Errno::EAGAIN),
                Err(_) => {}
            }

            let state = self.state.load(Ordering::Relaxed);
            if Self::can_read(state) {
                continue;
            }

            self.pending_lock.lock_raw();
            self.pending_reader_count.fetch_add(1, Ordering::Relaxed);
            let old_state = self.state.fetch_or(RWS_PD_READERS, Ordering::Relaxed);
            let old_serial = self.pending_reader_serial.load(Ordering::Relaxed);
            self.pending_lock.unlock_raw();

            if !Self::can_read(old_state) {
                self.pending_reader_wq
                    .wait(&self.pending_reader_serial, old_serial);
            }

            self.pending_lock.lock_raw();
            if self.pending_reader_count.fetch_sub(1, Ordering::Relaxed) == 1 {
                self.state.fetch_and(!RWS_PD_READERS, Ordering::Relaxed);
            }
            self.pending_lock.unlock_raw();
        }
    }

    pub fn try_write_raw(&self) -> Result<(), Errno> {
        let mut state = self.state.load(Ordering::Relaxed);

        while Self::can_write(state) {
            match self.state.compare_exchange_weak(
                state,
                state | RWS_WRLOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(s) => state = s,
            }
        }

        Err(Errno::EBUSY)
    }

    pub fn write_raw(&self) {
        loop {
            if self.try_write_raw().is_ok() {
                return;
            }

            let state = self.state.load(Ordering::Relaxed);
            if Self::can_write(state) {
                continue;
            }

            self.pending_lock.lock_raw();
            self.pending_writer_count.fetch_add(1, Ordering::Relaxed);
            let old_state = self.state.fetch_or(RWS_PD_WRITERS, Ordering::Relaxed);
            let old_serial = self.pending_writer_serial.load(Ordering::Relaxed);
            self.pending_lock.unlock_raw();

            if !Self::can_write(old_state) {
                self.pending_writer_wq
                    .wait(&self.pending_writer_serial, old_serial);
            }

            self.pending_lock.lock_raw();
            if self.pending_writer_count.fetch_sub(1, Ordering::Relaxed) == 1 {
                self.state.fetch_and(!RWS_PD_WRITERS, Ordering::Relaxed);
            }
            self.pending_lock.unlock_raw();
        }
    }

    /// Hands the lock off: writers first, else every pending reader.
    fn wake_pending(&self) {
        self.pending_lock.lock_raw();

        if self.pending_writer_count.load(Ordering::Relaxed) > 0 {
            self.pending_writer_serial.fetch_add(1, Ordering::Release);
            self.pending_lock.unlock_raw();

            self.pending_writer_wq.wake(1);
        } else if self.pending_reader_count.load(Ordering::Relaxed) > 0 {
            self.pending_reader_serial.fetch_add(1, Ordering::Release);
            self.pending_lock.unlock_raw();

            self.pending_reader_wq.wake(u32::MAX);
        } else {
            self.pending_lock.unlock_raw();
        }
    }

    pub fn unlock_write_raw(&self) {
        let old_state = self.state.fetch_and(!RWS_WRLOCKED, Ordering::Release);

        if old_state & (RWS_PD_WRITERS | RWS_PD_READERS) != 0 {
            self.wake_pending();
        }
    }

    pub fn unlock_read_raw(&self) {
        let old_state = self.state.fetch_sub(RCNT_INC_STEP, Ordering::Release);

        let was_last_reader = (old_state & !(RWS_WRLOCKED | RWS_PD_WRITERS | RWS_PD_READERS))
            >> RCNT_SHIFT
            == 1;
        if was_last_reader && old_state & (RWS_PD_WRITERS | RWS_PD_READERS) != 0 {
            self.wake_pending();
        }
    }
}

impl Default for RawSleepRwLock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawRwLock for RawSleepRwLock {
    const INIT: Self = Self::new();
    type GuardMarker = GuardSend;

    fn lock_shared(&self) {
        self.read_raw().expect("rwlock reader count overflow");
    }

    fn try_lock_shared(&self) -> bool {
        self.try_read_raw().is_ok()
    }

    unsafe fn unlock_shared(&self) {
        self.unlock_read_raw();
    }

    fn lock_exclusive(&self) {
        self.write_raw();
    }

    fn try_lock_exclusive(&self) -> bool {
        self.try_write_raw().is_ok()
    }

    unsafe fn unlock_exclusive(&self) {
        self.unlock_write_raw();
    }

    fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & !(RWS_PD_WRITERS | RWS_PD_READERS) != 0
    }

    fn is_locked_exclusive(&self) -> bool {
        write_locked(self.state.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_writer_exclusion() {
        let lock = RawSleepRwLock::new();

        lock.try_read_raw().unwrap();
        lock.try_read_raw().unwrap();
        assert_eq!(lock.try_write_raw(), Err(Errno::EBUSY));

        lock.unlock_read_raw();
        lock.unlock_read_raw();

        lock.try_write_raw().unwrap();
        assert_eq!(lock.try_read_raw(), Err(Errno::EBUSY));
        assert_eq!(lock.try_write_raw(), Err(Errno::EBUSY));
        lock.unlock_write_raw();

        lock.try_read_raw().unwrap();
        lock.unlock_read_raw();
    }

    #[test]
    fn pending_writer_blocks_new_readers() {
        let lock = RawSleepRwLock::new();

        lock.try_read_raw().unwrap();

        // A writer that cannot get in yet flags itself pending.
        lock.state.fetch_or(RWS_PD_WRITERS, Ordering::Relaxed);

        assert_eq!(lock.try_read_raw(), Err(Errno::EBUSY));

        lock.state.fetch_and(!RWS_PD_WRITERS, Ordering::Relaxed);
        lock.unlock_read_raw();
    }
}
