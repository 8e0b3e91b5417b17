//! Integer-valued parking cell.
//!
//! On Linux this is a thin wrapper over the futex syscall. Elsewhere the
//! same semantics are built from a mutex/condvar pair keyed on the cell.
//! The cell carries no ordering of its own beyond the atomic accesses the
//! caller chooses; `wait_if_equal` may return spuriously and callers must
//! re-evaluate.

use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(not(target_os = "linux"))]
use std::sync::{Condvar, Mutex};

pub(crate) struct Futex {
    cell: AtomicU32,
    #[cfg(not(target_os = "linux"))]
    lock: Mutex<()>,
    #[cfg(not(target_os = "linux"))]
    cond: Condvar,
}

impl Futex {
    pub(crate) fn new(value: u32) -> Self {
        Self {
            cell: AtomicU32::new(value),
            #[cfg(not(target_os = "linux"))]
            lock: Mutex::new(()),
            #[cfg(not(target_os = "linux"))]
            cond: Condvar::new(),
        }
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> u32 {
        self.cell.load(order)
    }

    #[inline]
    pub(crate) fn store(&self, value: u32, order: Ordering) {
        self.cell.store(value, order)
    }

    /// Blocks until woken if the cell still holds `expected`; returns
    /// immediately otherwise. Spurious returns are permitted.
    #[cfg(target_os = "linux")]
    pub(crate) fn wait_if_equal(&self, expected: u32) {
        // EAGAIN (cell changed) and EINTR both surface as an ordinary
        // return; the caller's loop re-evaluates either way.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.cell.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected as libc::c_int,
                std::ptr::null::<libc::timespec>(),
            );
        }
    }

    /// Wakes at most one thread blocked in [`Futex::wait_if_equal`].
    #[cfg(target_os = "linux")]
    pub(crate) fn wake_one(&self) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.cell.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1 as libc::c_int,
            );
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn wait_if_equal(&self, expected: u32) {
        let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.cell.load(Ordering::SeqCst) == expected {
            let _ = self.cond.wait(guard);
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn wake_one(&self) {
        // Taking the lock orders this wake against a waiter that has read
        // the cell but not yet blocked on the condvar.
        drop(self.lock.lock().unwrap_or_else(|e| e.into_inner()));
        self.cond.notify_one();
    }
}
