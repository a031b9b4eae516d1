//! Lightweight thread notification
//!
//! A pending bit plus a waiter queue. Signalling with no waiters leaves
//! the bit set, satisfying the next wait immediately; signalling with
//! waiters wakes all of them. ISR-safe on the signalling side.
use core::fmt;

use crate::{
    blocking::{self, BlockingCore},
    error::TimeoutError,
    kernel::PanicCode,
    klock::{lock_cpu, CpuLockCell},
    sched,
    utils::Init,
    KernelTraits,
};

pub struct Notify<Traits: KernelTraits> {
    pending: CpuLockCell<Traits, bool>,
    core: BlockingCore<Traits>,
    initialized: CpuLockCell<Traits, bool>,
}

impl<Traits: KernelTraits> Init for Notify<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> fmt::Debug for Notify<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Notify")
            .field("self", &(self as *const _))
            .field("pending", &self.pending)
            .finish()
    }
}

impl<Traits: KernelTraits> Notify<Traits> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            pending: Init::INIT,
            core: Init::INIT,
            initialized: Init::INIT,
        }
    }

    pub fn init(&self) {
        let mut guard = lock_cpu::<Traits>().expect("notify init inside a critical section");
        let mut lock = guard.borrow_mut();
        self.pending.replace(&mut *lock, false);
        self.initialized.replace(&mut *lock, true);
    }

    /// Wake every waiting thread, or record a pending signal if none is
    /// waiting. ISR-safe.
    pub fn signal(&self) {
        let mut guard = lock_cpu::<Traits>().expect("signal inside a critical section");
        let lock = &mut guard.borrow_mut();
        debug_assert!(self.initialized.get(&**lock), "notify used before init");

        if !self.core.has_waiters(lock) {
            self.pending.replace(&mut **lock, true);
            return;
        }

        let mut resched = false;
        while let Some(woken) = self.core.wake_one(lock) {
            if let Some(cur) = sched::current_ref(lock) {
                // Safety: registered threads are `&'static`
                if unsafe { woken.as_ref() }.effective_priority(lock)
                    >= unsafe { cur.as_ref() }.effective_priority(lock)
                {
                    resched = true;
                }
            }
        }
        self.pending.replace(&mut **lock, false);

        if resched {
            sched::yield_locked(lock);
        }
    }

    /// Wait for a signal. Returns `true` when the wait was satisfied
    /// immediately by a previously pending signal (which is consumed) and
    /// `false` when the thread blocked.
    pub fn wait(&self) -> bool {
        debug_assert!(
            !Traits::is_interrupt_context(),
            "notify wait from interrupt context"
        );
        let mut guard = lock_cpu::<Traits>().expect("wait inside a critical section");
        let lock = &mut guard.borrow_mut();
        debug_assert!(self.initialized.get(&**lock), "notify used before init");

        if self.pending.get(&**lock) {
            self.pending.replace(&mut **lock, false);
            return true;
        }

        let cur = sched::current_ref(lock).expect("wait before the kernel started");
        self.core.block(lock, cur);
        sched::yield_locked(lock);
        false
    }

    /// Timed variant of [`Notify::wait`]. The `Ok` value carries the same
    /// immediate-vs-blocked flag. A zero timeout waits forever.
    pub fn wait_timeout(&self, timeout_ms: u32) -> Result<bool, TimeoutError> {
        if timeout_ms == 0 {
            return Ok(self.wait());
        }
        debug_assert!(
            !Traits::is_interrupt_context(),
            "notify wait from interrupt context"
        );

        {
            let mut guard = lock_cpu::<Traits>().expect("wait inside a critical section");
            let lock = &mut guard.borrow_mut();
            debug_assert!(self.initialized.get(&**lock), "notify used before init");

            if self.pending.get(&**lock) {
                self.pending.replace(&mut **lock, false);
                return Ok(true);
            }

            let cur = sched::current_ref(lock).expect("wait before the kernel started");
            self.core.arm_timeout(lock, timeout_ms);
            self.core.block(lock, cur);
            sched::yield_locked(lock);
        }

        if blocking::finish_timeout::<Traits>() {
            Err(TimeoutError::Timeout)
        } else {
            Ok(false)
        }
    }
}

impl<Traits: KernelTraits> Drop for Notify<Traits> {
    fn drop(&mut self) {
        self.core.panic_if_waited(PanicCode::ActiveNotifyDescoped);
    }
}
