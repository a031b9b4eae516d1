//! Semaphores
//!
//! Counting (or, with a maximum of one, binary) semaphores. `post` is
//! safe to call from interrupt handlers; `pend` is not.
use core::fmt;

use crate::{
    blocking::{self, BlockingCore},
    error::TimeoutError,
    kernel::PanicCode,
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    sched,
    utils::Init,
    KernelTraits,
};

pub struct Semaphore<Traits: KernelTraits> {
    count: CpuLockCell<Traits, u16>,
    max: CpuLockCell<Traits, u16>,
    core: BlockingCore<Traits>,
    initialized: CpuLockCell<Traits, bool>,
}

impl<Traits: KernelTraits> Init for Semaphore<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> fmt::Debug for Semaphore<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("self", &(self as *const _))
            .field("count", &self.count)
            .field("max", &self.max)
            .finish()
    }
}

impl<Traits: KernelTraits> Semaphore<Traits> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            count: Init::INIT,
            max: Init::INIT,
            core: Init::INIT,
            initialized: Init::INIT,
        }
    }

    /// Establish the initial and maximum counts. `0 < max`,
    /// `initial <= max`.
    pub fn init(&self, initial: u16, max: u16) {
        debug_assert!(max > 0 && initial <= max);
        let mut guard = lock_cpu::<Traits>().expect("semaphore init inside a critical section");
        let mut lock = guard.borrow_mut();
        self.count.replace(&mut *lock, initial);
        self.max.replace(&mut *lock, max);
        self.initialized.replace(&mut *lock, true);
    }

    /// Release one permit. If a thread is waiting, it is handed the
    /// permit directly; otherwise the count rises, saturating at the
    /// maximum. ISR-safe.
    pub fn post(&self) {
        let mut guard = lock_cpu::<Traits>().expect("post inside a critical section");
        self.post_locked(&mut guard.borrow_mut());
    }

    pub(crate) fn post_locked(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) {
        debug_assert!(self.initialized.get(&**lock), "semaphore used before init");

        if let Some(woken) = self.core.wake_one(lock) {
            blocking::yield_if_outranks(lock, woken);
            return;
        }

        let count = self.count.get(&**lock);
        if count < self.max.get(&**lock) {
            self.count.replace(&mut **lock, count + 1);
        } else {
            #[cfg(feature = "sem-post-panic")]
            debug_assert!(false, "semaphore posted past its maximum");
            log::warn!("semaphore post past maximum; clamping");
        }
    }

    /// Take one permit, blocking until one is available.
    pub fn pend(&self) {
        debug_assert!(
            !Traits::is_interrupt_context(),
            "pend from interrupt context"
        );
        let mut guard = lock_cpu::<Traits>().expect("pend inside a critical section");
        let lock = &mut guard.borrow_mut();
        debug_assert!(self.initialized.get(&**lock), "semaphore used before init");

        let count = self.count.get(&**lock);
        if count > 0 {
            self.count.replace(&mut **lock, count - 1);
            return;
        }

        let cur = sched::current_ref(lock).expect("pend before the kernel started");
        self.core.block_priority(lock, cur);
        sched::yield_locked(lock);
    }

    /// Take one permit, giving up after `timeout_ms` milliseconds. A zero
    /// timeout waits forever.
    pub fn pend_timeout(&self, timeout_ms: u32) -> Result<(), TimeoutError> {
        if timeout_ms == 0 {
            self.pend();
            return Ok(());
        }
        debug_assert!(
            !Traits::is_interrupt_context(),
            "pend from interrupt context"
        );

        {
            let mut guard = lock_cpu::<Traits>().expect("pend inside a critical section");
            let lock = &mut guard.borrow_mut();
            debug_assert!(self.initialized.get(&**lock), "semaphore used before init");

            let count = self.count.get(&**lock);
            if count > 0 {
                self.count.replace(&mut **lock, count - 1);
                return Ok(());
            }

            let cur = sched::current_ref(lock).expect("pend before the kernel started");
            self.core.arm_timeout(lock, timeout_ms);
            self.core.block_priority(lock, cur);
            sched::yield_locked(lock);
        }

        if blocking::finish_timeout::<Traits>() {
            Err(TimeoutError::Timeout)
        } else {
            Ok(())
        }
    }

    /// The current count.
    pub fn count(&self) -> u16 {
        let mut guard = lock_cpu::<Traits>().expect("count read inside a critical section");
        let lock = guard.borrow_mut();
        self.count.get(&*lock)
    }
}

impl<Traits: KernelTraits> Drop for Semaphore<Traits> {
    fn drop(&mut self) {
        self.core.panic_if_waited(PanicCode::ActiveSemaphoreDescoped);
    }
}
