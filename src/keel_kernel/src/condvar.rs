//! Condition variables
//!
//! A waiter queue paired, per wait, with a caller-supplied [`Mutex`]:
//! the wait releases the mutex and blocks in one critical section, and
//! re-claims the mutex on the way out.
use core::fmt;

use crate::{
    blocking::{self, BlockingCore},
    error::TimeoutError,
    kernel::PanicCode,
    klock::{lock_cpu, CpuLockCell},
    mutex::Mutex,
    sched,
    utils::Init,
    KernelTraits,
};

pub struct CondVar<Traits: KernelTraits> {
    core: BlockingCore<Traits>,
    initialized: CpuLockCell<Traits, bool>,
}

impl<Traits: KernelTraits> Init for CondVar<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> fmt::Debug for CondVar<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CondVar")
            .field("self", &(self as *const _))
            .finish()
    }
}

impl<Traits: KernelTraits> CondVar<Traits> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            core: Init::INIT,
            initialized: Init::INIT,
        }
    }

    pub fn init(&self) {
        let mut guard = lock_cpu::<Traits>().expect("condvar init inside a critical section");
        let mut lock = guard.borrow_mut();
        self.initialized.replace(&mut *lock, true);
    }

    /// Atomically release `mutex` and block; re-claim `mutex` once
    /// signalled. The caller must hold `mutex` non-recursively.
    pub fn wait(&self, mutex: &Mutex<Traits>) {
        debug_assert!(
            !Traits::is_interrupt_context(),
            "condition wait from interrupt context"
        );
        {
            let mut guard = lock_cpu::<Traits>().expect("wait inside a critical section");
            let lock = &mut guard.borrow_mut();
            debug_assert!(self.initialized.get(&**lock), "condvar used before init");

            let cur = sched::current_ref(lock).expect("wait before the kernel started");
            mutex.release_locked(lock);
            self.core.block_priority(lock, cur);
            sched::yield_locked(lock);
        }

        if resumed::<Traits>() {
            mutex.claim();
        }
    }

    /// Timed variant of [`CondVar::wait`]. The mutex is re-claimed on
    /// both outcomes. A zero timeout waits forever.
    pub fn wait_timeout(&self, mutex: &Mutex<Traits>, timeout_ms: u32) -> Result<(), TimeoutError> {
        if timeout_ms == 0 {
            self.wait(mutex);
            return Ok(());
        }
        debug_assert!(
            !Traits::is_interrupt_context(),
            "condition wait from interrupt context"
        );

        {
            let mut guard = lock_cpu::<Traits>().expect("wait inside a critical section");
            let lock = &mut guard.borrow_mut();
            debug_assert!(self.initialized.get(&**lock), "condvar used before init");

            let cur = sched::current_ref(lock).expect("wait before the kernel started");
            mutex.release_locked(lock);
            self.core.arm_timeout(lock, timeout_ms);
            self.core.block_priority(lock, cur);
            sched::yield_locked(lock);
        }

        let expired = blocking::finish_timeout::<Traits>();
        if resumed::<Traits>() {
            mutex.claim();
        }
        if expired {
            Err(TimeoutError::Timeout)
        } else {
            Ok(())
        }
    }

    /// Wake the highest-priority waiter.
    pub fn signal(&self) {
        let mut guard = lock_cpu::<Traits>().expect("signal inside a critical section");
        let lock = &mut guard.borrow_mut();
        debug_assert!(self.initialized.get(&**lock), "condvar used before init");

        if let Some(woken) = self.core.wake_one(lock) {
            blocking::yield_if_outranks(lock, woken);
        }
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        let mut guard = lock_cpu::<Traits>().expect("broadcast inside a critical section");
        let lock = &mut guard.borrow_mut();
        debug_assert!(self.initialized.get(&**lock), "condvar used before init");

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
        if resched {
            sched::yield_locked(lock);
        }
    }
}

/// Whether the calling thread has actually been resumed. A port that
/// does not suspend the caller (the simulation port) returns from the
/// block with the wait still outstanding; the mutex is not re-claimed
/// on its behalf then.
fn resumed<Traits: KernelTraits>() -> bool {
    let mut guard = lock_cpu::<Traits>().expect("wait epilogue inside a critical section");
    let lock = &mut guard.borrow_mut();
    match sched::current_ref(lock) {
        // Safety: registered threads are `&'static`
        Some(cur) => unsafe { cur.as_ref() }.state_locked(lock) != crate::thread::ThreadState::Blocked,
        None => false,
    }
}

impl<Traits: KernelTraits> Drop for CondVar<Traits> {
    fn drop(&mut self) {
        self.core.panic_if_waited(PanicCode::ActiveCondVarDescoped);
    }
}
