//! Mutexes
//!
//! Recursive ownership with one-level priority inheritance: while a
//! higher-priority thread waits, the owner runs at the waiter's priority;
//! the effective priority is recomputed (never stacked) on claim
//! contention, release, and waiter-set change.
use core::fmt;

use crate::{
    blocking::{self, BlockingCore},
    error::TimeoutError,
    kernel::PanicCode,
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    sched,
    thread::ThreadRef,
    utils::Init,
    KernelTraits,
};

pub struct Mutex<Traits: KernelTraits> {
    owner: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,
    recursion: CpuLockCell<Traits, u16>,
    core: BlockingCore<Traits>,
    initialized: CpuLockCell<Traits, bool>,
}

impl<Traits: KernelTraits> Init for Mutex<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> fmt::Debug for Mutex<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("self", &(self as *const _))
            .field(
                "owner",
                &self.owner.debug_fmt_with(|x, f| x.fmt(f)),
            )
            .field("recursion", &self.recursion)
            .finish()
    }
}

impl<Traits: KernelTraits> Mutex<Traits> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            owner: Init::INIT,
            recursion: Init::INIT,
            core: Init::INIT,
            initialized: Init::INIT,
        }
    }

    pub fn init(&self) {
        let mut guard = lock_cpu::<Traits>().expect("mutex init inside a critical section");
        let mut lock = guard.borrow_mut();
        self.owner.replace(&mut *lock, None);
        self.recursion.replace(&mut *lock, 0);
        self.initialized.replace(&mut *lock, true);
    }

    /// Acquire the mutex, blocking while another thread owns it. Claims
    /// by the owner nest; each requires a matching [`Mutex::release`].
    pub fn claim(&self) {
        debug_assert!(
            !Traits::is_interrupt_context(),
            "claim from interrupt context"
        );
        let mut guard = lock_cpu::<Traits>().expect("claim inside a critical section");
        let lock = &mut guard.borrow_mut();
        debug_assert!(self.initialized.get(&**lock), "mutex used before init");

        let cur = sched::current_ref(lock).expect("claim before the kernel started");
        if self.claim_fast(lock, cur) {
            return;
        }

        self.boost_owner(lock, cur);
        self.core.block_priority(lock, cur);
        sched::yield_locked(lock);
    }

    /// Acquire the mutex, giving up after `timeout_ms` milliseconds. A
    /// zero timeout waits forever.
    pub fn claim_timeout(&self, timeout_ms: u32) -> Result<(), TimeoutError> {
        if timeout_ms == 0 {
            self.claim();
            return Ok(());
        }
        debug_assert!(
            !Traits::is_interrupt_context(),
            "claim from interrupt context"
        );

        {
            let mut guard = lock_cpu::<Traits>().expect("claim inside a critical section");
            let lock = &mut guard.borrow_mut();
            debug_assert!(self.initialized.get(&**lock), "mutex used before init");

            let cur = sched::current_ref(lock).expect("claim before the kernel started");
            if self.claim_fast(lock, cur) {
                return Ok(());
            }

            self.boost_owner(lock, cur);
            blocking::arm_wait_timer(
                lock,
                timeout_ms,
                claim_timeout_expired::<Traits>,
                crate::timer::CallbackData::new(self as *const Self as *mut ()),
            );
            self.core.block_priority(lock, cur);
            sched::yield_locked(lock);
        }

        if blocking::finish_timeout::<Traits>() {
            Err(TimeoutError::Timeout)
        } else {
            Ok(())
        }
    }

    /// Uncontended and recursive acquisition.
    fn claim_fast(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        cur: ThreadRef<Traits>,
    ) -> bool {
        match self.owner.get(&**lock) {
            None => {
                self.owner.replace(&mut **lock, Some(cur));
                self.recursion.replace(&mut **lock, 1);
                true
            }
            Some(owner) if owner == cur => {
                let recursion = self.recursion.get(&**lock);
                self.recursion.replace(&mut **lock, recursion + 1);
                true
            }
            Some(_) => false,
        }
    }

    /// One level of priority inheritance: raise the owner to the
    /// claimant's current priority if it ranks below it.
    fn boost_owner(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>, cur: ThreadRef<Traits>) {
        let owner = self.owner.get(&**lock).unwrap();
        // Safety: registered threads are `&'static`
        let owner = unsafe { owner.as_ref() };
        let cur_prio = unsafe { cur.as_ref() }.effective_priority(lock);
        if cur_prio > owner.effective_priority(lock) {
            owner.inherit_priority(lock, cur_prio);
        }
    }

    /// Recompute the owner's effective priority as
    /// `max(base, highest waiter)`.
    fn recompute_inheritance(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) {
        if let Some(owner) = self.owner.get(&**lock) {
            // Safety: registered threads are `&'static`
            let owner = unsafe { owner.as_ref() };
            let mut target = owner.base_priority_locked(lock);
            if let Some(waiter) = self.core.highest_waiter(lock) {
                // Safety: registered threads are `&'static`
                target = target.max(unsafe { waiter.as_ref() }.effective_priority(lock));
            }
            if owner.effective_priority(lock) != target {
                owner.inherit_priority(lock, target);
            }
        }
    }

    /// Release one level of ownership. Releasing the last level restores
    /// the caller's base priority and hands the mutex to the
    /// highest-priority waiter, if any.
    pub fn release(&self) {
        let mut guard = lock_cpu::<Traits>().expect("release inside a critical section");
        let lock = &mut guard.borrow_mut();
        debug_assert!(self.initialized.get(&**lock), "mutex used before init");

        let cur = sched::current_ref(lock).expect("release before the kernel started");
        debug_assert_eq!(
            self.owner.get(&**lock),
            Some(cur),
            "mutex released by a thread that does not own it"
        );

        let recursion = self.recursion.get(&**lock) - 1;
        self.recursion.replace(&mut **lock, recursion);
        if recursion > 0 {
            return;
        }

        self.release_ownership(lock, cur);
    }

    /// Full release on behalf of `cur`, the owner. The recursion count
    /// must already be zero.
    pub(crate) fn release_ownership(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        cur: ThreadRef<Traits>,
    ) {
        // Safety: registered threads are `&'static`
        let cur_cb = unsafe { cur.as_ref() };
        let mut resched = false;

        // Drop any inherited priority.
        let base = cur_cb.base_priority_locked(lock);
        if cur_cb.effective_priority(lock) != base {
            cur_cb.inherit_priority(lock, base);
            resched = true;
        }

        if let Some(waiter) = self.core.highest_waiter(lock) {
            // Direct handoff: the waiter leaves the queue already owning
            // the mutex.
            self.owner.replace(&mut **lock, Some(waiter));
            self.recursion.replace(&mut **lock, 1);
            self.core.unblock(lock, waiter);

            // Safety: registered threads are `&'static`
            if unsafe { waiter.as_ref() }.effective_priority(lock)
                >= cur_cb.effective_priority(lock)
            {
                resched = true;
            }
        } else {
            self.owner.replace(&mut **lock, None);
            self.recursion.replace(&mut **lock, 0);
        }

        if resched {
            sched::yield_locked(lock);
        }
    }

    /// Release with the CPU Lock already held. Used by the condition
    /// variable, which atomically releases and blocks. The hold must not
    /// be recursive.
    pub(crate) fn release_locked(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) {
        let cur = sched::current_ref(lock).expect("release before the kernel started");
        debug_assert_eq!(self.owner.get(&**lock), Some(cur));
        debug_assert_eq!(
            self.recursion.get(&**lock),
            1,
            "condition wait with a recursively held mutex"
        );
        self.recursion.replace(&mut **lock, 0);
        self.release_ownership(lock, cur);
    }

    pub fn is_held(&self) -> bool {
        let mut guard = lock_cpu::<Traits>().expect("query inside a critical section");
        let lock = guard.borrow_mut();
        self.owner.get(&*lock).is_some()
    }
}

/// Timeout callback for a timed claim: expire the wait, then recompute
/// the owner's inherited priority: the waiter set just shrank, so the
/// owner may be holding a priority it no longer needs.
fn claim_timeout_expired<Traits: KernelTraits>(
    owner: Option<&'static crate::thread::Thread<Traits>>,
    data: crate::timer::CallbackData,
) {
    let Some(waiter) = owner else { return };
    // Safety: the blocked thread stops its timer before the mutex can be
    // destroyed
    let mutex = unsafe { &*(data.get() as *const Mutex<Traits>) };

    let mut guard = lock_cpu::<Traits>().unwrap_or_else(|_| {
        // Safety: timer callbacks run with the CPU Lock released
        unsafe { crate::klock::assume_cpu_lock() }
    });
    let lock = &mut guard.borrow_mut();
    if blocking::expire_waiter(lock, &mutex.core, waiter) {
        // The recomputation may demote the owner below other ready
        // threads, so run the scheduler once more.
        mutex.recompute_inheritance(lock);
        sched::yield_locked(lock);
    }
}

impl<Traits: KernelTraits> Drop for Mutex<Traits> {
    fn drop(&mut self) {
        self.core.panic_if_waited(PanicCode::ActiveMutexDescoped);
    }
}
