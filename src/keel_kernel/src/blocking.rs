//! The blocking-object substrate
//!
//! Every blocking primitive embeds a [`BlockingCore`]: a waiter queue and
//! the block/unblock transitions against it. Blocking moves a thread from
//! its current list (normally a ready list) onto the waiter queue;
//! unblocking puts it back on the ready list of its current priority and,
//! at the call sites, requests a yield when the woken thread does not
//! rank below the running one.
use core::fmt;

use crate::{
    kernel::{self, PanicCode},
    klock::{lock_cpu, CpuLockTokenRefMut},
    list::Ref,
    sched,
    thread::{Thread, ThreadRef, ThreadState},
    threadlist::{ListRef, ThreadList},
    timer::CallbackData,
    utils::Init,
    KernelTraits,
};

pub struct BlockingCore<Traits: KernelTraits> {
    waiters: ThreadList<Traits>,
}

impl<Traits: KernelTraits> Init for BlockingCore<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        waiters: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for BlockingCore<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BlockingCore")
            .field("waiters", &self.waiters)
            .finish()
    }
}

impl<Traits: KernelTraits> BlockingCore<Traits> {
    /// Unlink `thread` from its current list and append it to the waiter
    /// queue in FIFO order.
    pub(crate) fn block(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        thread: ThreadRef<Traits>,
    ) {
        let thread = self.begin_block(lock, thread);
        self.waiters.add(lock, thread);
    }

    /// Unlink `thread` from its current list and insert it into the
    /// waiter queue ordered by effective priority.
    pub(crate) fn block_priority(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        thread: ThreadRef<Traits>,
    ) {
        let thread = self.begin_block(lock, thread);
        self.waiters.add_priority(lock, thread);
    }

    fn begin_block<'a>(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        thread: ThreadRef<Traits>,
    ) -> &'a Thread<Traits> {
        // Safety: registered threads are `&'static`
        let thread = unsafe { thread.as_ref() };
        if let Some(list) = thread.current_list(lock) {
            // Safety: the containing list outlives the membership
            unsafe { list.as_ref() }.remove(lock, thread);
        }
        thread.set_state_locked(lock, ThreadState::Blocked);
        thread
    }

    /// Move `thread` from the waiter queue back to the ready list of its
    /// current priority. The caller decides whether to yield.
    pub(crate) fn unblock(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        thread: ThreadRef<Traits>,
    ) {
        // Safety: registered threads are `&'static`
        let thread = unsafe { thread.as_ref() };
        debug_assert_eq!(thread.state_locked(lock), ThreadState::Blocked);

        self.waiters.remove(lock, thread);
        let prio = thread.effective_priority(lock);
        sched::ready_list::<Traits>(prio).add(lock, thread);
        thread.set_state_locked(lock, ThreadState::Ready);
    }

    /// Unblock the highest-priority waiter, if any.
    pub(crate) fn wake_one(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<ThreadRef<Traits>> {
        let woken = self.waiters.highest_waiter(lock)?;
        self.unblock(lock, woken);
        Some(woken)
    }

    pub(crate) fn has_waiters(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) -> bool {
        !self.waiters.is_empty(lock)
    }

    pub(crate) fn highest_waiter(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<ThreadRef<Traits>> {
        self.waiters.highest_waiter(lock)
    }

    pub(crate) fn waiters(&self) -> &ThreadList<Traits> {
        &self.waiters
    }

    pub(crate) fn waiters_ref(&self) -> ListRef<Traits> {
        Ref::new(&self.waiters)
    }

    /// Arm the calling thread's dedicated timer so that a timeout expires
    /// this wait. Must be followed by a `block`/`block_priority` on the
    /// same core within the same critical section.
    pub(crate) fn arm_timeout(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>, ms: u32) {
        arm_wait_timer(
            lock,
            ms,
            timeout_expired::<Traits>,
            CallbackData::new(self as *const Self as *mut ()),
        );
    }

    /// Panic if the object is destroyed with threads still waiting on it.
    pub(crate) fn panic_if_waited(&self, code: PanicCode) {
        if let Ok(mut guard) = lock_cpu::<Traits>() {
            if self.has_waiters(&mut guard.borrow_mut()) {
                // The guard stays held; the panic path expects the
                // critical section to be active.
                kernel::panic::<Traits>(code);
            }
        }
    }
}

/// Arm the calling thread's dedicated timer with a caller-chosen expiry
/// callback. Used by primitives whose timeout path needs more than the
/// stock [`timeout_expired`] (the mutex recomputes inheritance, the
/// event flag group zeroes the matched bits).
pub(crate) fn arm_wait_timer<Traits: KernelTraits>(
    lock: &mut CpuLockTokenRefMut<'_, Traits>,
    ms: u32,
    callback: crate::timer::TimerCallback<Traits>,
    data: CallbackData,
) {
    let cur = sched::current_ref(lock).expect("timed wait before the kernel started");
    // Safety: registered threads are `&'static`
    let cur = unsafe { cur.as_ref() };
    cur.set_expired_locked(lock, false);
    cur.timer().start_locked(lock, true, ms, 0, callback, data);
}

/// Timeout path shared by every timed wait: mark the thread expired and
/// wake it, unless the wait was already satisfied (the waker first
/// reached wins). Returns whether the thread was expired by this call.
pub(crate) fn expire_waiter<Traits: KernelTraits>(
    lock: &mut CpuLockTokenRefMut<'_, Traits>,
    core: &BlockingCore<Traits>,
    owner: &'static Thread<Traits>,
) -> bool {
    if owner.state_locked(lock) != ThreadState::Blocked
        || owner.current_list(lock) != Some(core.waiters_ref())
    {
        return false;
    }

    owner.set_expired_locked(lock, true);
    core.unblock(lock, Ref::new(owner));

    if let Some(cur) = sched::current_ref(lock) {
        // Safety: registered threads are `&'static`
        if owner.effective_priority(lock) >= unsafe { cur.as_ref() }.effective_priority(lock) {
            sched::yield_locked(lock);
        }
    }
    true
}

/// The timer callback armed by [`BlockingCore::arm_timeout`]. Runs in
/// interrupt context.
fn timeout_expired<Traits: KernelTraits>(
    owner: Option<&'static Thread<Traits>>,
    data: CallbackData,
) {
    let Some(owner) = owner else { return };
    // Safety: the blocked thread stops its timer before the blocking
    // object can be destroyed, so the core is alive whenever this fires
    let core = unsafe { &*(data.get() as *const BlockingCore<Traits>) };

    let mut guard = lock_cpu::<Traits>().unwrap_or_else(|_| {
        // Safety: timer callbacks run with the CPU Lock released
        unsafe { crate::klock::assume_cpu_lock() }
    });
    expire_waiter(&mut guard.borrow_mut(), core, owner);
}

/// Epilogue of a timed wait, run after the blocking call resumes: stop
/// the thread's timer if it is still armed and report whether the wait
/// expired.
///
/// A port that does not actually suspend the caller (the simulation
/// port) reaches this epilogue with the wait still outstanding; the
/// timeout is left armed in that case so it can still resolve the wait.
pub(crate) fn finish_timeout<Traits: KernelTraits>() -> bool {
    let mut guard = lock_cpu::<Traits>().expect("wait epilogue inside a critical section");
    let lock = &mut guard.borrow_mut();
    let cur = sched::current_ref(lock).expect("timed wait before the kernel started");
    // Safety: registered threads are `&'static`
    let cur = unsafe { cur.as_ref() };
    if cur.state_locked(lock) != ThreadState::Blocked {
        cur.timer().stop_locked(lock);
    }
    cur.expired_locked(lock)
}

/// Request a yield when `woken` does not rank below the running thread.
pub(crate) fn yield_if_outranks<Traits: KernelTraits>(
    lock: &mut CpuLockTokenRefMut<'_, Traits>,
    woken: ThreadRef<Traits>,
) {
    if let Some(cur) = sched::current_ref(lock) {
        // Safety: registered threads are `&'static`
        let woken_prio = unsafe { woken.as_ref() }.effective_priority(lock);
        let cur_prio = unsafe { cur.as_ref() }.effective_priority(lock);
        if woken_prio >= cur_prio {
            sched::yield_locked(lock);
        }
    }
}
