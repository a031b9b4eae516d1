//! The strict-priority scheduler
//!
//! Keeps one ready list per priority level plus the stopped list, tracks
//! the `current` and `next` thread cells, and makes the constant-time
//! scheduling decision: `next` is the head of the highest nonempty ready
//! list. The running thread stays linked in its ready list; round-robin
//! rotation is a pivot of that list.
use crate::{
    kernel::{self, PanicCode},
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    thread::{Thread, ThreadRef},
    threadlist::ThreadList,
    utils::{Init, PriorityMap},
    KernelTraits, NUM_PRIORITIES,
};

pub(crate) struct Scheduler<Traits: KernelTraits> {
    pub(crate) ready: [ThreadList<Traits>; NUM_PRIORITIES],
    pub(crate) stop_list: ThreadList<Traits>,
    pub(crate) prio_map: CpuLockCell<Traits, PriorityMap>,

    enabled: CpuLockCell<Traits, bool>,
    queued_schedule: CpuLockCell<Traits, bool>,

    pub(crate) current: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,
    pub(crate) next: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,
}

impl<Traits: KernelTraits> Init for Scheduler<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        ready: Init::INIT,
        stop_list: Init::INIT,
        prio_map: Init::INIT,
        enabled: Init::INIT,
        queued_schedule: Init::INIT,
        current: Init::INIT,
        next: Init::INIT,
    };
}

/// Pick the next thread to run: the head of the highest nonempty ready
/// list. Scheduling with an empty ready set is fatal; applications must
/// provide a priority-0 idle thread.
pub(crate) fn schedule<Traits: KernelTraits>(lock: &mut CpuLockTokenRefMut<'_, Traits>) {
    let sched = &Traits::state().sched;

    let prio = match sched.prio_map.get(&**lock).highest() {
        Some(prio) => prio,
        None => kernel::panic::<Traits>(PanicCode::NoReadyThreads),
    };

    // The map bit guarantees the list is nonempty
    let head = sched.ready[prio].head(lock).unwrap();
    sched.next.replace(&mut **lock, Some(head));
}

/// Enroll `thread` in the ready list of its base priority.
pub(crate) fn add<Traits: KernelTraits>(
    lock: &mut CpuLockTokenRefMut<'_, Traits>,
    thread: &Thread<Traits>,
) {
    let prio = thread.base_priority_locked(lock);
    Traits::state().sched.ready[usize::from(prio)].add(lock, thread);
}

/// The ready list for the given priority level.
pub(crate) fn ready_list<Traits: KernelTraits>(
    prio: crate::PrioLevel,
) -> &'static ThreadList<Traits> {
    &Traits::state().sched.ready[usize::from(prio)]
}

pub(crate) fn current_ref<Traits: KernelTraits>(
    lock: &mut CpuLockTokenRefMut<'_, Traits>,
) -> Option<ThreadRef<Traits>> {
    Traits::state().sched.current.get(&**lock)
}

/// The currently running thread, or `None` before [`crate::kernel::bootstrap`].
pub fn current_thread<Traits: KernelTraits>() -> Option<&'static Thread<Traits>> {
    let mut guard = lock_cpu::<Traits>().unwrap_or_else(|_| {
        // Safety: the critical section is already active, and the kernel
        // never calls this while holding the token
        unsafe { crate::klock::assume_cpu_lock() }
    });
    let mut lock = guard.borrow_mut();
    // Safety: registered threads are `&'static`
    current_ref(&mut lock).map(|r| unsafe { r.as_ref() })
}

/// Atomically swap the scheduler-enabled flag, returning the previous
/// value. Re-enabling runs a schedule that was queued while disabled.
pub fn set_scheduler<Traits: KernelTraits>(enable: bool) -> bool {
    let mut guard = lock_cpu::<Traits>().expect("scheduler toggled inside a critical section");
    let mut lock = guard.borrow_mut();
    let sched = &Traits::state().sched;

    let prev = sched.enabled.replace(&mut *lock, enable);
    if enable && sched.queued_schedule.get(&*lock) {
        sched.queued_schedule.replace(&mut *lock, false);
        yield_locked(&mut lock);
    }
    prev
}

pub(crate) fn set_enabled_locked<Traits: KernelTraits>(
    lock: &mut CpuLockTokenRefMut<'_, Traits>,
    enable: bool,
) {
    Traits::state().sched.enabled.replace(&mut **lock, enable);
}

/// Record that a schedule was requested while the scheduler was disabled;
/// it runs when the scheduler is re-enabled.
pub(crate) fn queue_schedule<Traits: KernelTraits>(lock: &mut CpuLockTokenRefMut<'_, Traits>) {
    Traits::state()
        .sched
        .queued_schedule
        .replace(&mut **lock, true);
}

/// Run the scheduler and, if the chosen thread differs from the running
/// one, request a context switch. With the scheduler disabled, the request
/// is queued instead.
pub(crate) fn yield_locked<Traits: KernelTraits>(lock: &mut CpuLockTokenRefMut<'_, Traits>) {
    let sched = &Traits::state().sched;

    if !sched.enabled.get(&**lock) {
        queue_schedule(lock);
        return;
    }

    schedule(lock);

    let next = sched.next.get(&**lock);
    #[cfg(feature = "round-robin")]
    if let Some(next) = next {
        crate::quantum::update(lock, next);
    }

    if sched.current.get(&**lock) != next {
        request_context_switch(lock);
    }
}

/// Voluntarily invoke the scheduler.
pub fn yield_now<Traits: KernelTraits>() {
    let mut guard = lock_cpu::<Traits>().expect("yield inside a critical section");
    yield_locked(&mut guard.borrow_mut());
}

/// Pivot the current priority's ready list, then yield: cooperative
/// round-robin without waiting for the quantum timer.
pub fn coop_yield<Traits: KernelTraits>() {
    let mut guard = lock_cpu::<Traits>().expect("yield inside a critical section");
    let mut lock = guard.borrow_mut();
    if let Some(cur) = current_ref(&mut lock) {
        // Safety: registered threads are `&'static`
        if let Some(list) = unsafe { cur.as_ref() }.current_list(&mut lock) {
            // Safety: a ready list is kernel-global state
            unsafe { list.as_ref() }.pivot_forward(&mut lock);
        }
    }
    yield_locked(&mut lock);
}

/// Trigger the context-switch software interrupt. The switch itself runs
/// when the port services the interrupt, after the critical section is
/// released.
pub(crate) fn request_context_switch<Traits: KernelTraits>(
    lock: &mut CpuLockTokenRefMut<'_, Traits>,
) {
    if !Traits::state().sched.enabled.get(&**lock) {
        return;
    }

    #[cfg(feature = "stack-check")]
    if let Some(cur) = current_ref(&mut *lock) {
        // Safety: registered threads are `&'static`
        let cur = unsafe { cur.as_ref() };
        let threshold = Traits::state().stack_guard_threshold.get(&**lock);
        if cur.stack_slack_locked(lock) <= threshold {
            kernel::panic::<Traits>(PanicCode::StackSlackViolated);
        }
    }

    if let Some(callout) = Traits::state().callouts.context_switch.get(&**lock) {
        // Safety: registered threads are `&'static`
        if let Some(cur) = current_ref(&mut *lock) {
            callout(unsafe { cur.as_ref() });
        }
    }

    // Safety: we are in the critical section; the port defers the switch
    // until it is released
    unsafe { Traits::pend_context_switch() };
}

/// Publish `current ← next`. Called by the port's context-switch handler
/// between saving the outgoing context and restoring the incoming one.
pub fn context_switch_completed<Traits: KernelTraits>() {
    let mut guard = lock_cpu::<Traits>().unwrap_or_else(|_| {
        // Safety: the switch handler runs with interrupts masked
        unsafe { crate::klock::assume_cpu_lock() }
    });
    let mut lock = guard.borrow_mut();
    let sched = &Traits::state().sched;
    let next = sched.next.get(&*lock);
    let prev = sched.current.replace(&mut *lock, next);

    if prev != next {
        // Safety: registered threads are `&'static`
        let prev_id = prev.map(|t| unsafe { t.as_ref() }.id_locked(&mut lock));
        let next_id = next.map(|t| unsafe { t.as_ref() }.id_locked(&mut lock));
        log::trace!("context switch: {prev_id:?} -> {next_id:?}");
    }
}
