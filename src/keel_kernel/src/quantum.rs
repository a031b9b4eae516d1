//! Round-robin quantum
//!
//! When several ready threads share the highest populated priority, a
//! one-shot quantum timer is armed for the running thread. On expiry the
//! ready list at that priority pivots one position and a yield is raised,
//! so equal-priority threads time-slice at quantum granularity. The timer
//! is cancelled whenever a different thread takes over or the tie
//! disappears.
use crate::{
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    sched,
    thread::ThreadRef,
    timer::{CallbackData, Timer},
    utils::Init,
    KernelTraits,
};

pub(crate) struct QuantumState<Traits: KernelTraits> {
    timer: Timer<Traits>,

    /// The thread the quantum timer is currently armed for.
    active_thread: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,
}

impl<Traits: KernelTraits> Init for QuantumState<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        timer: Timer::new(),
        active_thread: Init::INIT,
    };
}

impl<Traits: KernelTraits> QuantumState<Traits> {
    pub(crate) fn init(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) {
        self.timer.init_locked(lock);
    }
}

/// (Re)arm the quantum for `thread`, the thread about to run. A no-op if
/// it is already armed for that thread; cancelled if the thread has its
/// priority level to itself.
pub(crate) fn update<Traits: KernelTraits>(
    lock: &mut CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadRef<Traits>,
) {
    let quantum = &Traits::state().timers.quantum;
    // Safety: registered threads are `&'static`
    let thread_cb = unsafe { thread.as_ref() };
    let prio = thread_cb.effective_priority(lock);

    if sched::ready_list::<Traits>(prio).has_multiple(lock) {
        if quantum.active_thread.get(&**lock) != Some(thread) {
            cancel(lock);
            quantum.active_thread.replace(&mut **lock, Some(thread));
            let quantum_ms = thread_cb.quantum_locked(lock);
            quantum.timer.start_locked(
                lock,
                true,
                quantum_ms,
                0,
                expire::<Traits>,
                CallbackData::null(),
            );
        }
    } else {
        cancel(lock);
    }
}

/// Disarm the quantum timer.
pub(crate) fn cancel<Traits: KernelTraits>(lock: &mut CpuLockTokenRefMut<'_, Traits>) {
    let quantum = &Traits::state().timers.quantum;
    if quantum.active_thread.replace(&mut **lock, None).is_some() {
        quantum.timer.stop_locked(lock);
    }
}

/// Quantum expiry: rotate the running priority's ready list and request
/// a switch on interrupt exit. Runs in interrupt context.
fn expire<Traits: KernelTraits>(
    _owner: Option<&'static crate::thread::Thread<Traits>>,
    _data: CallbackData,
) {
    let mut guard = lock_cpu::<Traits>().unwrap_or_else(|_| {
        // Safety: timer callbacks run with the CPU Lock released
        unsafe { crate::klock::assume_cpu_lock() }
    });
    let lock = &mut guard.borrow_mut();

    let quantum = &Traits::state().timers.quantum;
    quantum.active_thread.replace(&mut **lock, None);

    if let Some(cur) = sched::current_ref(lock) {
        // Safety: registered threads are `&'static`
        let prio = unsafe { cur.as_ref() }.effective_priority(lock);
        sched::ready_list::<Traits>(prio).pivot_forward(lock);
    }
    sched::yield_locked(lock);
}
