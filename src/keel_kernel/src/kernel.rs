//! The kernel facade
//!
//! Initialization, startup, the panic funnel and the user callouts.
use core::marker::PhantomData;
use core::sync::atomic::Ordering;

use crate::{
    klock::{lock_cpu, CpuLockCell},
    sched,
    thread::Thread,
    utils::Init,
    KernelTraits, PrioLevel,
};

/// Default stack-slack guard threshold, in bytes.
#[cfg(feature = "stack-check")]
pub const STACK_GUARD_DEFAULT: usize = 32;

/// Fatal invariant violations. Reported to the panic callout; without
/// one, the kernel halts with interrupts disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicCode {
    /// The scheduler ran with no ready thread. An idle thread at
    /// priority 0 must always exist.
    NoReadyThreads,
    /// A list node's neighbours disagree on its membership.
    ListUnlinkFailed,
    /// A blocking object was destroyed with waiters on it.
    ActiveSemaphoreDescoped,
    ActiveMutexDescoped,
    ActiveEventFlagDescoped,
    ActiveNotifyDescoped,
    ActiveCondVarDescoped,
    ActiveRwLockDescoped,
    /// A mailbox was destroyed while holding undelivered envelopes.
    ActiveMailboxDescoped,
    /// A thread object was destroyed while ready, running or blocked.
    RunningThreadDescoped,
    /// A thread's stack slack fell below the guard threshold.
    StackSlackViolated,
}

/// A callout receiving a thread reference.
pub type ThreadCallout<Traits> = fn(&'static Thread<Traits>);

pub(crate) struct Callouts<Traits: KernelTraits> {
    pub(crate) thread_create: CpuLockCell<Traits, Option<ThreadCallout<Traits>>>,
    pub(crate) thread_exit: CpuLockCell<Traits, Option<ThreadCallout<Traits>>>,
    pub(crate) context_switch: CpuLockCell<Traits, Option<ThreadCallout<Traits>>>,
    pub(crate) idle: CpuLockCell<Traits, Option<fn()>>,
    pub(crate) debug_print: CpuLockCell<Traits, Option<fn(&str)>>,
}

impl<Traits: KernelTraits> Init for Callouts<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        thread_create: Init::INIT,
        thread_exit: Init::INIT,
        context_switch: Init::INIT,
        idle: Init::INIT,
        debug_print: Init::INIT,
    };
}

/// The kernel entry points for one instantiation, addressed as
/// `Kernel::<SystemTraits>::...`.
pub struct Kernel<Traits>(PhantomData<Traits>);

impl<Traits: KernelTraits> Kernel<Traits> {
    /// Initialize the scheduler and timer scheduler. Must run before any
    /// kernel object is initialized.
    pub fn init() {
        let mut guard = lock_cpu::<Traits>().expect("kernel init inside a critical section");
        let lock = &mut guard.borrow_mut();
        let state = Traits::state();

        for (prio, list) in state.sched.ready.iter().enumerate() {
            list.set_priority(lock, prio as PrioLevel);
        }

        #[cfg(feature = "round-robin")]
        state.timers.quantum.init(lock);

        state.kernel_initialized.replace(&mut **lock, true);
    }

    /// Whether [`Kernel::start`] has run.
    pub fn is_started() -> bool {
        is_started::<Traits>()
    }

    /// Choose the first thread, arm the tick source, and hand the CPU to
    /// the port. Never returns.
    pub fn start() -> ! {
        // Safety: this is the one place `bootstrap` is meant to be called
        unsafe { bootstrap::<Traits>() };
        // Safety: the kernel is started; the tick handler has valid state
        unsafe { Traits::timer_start() };
        // Safety: `bootstrap` chose the first thread
        unsafe { Traits::start_threads() }
    }

    /// Report a fatal error. Never returns.
    pub fn panic(code: PanicCode) -> ! {
        panic::<Traits>(code)
    }

    /// Install the panic callout. Must be called before [`Kernel::start`].
    pub fn set_panic_handler(handler: fn(PanicCode)) {
        let _guard = lock_cpu::<Traits>().expect("callout change inside a critical section");
        // Safety: interrupts are disabled and the kernel is not running
        unsafe { Traits::state().panic_handler.set(Some(handler)) };
    }

    /// Install the thread-creation callout.
    ///
    /// Callouts run from kernel context and must not call kernel
    /// services.
    pub fn set_thread_create_callout(callout: ThreadCallout<Traits>) {
        let mut guard = lock_cpu::<Traits>().expect("callout change inside a critical section");
        let mut lock = guard.borrow_mut();
        Traits::state()
            .callouts
            .thread_create
            .replace(&mut *lock, Some(callout));
    }

    /// Install the thread-exit callout.
    pub fn set_thread_exit_callout(callout: ThreadCallout<Traits>) {
        let mut guard = lock_cpu::<Traits>().expect("callout change inside a critical section");
        let mut lock = guard.borrow_mut();
        Traits::state()
            .callouts
            .thread_exit
            .replace(&mut *lock, Some(callout));
    }

    /// Install the context-switch callout. It receives the outgoing
    /// thread and runs inside the critical section; it must not call
    /// kernel services.
    pub fn set_context_switch_callout(callout: ThreadCallout<Traits>) {
        let mut guard = lock_cpu::<Traits>().expect("callout change inside a critical section");
        let mut lock = guard.borrow_mut();
        Traits::state()
            .callouts
            .context_switch
            .replace(&mut *lock, Some(callout));
    }

    /// Install the idle hook, for the idle thread (or a tickless port's
    /// idle loop) to call.
    pub fn set_idle_callout(callout: fn()) {
        let mut guard = lock_cpu::<Traits>().expect("callout change inside a critical section");
        let mut lock = guard.borrow_mut();
        Traits::state().callouts.idle.replace(&mut *lock, Some(callout));
    }

    pub fn idle_callout() -> Option<fn()> {
        let mut guard = lock_cpu::<Traits>().expect("callout read inside a critical section");
        let lock = guard.borrow_mut();
        Traits::state().callouts.idle.get(&*lock)
    }

    /// Install the debug-print callout used by [`Kernel::debug_print`].
    pub fn set_debug_print_callout(callout: fn(&str)) {
        let mut guard = lock_cpu::<Traits>().expect("callout change inside a critical section");
        let mut lock = guard.borrow_mut();
        Traits::state()
            .callouts
            .debug_print
            .replace(&mut *lock, Some(callout));
    }

    /// Hand a string to the debug-print callout, if one is installed.
    pub fn debug_print(message: &str) {
        let callout = {
            let mut guard = lock_cpu::<Traits>().expect("callout read inside a critical section");
            let lock = guard.borrow_mut();
            Traits::state().callouts.debug_print.get(&*lock)
        };
        if let Some(callout) = callout {
            callout(message);
        }
    }

    /// Suspend the calling thread for `ms` milliseconds.
    pub fn sleep(ms: u32) {
        crate::thread::sleep::<Traits>(ms);
    }

    /// Voluntarily invoke the scheduler.
    pub fn yield_now() {
        sched::yield_now::<Traits>();
    }

    /// Rotate the current priority's ready list, then yield.
    pub fn coop_yield() {
        sched::coop_yield::<Traits>();
    }

    /// The currently running thread.
    pub fn current_thread() -> Option<&'static Thread<Traits>> {
        sched::current_thread::<Traits>()
    }

    /// Swap the scheduler-enabled flag, returning the previous value.
    pub fn set_scheduler(enable: bool) -> bool {
        sched::set_scheduler::<Traits>(enable)
    }

    /// Set the stack-slack guard threshold, in bytes.
    #[cfg(feature = "stack-check")]
    pub fn set_stack_guard_threshold(bytes: usize) {
        let mut guard = lock_cpu::<Traits>().expect("threshold change inside a critical section");
        let mut lock = guard.borrow_mut();
        Traits::state()
            .stack_guard_threshold
            .replace(&mut *lock, bytes);
    }
}

pub(crate) fn is_started<Traits: KernelTraits>() -> bool {
    Traits::state().started.load(Ordering::Relaxed)
}

/// Enable the scheduler, choose the first thread and mark the kernel
/// started. Split out of [`Kernel::start`] for ports (and simulators)
/// that dispatch the first thread themselves.
///
/// # Safety
///
/// Must be called exactly once, after `Kernel::init` and after at least
/// one thread (the priority-0 idle thread included) has been started.
pub unsafe fn bootstrap<Traits: KernelTraits>() {
    let mut guard = lock_cpu::<Traits>().expect("kernel start inside a critical section");
    let lock = &mut guard.borrow_mut();
    let state = Traits::state();

    sched::set_enabled_locked(lock, true);
    sched::schedule(lock);

    let next = state.sched.next.get(&**lock);
    state.sched.current.replace(&mut **lock, next);

    #[cfg(feature = "round-robin")]
    if let Some(next) = next {
        crate::quantum::update(lock, next);
    }

    state.started.store(true, Ordering::Relaxed);
}

/// The panic funnel: invoke the panic callout if one is installed,
/// otherwise halt with interrupts disabled.
pub(crate) fn panic<Traits: KernelTraits>(code: PanicCode) -> ! {
    if !Traits::is_critical_active() {
        // Safety: halting; the state is never released
        unsafe { Traits::enter_critical() };
    }

    // Safety: interrupts are disabled on the single core
    let handler = unsafe { Traits::state().panic_handler.get() };
    if let Some(handler) = handler {
        handler(code);
    }

    loop {
        core::hint::spin_loop();
    }
}

pub(crate) fn thread_create_callout<Traits: KernelTraits>() -> Option<ThreadCallout<Traits>> {
    let mut guard = lock_cpu::<Traits>().expect("callout read inside a critical section");
    let lock = guard.borrow_mut();
    Traits::state().callouts.thread_create.get(&*lock)
}

pub(crate) fn thread_exit_callout<Traits: KernelTraits>() -> Option<ThreadCallout<Traits>> {
    let mut guard = lock_cpu::<Traits>().expect("callout read inside a critical section");
    let lock = guard.borrow_mut();
    Traits::state().callouts.thread_exit.get(&*lock)
}

/// Route kernel panics into Rust test panics.
#[cfg(test)]
pub fn install_test_panic_handler<Traits: KernelTraits>() {
    fn handler(code: PanicCode) {
        panic!("kernel panic: {code:?}");
    }
    Kernel::<Traits>::set_panic_handler(handler);
}
