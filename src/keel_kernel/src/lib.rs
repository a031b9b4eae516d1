//! keel, a strict-priority preemptive real-time kernel nucleus for
//! single-core microcontrollers without an MMU.
//!
//! The kernel multiplexes one CPU across many threads using
//! strict-priority scheduling with round-robin tiebreaking, provides
//! deterministic software timers driven by a single hardware tick, and
//! supplies a family of blocking primitives (semaphores, mutexes with
//! priority inheritance, event flags, notifications, condition variables,
//! reader-writer locks, mailboxes, message queues).
//!
//! # Kernel instantiation
//!
//! The kernel is generic over a `Traits` type supplied by a *port*: the
//! chip-specific layer providing the context-switch software interrupt,
//! the critical section, and the hardware tick source. A port defines a
//! trait-implementing type and materializes the kernel-global state with
//! [`build_kernel!`]:
//!
//! ```ignore
//! struct SystemTraits;
//! /* impl PortThreading, PortTimer for SystemTraits */
//! keel_kernel::build_kernel!(SystemTraits);
//! ```
//!
//! Applications then allocate kernel objects in `static` storage, call
//! `init` on each of them, and hand control to [`Kernel::start`]. An idle
//! thread at priority 0 is mandatory; scheduling an empty ready set is a
//! kernel panic.
//!
//! # Context rules
//!
//! Interrupt handlers may post semaphores, signal notifications, and set
//! event flags; they must never block. Timer callbacks run in interrupt
//! context and are subject to the same rule.
#![cfg_attr(not(test), no_std)]

pub mod utils;

mod klock;

pub mod blocking;
pub mod condvar;
pub mod error;
#[cfg(feature = "event-flags")]
pub mod eventflag;
pub mod kernel;
pub mod list;
pub mod mailbox;
pub mod message;
pub mod mutex;
pub mod notify;
#[cfg(feature = "round-robin")]
pub mod quantum;
pub mod rwlock;
pub mod sched;
pub mod semaphore;
pub mod thread;
pub mod threadlist;
pub mod timer;

#[cfg(test)]
pub mod test_port;

#[cfg(feature = "event-flags")]
pub use self::eventflag::{EventFlag, EventFlagMode};
pub use self::{
    condvar::CondVar,
    error::TimeoutError,
    kernel::{Kernel, PanicCode},
    mailbox::Mailbox,
    message::{Message, MessagePool, MessageQueue},
    mutex::Mutex,
    notify::Notify,
    rwlock::RwLock,
    semaphore::Semaphore,
    thread::{Stack, Thread, ThreadState},
    timer::{CallbackData, Timer, TimerCallback},
};

use crate::utils::{Init, RawCell};

/// A thread priority level. Higher values outrank lower ones; level 0 is
/// reserved for the idle thread.
pub type PrioLevel = u8;

/// The number of priority levels managed by the scheduler.
pub const NUM_PRIORITIES: usize = 16;

/// The word every stack is filled with at thread initialization, used by
/// the stack-slack scan.
pub const STACK_FILL_WORD: usize = usize::MAX;

/// Round-robin quantum, in milliseconds, assigned to threads that don't
/// configure their own.
pub const THREAD_QUANTUM_DEFAULT: u32 = 4;

/// The port-provided threading interface: context-switch plumbing and the
/// critical section.
///
/// # Safety-relevant contract
///
/// The port must guarantee that `pend_context_switch` defers the actual
/// switch until the critical section is released, and that the switch
/// handler performs: save the integer register file to the outgoing
/// thread's stack, call [`sched::context_switch_completed`], restore from
/// the incoming thread's stack.
pub trait PortThreading: Sized + 'static {
    /// Port-defined per-thread state. Holds at least the saved stack-top
    /// pointer. Placed at the very beginning of [`Thread`] so assembler
    /// code can refer to it without offset arithmetic.
    type PortThreadState: Init + Send + Sync + 'static;

    /// Write a synthetic exception frame to the thread's stack so that the
    /// first restore lands at `entry(arg)`, and record the resulting
    /// stack-top pointer in the thread's `port_state`.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel during `Thread::init`.
    unsafe fn init_stack(
        port_state: &Self::PortThreadState,
        stack_base: *mut usize,
        stack_words: usize,
        entry: fn(usize),
        arg: usize,
    );

    /// Arm the software interrupt and the tick source, then jump to the
    /// first thread via a synthetic exception return.
    ///
    /// # Safety
    ///
    /// Only meant to be called by [`Kernel::start`], exactly once, after
    /// [`kernel::bootstrap`] has chosen the first thread.
    unsafe fn start_threads() -> !;

    /// Pend the context-switch software interrupt.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel, inside the critical section.
    unsafe fn pend_context_switch();

    /// Try to enter the critical section (disable interrupts). Returns
    /// `false` if it was already active.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn try_enter_critical() -> bool;

    /// Enter the critical section unconditionally.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn enter_critical();

    /// Leave the critical section (restore interrupts).
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel, in the critical section.
    unsafe fn leave_critical();

    /// Whether the critical section is currently active.
    fn is_critical_active() -> bool;

    /// Whether the current execution context is an interrupt handler.
    /// Blocking calls are rejected by debug assertions in interrupt
    /// context.
    fn is_interrupt_context() -> bool;
}

/// The port-provided hardware tick interface.
pub trait PortTimer: Sized + 'static {
    /// Tick rate of the hardware timer driving [`timer::tick`].
    /// Software timer intervals are specified in milliseconds and
    /// converted with this rate.
    const TICK_HZ: u32 = 1000;

    /// Configure and start the hardware tick source. The port's tick ISR
    /// must call [`timer::tick`] once per tick.
    ///
    /// # Safety
    ///
    /// Only meant to be called by [`Kernel::start`].
    unsafe fn timer_start();
}

/// The complete set of traits a kernel instantiation provides, plus access
/// to the kernel-global state. Implemented by [`build_kernel!`]; not meant
/// to be implemented by hand.
pub trait KernelTraits: PortThreading + PortTimer {
    /// The fixed symbol through which every kernel service and every
    /// interrupt entry point reaches this instantiation's state.
    fn state() -> &'static KernelState<Self>;
}

/// The kernel-global state of one kernel instantiation.
///
/// All fields are interior-mutable behind the CPU Lock; the value itself
/// lives in a `static` generated by [`build_kernel!`].
pub struct KernelState<Traits: KernelTraits> {
    pub(crate) sched: sched::Scheduler<Traits>,
    pub(crate) timers: timer::TimerScheduler<Traits>,
    pub(crate) callouts: kernel::Callouts<Traits>,

    /// The panic callout. Kept outside the CPU Lock cells because the
    /// panic path may already own the token.
    pub(crate) panic_handler: RawCell<Option<fn(PanicCode)>>,

    /// Set by [`kernel::bootstrap`]; read without the CPU Lock.
    pub(crate) started: core::sync::atomic::AtomicBool,

    pub(crate) kernel_initialized: klock::CpuLockCell<Traits, bool>,
    pub(crate) next_thread_id: klock::CpuLockCell<Traits, u8>,

    #[cfg(feature = "stack-check")]
    pub(crate) stack_guard_threshold: klock::CpuLockCell<Traits, usize>,
}

impl<Traits: KernelTraits> Init for KernelState<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        sched: Init::INIT,
        timers: Init::INIT,
        callouts: Init::INIT,
        panic_handler: RawCell::new(None),
        started: core::sync::atomic::AtomicBool::new(false),
        kernel_initialized: Init::INIT,
        next_thread_id: Init::INIT,
        #[cfg(feature = "stack-check")]
        stack_guard_threshold: klock::CpuLockCell::new(kernel::STACK_GUARD_DEFAULT),
    };
}

impl<Traits: KernelTraits> KernelState<Traits> {
    /// The value placed in the `static` generated by [`build_kernel!`].
    #[allow(clippy::declare_interior_mutable_const)]
    pub const INIT: Self = Init::INIT;
}

/// Materialize the kernel-global state for a port-defined `Traits` type
/// and wire it up through [`KernelTraits`].
#[macro_export]
macro_rules! build_kernel {
    ($Traits:ty) => {
        impl $crate::KernelTraits for $Traits {
            fn state() -> &'static $crate::KernelState<Self> {
                static STATE: $crate::KernelState<$Traits> = $crate::KernelState::INIT;
                &STATE
            }
        }
    };
}
