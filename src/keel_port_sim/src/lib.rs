//! Simulation port for the keel kernel
//!
//! Runs a kernel instantiation inside an ordinary host process with no
//! real interrupts and no real context switching: the kernel is driven as
//! a deterministic state machine.
//!
//!  - The critical section is a process-global flag (contended entries
//!    spin, so parallel test threads serialize instead of failing).
//!  - `pend_context_switch` latches a flag; pumping the port performs
//!    the publish step the real switch handler would, making the
//!    scheduler's chosen thread *current*.
//!  - The hardware tick is advanced explicitly with `advance_ticks`,
//!    which runs the kernel tick handler in a simulated interrupt
//!    context and services any resulting switch request.
//!
//! Because nothing ever really suspends, a blocking call issued on the
//! simulated current thread returns to the caller immediately after
//! recording the block; tests assert on the kernel state (thread states,
//! the current thread, counts) rather than on control flow. For the same
//! reason `Kernel::sleep` (which pends on a semaphore local to its own
//! stack frame) cannot be driven here; model a sleep as a timed pend on
//! a semaphore the test owns.
//!
//! ```ignore
//! struct Sys;
//! keel_port_sim::sim_kernel!(Sys);
//!
//! keel_port_sim::install_panic_handler::<Sys>();
//! Kernel::<Sys>::init();
//! /* init + start threads */
//! Sys::boot();
//! Sys::advance_ticks(50);
//! ```
use std::sync::atomic::AtomicUsize;

use keel_kernel::{utils::Init, KernelTraits, PanicCode};

/// Per-thread state kept for the simulated port: the would-be saved
/// stack-top pointer.
pub struct SimThreadState {
    pub stack_top: AtomicUsize,
}

impl Init for SimThreadState {
    const INIT: Self = Self {
        stack_top: AtomicUsize::new(0),
    };
}

/// Route kernel panics into ordinary Rust panics, so tests can observe
/// them with `#[should_panic]` or `catch_unwind`.
pub fn install_panic_handler<Traits: KernelTraits>() {
    fn handler(code: PanicCode) {
        panic!("kernel panic: {code:?}");
    }
    keel_kernel::Kernel::<Traits>::set_panic_handler(handler);
}

/// Implement the port traits for `$Traits`, materialize the kernel state
/// with `build_kernel!`, and attach the simulation helpers (`boot`,
/// `pump`, `advance_ticks`).
#[macro_export]
macro_rules! sim_kernel {
    ($Traits:ty) => {
        impl $Traits {
            fn cs_flag() -> &'static ::std::sync::atomic::AtomicBool {
                static FLAG: ::std::sync::atomic::AtomicBool =
                    ::std::sync::atomic::AtomicBool::new(false);
                &FLAG
            }

            fn swi_flag() -> &'static ::std::sync::atomic::AtomicBool {
                static FLAG: ::std::sync::atomic::AtomicBool =
                    ::std::sync::atomic::AtomicBool::new(false);
                &FLAG
            }

            fn irq_depth() -> &'static ::std::sync::atomic::AtomicUsize {
                static DEPTH: ::std::sync::atomic::AtomicUsize =
                    ::std::sync::atomic::AtomicUsize::new(0);
                &DEPTH
            }

            /// Mark the kernel started and make the scheduler's first
            /// choice current, the way `Kernel::start` would before
            /// dispatching.
            #[allow(dead_code)]
            pub fn boot() {
                // Safety: the simulation's one and only startup point
                unsafe { ::keel_kernel::kernel::bootstrap::<$Traits>() };
            }

            /// Service a pended context switch the way the port's switch
            /// handler would on interrupt exit.
            #[allow(dead_code)]
            pub fn pump() {
                use ::std::sync::atomic::Ordering;
                while Self::swi_flag().swap(false, Ordering::SeqCst) {
                    ::keel_kernel::sched::context_switch_completed::<$Traits>();
                }
            }

            /// Run `n` hardware ticks: each enters a simulated interrupt
            /// context, runs the kernel tick handler, and services any
            /// switch request on the way out.
            #[allow(dead_code)]
            pub fn advance_ticks(n: u32) {
                use ::std::sync::atomic::Ordering;
                for _ in 0..n {
                    Self::irq_depth().fetch_add(1, Ordering::SeqCst);
                    ::keel_kernel::timer::tick::<$Traits>();
                    Self::irq_depth().fetch_sub(1, Ordering::SeqCst);
                    Self::pump();
                }
            }
        }

        impl ::keel_kernel::PortThreading for $Traits {
            type PortThreadState = $crate::SimThreadState;

            unsafe fn init_stack(
                port_state: &Self::PortThreadState,
                stack_base: *mut usize,
                stack_words: usize,
                entry: fn(usize),
                arg: usize,
            ) {
                use ::std::sync::atomic::Ordering;
                // Write a synthetic two-word first frame: return target
                // and argument, the way a real port seeds the exception
                // return.
                let top = unsafe { stack_base.add(stack_words - 2) };
                unsafe {
                    top.write(entry as usize);
                    top.add(1).write(arg);
                }
                port_state.stack_top.store(top as usize, Ordering::SeqCst);
            }

            unsafe fn start_threads() -> ! {
                unreachable!("the simulation port dispatches through `boot`, not `start_threads`")
            }

            unsafe fn pend_context_switch() {
                use ::std::sync::atomic::Ordering;
                Self::swi_flag().store(true, Ordering::SeqCst);
            }

            unsafe fn try_enter_critical() -> bool {
                use ::std::sync::atomic::Ordering;
                // Contended entries spin: parallel test threads sharing
                // one kernel instantiation serialize on the flag.
                while Self::cs_flag()
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    ::std::thread::yield_now();
                }
                true
            }

            unsafe fn enter_critical() {
                unsafe {
                    let _ = Self::try_enter_critical();
                }
            }

            unsafe fn leave_critical() {
                use ::std::sync::atomic::Ordering;
                Self::cs_flag().store(false, Ordering::SeqCst);
            }

            fn is_critical_active() -> bool {
                use ::std::sync::atomic::Ordering;
                Self::cs_flag().load(Ordering::SeqCst)
            }

            fn is_interrupt_context() -> bool {
                use ::std::sync::atomic::Ordering;
                Self::irq_depth().load(Ordering::SeqCst) != 0
            }
        }

        impl ::keel_kernel::PortTimer for $Traits {
            unsafe fn timer_start() {}
        }

        ::keel_kernel::build_kernel!($Traits);
    };
}
