//! A minimal port for in-crate unit tests.
//!
//! The critical section is a spinning flag (unit tests of different
//! `Traits` types run in parallel threads; tests sharing one `Traits`
//! serialize on it), the software interrupt is a flag serviced by
//! `pump`, and nothing ever actually dispatches.
use core::sync::atomic::AtomicUsize;

use crate::utils::Init;

pub struct TestThreadState {
    pub stack_top: AtomicUsize,
}

impl Init for TestThreadState {
    const INIT: Self = Self {
        stack_top: AtomicUsize::new(0),
    };
}

/// Implement the port traits for a test-local `Traits` type.
#[macro_export]
macro_rules! sim_port_for_tests {
    ($Traits:ty) => {
        impl $Traits {
            fn cs_flag() -> &'static ::std::sync::atomic::AtomicBool {
                static FLAG: ::std::sync::atomic::AtomicBool =
                    ::std::sync::atomic::AtomicBool::new(false);
                &FLAG
            }

            #[allow(dead_code)]
            fn swi_flag() -> &'static ::std::sync::atomic::AtomicBool {
                static FLAG: ::std::sync::atomic::AtomicBool =
                    ::std::sync::atomic::AtomicBool::new(false);
                &FLAG
            }

            /// Service a pended context switch the way the port's SWI
            /// handler would.
            #[allow(dead_code)]
            pub fn pump() {
                use ::std::sync::atomic::Ordering;
                while Self::swi_flag().swap(false, Ordering::SeqCst) {
                    $crate::sched::context_switch_completed::<$Traits>();
                }
            }
        }

        impl $crate::PortThreading for $Traits {
            type PortThreadState = $crate::test_port::TestThreadState;

            unsafe fn init_stack(
                port_state: &Self::PortThreadState,
                stack_base: *mut usize,
                stack_words: usize,
                _entry: fn(usize),
                _arg: usize,
            ) {
                use ::std::sync::atomic::Ordering;
                // Pretend a two-word exception frame was pushed.
                let top = unsafe { stack_base.add(stack_words - 2) };
                unsafe {
                    top.write(0);
                    top.add(1).write(0);
                }
                port_state.stack_top.store(top as usize, Ordering::SeqCst);
            }

            unsafe fn start_threads() -> ! {
                unreachable!("the test port never dispatches")
            }

            unsafe fn pend_context_switch() {
                use ::std::sync::atomic::Ordering;
                Self::swi_flag().store(true, Ordering::SeqCst);
            }

            unsafe fn try_enter_critical() -> bool {
                use ::std::sync::atomic::Ordering;
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
                false
            }
        }

        impl $crate::PortTimer for $Traits {
            unsafe fn timer_start() {}
        }
    };
}
