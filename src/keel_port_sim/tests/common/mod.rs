//! Shared scaffolding for the kernel scenario tests.
//!
//! Every test declares its own kernel instantiation so tests stay
//! isolated when the harness runs them in parallel.
#![allow(unused_macros)]

/// Declare a kernel instantiation, install the panic hook and run
/// `Kernel::init`.
macro_rules! kernel_fixture {
    ($Sys:ident) => {
        struct $Sys;
        keel_port_sim::sim_kernel!($Sys);
        keel_port_sim::install_panic_handler::<$Sys>();
        keel_kernel::Kernel::<$Sys>::init();
    };
}

/// Declare, initialize and start a static thread.
macro_rules! spawn_thread {
    ($name:ident : $Sys:ty, prio $prio:expr) => {
        static $name: keel_kernel::Thread<$Sys> = keel_kernel::Thread::new();
        {
            static STACK: keel_kernel::Stack<64> = keel_kernel::Stack::new();
            fn entry(_: usize) {}
            $name.init(&STACK, $prio, entry, 0);
            $name.start();
        }
    };
}

/// Pointer-compare the running thread.
macro_rules! assert_current {
    ($Sys:ty, $thread:expr) => {
        assert!(
            ::core::ptr::eq(
                keel_kernel::Kernel::<$Sys>::current_thread().unwrap(),
                &$thread,
            ),
            "unexpected current thread",
        );
    };
}
