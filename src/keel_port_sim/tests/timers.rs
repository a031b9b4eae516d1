//! Software timer behaviour.
use std::sync::atomic::{AtomicU32, Ordering};

use keel_kernel::{CallbackData, Thread, Timer};

#[macro_use]
mod common;

fn count_up<Traits: keel_kernel::KernelTraits>(
    _owner: Option<&'static Thread<Traits>>,
    data: CallbackData,
) {
    // Safety: every test passes a pointer to its own counter
    let counter = unsafe { &*(data.get() as *const AtomicU32) };
    counter.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn one_shot_fires_exactly_once() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    static TIMER: Timer<Sys> = Timer::new();
    static FIRED: AtomicU32 = AtomicU32::new(0);
    Sys::boot();

    TIMER.init();
    TIMER.start(
        false,
        5,
        count_up::<Sys>,
        CallbackData::new(&FIRED as *const _ as *mut ()),
    );

    Sys::advance_ticks(4);
    assert_eq!(FIRED.load(Ordering::SeqCst), 0);
    assert!(!TIMER.expired());

    Sys::advance_ticks(1);
    assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    assert!(TIMER.expired());

    Sys::advance_ticks(20);
    assert_eq!(FIRED.load(Ordering::SeqCst), 1);
}

#[test]
fn zero_interval_fires_on_the_next_tick() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    static TIMER: Timer<Sys> = Timer::new();
    static FIRED: AtomicU32 = AtomicU32::new(0);
    Sys::boot();

    TIMER.init();
    TIMER.start(
        false,
        0,
        count_up::<Sys>,
        CallbackData::new(&FIRED as *const _ as *mut ()),
    );

    Sys::advance_ticks(1);
    assert_eq!(FIRED.load(Ordering::SeqCst), 1);
}

#[test]
fn stopping_an_inactive_timer_is_a_no_op() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    static TIMER: Timer<Sys> = Timer::new();
    Sys::boot();

    TIMER.init();
    TIMER.stop();
    TIMER.stop();
}

#[test]
fn periodic_timer_reloads() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    static TIMER: Timer<Sys> = Timer::new();
    static FIRED: AtomicU32 = AtomicU32::new(0);
    Sys::boot();

    TIMER.init();
    TIMER.start(
        true,
        3,
        count_up::<Sys>,
        CallbackData::new(&FIRED as *const _ as *mut ()),
    );

    Sys::advance_ticks(9);
    assert_eq!(FIRED.load(Ordering::SeqCst), 3);

    TIMER.stop();
    Sys::advance_ticks(9);
    assert_eq!(FIRED.load(Ordering::SeqCst), 3);
}

#[test]
fn expired_one_shot_can_be_restarted_as_configured() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    static TIMER: Timer<Sys> = Timer::new();
    static FIRED: AtomicU32 = AtomicU32::new(0);
    Sys::boot();

    TIMER.init();
    TIMER.start(
        false,
        2,
        count_up::<Sys>,
        CallbackData::new(&FIRED as *const _ as *mut ()),
    );
    Sys::advance_ticks(2);
    assert_eq!(FIRED.load(Ordering::SeqCst), 1);

    TIMER.start_configured();
    assert!(!TIMER.expired());
    Sys::advance_ticks(2);
    assert_eq!(FIRED.load(Ordering::SeqCst), 2);
}

// A timer granted tolerance coalesces with a neighbouring expiry: both
// fire on the same tick, the latter no earlier than its nominal time.
#[test]
fn tolerance_coalesces_expiries() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    static ANCHOR: Timer<Sys> = Timer::new();
    static LAZY: Timer<Sys> = Timer::new();
    static FIRED: AtomicU32 = AtomicU32::new(0);
    Sys::boot();

    ANCHOR.init();
    LAZY.init();
    ANCHOR.start(
        false,
        10,
        count_up::<Sys>,
        CallbackData::new(&FIRED as *const _ as *mut ()),
    );
    LAZY.start_with_tolerance(
        false,
        8,
        3,
        count_up::<Sys>,
        CallbackData::new(&FIRED as *const _ as *mut ()),
    );

    // Nominal tick 8 passes silently: the expiry was deferred onto the
    // anchor's.
    Sys::advance_ticks(9);
    assert_eq!(FIRED.load(Ordering::SeqCst), 0);

    Sys::advance_ticks(1);
    assert_eq!(FIRED.load(Ordering::SeqCst), 2);
}
