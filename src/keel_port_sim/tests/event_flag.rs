//! Event flag group behaviour.
use keel_kernel::{EventFlag, EventFlagMode, ThreadState};

#[macro_use]
mod common;

// A thread waits on (0xAAAA, AnySet). Setting 0x0005 leaves it blocked;
// setting 0x0002 wakes it with matched bits 0x0002, and the flag field
// reads 0x0007 afterwards.
#[test]
fn any_set_wakes_on_first_overlap() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WAITER: Sys, prio 1);
    static FLAG: EventFlag<Sys> = EventFlag::new();
    FLAG.init();
    Sys::boot();

    assert_current!(Sys, WAITER);
    FLAG.wait(0xAAAA, EventFlagMode::AnySet);
    Sys::pump();
    assert_current!(Sys, IDLE);
    assert_eq!(WAITER.state(), ThreadState::Blocked);

    FLAG.set(0x0005);
    Sys::pump();
    assert_eq!(WAITER.state(), ThreadState::Blocked);

    FLAG.set(0x0002);
    Sys::pump();
    assert_eq!(WAITER.state(), ThreadState::Ready);
    assert_eq!(WAITER.event_mask(), 0x0002);
    assert_eq!(FLAG.get_mask(), 0x0007);
    assert_current!(Sys, WAITER);
}

// A thread waits on (0x03C0, AllClear). Setting exactly those bits wakes
// it with the full mask, which is consumed from the flag field.
#[test]
fn all_clear_consumes_matched_bits() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WAITER: Sys, prio 1);
    static FLAG: EventFlag<Sys> = EventFlag::new();
    FLAG.init();
    Sys::boot();

    FLAG.wait(0x03C0, EventFlagMode::AllClear);
    Sys::pump();
    assert_eq!(WAITER.state(), ThreadState::Blocked);

    FLAG.set(0x03C0);
    Sys::pump();
    assert_eq!(WAITER.state(), ThreadState::Ready);
    assert_eq!(WAITER.event_mask(), 0x03C0);
    assert_eq!(FLAG.get_mask(), 0);
}

#[test]
fn all_set_requires_every_bit() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WAITER: Sys, prio 1);
    static FLAG: EventFlag<Sys> = EventFlag::new();
    FLAG.init();
    Sys::boot();

    FLAG.wait(0x0030, EventFlagMode::AllSet);
    Sys::pump();

    FLAG.set(0x0010);
    Sys::pump();
    assert_eq!(WAITER.state(), ThreadState::Blocked);

    FLAG.set(0x0020);
    Sys::pump();
    assert_eq!(WAITER.state(), ThreadState::Ready);
    assert_eq!(WAITER.event_mask(), 0x0030);
    // AllSet does not consume.
    assert_eq!(FLAG.get_mask(), 0x0030);
}

#[test]
fn immediate_match_does_not_block() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WAITER: Sys, prio 1);
    static FLAG: EventFlag<Sys> = EventFlag::new();
    FLAG.init();
    Sys::boot();

    FLAG.set(0x00F0);
    let matched = FLAG.wait(0x0010, EventFlagMode::AnyClear);
    assert_eq!(matched, 0x0010);
    assert_eq!(FLAG.get_mask(), 0x00E0);
    assert_current!(Sys, WAITER);
}

// Waiting for "all of nothing" is satisfied trivially.
#[test]
fn empty_mask_returns_immediately() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WAITER: Sys, prio 1);
    static FLAG: EventFlag<Sys> = EventFlag::new();
    FLAG.init();
    Sys::boot();

    let matched = FLAG.wait(0, EventFlagMode::AllSet);
    assert_eq!(matched, 0);
    assert_current!(Sys, WAITER);
}

#[test]
fn set_then_clear_is_a_no_op_on_the_mask() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WAITER: Sys, prio 1);
    static FLAG: EventFlag<Sys> = EventFlag::new();
    FLAG.init();
    Sys::boot();

    FLAG.set(0x1234);
    FLAG.clear(0x1234);
    assert_eq!(FLAG.get_mask(), 0);
}

#[test]
fn wait_timeout_returns_zero_match() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WAITER: Sys, prio 1);
    static FLAG: EventFlag<Sys> = EventFlag::new();
    FLAG.init();
    Sys::boot();

    FLAG.wait_timeout(0x000F, EventFlagMode::AnySet, 10);
    Sys::pump();
    assert_eq!(WAITER.state(), ThreadState::Blocked);

    Sys::advance_ticks(10);
    assert_eq!(WAITER.state(), ThreadState::Ready);
    assert!(WAITER.expired());
    assert_eq!(WAITER.event_mask(), 0);
    assert_eq!(FLAG.get_mask(), 0);
}

// Two waiters with different conditions; one set call wakes both inside
// one critical section, with clears accumulated before anyone runs.
#[test]
fn one_set_wakes_every_satisfied_waiter() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(LOW: Sys, prio 1);
    spawn_thread!(HIGH: Sys, prio 2);
    static FLAG: EventFlag<Sys> = EventFlag::new();
    FLAG.init();
    Sys::boot();

    assert_current!(Sys, HIGH);
    FLAG.wait(0x0001, EventFlagMode::AnyClear);
    Sys::pump();
    assert_current!(Sys, LOW);
    FLAG.wait(0x0003, EventFlagMode::AnySet);
    Sys::pump();
    assert_current!(Sys, IDLE);

    FLAG.set(0x0003);
    Sys::pump();
    assert_eq!(HIGH.state(), ThreadState::Ready);
    assert_eq!(LOW.state(), ThreadState::Ready);
    assert_eq!(HIGH.event_mask(), 0x0001);
    // The later waiter was evaluated against the pre-clear flag field.
    assert_eq!(LOW.event_mask(), 0x0003);
    assert_eq!(FLAG.get_mask(), 0x0002);
    assert_current!(Sys, HIGH);
}
