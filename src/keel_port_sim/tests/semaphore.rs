//! Semaphore behaviour.
use keel_kernel::{Semaphore, ThreadState, Timer};

#[macro_use]
mod common;

#[test]
fn post_pend_round_trip_leaves_count_zero() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WORKER: Sys, prio 1);
    static SEM: Semaphore<Sys> = Semaphore::new();
    SEM.init(0, 1);
    Sys::boot();

    SEM.post();
    assert_eq!(SEM.count(), 1);
    SEM.pend();
    assert_eq!(SEM.count(), 0);
    // No block happened: the worker is still running.
    assert_current!(Sys, WORKER);
}

#[test]
fn post_past_maximum_clamps() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WORKER: Sys, prio 1);
    static SEM: Semaphore<Sys> = Semaphore::new();
    SEM.init(2, 2);
    Sys::boot();

    SEM.post();
    assert_eq!(SEM.count(), 2);
}

#[test]
fn waiters_are_woken_in_priority_order() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(LOW: Sys, prio 1);
    spawn_thread!(HIGH: Sys, prio 2);
    static SEM: Semaphore<Sys> = Semaphore::new();
    SEM.init(0, 2);
    Sys::boot();

    // Both threads block, highest priority first.
    assert_current!(Sys, HIGH);
    SEM.pend();
    Sys::pump();
    assert_current!(Sys, LOW);
    SEM.pend();
    Sys::pump();
    assert_current!(Sys, IDLE);
    assert_eq!(HIGH.state(), ThreadState::Blocked);
    assert_eq!(LOW.state(), ThreadState::Blocked);

    // A post is handed to the highest-priority waiter, not the count.
    SEM.post();
    Sys::pump();
    assert_eq!(SEM.count(), 0);
    assert_eq!(HIGH.state(), ThreadState::Ready);
    assert_eq!(LOW.state(), ThreadState::Blocked);
    assert_current!(Sys, HIGH);
}

#[test]
fn pend_timeout_expires() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WORKER: Sys, prio 1);
    static SEM: Semaphore<Sys> = Semaphore::new();
    SEM.init(0, 1);
    Sys::boot();

    let _ = SEM.pend_timeout(10);
    Sys::pump();
    assert_current!(Sys, IDLE);
    assert_eq!(WORKER.state(), ThreadState::Blocked);

    Sys::advance_ticks(9);
    assert_eq!(WORKER.state(), ThreadState::Blocked);

    Sys::advance_ticks(1);
    assert_eq!(WORKER.state(), ThreadState::Ready);
    assert!(WORKER.expired());
    assert_current!(Sys, WORKER);
    assert_eq!(SEM.count(), 0);
}

#[test]
fn post_beats_timeout() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WORKER: Sys, prio 1);
    static SEM: Semaphore<Sys> = Semaphore::new();
    SEM.init(0, 1);
    Sys::boot();

    let _ = SEM.pend_timeout(10);
    Sys::pump();
    assert_current!(Sys, IDLE);

    Sys::advance_ticks(5);
    SEM.post();
    Sys::pump();
    assert_eq!(WORKER.state(), ThreadState::Ready);
    assert!(!WORKER.expired());
    assert_current!(Sys, WORKER);

    // The stale timeout fires into nothing: the wait already concluded.
    Sys::advance_ticks(10);
    assert!(!WORKER.expired());
    assert_eq!(WORKER.state(), ThreadState::Ready);
}

#[test]
fn interrupt_context_post_wakes_a_waiter() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WORKER: Sys, prio 1);
    static SEM: Semaphore<Sys> = Semaphore::new();
    static TICKER: Timer<Sys> = Timer::new();
    SEM.init(0, 1);
    Sys::boot();

    fn post_from_isr(_owner: Option<&'static keel_kernel::Thread<Sys>>, _data: keel_kernel::CallbackData) {
        SEM.post();
    }

    TICKER.init();
    TICKER.start(false, 3, post_from_isr, keel_kernel::CallbackData::null());

    SEM.pend();
    Sys::pump();
    assert_current!(Sys, IDLE);
    assert_eq!(WORKER.state(), ThreadState::Blocked);

    Sys::advance_ticks(3);
    assert_eq!(WORKER.state(), ThreadState::Ready);
    assert_current!(Sys, WORKER);
    assert!(TICKER.expired());
}

#[test]
#[should_panic(expected = "ActiveSemaphoreDescoped")]
fn descoping_a_waited_semaphore_panics() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WORKER: Sys, prio 1);
    Sys::boot();

    let sem = Semaphore::<Sys>::new();
    sem.init(0, 1);
    sem.pend();
    // `sem` goes out of scope with the worker still queued on it.
}
