//! Thread lifecycle and scheduling basics.
use keel_kernel::{Kernel, Semaphore, ThreadState};

#[macro_use]
mod common;

#[test]
fn boot_selects_highest_priority() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(LOW: Sys, prio 1);
    spawn_thread!(HIGH: Sys, prio 2);
    Sys::boot();

    assert_current!(Sys, HIGH);
    assert_eq!(HIGH.state(), ThreadState::Ready);
    assert_eq!(LOW.state(), ThreadState::Ready);
}

// Two threads at priorities 1 and 2 plus the idle thread; each goes to
// sleep for 50 ms in turn (modelled as a timed pend on a semaphore nobody
// posts), and after 50 ticks both wake with the higher-priority one
// running first.
#[test]
fn sleepers_wake_by_priority() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(LOW: Sys, prio 1);
    spawn_thread!(HIGH: Sys, prio 2);
    static HIGH_SLEEP: Semaphore<Sys> = Semaphore::new();
    static LOW_SLEEP: Semaphore<Sys> = Semaphore::new();
    HIGH_SLEEP.init(0, 1);
    LOW_SLEEP.init(0, 1);
    Sys::boot();

    assert_current!(Sys, HIGH);
    let _ = HIGH_SLEEP.pend_timeout(50);
    Sys::pump();
    assert_current!(Sys, LOW);
    assert_eq!(HIGH.state(), ThreadState::Blocked);

    let _ = LOW_SLEEP.pend_timeout(50);
    Sys::pump();
    assert_current!(Sys, IDLE);
    assert_eq!(LOW.state(), ThreadState::Blocked);

    Sys::advance_ticks(49);
    assert_current!(Sys, IDLE);

    Sys::advance_ticks(1);
    assert_eq!(HIGH.state(), ThreadState::Ready);
    assert_eq!(LOW.state(), ThreadState::Ready);
    assert_current!(Sys, HIGH);
}

#[test]
fn yield_without_competition_keeps_current() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(ONLY: Sys, prio 3);
    Sys::boot();

    assert_current!(Sys, ONLY);
    Kernel::<Sys>::yield_now();
    Sys::pump();
    assert_current!(Sys, ONLY);
}

#[test]
fn stop_and_restart() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WORKER: Sys, prio 1);
    Sys::boot();

    assert_current!(Sys, WORKER);
    WORKER.stop();
    Sys::pump();
    assert_eq!(WORKER.state(), ThreadState::Stop);
    assert_current!(Sys, IDLE);

    WORKER.start();
    Sys::pump();
    assert_eq!(WORKER.state(), ThreadState::Ready);
    assert_current!(Sys, WORKER);
}

#[test]
fn exit_forfeits_priority() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WORKER: Sys, prio 5);
    Sys::boot();

    assert_current!(Sys, WORKER);
    WORKER.exit();
    Sys::pump();
    assert_eq!(WORKER.state(), ThreadState::Exit);
    assert_eq!(WORKER.priority(), 0);
    assert_eq!(WORKER.current_priority(), 0);
    assert_current!(Sys, IDLE);
}

#[test]
fn set_priority_reschedules() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(A: Sys, prio 1);
    spawn_thread!(B: Sys, prio 2);
    Sys::boot();

    assert_current!(Sys, B);
    // Dropping below A hands the processor over.
    B.set_priority(1);
    Sys::pump();
    assert_current!(Sys, A);
    assert_eq!(B.priority(), 1);

    // Raising B above A takes it back.
    B.set_priority(3);
    Sys::pump();
    assert_current!(Sys, B);
}

#[test]
fn thread_ids_and_names() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WORKER: Sys, prio 1);
    Sys::boot();

    assert_ne!(IDLE.id(), WORKER.id());
    assert_eq!(WORKER.name(), None);
    WORKER.set_name("worker");
    assert_eq!(WORKER.name(), Some("worker"));
}

#[test]
fn stack_slack_reports_untouched_depth() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WORKER: Sys, prio 1);
    Sys::boot();

    // The simulated port seeds a two-word frame at the top; everything
    // below it still carries the fill pattern.
    let word = core::mem::size_of::<usize>();
    let slack = WORKER.stack_slack();
    assert!(slack >= 58 * word, "slack {slack} too small");
    assert!(slack <= 62 * word, "slack {slack} too large");
}

#[test]
#[should_panic(expected = "NoReadyThreads")]
fn empty_ready_set_panics() {
    kernel_fixture!(Sys);
    // No idle thread: choosing the first thread must panic.
    Sys::boot();
}
