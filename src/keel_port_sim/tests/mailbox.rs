//! Mailbox envelope delivery.
use keel_kernel::{Mailbox, ThreadState};

#[macro_use]
mod common;

fn leak_buffer(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}

#[test]
fn envelopes_survive_the_ring() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WORKER: Sys, prio 1);
    static MBOX: Mailbox<Sys> = Mailbox::new();
    MBOX.init(leak_buffer(64), 16);
    Sys::boot();

    let mut env = [0u8; 16];
    env[0] = 0xA5;
    env[15] = 0x5A;
    assert!(MBOX.send(&env));
    assert_eq!(MBOX.free_slots(), 3);

    let mut out = [0u8; 16];
    assert!(MBOX.receive(&mut out));
    assert_eq!(out, env);
    assert!(MBOX.is_empty());
}

// The ring is double-ended: the head side behaves as a stack, the tail
// side drains oldest-first.
#[test]
fn head_and_tail_deliveries() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WORKER: Sys, prio 1);
    static MBOX: Mailbox<Sys> = Mailbox::new();
    MBOX.init(leak_buffer(16), 4);
    Sys::boot();

    for value in 1u8..=3 {
        assert!(MBOX.send(&[value, 0, 0, 0]));
    }

    let mut out = [0u8; 4];
    assert!(MBOX.receive_from_tail(&mut out));
    assert_eq!(out[0], 1);
    assert!(MBOX.receive(&mut out));
    assert_eq!(out[0], 3);
    assert!(MBOX.receive_from_tail(&mut out));
    assert_eq!(out[0], 2);
    assert!(MBOX.is_empty());
}

// Capacity-4 mailbox: four sends succeed, the fifth with a 100 ms
// timeout fails after 100 ms, and freeing one slot lets a retry through.
#[test]
fn full_mailbox_times_out_then_recovers() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WORKER: Sys, prio 1);
    static MBOX: Mailbox<Sys> = Mailbox::new();
    MBOX.init(leak_buffer(64), 16);
    Sys::boot();

    let env = [7u8; 16];
    for _ in 0..4 {
        assert!(MBOX.send(&env));
    }
    assert!(MBOX.is_full());

    // The fifth delivery parks the worker on the send semaphore.
    assert!(!MBOX.send_timeout(&env, 100));
    Sys::pump();
    assert_eq!(WORKER.state(), ThreadState::Blocked);
    assert_current!(Sys, IDLE);

    Sys::advance_ticks(100);
    assert_eq!(WORKER.state(), ThreadState::Ready);
    assert!(WORKER.expired());
    Sys::pump();
    assert_current!(Sys, WORKER);

    // One receive makes room; a retried send goes through immediately.
    let mut out = [0u8; 16];
    assert!(MBOX.receive(&mut out));
    assert!(MBOX.send_timeout(&env, 100));
    assert!(MBOX.is_full());
}

#[test]
fn receive_timeout_on_empty_mailbox() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WORKER: Sys, prio 1);
    static MBOX: Mailbox<Sys> = Mailbox::new();
    MBOX.init(leak_buffer(32), 8);
    Sys::boot();

    let mut out = [0u8; 8];
    // The receive parks the worker on the delivery semaphore.
    assert!(!MBOX.receive_timeout(&mut out, 10));
    Sys::pump();
    assert_eq!(WORKER.state(), ThreadState::Blocked);

    Sys::advance_ticks(10);
    assert_eq!(WORKER.state(), ThreadState::Ready);
    assert!(WORKER.expired());
}

#[test]
#[should_panic(expected = "ActiveMailboxDescoped")]
fn descoping_a_nonempty_mailbox_panics() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WORKER: Sys, prio 1);
    Sys::boot();

    let mbox = Mailbox::<Sys>::new();
    mbox.init(leak_buffer(16), 4);
    assert!(mbox.send(&[1, 2, 3, 4]));
    // `mbox` goes out of scope still holding an envelope.
}
