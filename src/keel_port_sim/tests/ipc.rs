//! Message queues, notifications, condition variables and
//! reader-writer locks.
use keel_kernel::{
    CallbackData, CondVar, Message, MessagePool, MessageQueue, Mutex, Notify, RwLock, ThreadState,
};

#[macro_use]
mod common;

#[test]
fn message_queue_is_fifo_and_pool_backed() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WORKER: Sys, prio 1);
    static POOL: MessagePool<Sys> = MessagePool::new();
    static QUEUE: MessageQueue<Sys> = MessageQueue::new();
    static MSG_A: Message<Sys> = Message::new();
    static MSG_B: Message<Sys> = Message::new();
    QUEUE.init();
    Sys::boot();

    POOL.push(&MSG_A);
    POOL.push(&MSG_B);

    let first = POOL.pop().unwrap();
    first.set_code(0x10);
    first.set_data(CallbackData::null());
    QUEUE.send(first);

    let second = POOL.pop().unwrap();
    second.set_code(0x20);
    QUEUE.send(second);

    assert!(POOL.pop().is_none());

    let received = QUEUE.receive().unwrap();
    assert_eq!(received.code(), 0x10);
    POOL.push(received);

    let received = QUEUE.receive().unwrap();
    assert_eq!(received.code(), 0x20);
    POOL.push(received);

    assert!(POOL.pop().is_some());
}

#[test]
fn message_receive_timeout_expires() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WORKER: Sys, prio 1);
    static QUEUE: MessageQueue<Sys> = MessageQueue::new();
    QUEUE.init();
    Sys::boot();

    assert!(QUEUE.receive_timeout(5).is_none());
    Sys::pump();
    assert_eq!(WORKER.state(), ThreadState::Blocked);

    Sys::advance_ticks(5);
    assert_eq!(WORKER.state(), ThreadState::Ready);
    assert!(WORKER.expired());
}

#[test]
fn notify_pending_satisfies_next_wait() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WORKER: Sys, prio 1);
    static NOTIFY: Notify<Sys> = Notify::new();
    NOTIFY.init();
    Sys::boot();

    // No waiters: the signal is latched.
    NOTIFY.signal();
    assert!(NOTIFY.wait());
    assert_current!(Sys, WORKER);

    // The latch was consumed: the next wait blocks.
    assert!(!NOTIFY.wait());
    Sys::pump();
    assert_eq!(WORKER.state(), ThreadState::Blocked);
    assert_current!(Sys, IDLE);

    NOTIFY.signal();
    Sys::pump();
    assert_eq!(WORKER.state(), ThreadState::Ready);
    assert_current!(Sys, WORKER);
}

#[test]
fn notify_signal_wakes_every_waiter() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(LOW: Sys, prio 1);
    spawn_thread!(HIGH: Sys, prio 2);
    static NOTIFY: Notify<Sys> = Notify::new();
    NOTIFY.init();
    Sys::boot();

    NOTIFY.wait();
    Sys::pump();
    NOTIFY.wait();
    Sys::pump();
    assert_current!(Sys, IDLE);
    assert_eq!(HIGH.state(), ThreadState::Blocked);
    assert_eq!(LOW.state(), ThreadState::Blocked);

    NOTIFY.signal();
    Sys::pump();
    assert_eq!(HIGH.state(), ThreadState::Ready);
    assert_eq!(LOW.state(), ThreadState::Ready);
    assert_current!(Sys, HIGH);
}

#[test]
fn condvar_wait_releases_the_mutex() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WAITER: Sys, prio 1);
    static MUTEX: Mutex<Sys> = Mutex::new();
    static COND: CondVar<Sys> = CondVar::new();
    MUTEX.init();
    COND.init();
    Sys::boot();

    MUTEX.claim();
    COND.wait(&MUTEX);
    Sys::pump();
    assert_eq!(WAITER.state(), ThreadState::Blocked);
    assert!(!MUTEX.is_held());
    assert_current!(Sys, IDLE);

    COND.signal();
    Sys::pump();
    assert_eq!(WAITER.state(), ThreadState::Ready);
    assert_current!(Sys, WAITER);
}

#[test]
fn condvar_wait_timeout_expires() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WAITER: Sys, prio 1);
    static MUTEX: Mutex<Sys> = Mutex::new();
    static COND: CondVar<Sys> = CondVar::new();
    MUTEX.init();
    COND.init();
    Sys::boot();

    MUTEX.claim();
    let _ = COND.wait_timeout(&MUTEX, 8);
    Sys::pump();
    assert_eq!(WAITER.state(), ThreadState::Blocked);

    Sys::advance_ticks(8);
    assert_eq!(WAITER.state(), ThreadState::Ready);
    assert!(WAITER.expired());
}

#[test]
fn rwlock_writer_release_admits_readers() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(READER: Sys, prio 1);
    spawn_thread!(WRITER: Sys, prio 2);
    static LOCK: RwLock<Sys> = RwLock::new();
    LOCK.init();
    Sys::boot();

    // The writer takes the lock, then parks itself.
    assert_current!(Sys, WRITER);
    LOCK.acquire_writer();
    assert!(LOCK.is_writer_held());
    WRITER.stop();
    Sys::pump();
    assert_current!(Sys, READER);

    // The reader queues behind the held write lock.
    LOCK.acquire_reader();
    Sys::pump();
    assert_eq!(READER.state(), ThreadState::Blocked);
    assert_current!(Sys, IDLE);

    // Releasing the write side admits the queued reader and counts it in.
    LOCK.release_writer();
    Sys::pump();
    assert!(!LOCK.is_writer_held());
    assert_eq!(LOCK.reader_count(), 1);
    assert_eq!(READER.state(), ThreadState::Ready);
    assert_current!(Sys, READER);

    LOCK.release_reader();
    assert_eq!(LOCK.reader_count(), 0);
}

#[test]
fn rwlock_last_reader_hands_off_to_writer() {
    kernel_fixture!(Sys);
    spawn_thread!(IDLE: Sys, prio 0);
    spawn_thread!(WRITER: Sys, prio 1);
    spawn_thread!(READER: Sys, prio 2);
    static LOCK: RwLock<Sys> = RwLock::new();
    LOCK.init();
    Sys::boot();

    // The reader takes shared access twice, then the writer queues.
    assert_current!(Sys, READER);
    LOCK.acquire_reader();
    LOCK.acquire_reader();
    assert_eq!(LOCK.reader_count(), 2);
    READER.stop();
    Sys::pump();
    assert_current!(Sys, WRITER);

    LOCK.acquire_writer();
    Sys::pump();
    assert_eq!(WRITER.state(), ThreadState::Blocked);
    assert_current!(Sys, IDLE);

    // A new reader defers to the queued writer.
    READER.start();
    Sys::pump();
    assert_current!(Sys, READER);
    LOCK.acquire_reader();
    Sys::pump();
    assert_eq!(READER.state(), ThreadState::Blocked);
    assert_current!(Sys, IDLE);

    // Draining the shared side hands the lock to the writer.
    LOCK.release_reader();
    assert_eq!(LOCK.reader_count(), 1);
    LOCK.release_reader();
    Sys::pump();
    assert!(LOCK.is_writer_held());
    assert_eq!(WRITER.state(), ThreadState::Ready);
    assert_current!(Sys, WRITER);
}
