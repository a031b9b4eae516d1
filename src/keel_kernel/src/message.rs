//! Messages, message queues and message pools
//!
//! A [`Message`] is a 16-bit code plus an opaque data pointer, usable as
//! a list node. Ownership of a message travels with its reference: a
//! sender takes it from a [`MessagePool`], the receiver is responsible
//! for returning it there.
use core::fmt;

use crate::{
    klock::{lock_cpu, CpuLockCell},
    list::{DoubleList, Link, ListNode},
    semaphore::Semaphore,
    timer::CallbackData,
    utils::Init,
    KernelTraits,
};

pub struct Message<Traits: KernelTraits> {
    link: Link<Traits, Self>,
    code: CpuLockCell<Traits, u16>,
    data: CpuLockCell<Traits, CallbackData>,
}

impl<Traits: KernelTraits> ListNode<Traits> for Message<Traits> {
    fn link(&self) -> &Link<Traits, Self> {
        &self.link
    }
}

impl<Traits: KernelTraits> Init for Message<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> fmt::Debug for Message<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Message")
            .field("self", &(self as *const _))
            .field("code", &self.code)
            .field("data", &self.data)
            .finish()
    }
}

impl<Traits: KernelTraits> Message<Traits> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            link: Init::INIT,
            code: Init::INIT,
            data: Init::INIT,
        }
    }

    pub fn set_code(&self, code: u16) {
        let mut guard = lock_cpu::<Traits>().expect("message access inside a critical section");
        let mut lock = guard.borrow_mut();
        self.code.replace(&mut *lock, code);
    }

    pub fn code(&self) -> u16 {
        let mut guard = lock_cpu::<Traits>().expect("message access inside a critical section");
        let lock = guard.borrow_mut();
        self.code.get(&*lock)
    }

    pub fn set_data(&self, data: CallbackData) {
        let mut guard = lock_cpu::<Traits>().expect("message access inside a critical section");
        let mut lock = guard.borrow_mut();
        self.data.replace(&mut *lock, data);
    }

    pub fn data(&self) -> CallbackData {
        let mut guard = lock_cpu::<Traits>().expect("message access inside a critical section");
        let lock = guard.borrow_mut();
        self.data.get(&*lock)
    }
}

/// A FIFO of messages with blocking receive.
pub struct MessageQueue<Traits: KernelTraits> {
    queue: DoubleList<Traits, Message<Traits>>,
    sem: Semaphore<Traits>,
    initialized: CpuLockCell<Traits, bool>,
}

impl<Traits: KernelTraits> Init for MessageQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> MessageQueue<Traits> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            queue: Init::INIT,
            sem: Semaphore::new(),
            initialized: Init::INIT,
        }
    }

    pub fn init(&self) {
        self.sem.init(0, u16::MAX);
        let mut guard = lock_cpu::<Traits>().expect("queue init inside a critical section");
        let mut lock = guard.borrow_mut();
        self.initialized.replace(&mut *lock, true);
    }

    /// Enqueue `message`, transferring its ownership to the receiver.
    /// ISR-safe.
    pub fn send(&self, message: &'static Message<Traits>) {
        {
            let mut guard = lock_cpu::<Traits>().expect("send inside a critical section");
            let lock = &mut guard.borrow_mut();
            debug_assert!(self.initialized.get(&**lock), "queue used before init");
            self.queue.push_back(lock, message);
        }
        self.sem.post();
    }

    /// Dequeue the oldest message, blocking until one arrives.
    pub fn receive(&self) -> Option<&'static Message<Traits>> {
        self.sem.pend();
        self.pop()
    }

    /// Timed variant of [`MessageQueue::receive`]; `None` if the timeout
    /// fires first. A zero timeout waits forever.
    pub fn receive_timeout(&self, timeout_ms: u32) -> Option<&'static Message<Traits>> {
        if self.sem.pend_timeout(timeout_ms).is_err() {
            return None;
        }
        self.pop()
    }

    fn pop(&self) -> Option<&'static Message<Traits>> {
        let mut guard = lock_cpu::<Traits>().expect("receive inside a critical section");
        let lock = &mut guard.borrow_mut();
        let head = self.queue.head(lock)?;
        // Safety: queued messages are `&'static`, owned by the caller
        // from here on
        let message = unsafe { head.as_ref() };
        self.queue.remove(lock, message);
        Some(message)
    }
}

/// A free list of pre-allocated messages.
pub struct MessagePool<Traits: KernelTraits> {
    pool: DoubleList<Traits, Message<Traits>>,
}

impl<Traits: KernelTraits> Init for MessagePool<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> MessagePool<Traits> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self { pool: Init::INIT }
    }

    /// Return (or seed) a message into the pool.
    pub fn push(&self, message: &'static Message<Traits>) {
        let mut guard = lock_cpu::<Traits>().expect("pool access inside a critical section");
        let lock = &mut guard.borrow_mut();
        self.pool.push_back(lock, message);
    }

    /// Take a free message, if one is available.
    pub fn pop(&self) -> Option<&'static Message<Traits>> {
        let mut guard = lock_cpu::<Traits>().expect("pool access inside a critical section");
        let lock = &mut guard.borrow_mut();
        let head = self.pool.head(lock)?;
        // Safety: pooled messages are `&'static`
        let message = unsafe { head.as_ref() };
        self.pool.remove(lock, message);
        Some(message)
    }
}
