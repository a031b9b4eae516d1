//! Mailboxes
//!
//! A fixed-size envelope ring over a caller-supplied byte buffer. Two
//! internal semaphores provide the blocking: a counting one, sized to the
//! capacity, gates receivers; a binary one parks senders that found the
//! ring full. Envelope copies run with the scheduler disabled rather than
//! inside the critical section, keeping interrupt latency independent of
//! the element size.
use core::fmt;

use crate::{
    kernel::{self, PanicCode},
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    sched,
    semaphore::Semaphore,
    utils::Init,
    KernelTraits,
};

#[derive(Clone, Copy)]
struct BufferRegion {
    ptr: *mut u8,
}

// Safety: the address is only dereferenced on the single core this
// kernel manages, inside a scheduler-disabled window.
unsafe impl Send for BufferRegion {}

pub struct Mailbox<Traits: KernelTraits> {
    buffer: CpuLockCell<Traits, Option<BufferRegion>>,
    element_size: CpuLockCell<Traits, u16>,
    capacity: CpuLockCell<Traits, u16>,
    free: CpuLockCell<Traits, u16>,
    head: CpuLockCell<Traits, u16>,
    tail: CpuLockCell<Traits, u16>,

    recv_sem: Semaphore<Traits>,
    send_sem: Semaphore<Traits>,

    initialized: CpuLockCell<Traits, bool>,
}

impl<Traits: KernelTraits> Init for Mailbox<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> fmt::Debug for Mailbox<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("self", &(self as *const _))
            .field("element_size", &self.element_size)
            .field("capacity", &self.capacity)
            .field("free", &self.free)
            .finish()
    }
}

impl<Traits: KernelTraits> Mailbox<Traits> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            buffer: Init::INIT,
            element_size: Init::INIT,
            capacity: Init::INIT,
            free: Init::INIT,
            head: Init::INIT,
            tail: Init::INIT,
            recv_sem: Semaphore::new(),
            send_sem: Semaphore::new(),
            initialized: Init::INIT,
        }
    }

    /// Set up the ring over `buffer`. The capacity is
    /// `buffer.len() / element_size` envelopes.
    pub fn init(&self, buffer: &'static mut [u8], element_size: u16) {
        assert!(element_size > 0);
        let capacity = (buffer.len() / usize::from(element_size)) as u16;
        assert!(capacity > 0);

        self.recv_sem.init(0, capacity);
        self.send_sem.init(0, 1);

        let mut guard = lock_cpu::<Traits>().expect("mailbox init inside a critical section");
        let mut lock = guard.borrow_mut();
        self.buffer.replace(
            &mut *lock,
            Some(BufferRegion {
                ptr: buffer.as_mut_ptr(),
            }),
        );
        self.element_size.replace(&mut *lock, element_size);
        self.capacity.replace(&mut *lock, capacity);
        self.free.replace(&mut *lock, capacity);
        self.head.replace(&mut *lock, 0);
        self.tail.replace(&mut *lock, 0);
        self.initialized.replace(&mut *lock, true);
    }

    /// Deliver one envelope to the head of the mailbox. Fails
    /// immediately when the ring is full.
    pub fn send(&self, envelope: &[u8]) -> bool {
        self.send_inner(envelope, false, 0)
    }

    /// Deliver one envelope to the tail of the mailbox.
    pub fn send_to_tail(&self, envelope: &[u8]) -> bool {
        self.send_inner(envelope, true, 0)
    }

    /// Deliver to the head, waiting up to `timeout_ms` for a free slot.
    pub fn send_timeout(&self, envelope: &[u8], timeout_ms: u32) -> bool {
        self.send_inner(envelope, false, timeout_ms)
    }

    /// Deliver to the tail, waiting up to `timeout_ms` for a free slot.
    pub fn send_to_tail_timeout(&self, envelope: &[u8], timeout_ms: u32) -> bool {
        self.send_inner(envelope, true, timeout_ms)
    }

    /// Read one envelope from the head, blocking until one is delivered.
    pub fn receive(&self, envelope: &mut [u8]) -> bool {
        self.receive_inner(envelope, false, 0)
    }

    /// Read one envelope from the tail (the oldest delivery).
    pub fn receive_from_tail(&self, envelope: &mut [u8]) -> bool {
        self.receive_inner(envelope, true, 0)
    }

    /// Read from the head, giving up after `timeout_ms` without delivery.
    pub fn receive_timeout(&self, envelope: &mut [u8], timeout_ms: u32) -> bool {
        self.receive_inner(envelope, false, timeout_ms)
    }

    /// Read from the tail, giving up after `timeout_ms` without delivery.
    pub fn receive_from_tail_timeout(&self, envelope: &mut [u8], timeout_ms: u32) -> bool {
        self.receive_inner(envelope, true, timeout_ms)
    }

    pub fn free_slots(&self) -> u16 {
        let mut guard = lock_cpu::<Traits>().expect("query inside a critical section");
        let lock = guard.borrow_mut();
        self.free.get(&*lock)
    }

    pub fn is_full(&self) -> bool {
        self.free_slots() == 0
    }

    pub fn is_empty(&self) -> bool {
        let mut guard = lock_cpu::<Traits>().expect("query inside a critical section");
        let lock = guard.borrow_mut();
        self.free.get(&*lock) == self.capacity.get(&*lock)
    }

    fn slot_ptr(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>, index: u16) -> *mut u8 {
        let region = self.buffer.get(&**lock).unwrap();
        let element_size = usize::from(self.element_size.get(&**lock));
        // Safety: `index` is in `0..capacity`, in bounds of the buffer
        unsafe { region.ptr.add(usize::from(index) * element_size) }
    }

    fn move_head_forward(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) {
        let mut head = self.head.get(&**lock) + 1;
        if head == self.capacity.get(&**lock) {
            head = 0;
        }
        self.head.replace(&mut **lock, head);
    }

    fn move_head_backward(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) {
        let mut head = self.head.get(&**lock);
        if head == 0 {
            head = self.capacity.get(&**lock);
        }
        self.head.replace(&mut **lock, head - 1);
    }

    fn move_tail_forward(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) {
        let mut tail = self.tail.get(&**lock) + 1;
        if tail == self.capacity.get(&**lock) {
            tail = 0;
        }
        self.tail.replace(&mut **lock, tail);
    }

    fn move_tail_backward(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) {
        let mut tail = self.tail.get(&**lock);
        if tail == 0 {
            tail = self.capacity.get(&**lock);
        }
        self.tail.replace(&mut **lock, tail - 1);
    }

    fn send_inner(&self, envelope: &[u8], to_tail: bool, timeout_ms: u32) -> bool {
        debug_assert!(
            !Traits::is_interrupt_context(),
            "mailbox send from interrupt context"
        );

        let sched_state = sched::set_scheduler::<Traits>(false);

        let mut delivered = false;
        let mut must_block = false;
        let mut done = false;
        let mut slot: Option<*mut u8> = None;

        while !done {
            // Claim a slot first; fall back to blocking on the send
            // semaphore and retrying once.
            if must_block {
                done = true;
                sched::set_scheduler::<Traits>(sched_state);
                let _ = self.send_sem.pend_timeout(timeout_ms);
                sched::set_scheduler::<Traits>(false);
            }

            {
                let mut guard =
                    lock_cpu::<Traits>().expect("mailbox send inside a critical section");
                let lock = &mut guard.borrow_mut();
                debug_assert!(self.initialized.get(&**lock), "mailbox used before init");
                debug_assert_eq!(
                    usize::from(self.element_size.get(&**lock)),
                    envelope.len()
                );

                let free = self.free.get(&**lock);
                if free > 0 {
                    self.free.replace(&mut **lock, free - 1);
                    slot = Some(if to_tail {
                        let ptr = self.slot_ptr(lock, self.tail.get(&**lock));
                        self.move_tail_backward(lock);
                        ptr
                    } else {
                        self.move_head_forward(lock);
                        self.slot_ptr(lock, self.head.get(&**lock))
                    });
                    delivered = true;
                    done = true;
                } else if timeout_ms != 0 && !must_block {
                    must_block = true;
                } else {
                    done = true;
                }
            }
        }

        if let Some(slot) = slot {
            // Safety: the slot was claimed above and stays ours until the
            // matching receive; the scheduler is disabled
            unsafe {
                core::ptr::copy_nonoverlapping(envelope.as_ptr(), slot, envelope.len());
            }
        }

        sched::set_scheduler::<Traits>(sched_state);

        if delivered {
            self.recv_sem.post();
        }
        delivered
    }

    fn receive_inner(&self, envelope: &mut [u8], from_tail: bool, timeout_ms: u32) -> bool {
        debug_assert!(
            !Traits::is_interrupt_context(),
            "mailbox receive from interrupt context"
        );

        if self.recv_sem.pend_timeout(timeout_ms).is_err() {
            // No delivery within the allotted time.
            return false;
        }

        let sched_state = sched::set_scheduler::<Traits>(false);

        let src;
        {
            let mut guard =
                lock_cpu::<Traits>().expect("mailbox receive inside a critical section");
            let lock = &mut guard.borrow_mut();
            debug_assert!(self.initialized.get(&**lock), "mailbox used before init");
            debug_assert_eq!(usize::from(self.element_size.get(&**lock)), envelope.len());

            let free = self.free.get(&**lock);
            if free == self.capacity.get(&**lock) {
                // A port that does not suspend the caller (the simulation
                // port) returns from the pend with the delivery still
                // outstanding; there is nothing to drain yet.
                src = None;
            } else {
                self.free.replace(&mut **lock, free + 1);
                src = Some(if from_tail {
                    self.move_tail_forward(lock);
                    self.slot_ptr(lock, self.tail.get(&**lock))
                } else {
                    let ptr = self.slot_ptr(lock, self.head.get(&**lock));
                    self.move_head_backward(lock);
                    ptr
                });
            }
        }

        if let Some(src) = src {
            // Safety: the slot was released from the ring above; the
            // scheduler is disabled while we copy out of it
            unsafe {
                core::ptr::copy_nonoverlapping(src, envelope.as_mut_ptr(), envelope.len());
            }
        }

        sched::set_scheduler::<Traits>(sched_state);

        if src.is_some() {
            self.send_sem.post();
        }
        src.is_some()
    }
}

impl<Traits: KernelTraits> Drop for Mailbox<Traits> {
    fn drop(&mut self) {
        if let Ok(mut guard) = lock_cpu::<Traits>() {
            let lock = guard.borrow_mut();
            if self.initialized.get(&*lock)
                && self.free.get(&*lock) != self.capacity.get(&*lock)
            {
                // The guard stays held; the panic path expects the
                // critical section to be active.
                kernel::panic::<Traits>(PanicCode::ActiveMailboxDescoped);
            }
        }
    }
}
