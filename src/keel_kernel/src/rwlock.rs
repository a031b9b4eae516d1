//! Reader-writer locks
//!
//! Many readers or one writer. Admission is writer-preferring: a new
//! reader queues behind any waiting writer. Release is reader-preferring:
//! a releasing writer wakes every waiting reader before considering the
//! next writer, so neither side starves indefinitely.
use core::fmt;

use crate::{
    blocking::{self, BlockingCore},
    kernel::PanicCode,
    klock::{lock_cpu, CpuLockCell},
    sched,
    utils::Init,
    KernelTraits,
};

pub struct RwLock<Traits: KernelTraits> {
    reader_count: CpuLockCell<Traits, u16>,
    writer_held: CpuLockCell<Traits, bool>,
    readers: BlockingCore<Traits>,
    writers: BlockingCore<Traits>,
    initialized: CpuLockCell<Traits, bool>,
}

impl<Traits: KernelTraits> Init for RwLock<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> fmt::Debug for RwLock<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RwLock")
            .field("self", &(self as *const _))
            .field("reader_count", &self.reader_count)
            .field("writer_held", &self.writer_held)
            .finish()
    }
}

impl<Traits: KernelTraits> RwLock<Traits> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            reader_count: Init::INIT,
            writer_held: Init::INIT,
            readers: Init::INIT,
            writers: Init::INIT,
            initialized: Init::INIT,
        }
    }

    pub fn init(&self) {
        let mut guard = lock_cpu::<Traits>().expect("rwlock init inside a critical section");
        let mut lock = guard.borrow_mut();
        self.reader_count.replace(&mut *lock, 0);
        self.writer_held.replace(&mut *lock, false);
        self.initialized.replace(&mut *lock, true);
    }

    /// Acquire shared access. Blocks while a writer holds the lock or
    /// waits for it.
    pub fn acquire_reader(&self) {
        debug_assert!(
            !Traits::is_interrupt_context(),
            "rwlock acquire from interrupt context"
        );
        let mut guard = lock_cpu::<Traits>().expect("acquire inside a critical section");
        let lock = &mut guard.borrow_mut();
        debug_assert!(self.initialized.get(&**lock), "rwlock used before init");

        if self.writer_held.get(&**lock) || self.writers.has_waiters(lock) {
            let cur = sched::current_ref(lock).expect("acquire before the kernel started");
            self.readers.block_priority(lock, cur);
            sched::yield_locked(lock);
            // A waking releaser has already counted us in.
            return;
        }

        let count = self.reader_count.get(&**lock);
        self.reader_count.replace(&mut **lock, count + 1);
    }

    /// Release shared access; the last reader out hands the lock to a
    /// waiting writer.
    pub fn release_reader(&self) {
        let mut guard = lock_cpu::<Traits>().expect("release inside a critical section");
        let lock = &mut guard.borrow_mut();
        debug_assert!(self.initialized.get(&**lock), "rwlock used before init");

        let count = self.reader_count.get(&**lock);
        debug_assert!(count > 0, "reader release without a reader hold");
        self.reader_count.replace(&mut **lock, count - 1);

        if count == 1 {
            if let Some(writer) = self.writers.highest_waiter(lock) {
                self.writer_held.replace(&mut **lock, true);
                self.writers.unblock(lock, writer);
                blocking::yield_if_outranks(lock, writer);
            }
        }
    }

    /// Acquire exclusive access. Blocks while readers are in or another
    /// writer holds the lock.
    pub fn acquire_writer(&self) {
        debug_assert!(
            !Traits::is_interrupt_context(),
            "rwlock acquire from interrupt context"
        );
        let mut guard = lock_cpu::<Traits>().expect("acquire inside a critical section");
        let lock = &mut guard.borrow_mut();
        debug_assert!(self.initialized.get(&**lock), "rwlock used before init");

        if self.writer_held.get(&**lock) || self.reader_count.get(&**lock) > 0 {
            let cur = sched::current_ref(lock).expect("acquire before the kernel started");
            self.writers.block_priority(lock, cur);
            sched::yield_locked(lock);
            // Ownership was handed over by the releaser.
            return;
        }

        self.writer_held.replace(&mut **lock, true);
    }

    /// Release exclusive access: admit every waiting reader, or failing
    /// that the next writer.
    pub fn release_writer(&self) {
        let mut guard = lock_cpu::<Traits>().expect("release inside a critical section");
        let lock = &mut guard.borrow_mut();
        debug_assert!(self.initialized.get(&**lock), "rwlock used before init");
        debug_assert!(self.writer_held.get(&**lock), "writer release without hold");

        self.writer_held.replace(&mut **lock, false);

        if self.readers.has_waiters(lock) {
            let mut resched = false;
            while let Some(reader) = self.readers.wake_one(lock) {
                let count = self.reader_count.get(&**lock);
                self.reader_count.replace(&mut **lock, count + 1);
                if let Some(cur) = sched::current_ref(lock) {
                    // Safety: registered threads are `&'static`
                    if unsafe { reader.as_ref() }.effective_priority(lock)
                        >= unsafe { cur.as_ref() }.effective_priority(lock)
                    {
                        resched = true;
                    }
                }
            }
            if resched {
                sched::yield_locked(lock);
            }
        } else if let Some(writer) = self.writers.highest_waiter(lock) {
            self.writer_held.replace(&mut **lock, true);
            self.writers.unblock(lock, writer);
            blocking::yield_if_outranks(lock, writer);
        }
    }

    pub fn reader_count(&self) -> u16 {
        let mut guard = lock_cpu::<Traits>().expect("query inside a critical section");
        let lock = guard.borrow_mut();
        self.reader_count.get(&*lock)
    }

    pub fn is_writer_held(&self) -> bool {
        let mut guard = lock_cpu::<Traits>().expect("query inside a critical section");
        let lock = guard.borrow_mut();
        self.writer_held.get(&*lock)
    }
}

impl<Traits: KernelTraits> Drop for RwLock<Traits> {
    fn drop(&mut self) {
        self.readers.panic_if_waited(PanicCode::ActiveRwLockDescoped);
        self.writers.panic_if_waited(PanicCode::ActiveRwLockDescoped);
    }
}
