//! Thread lists
//!
//! A `ThreadList` is the ordered collection type behind both the
//! scheduler's ready lists and every blocking object's waiter queue. It is
//! a circular list of threads; a list tagged with a priority level keeps
//! the corresponding bit of the scheduler's priority map in sync with its
//! emptiness.
use core::fmt;

use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    list::{next_of, CircularList, Ref},
    thread::{Thread, ThreadRef},
    utils::Init,
    KernelTraits, PrioLevel,
};

pub(crate) type ListRef<Traits> = Ref<ThreadList<Traits>>;

pub struct ThreadList<Traits: KernelTraits> {
    list: CircularList<Traits, Thread<Traits>>,

    /// `Some(p)` tags this list as the scheduler's ready list for priority
    /// `p`; adding the first thread sets bit `p` of the priority map and
    /// removing the last clears it.
    priority: CpuLockCell<Traits, Option<PrioLevel>>,
}

impl<Traits: KernelTraits> Init for ThreadList<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        list: Init::INIT,
        priority: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for ThreadList<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadList")
            .field("self", &(self as *const _))
            .field("priority", &self.priority)
            .finish()
    }
}

impl<Traits: KernelTraits> ThreadList<Traits> {
    /// Tag this list as a scheduler ready list. Called once, from
    /// [`crate::kernel::Kernel::init`].
    pub(crate) fn set_priority(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>, p: PrioLevel) {
        self.priority.replace(&mut **lock, Some(p));
    }

    pub(crate) fn head(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) -> Option<ThreadRef<Traits>> {
        self.list.head(lock)
    }

    pub(crate) fn is_empty(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.list.is_empty(lock)
    }

    pub(crate) fn has_multiple(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.list.has_multiple(lock)
    }

    /// Append `thread` at the tail (FIFO order).
    pub(crate) fn add(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>, thread: &Thread<Traits>) {
        self.list.push_back(lock, thread);
        self.after_add(lock, thread);
    }

    /// Insert `thread` so the list stays ordered from highest to lowest
    /// effective priority. Ties go after existing members, so equal-priority
    /// waiters are served FIFO.
    pub(crate) fn add_priority(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        thread: &Thread<Traits>,
    ) {
        let prio = thread.effective_priority(lock);

        let mut insert_at = None;
        if let Some(head) = self.list.head(lock) {
            let mut cursor = head;
            loop {
                // Safety: list members are alive while linked
                if unsafe { cursor.as_ref() }.effective_priority(lock) < prio {
                    insert_at = Some(cursor);
                    break;
                }
                cursor = next_of(lock, cursor).unwrap();
                if cursor == head {
                    break;
                }
            }
        }

        if let Some(at) = insert_at {
            self.list.insert_before(lock, thread, at);
        } else {
            self.list.push_back(lock, thread);
        }
        self.after_add(lock, thread);
    }

    fn after_add(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>, thread: &Thread<Traits>) {
        thread.set_current_list(lock, Some(Ref::new(self)));
        if let Some(p) = self.priority.get(&**lock) {
            Traits::state()
                .sched
                .prio_map
                .write(&mut **lock)
                .set(usize::from(p));
        }
    }

    /// Unlink `thread`, clearing the priority map bit if the list became
    /// empty. Panics if the thread's neighbour links are inconsistent.
    pub(crate) fn remove(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>, thread: &Thread<Traits>) {
        self.list.remove(lock, thread);
        thread.set_current_list(lock, None);
        if let Some(p) = self.priority.get(&**lock) {
            if self.list.is_empty(lock) {
                Traits::state()
                    .sched
                    .prio_map
                    .write(&mut **lock)
                    .clear(usize::from(p));
            }
        }
    }

    /// The highest-priority member. Waiter lists are kept priority-ordered
    /// by [`Self::add_priority`], so this is the head.
    pub(crate) fn highest_waiter(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<ThreadRef<Traits>> {
        self.list.head(lock)
    }

    /// Rotate the list forward by one position (round-robin step).
    pub(crate) fn pivot_forward(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) {
        self.list.pivot_forward(lock);
    }

    #[allow(dead_code)]
    pub(crate) fn pivot_backward(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) {
        self.list.pivot_backward(lock);
    }
}
