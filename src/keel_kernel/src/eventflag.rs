//! Event flag groups
//!
//! A 16-bit flag field threads can wait on with an any/all condition over
//! a mask, optionally consuming (clearing) the bits that satisfied them.
//! `set` is ISR-safe.
use core::fmt;

use crate::{
    blocking::{self, BlockingCore},
    kernel::PanicCode,
    klock::{lock_cpu, CpuLockCell},
    list::next_of,
    sched,
    thread::ThreadRef,
    timer::CallbackData,
    utils::Init,
    KernelTraits,
};

/// How a waiting thread's mask is matched against the flag field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFlagMode {
    /// Wake when any masked bit is set.
    AnySet,
    /// Wake when every masked bit is set.
    AllSet,
    /// Like [`EventFlagMode::AnySet`], additionally clearing the masked
    /// bits on wakeup.
    AnyClear,
    /// Like [`EventFlagMode::AllSet`], additionally clearing the masked
    /// bits on wakeup.
    AllClear,
    /// Internal marker: the waiter matched during a `set` pass and is
    /// about to be unblocked. Not a valid argument to `wait`.
    PendingUnblock,
}

impl Init for EventFlagMode {
    const INIT: Self = Self::AnySet;
}

pub struct EventFlag<Traits: KernelTraits> {
    mask: CpuLockCell<Traits, u16>,
    core: BlockingCore<Traits>,
    initialized: CpuLockCell<Traits, bool>,
}

impl<Traits: KernelTraits> Init for EventFlag<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> fmt::Debug for EventFlag<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventFlag")
            .field("self", &(self as *const _))
            .field("mask", &self.mask)
            .finish()
    }
}

/// Match `(mask, mode)` against `set`. Returns the matched bits.
fn match_condition(set: u16, mask: u16, mode: EventFlagMode) -> Option<u16> {
    match mode {
        EventFlagMode::AllSet | EventFlagMode::AllClear => {
            (set & mask == mask).then_some(mask)
        }
        EventFlagMode::AnySet | EventFlagMode::AnyClear => {
            (set & mask != 0).then_some(set & mask)
        }
        EventFlagMode::PendingUnblock => None,
    }
}

fn is_clear_mode(mode: EventFlagMode) -> bool {
    matches!(mode, EventFlagMode::AnyClear | EventFlagMode::AllClear)
}

impl<Traits: KernelTraits> EventFlag<Traits> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            mask: Init::INIT,
            core: Init::INIT,
            initialized: Init::INIT,
        }
    }

    pub fn init(&self) {
        let mut guard = lock_cpu::<Traits>().expect("event flag init inside a critical section");
        let mut lock = guard.borrow_mut();
        self.mask.replace(&mut *lock, 0);
        self.initialized.replace(&mut *lock, true);
    }

    /// Wait until the flag field matches `(mask, mode)`. Returns the
    /// matched bits.
    pub fn wait(&self, mask: u16, mode: EventFlagMode) -> u16 {
        self.wait_inner(mask, mode, 0)
    }

    /// Timed variant of [`EventFlag::wait`]; returns `0` if the timeout
    /// fires first. A zero timeout waits forever.
    pub fn wait_timeout(&self, mask: u16, mode: EventFlagMode, timeout_ms: u32) -> u16 {
        self.wait_inner(mask, mode, timeout_ms)
    }

    fn wait_inner(&self, mask: u16, mode: EventFlagMode, timeout_ms: u32) -> u16 {
        debug_assert!(
            !Traits::is_interrupt_context(),
            "event flag wait from interrupt context"
        );
        debug_assert!(mode != EventFlagMode::PendingUnblock);

        let used_timer;
        {
            let mut guard = lock_cpu::<Traits>().expect("wait inside a critical section");
            let lock = &mut guard.borrow_mut();
            debug_assert!(self.initialized.get(&**lock), "event flag used before init");

            let cur = sched::current_ref(lock).expect("wait before the kernel started");
            // Safety: registered threads are `&'static`
            let cur_cb = unsafe { cur.as_ref() };

            let set = self.mask.get(&**lock);
            if let Some(matched) = match_condition(set, mask, mode) {
                cur_cb.set_event_mask_locked(lock, matched);
                if is_clear_mode(mode) {
                    self.mask.replace(&mut **lock, set & !mask);
                }
                return matched;
            }

            cur_cb.set_event_mask_locked(lock, mask);
            cur_cb.set_event_mode_locked(lock, mode);

            used_timer = timeout_ms != 0;
            if used_timer {
                blocking::arm_wait_timer(
                    lock,
                    timeout_ms,
                    wait_timeout_expired::<Traits>,
                    CallbackData::new(self as *const Self as *mut ()),
                );
            }

            self.core.block_priority(lock, cur);
            sched::yield_locked(lock);
        }

        if used_timer {
            // Stops the still-armed timer on the wakeup path; a timeout
            // has already zeroed the thread's matched bits.
            let _ = blocking::finish_timeout::<Traits>();
        }

        let mut guard = lock_cpu::<Traits>().expect("wait inside a critical section");
        let lock = &mut guard.borrow_mut();
        let cur = sched::current_ref(lock).expect("wait before the kernel started");
        // Safety: registered threads are `&'static`
        unsafe { cur.as_ref() }.event_mask_locked(lock)
    }

    /// OR `bits` into the flag field and wake every waiter whose
    /// condition is now satisfied. The wakeups are atomic: clears
    /// requested by clear-mode waiters accumulate in a scratch mask and
    /// are committed before any thread is unblocked, so later waiters are
    /// never re-evaluated against bits cleared by earlier ones. ISR-safe.
    pub fn set(&self, bits: u16) {
        let mut guard = lock_cpu::<Traits>().expect("set inside a critical section");
        let lock = &mut guard.borrow_mut();
        debug_assert!(self.initialized.get(&**lock), "event flag used before init");

        let set_mask = self.mask.get(&**lock) | bits;
        self.mask.replace(&mut **lock, set_mask);
        let mut scratch = set_mask;

        // Pass 1: tag every satisfied waiter and record its matched bits.
        let waiters = self.core.waiters();
        if let Some(head) = waiters.head(lock) {
            let mut cursor = head;
            loop {
                let next = next_of(lock, cursor).unwrap();
                // Safety: registered threads are `&'static`
                let waiter = unsafe { cursor.as_ref() };

                let thread_mask = waiter.event_mask_locked(lock);
                let mode = waiter.event_mode_locked(lock);
                if let Some(matched) = match_condition(set_mask, thread_mask, mode) {
                    waiter.set_event_mode_locked(lock, EventFlagMode::PendingUnblock);
                    waiter.set_event_mask_locked(lock, matched);
                    if is_clear_mode(mode) {
                        scratch &= !(thread_mask & bits);
                    }
                }

                cursor = next;
                if cursor == head {
                    break;
                }
            }
        }

        // Commit accumulated clears before waking anyone.
        self.mask.replace(&mut **lock, scratch);

        // Pass 2: unblock the tagged waiters. Scan afresh each round;
        // unblocking rearranges the queue.
        let mut resched = false;
        loop {
            let mut found: Option<ThreadRef<Traits>> = None;
            if let Some(head) = waiters.head(lock) {
                let mut cursor = head;
                loop {
                    // Safety: registered threads are `&'static`
                    if unsafe { cursor.as_ref() }.event_mode_locked(lock)
                        == EventFlagMode::PendingUnblock
                    {
                        found = Some(cursor);
                        break;
                    }
                    cursor = next_of(lock, cursor).unwrap();
                    if cursor == head {
                        break;
                    }
                }
            }

            let Some(woken) = found else { break };
            self.core.unblock(lock, woken);
            if let Some(cur) = sched::current_ref(lock) {
                // Safety: registered threads are `&'static`
                if unsafe { woken.as_ref() }.effective_priority(lock)
                    >= unsafe { cur.as_ref() }.effective_priority(lock)
                {
                    resched = true;
                }
            }
        }

        if resched {
            sched::yield_locked(lock);
        }
    }

    /// AND-NOT `bits` out of the flag field.
    pub fn clear(&self, bits: u16) {
        let mut guard = lock_cpu::<Traits>().expect("clear inside a critical section");
        let mut lock = guard.borrow_mut();
        debug_assert!(self.initialized.get(&*lock), "event flag used before init");
        self.mask.replace_with(&mut *lock, |m| *m & !bits);
    }

    /// Atomic read of the flag field.
    pub fn get_mask(&self) -> u16 {
        let mut guard = lock_cpu::<Traits>().expect("read inside a critical section");
        let lock = guard.borrow_mut();
        self.mask.get(&*lock)
    }
}

/// Timeout callback for a timed wait: zero the matched bits, then take
/// the common expiry path.
fn wait_timeout_expired<Traits: KernelTraits>(
    owner: Option<&'static crate::thread::Thread<Traits>>,
    data: CallbackData,
) {
    let Some(owner) = owner else { return };
    // Safety: the blocked thread stops its timer before the event flag
    // can be destroyed
    let flag = unsafe { &*(data.get() as *const EventFlag<Traits>) };

    let mut guard = lock_cpu::<Traits>().unwrap_or_else(|_| {
        // Safety: timer callbacks run with the CPU Lock released
        unsafe { crate::klock::assume_cpu_lock() }
    });
    let lock = &mut guard.borrow_mut();
    if blocking::expire_waiter(lock, &flag.core, owner) {
        owner.set_event_mask_locked(lock, 0);
    }
}

impl<Traits: KernelTraits> Drop for EventFlag<Traits> {
    fn drop(&mut self) {
        self.core.panic_if_waited(PanicCode::ActiveEventFlagDescoped);
    }
}
