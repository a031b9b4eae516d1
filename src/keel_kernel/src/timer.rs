//! Software timers and the timer scheduler
//!
//! One hardware tick is multiplexed across any number of software
//! timers. The port's tick ISR calls [`tick`] once per tick; expiry
//! callbacks therefore run in interrupt context and must restrict
//! themselves to posting synchronization objects; they can never block.
use core::fmt;

use crate::{
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    list::{next_of, DoubleList, Link, ListNode},
    sched,
    thread::{Thread, ThreadRef},
    utils::Init,
    KernelTraits, PortTimer,
};

/// Opaque word handed back to a timer callback.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CallbackData(*mut ());

// Safety: the kernel never dereferences the pointer; the callback's
// author is responsible for what it addresses.
unsafe impl Send for CallbackData {}
unsafe impl Sync for CallbackData {}

impl CallbackData {
    pub const fn new(ptr: *mut ()) -> Self {
        Self(ptr)
    }

    pub const fn null() -> Self {
        Self(core::ptr::null_mut())
    }

    pub fn get(self) -> *mut () {
        self.0
    }
}

impl Init for CallbackData {
    const INIT: Self = Self::null();
}

impl fmt::Debug for CallbackData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CallbackData({:p})", self.0)
    }
}

/// A timer expiry callback. Runs in interrupt context with the CPU Lock
/// released: it may post, signal and set, but never block.
pub type TimerCallback<Traits> = fn(Option<&'static Thread<Traits>>, CallbackData);

/// Timer state flags.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerFlags(u8);

impl TimerFlags {
    pub(crate) const ONE_SHOT: u8 = 0x01;
    pub(crate) const ACTIVE: u8 = 0x02;
    pub(crate) const CALLBACK: u8 = 0x04;
    pub(crate) const EXPIRED: u8 = 0x08;

    pub(crate) fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub(crate) fn set(&mut self, bit: u8) {
        self.0 |= bit;
    }

    pub(crate) fn clear(&mut self, bit: u8) {
        self.0 &= !bit;
    }
}

impl Init for TimerFlags {
    const INIT: Self = Self(0);
}

impl fmt::Debug for TimerFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TimerFlags({:#04x})", self.0)
    }
}

/// Convert a millisecond interval to hardware ticks, rounding up.
pub(crate) fn ticks_from_ms<Traits: PortTimer>(ms: u32) -> u32 {
    if Traits::TICK_HZ == 1000 {
        ms
    } else {
        (u64::from(ms) * u64::from(Traits::TICK_HZ)).div_ceil(1000) as u32
    }
}

/// A software timer.
///
/// Created dormant; [`Timer::start`] inserts it into the kernel's timer
/// list, where the tick handler ages it and eventually runs its callback.
/// A one-shot timer retires itself on expiry and can be re-armed with
/// [`Timer::start_configured`].
pub struct Timer<Traits: KernelTraits> {
    link: Link<Traits, Self>,

    flags: CpuLockCell<Traits, TimerFlags>,

    /// Nominal interval, in ticks.
    interval: CpuLockCell<Traits, u32>,
    /// Ticks until expiry.
    remaining: CpuLockCell<Traits, u32>,
    /// Permissible lateness, in ticks, used to coalesce expiries.
    tolerance: CpuLockCell<Traits, u32>,

    callback: CpuLockCell<Traits, Option<TimerCallback<Traits>>>,
    data: CpuLockCell<Traits, CallbackData>,

    owner: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,

    initialized: CpuLockCell<Traits, bool>,
}

impl<Traits: KernelTraits> ListNode<Traits> for Timer<Traits> {
    fn link(&self) -> &Link<Traits, Self> {
        &self.link
    }
}

impl<Traits: KernelTraits> Init for Timer<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> fmt::Debug for Timer<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timer")
            .field("self", &(self as *const _))
            .field("flags", &self.flags)
            .field("interval", &self.interval)
            .field("remaining", &self.remaining)
            .finish()
    }
}

impl<Traits: KernelTraits> Timer<Traits> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            link: Init::INIT,
            flags: Init::INIT,
            interval: Init::INIT,
            remaining: Init::INIT,
            tolerance: Init::INIT,
            callback: Init::INIT,
            data: Init::INIT,
            owner: Init::INIT,
            initialized: Init::INIT,
        }
    }

    /// Reset the timer to its dormant default state.
    pub fn init(&self) {
        let mut guard = lock_cpu::<Traits>().expect("timer init inside a critical section");
        self.init_locked(&mut guard.borrow_mut());
    }

    pub(crate) fn init_locked(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) {
        if self.flags.get(&**lock).contains(TimerFlags::ACTIVE) {
            Traits::state().timers.list.remove(lock, self);
        }
        self.flags.replace(&mut **lock, TimerFlags::INIT);
        self.interval.replace(&mut **lock, 0);
        self.remaining.replace(&mut **lock, 0);
        self.tolerance.replace(&mut **lock, 0);
        self.callback.replace(&mut **lock, None);
        self.data.replace(&mut **lock, CallbackData::null());
        self.owner.replace(&mut **lock, None);
        self.initialized.replace(&mut **lock, true);
    }

    /// Arm the timer: one-shot when `repeat` is `false`, periodic
    /// otherwise. The interval is in milliseconds.
    pub fn start(
        &self,
        repeat: bool,
        interval_ms: u32,
        callback: TimerCallback<Traits>,
        data: CallbackData,
    ) {
        let mut guard = lock_cpu::<Traits>().expect("timer start inside a critical section");
        self.start_locked(
            &mut guard.borrow_mut(),
            !repeat,
            interval_ms,
            0,
            callback,
            data,
        );
    }

    /// Like [`Timer::start`], additionally granting the scheduler
    /// `tolerance_ms` of lateness to coalesce this expiry with a
    /// neighbouring one. Expiry may occur up to the tolerance later than
    /// nominal, never earlier.
    pub fn start_with_tolerance(
        &self,
        repeat: bool,
        interval_ms: u32,
        tolerance_ms: u32,
        callback: TimerCallback<Traits>,
        data: CallbackData,
    ) {
        let mut guard = lock_cpu::<Traits>().expect("timer start inside a critical section");
        self.start_locked(
            &mut guard.borrow_mut(),
            !repeat,
            interval_ms,
            tolerance_ms,
            callback,
            data,
        );
    }

    /// Re-arm with the previously configured interval, flags, callback
    /// and data. Useful for retriggering an expired one-shot.
    pub fn start_configured(&self) {
        let mut guard = lock_cpu::<Traits>().expect("timer start inside a critical section");
        let lock = &mut guard.borrow_mut();
        debug_assert!(self.initialized.get(&**lock));

        if self.flags.get(&**lock).contains(TimerFlags::ACTIVE) {
            Traits::state().timers.list.remove(lock, self);
        }
        {
            let flags = self.flags.write(&mut **lock);
            flags.set(TimerFlags::ACTIVE);
            flags.clear(TimerFlags::CALLBACK | TimerFlags::EXPIRED);
        }
        let interval = self.interval.get(&**lock);
        self.remaining.replace(&mut **lock, interval);
        self.arm(lock);
    }

    pub(crate) fn start_locked(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        one_shot: bool,
        interval_ms: u32,
        tolerance_ms: u32,
        callback: TimerCallback<Traits>,
        data: CallbackData,
    ) {
        debug_assert!(self.initialized.get(&**lock), "timer used before init");

        if self.flags.get(&**lock).contains(TimerFlags::ACTIVE) {
            Traits::state().timers.list.remove(lock, self);
        }

        {
            let flags = self.flags.write(&mut **lock);
            flags.clear(TimerFlags::ONE_SHOT | TimerFlags::CALLBACK | TimerFlags::EXPIRED);
            if one_shot {
                flags.set(TimerFlags::ONE_SHOT);
            }
            flags.set(TimerFlags::ACTIVE);
        }

        let ticks = ticks_from_ms::<Traits>(interval_ms);
        self.interval.replace(&mut **lock, ticks);
        self.remaining.replace(&mut **lock, ticks);
        self.tolerance
            .replace(&mut **lock, ticks_from_ms::<Traits>(tolerance_ms));
        self.callback.replace(&mut **lock, Some(callback));
        self.data.replace(&mut **lock, data);
        if self.owner.get(&**lock).is_none() {
            let current = sched::current_ref(lock);
            self.owner.replace(&mut **lock, current);
        }

        self.arm(lock);
    }

    /// Insert into the timer list, coalescing with an already-pending
    /// expiry when the tolerance allows it.
    fn arm(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) {
        let tolerance = self.tolerance.get(&**lock);
        if tolerance > 0 {
            let nominal = self.remaining.get(&**lock);
            let list = &Traits::state().timers.list;
            let mut cursor = list.head(lock);
            while let Some(t) = cursor {
                cursor = next_of(lock, t);
                // Safety: linked timers are alive
                let other = unsafe { t.as_ref() };
                if other.flags.get(&**lock).contains(TimerFlags::ACTIVE) {
                    let their_remaining = other.remaining.get(&**lock);
                    if their_remaining >= nominal && their_remaining - nominal <= tolerance {
                        self.remaining.replace(&mut **lock, their_remaining);
                        break;
                    }
                }
            }
        }

        Traits::state().timers.list.push_back(lock, self);
    }

    /// Disarm the timer. A no-op if it is not active. The configured
    /// interval, callback and data survive for [`Timer::start_configured`].
    pub fn stop(&self) {
        let mut guard = lock_cpu::<Traits>().expect("timer stop inside a critical section");
        self.stop_locked(&mut guard.borrow_mut());
    }

    pub(crate) fn stop_locked(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) {
        if !self.flags.get(&**lock).contains(TimerFlags::ACTIVE) {
            return;
        }
        Traits::state().timers.list.remove(lock, self);
        let flags = self.flags.write(&mut **lock);
        flags.clear(TimerFlags::ACTIVE | TimerFlags::CALLBACK);
    }

    /// The configured interval, in ticks.
    pub fn interval(&self) -> u32 {
        let mut guard = lock_cpu::<Traits>().expect("timer read inside a critical section");
        let lock = guard.borrow_mut();
        self.interval.get(&*lock)
    }

    /// Whether the timer has expired without being re-armed.
    pub fn expired(&self) -> bool {
        let mut guard = lock_cpu::<Traits>().expect("timer read inside a critical section");
        let lock = guard.borrow_mut();
        self.flags.get(&*lock).contains(TimerFlags::EXPIRED)
    }

    pub fn set_interval_ticks(&self, ticks: u32) {
        let mut guard = lock_cpu::<Traits>().expect("timer reconfig inside a critical section");
        let mut lock = guard.borrow_mut();
        self.interval.replace(&mut *lock, ticks);
    }

    pub fn set_interval_ms(&self, ms: u32) {
        self.set_interval_ticks(ticks_from_ms::<Traits>(ms));
    }

    pub fn set_interval_seconds(&self, seconds: u32) {
        self.set_interval_ticks(ticks_from_ms::<Traits>(seconds.saturating_mul(1000)));
    }

    pub fn set_tolerance_ms(&self, ms: u32) {
        let mut guard = lock_cpu::<Traits>().expect("timer reconfig inside a critical section");
        let mut lock = guard.borrow_mut();
        self.tolerance
            .replace(&mut *lock, ticks_from_ms::<Traits>(ms));
    }

    pub fn set_one_shot(&self, one_shot: bool) {
        let mut guard = lock_cpu::<Traits>().expect("timer reconfig inside a critical section");
        let mut lock = guard.borrow_mut();
        let flags = self.flags.write(&mut *lock);
        if one_shot {
            flags.set(TimerFlags::ONE_SHOT);
        } else {
            flags.clear(TimerFlags::ONE_SHOT);
        }
    }

    pub fn set_callback(&self, callback: TimerCallback<Traits>) {
        let mut guard = lock_cpu::<Traits>().expect("timer reconfig inside a critical section");
        let mut lock = guard.borrow_mut();
        self.callback.replace(&mut *lock, Some(callback));
    }

    pub fn set_data(&self, data: CallbackData) {
        let mut guard = lock_cpu::<Traits>().expect("timer reconfig inside a critical section");
        let mut lock = guard.borrow_mut();
        self.data.replace(&mut *lock, data);
    }

    pub(crate) fn set_owner_locked(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        owner: Option<ThreadRef<Traits>>,
    ) {
        self.owner.replace(&mut **lock, owner);
    }
}

impl<Traits: KernelTraits> Drop for Timer<Traits> {
    fn drop(&mut self) {
        // A timer destroyed while armed would leave a dangling list node.
        if let Ok(mut guard) = lock_cpu::<Traits>() {
            self.stop_locked(&mut guard.borrow_mut());
        }
    }
}

/// Kernel-global timer state: the timer list and the round-robin quantum.
pub(crate) struct TimerScheduler<Traits: KernelTraits> {
    pub(crate) list: DoubleList<Traits, Timer<Traits>>,
    #[cfg(feature = "round-robin")]
    pub(crate) quantum: crate::quantum::QuantumState<Traits>,
}

impl<Traits: KernelTraits> Init for TimerScheduler<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        list: Init::INIT,
        #[cfg(feature = "round-robin")]
        quantum: Init::INIT,
    };
}

/// The kernel tick handler. The port's tick ISR calls this once per
/// hardware tick, with the kernel CPU Lock *not* held.
///
/// Two passes over the timer list: age every active timer, then run the
/// callbacks that came due, reloading periodic timers and retiring
/// one-shots. Callbacks are invoked with the CPU Lock released so they
/// can post and signal.
pub fn tick<Traits: KernelTraits>() {
    let mut guard = lock_cpu::<Traits>().unwrap_or_else(|_| {
        // Safety: the tick ISR runs with interrupts masked and no
        // outstanding guard
        unsafe { crate::klock::assume_cpu_lock() }
    });

    // Pass 1: age.
    {
        let lock = &mut guard.borrow_mut();
        let list = &Traits::state().timers.list;
        let mut cursor = list.head(lock);
        while let Some(t) = cursor {
            cursor = next_of(lock, t);
            // Safety: linked timers are alive
            let timer = unsafe { t.as_ref() };
            let flags = timer.flags.get(&**lock);
            if flags.contains(TimerFlags::ACTIVE) && !flags.contains(TimerFlags::CALLBACK) {
                let remaining = timer.remaining.get(&**lock).saturating_sub(1);
                timer.remaining.replace(&mut **lock, remaining);
                if remaining == 0 {
                    timer.flags.write(&mut **lock).set(TimerFlags::CALLBACK);
                }
            }
        }
    }

    // Pass 2: dispatch. A fresh scan per callback, because a callback may
    // arbitrarily rearrange the timer list.
    loop {
        let mut pending = None;
        {
            let lock = &mut guard.borrow_mut();
            let list = &Traits::state().timers.list;
            let mut cursor = list.head(lock);
            while let Some(t) = cursor {
                cursor = next_of(lock, t);
                // Safety: linked timers are alive
                if unsafe { t.as_ref() }
                    .flags
                    .get(&**lock)
                    .contains(TimerFlags::CALLBACK)
                {
                    pending = Some(t);
                    break;
                }
            }

            if let Some(t) = pending {
                // Safety: linked timers are alive
                let timer = unsafe { t.as_ref() };
                timer.flags.write(&mut **lock).clear(TimerFlags::CALLBACK);
                if timer.flags.get(&**lock).contains(TimerFlags::ONE_SHOT) {
                    list.remove(lock, timer);
                    let flags = timer.flags.write(&mut **lock);
                    flags.clear(TimerFlags::ACTIVE);
                    flags.set(TimerFlags::EXPIRED);
                } else {
                    let interval = timer.interval.get(&**lock);
                    timer.remaining.replace(&mut **lock, interval);
                }
            }
        }

        let Some(t) = pending else { break };

        // Safety: a retired one-shot stays alive at least until its
        // callback has run; the arming code guarantees it
        let timer = unsafe { t.as_ref() };
        let (callback, owner, data) = {
            let lock = &mut guard.borrow_mut();
            (
                timer.callback.get(&**lock),
                timer.owner.get(&**lock),
                timer.data.get(&**lock),
            )
        };

        if let Some(callback) = callback {
            drop(guard);
            // Safety: registered threads are `&'static`
            callback(owner.map(|o| unsafe { o.as_ref() }), data);
            guard = lock_cpu::<Traits>().unwrap_or_else(|_| {
                // Safety: the callback returned with the CPU Lock released
                unsafe { crate::klock::assume_cpu_lock() }
            });
        }
    }
}
