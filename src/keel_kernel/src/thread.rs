//! Threads
//!
//! A [`Thread`] is one execution context: a stack, an entry function, a
//! base priority and a (possibly inherited) current priority, plus one
//! dedicated [`Timer`] used for sleeps and blocking-call timeouts.
//!
//! Lifecycle: [`Thread::init`] registers the thread on the stopped list,
//! [`Thread::start`] moves it to its priority's ready list, and
//! [`Thread::stop`] / [`Thread::exit`] take it back out of scheduling.
//! Exactly one list contains the thread at all times except during
//! transitions inside the critical section.
use core::{cell::UnsafeCell, fmt, mem::MaybeUninit};

use crate::{
    kernel::{self, PanicCode},
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    list::{Link, ListNode, Ref},
    sched,
    semaphore::Semaphore,
    threadlist::ListRef,
    timer::{CallbackData, Timer},
    utils::Init,
    KernelTraits, PrioLevel, NUM_PRIORITIES, STACK_FILL_WORD,
    THREAD_QUANTUM_DEFAULT,
};

pub(crate) type ThreadRef<Traits> = Ref<Thread<Traits>>;

/// A thread entry function. The argument is the opaque value passed to
/// [`Thread::init`].
pub type ThreadEntry = fn(usize);

/// Thread state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Registered but not participating in scheduling.
    Stop,
    /// In a ready list. The running thread stays in this state.
    Ready,
    /// In a blocking object's waiter list.
    Blocked,
    /// Out of every kernel list. Also the state of a never-initialized
    /// thread object.
    Exit,
}

impl Init for ThreadState {
    const INIT: Self = Self::Exit;
}

/// The memory a thread executes on. Allocate in `static` storage and pass
/// to [`Thread::init`].
pub struct Stack<const N: usize> {
    storage: UnsafeCell<[MaybeUninit<usize>; N]>,
}

// Safety: the buffer is only touched by the owning thread's execution and
// by kernel code holding the CPU Lock (fill, slack scan).
unsafe impl<const N: usize> Sync for Stack<N> {}

impl<const N: usize> Stack<N> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            storage: UnsafeCell::new([MaybeUninit::uninit(); N]),
        }
    }

    /// Stack size in machine words.
    pub const fn len_words(&self) -> usize {
        N
    }

    fn region(&self) -> StackRegion {
        StackRegion {
            ptr: self.storage.get() as *mut usize,
            words: N,
        }
    }
}

/// Raw view of a thread's stack buffer.
#[derive(Clone, Copy)]
pub(crate) struct StackRegion {
    pub(crate) ptr: *mut usize,
    pub(crate) words: usize,
}

// Safety: the address is only dereferenced under the CPU Lock on the
// single core this kernel manages.
unsafe impl Send for StackRegion {}

impl fmt::Debug for StackRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StackRegion")
            .field("ptr", &self.ptr)
            .field("words", &self.words)
            .finish()
    }
}

/// A thread control block.
///
/// Allocate in `static` storage; all mutable state is interior, behind
/// the CPU Lock.
#[repr(C)]
pub struct Thread<Traits: KernelTraits> {
    /// Port-defined per-thread state (the saved stack-top pointer lives
    /// here). First field, so the port's context-switch handler can reach
    /// it without offset arithmetic.
    pub port_state: Traits::PortThreadState,

    link: Link<Traits, Self>,

    state: CpuLockCell<Traits, ThreadState>,
    base_priority: CpuLockCell<Traits, PrioLevel>,
    cur_priority: CpuLockCell<Traits, PrioLevel>,

    entry: CpuLockCell<Traits, Option<ThreadEntry>>,
    arg: CpuLockCell<Traits, usize>,
    stack: CpuLockCell<Traits, Option<StackRegion>>,

    /// The list currently containing this thread (a ready list, the
    /// stopped list, or a blocking object's waiter list).
    current_list: CpuLockCell<Traits, Option<ListRef<Traits>>>,

    /// The ready list owning this thread by priority.
    owner_list: CpuLockCell<Traits, Option<ListRef<Traits>>>,

    /// Dedicated timer for sleeps and blocking-call timeouts.
    timer: Timer<Traits>,

    /// Set when a timed blocking call gave up before being satisfied.
    expired: CpuLockCell<Traits, bool>,

    #[cfg(feature = "event-flags")]
    event_mask: CpuLockCell<Traits, u16>,
    #[cfg(feature = "event-flags")]
    event_mode: CpuLockCell<Traits, crate::eventflag::EventFlagMode>,

    id: CpuLockCell<Traits, u8>,

    #[cfg(feature = "named-threads")]
    name: CpuLockCell<Traits, Option<&'static str>>,

    #[cfg(feature = "round-robin")]
    quantum: CpuLockCell<Traits, u32>,

    initialized: CpuLockCell<Traits, bool>,
}

impl<Traits: KernelTraits> ListNode<Traits> for Thread<Traits> {
    fn link(&self) -> &Link<Traits, Self> {
        &self.link
    }
}

impl<Traits: KernelTraits> Init for Thread<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> Thread<Traits> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            port_state: Init::INIT,
            link: Init::INIT,
            state: Init::INIT,
            base_priority: Init::INIT,
            cur_priority: Init::INIT,
            entry: Init::INIT,
            arg: Init::INIT,
            stack: Init::INIT,
            current_list: Init::INIT,
            owner_list: Init::INIT,
            timer: Timer::new(),
            expired: Init::INIT,
            #[cfg(feature = "event-flags")]
            event_mask: Init::INIT,
            #[cfg(feature = "event-flags")]
            event_mode: Init::INIT,
            id: Init::INIT,
            #[cfg(feature = "named-threads")]
            name: Init::INIT,
            #[cfg(feature = "round-robin")]
            quantum: CpuLockCell::new(THREAD_QUANTUM_DEFAULT),
            initialized: Init::INIT,
        }
    }
}

impl<Traits: KernelTraits> Thread<Traits> {
    /// Initialize the thread: fill the stack, have the port write the
    /// synthetic first frame, and place the thread on the stopped list.
    pub fn init<const N: usize>(
        &'static self,
        stack: &'static Stack<N>,
        priority: PrioLevel,
        entry: ThreadEntry,
        arg: usize,
    ) {
        assert!(usize::from(priority) < NUM_PRIORITIES);

        let region = stack.region();

        // Fill the whole buffer with the slack pattern before the port
        // writes the first frame over part of it.
        for i in 0..region.words {
            // Safety: `i` is within the stack buffer
            unsafe { region.ptr.add(i).write(STACK_FILL_WORD) };
        }

        // Safety: no CPU Lock needed, the thread is not registered yet
        unsafe { Traits::init_stack(&self.port_state, region.ptr, region.words, entry, arg) };

        let mut guard = lock_cpu::<Traits>().expect("thread init inside a critical section");
        {
            let lock = &mut guard.borrow_mut();
            let state = Traits::state();
            debug_assert!(
                state.kernel_initialized.get(&**lock),
                "Kernel::init must run before Thread::init"
            );

            // Re-initialization of a stopped thread: take it off the
            // stopped list before re-registering.
            if self.state.get(&**lock) == ThreadState::Stop {
                state.sched.stop_list.remove(lock, self);
            }
            debug_assert!(self.current_list.get(&**lock).is_none());

            let id = state.next_thread_id.get(&**lock);
            state.next_thread_id.replace(&mut **lock, id.wrapping_add(1));
            self.id.replace(&mut **lock, id);

            self.stack.replace(&mut **lock, Some(region));
            self.base_priority.replace(&mut **lock, priority);
            self.cur_priority.replace(&mut **lock, priority);
            self.entry.replace(&mut **lock, Some(entry));
            self.arg.replace(&mut **lock, arg);
            self.expired.replace(&mut **lock, false);
            #[cfg(feature = "named-threads")]
            self.name.replace(&mut **lock, None);
            #[cfg(feature = "round-robin")]
            self.quantum.replace(&mut **lock, THREAD_QUANTUM_DEFAULT);

            self.timer.init_locked(lock);
            self.timer.set_owner_locked(lock, Some(Ref::new(self)));

            self.owner_list.replace(
                &mut **lock,
                Some(Ref::new(sched::ready_list::<Traits>(priority))),
            );
            self.state.replace(&mut **lock, ThreadState::Stop);
            state.sched.stop_list.add(lock, self);
            self.initialized.replace(&mut **lock, true);
        }
        drop(guard);

        if let Some(callout) = kernel::thread_create_callout::<Traits>() {
            callout(self);
        }
    }

    /// Move the thread from the stopped list to its priority's ready
    /// list. Yields if the started thread does not rank below the running
    /// one.
    pub fn start(&'static self) {
        let mut guard = lock_cpu::<Traits>().expect("thread start inside a critical section");
        let lock = &mut guard.borrow_mut();
        debug_assert!(self.initialized.get(&**lock));

        if self.state.get(&**lock) != ThreadState::Stop {
            return;
        }

        let state = Traits::state();
        state.sched.stop_list.remove(lock, self);
        sched::add(lock, self);
        let prio = self.base_priority.get(&**lock);
        self.owner_list
            .replace(&mut **lock, Some(Ref::new(sched::ready_list::<Traits>(prio))));
        self.state.replace(&mut **lock, ThreadState::Ready);

        if kernel::is_started::<Traits>() {
            if let Some(cur) = sched::current_ref(lock) {
                // Safety: registered threads are `&'static`
                let cur_prio = unsafe { cur.as_ref() }.effective_priority(lock);
                if self.effective_priority(lock) >= cur_prio {
                    sched::yield_locked(lock);
                }
            }
        }
    }

    /// Return the thread to the stopped list, cancelling its timer. A
    /// thread stopping itself yields.
    pub fn stop(&'static self) {
        let mut guard = lock_cpu::<Traits>().expect("thread stop inside a critical section");
        let lock = &mut guard.borrow_mut();
        debug_assert!(self.initialized.get(&**lock));

        match self.state.get(&**lock) {
            ThreadState::Stop | ThreadState::Exit => return,
            ThreadState::Ready | ThreadState::Blocked => {}
        }

        let is_current = sched::current_ref(lock) == Some(Ref::new(self));
        #[cfg(feature = "round-robin")]
        if is_current {
            crate::quantum::cancel(lock);
        }

        if let Some(list) = self.current_list.get(&**lock) {
            // Safety: the containing list outlives the membership
            unsafe { list.as_ref() }.remove(lock, self);
        }

        let state = Traits::state();
        state.sched.stop_list.add(lock, self);
        self.owner_list
            .replace(&mut **lock, Some(Ref::new(&state.sched.stop_list)));
        self.state.replace(&mut **lock, ThreadState::Stop);

        self.timer.stop_locked(lock);

        if is_current {
            sched::yield_locked(lock);
        }
    }

    /// Remove the thread from every kernel list and forfeit its priority,
    /// so that interrupt-driven priority comparisons never select it
    /// again. A thread exiting itself yields.
    pub fn exit(&'static self) {
        let mut guard = lock_cpu::<Traits>().expect("thread exit inside a critical section");
        let is_current;
        {
            let lock = &mut guard.borrow_mut();
            debug_assert!(self.initialized.get(&**lock));

            if self.state.get(&**lock) == ThreadState::Exit {
                return;
            }

            is_current = sched::current_ref(lock) == Some(Ref::new(self));
            #[cfg(feature = "round-robin")]
            if is_current {
                crate::quantum::cancel(lock);
            }

            if let Some(list) = self.current_list.get(&**lock) {
                // Safety: the containing list outlives the membership
                unsafe { list.as_ref() }.remove(lock, self);
            }

            self.owner_list.replace(&mut **lock, None);
            self.state.replace(&mut **lock, ThreadState::Exit);
            self.base_priority.replace(&mut **lock, 0);
            self.cur_priority.replace(&mut **lock, 0);

            self.timer.stop_locked(lock);
        }
        drop(guard);

        if let Some(callout) = kernel::thread_exit_callout::<Traits>() {
            callout(self);
        }

        if is_current {
            sched::yield_now::<Traits>();
        }
    }

    /// Reassign both priorities, repositioning the thread in whatever
    /// list it currently inhabits. Yields when this invalidates the
    /// running thread's primacy.
    pub fn set_priority(&'static self, priority: PrioLevel) {
        assert!(usize::from(priority) < NUM_PRIORITIES);
        let mut guard = lock_cpu::<Traits>().expect("priority change inside a critical section");
        let lock = &mut guard.borrow_mut();
        debug_assert!(self.initialized.get(&**lock));

        let state = self.state.get(&**lock);
        let is_current = sched::current_ref(lock) == Some(Ref::new(self));
        let mut resched = is_current;
        if !resched {
            if let Some(cur) = sched::current_ref(lock) {
                // Safety: registered threads are `&'static`
                resched = priority > unsafe { cur.as_ref() }.effective_priority(lock);
            }
        }

        match state {
            ThreadState::Ready => {
                if let Some(list) = self.current_list.get(&**lock) {
                    // Safety: the containing list outlives the membership
                    unsafe { list.as_ref() }.remove(lock, self);
                }
                self.base_priority.replace(&mut **lock, priority);
                self.cur_priority.replace(&mut **lock, priority);
                sched::add(lock, self);
                self.owner_list.replace(
                    &mut **lock,
                    Some(Ref::new(sched::ready_list::<Traits>(priority))),
                );
            }
            ThreadState::Blocked => {
                let list = self.current_list.get(&**lock).unwrap();
                self.base_priority.replace(&mut **lock, priority);
                self.cur_priority.replace(&mut **lock, priority);
                // Reposition within the waiter queue
                // Safety: the containing list outlives the membership
                unsafe {
                    list.as_ref().remove(lock, self);
                    list.as_ref().add_priority(lock, self);
                }
            }
            ThreadState::Stop | ThreadState::Exit => {
                self.base_priority.replace(&mut **lock, priority);
                self.cur_priority.replace(&mut **lock, priority);
            }
        }

        if resched && state == ThreadState::Ready {
            sched::yield_locked(lock);
        }
    }

    /// Transiently raise (or restore) the thread's current priority
    /// without touching the base priority, migrating it to the matching
    /// list position. Used by the mutex priority-inheritance protocol.
    pub(crate) fn inherit_priority(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        priority: PrioLevel,
    ) {
        match self.state.get(&**lock) {
            ThreadState::Ready => {
                if let Some(list) = self.current_list.get(&**lock) {
                    // Safety: the containing list outlives the membership
                    unsafe { list.as_ref() }.remove(lock, self);
                }
                self.cur_priority.replace(&mut **lock, priority);
                let list = sched::ready_list::<Traits>(priority);
                list.add(lock, self);
                self.owner_list.replace(&mut **lock, Some(Ref::new(list)));
            }
            ThreadState::Blocked => {
                let list = self.current_list.get(&**lock).unwrap();
                self.cur_priority.replace(&mut **lock, priority);
                // Safety: the containing list outlives the membership
                unsafe {
                    list.as_ref().remove(lock, self);
                    list.as_ref().add_priority(lock, self);
                }
            }
            ThreadState::Stop | ThreadState::Exit => {
                self.cur_priority.replace(&mut **lock, priority);
            }
        }
    }

    /// Report unused stack depth in bytes by bisecting for the end of the
    /// fill pattern. Approximate, but monotone enough for a guard check.
    pub fn stack_slack(&self) -> usize {
        let mut guard = lock_cpu::<Traits>().expect("stack scan inside a critical section");
        self.stack_slack_locked(&mut guard.borrow_mut())
    }

    pub(crate) fn stack_slack_locked(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) -> usize {
        let region = match self.stack.get(&**lock) {
            Some(region) => region,
            None => return 0,
        };

        let mut bottom = 0usize;
        let mut top = region.words - 1;
        let mut mid = (top + bottom + 1) / 2;
        while top - bottom > 1 {
            // Safety: `mid` is within the buffer, which `init` filled
            let word = unsafe { region.ptr.add(mid).read() };
            if word != STACK_FILL_WORD {
                top = mid;
            } else {
                bottom = mid;
            }
            mid = (top + bottom + 1) / 2;
        }
        mid * core::mem::size_of::<usize>()
    }

    pub fn state(&self) -> ThreadState {
        let mut guard = lock_cpu::<Traits>().expect("state read inside a critical section");
        let lock = guard.borrow_mut();
        self.state.get(&*lock)
    }

    /// The thread's base priority.
    pub fn priority(&self) -> PrioLevel {
        let mut guard = lock_cpu::<Traits>().expect("priority read inside a critical section");
        let lock = guard.borrow_mut();
        self.base_priority.get(&*lock)
    }

    /// The thread's current, possibly inherited, priority.
    pub fn current_priority(&self) -> PrioLevel {
        let mut guard = lock_cpu::<Traits>().expect("priority read inside a critical section");
        let lock = guard.borrow_mut();
        self.cur_priority.get(&*lock)
    }

    pub fn id(&self) -> u8 {
        let mut guard = lock_cpu::<Traits>().expect("id read inside a critical section");
        let lock = guard.borrow_mut();
        self.id.get(&*lock)
    }

    /// Whether the thread's last timed blocking call gave up before its
    /// condition was satisfied.
    pub fn expired(&self) -> bool {
        let mut guard = lock_cpu::<Traits>().expect("flag read inside a critical section");
        let lock = guard.borrow_mut();
        self.expired.get(&*lock)
    }

    /// The bits that satisfied (or were requested by) the thread's last
    /// event flag wait.
    #[cfg(feature = "event-flags")]
    pub fn event_mask(&self) -> u16 {
        let mut guard = lock_cpu::<Traits>().expect("flag read inside a critical section");
        let lock = guard.borrow_mut();
        self.event_mask.get(&*lock)
    }

    #[cfg(feature = "named-threads")]
    pub fn set_name(&self, name: &'static str) {
        let mut guard = lock_cpu::<Traits>().expect("rename inside a critical section");
        let mut lock = guard.borrow_mut();
        self.name.replace(&mut *lock, Some(name));
    }

    #[cfg(feature = "named-threads")]
    pub fn name(&self) -> Option<&'static str> {
        let mut guard = lock_cpu::<Traits>().expect("name read inside a critical section");
        let lock = guard.borrow_mut();
        self.name.get(&*lock)
    }

    /// Set the round-robin quantum, in milliseconds, granted to this
    /// thread before the ready list rotates past it.
    #[cfg(feature = "round-robin")]
    pub fn set_quantum(&self, quantum_ms: u32) {
        let mut guard = lock_cpu::<Traits>().expect("quantum change inside a critical section");
        let mut lock = guard.borrow_mut();
        self.quantum.replace(&mut *lock, quantum_ms.max(1));
    }

    // Accessors used by the rest of the kernel, all under the CPU Lock.

    pub(crate) fn state_locked(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) -> ThreadState {
        self.state.get(&**lock)
    }

    pub(crate) fn set_state_locked(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        state: ThreadState,
    ) {
        self.state.replace(&mut **lock, state);
    }

    pub(crate) fn base_priority_locked(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) -> PrioLevel {
        self.base_priority.get(&**lock)
    }

    pub(crate) fn effective_priority(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) -> PrioLevel {
        self.cur_priority.get(&**lock)
    }

    pub(crate) fn id_locked(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) -> u8 {
        self.id.get(&**lock)
    }

    pub(crate) fn set_current_list(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        list: Option<ListRef<Traits>>,
    ) {
        self.current_list.replace(&mut **lock, list);
    }

    pub(crate) fn current_list(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<ListRef<Traits>> {
        self.current_list.get(&**lock)
    }

    pub(crate) fn expired_locked(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.expired.get(&**lock)
    }

    pub(crate) fn set_expired_locked(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        expired: bool,
    ) {
        self.expired.replace(&mut **lock, expired);
    }

    #[cfg(feature = "round-robin")]
    pub(crate) fn quantum_locked(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) -> u32 {
        self.quantum.get(&**lock)
    }

    #[cfg(feature = "event-flags")]
    pub(crate) fn event_mask_locked(&self, lock: &mut CpuLockTokenRefMut<'_, Traits>) -> u16 {
        self.event_mask.get(&**lock)
    }

    #[cfg(feature = "event-flags")]
    pub(crate) fn set_event_mask_locked(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        mask: u16,
    ) {
        self.event_mask.replace(&mut **lock, mask);
    }

    #[cfg(feature = "event-flags")]
    pub(crate) fn event_mode_locked(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
    ) -> crate::eventflag::EventFlagMode {
        self.event_mode.get(&**lock)
    }

    #[cfg(feature = "event-flags")]
    pub(crate) fn set_event_mode_locked(
        &self,
        lock: &mut CpuLockTokenRefMut<'_, Traits>,
        mode: crate::eventflag::EventFlagMode,
    ) {
        self.event_mode.replace(&mut **lock, mode);
    }

    pub(crate) fn timer(&self) -> &Timer<Traits> {
        &self.timer
    }
}

impl<Traits: KernelTraits> Drop for Thread<Traits> {
    fn drop(&mut self) {
        let Ok(mut guard) = lock_cpu::<Traits>() else {
            return;
        };
        let lock = &mut guard.borrow_mut();
        match self.state.get(&**lock) {
            ThreadState::Exit => {}
            ThreadState::Stop if self.initialized.get(&**lock) => {
                Traits::state().sched.stop_list.remove(lock, self);
                self.state.replace(&mut **lock, ThreadState::Exit);
            }
            ThreadState::Stop => {}
            _ => {
                kernel::panic::<Traits>(PanicCode::RunningThreadDescoped);
            }
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for Thread<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Thread")
            .field("self", &(self as *const _))
            .field("id", &self.id)
            .field("state", &self.state)
            .field("base_priority", &self.base_priority)
            .field("cur_priority", &self.cur_priority)
            .field(
                "current_list",
                &self.current_list.debug_fmt_with(|x, f| x.fmt(f)),
            )
            .finish()
    }
}

/// Suspend the calling thread for `ms` milliseconds: a one-shot timer
/// posts a private binary semaphore the thread pends on.
pub fn sleep<Traits: KernelTraits>(ms: u32) {
    debug_assert!(!Traits::is_interrupt_context());

    let sem = Semaphore::<Traits>::new();
    sem.init(0, 1);

    {
        let mut guard = lock_cpu::<Traits>().expect("sleep inside a critical section");
        let lock = &mut guard.borrow_mut();
        let cur = sched::current_ref(lock).expect("sleep before the kernel started");
        // Safety: registered threads are `&'static`
        let cur = unsafe { cur.as_ref() };
        cur.timer.start_locked(
            lock,
            true,
            ms,
            0,
            sleep_timeout::<Traits>,
            CallbackData::new(&sem as *const Semaphore<Traits> as *mut ()),
        );
    }

    sem.pend();
}

fn sleep_timeout<Traits: KernelTraits>(_owner: Option<&'static Thread<Traits>>, data: CallbackData) {
    // Safety: the sleeping thread keeps the semaphore alive until its
    // pend completes, and the timer fires at most once
    let sem = unsafe { &*(data.get() as *const Semaphore<Traits>) };
    sem.post();
}
