//! Threads: the unit the scheduler multiplexes.
//!
//! A thread is a stack, a saved register context and a pile of scheduler
//! bookkeeping. Guest threads additionally reference the context they run
//! in and, when born from an FTL `invoke`, the task record a completion
//! must be posted for once they are reaped.

pub mod current;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use bitflags::bitflags;
use slab::Slab;

use storpu_abi::errors::Errno;
use storpu_abi::tasks::StorpuTask;

use crate::arch::threading::CpuContext;
use crate::config::{MAX_FREE_STACKS, THREAD_STACK_MIN};
use crate::memory::frame_allocator::{self, ZoneSet};
use crate::memory::paging::PAGE_SIZE;
use crate::scheduler;
use crate::smp::CpuMask;
use crate::sync::Condvar;
use crate::utils::locks::{Mutex, RwLock, SpinLock, mutex, rwlock, spinlock};
use crate::vm::VmContext;
use crate::debug::Threads;
use crate::{VirtAddr, tasks};

/// Thread ID, a unique identifier for a thread.
pub type Tid = u32;

/// Id of the per-cpu bootstrap threads; they live outside the IDR.
pub const MAIN_THREAD: Tid = Tid::MAX;

bitflags! {
    /// Lifecycle state. `RUNNING` is the empty set, matching the state
    /// masks wake-up paths test against.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadState: u32 {
        const BLOCKED = 0x01;
        const EXITING = 0x02;
        const DEAD = 0x04;
        const WAKING = 0x08;
        const REAPABLE = 0x10;
    }
}

impl ThreadState {
    pub const RUNNING: ThreadState = ThreadState::empty();
}

/// `on_rq` values.
pub const ON_RQ_QUEUED: u32 = 1;
pub const ON_RQ_MIGRATING: u32 = 2;

pub type ThreadProc = extern "C" fn(u64) -> u64;

#[derive(Debug, Clone, Copy)]
pub struct ThreadAttr {
    pub stack_size: usize,
    /// Caller-provided stack; not freed on reap.
    pub stack_addr: Option<VirtAddr>,
}

impl Default for ThreadAttr {
    fn default() -> Self {
        Self {
            stack_size: THREAD_STACK_MIN,
            stack_addr: None,
        }
    }
}

/// A runtime-allocated thread stack.
#[derive(Debug)]
pub struct OwnedStack {
    base: VirtAddr,
    size: usize,
}

impl OwnedStack {
    fn allocate(size: usize) -> Option<Self> {
        let base = frame_allocator::alloc_vmpages(size / PAGE_SIZE, ZoneSet::ANY)?;
        Some(Self { base, size })
    }

    pub fn top(&self) -> VirtAddr {
        self.base + self.size
    }
}

impl Drop for OwnedStack {
    fn drop(&mut self) {
        frame_allocator::free_mem(self.base.into_phys(), self.size);
    }
}

/// Data guarded by the pi-lock: the migration descriptor slot. The
/// pointer targets a `SetAffinityPending` on some waiter's stack, kept
/// alive by that waiter blocking on its completion.
pub struct PiState {
    pub(crate) migration_pending: *mut (),
}

unsafe impl Send for PiState {}

pub struct Thread {
    id: Tid,
    attr: ThreadAttr,
    state: AtomicU32,

    /// Saved registers; only the scheduler touches this, from the cpu that
    /// owns the thread at that instant.
    ctx: UnsafeCell<CpuContext>,
    stack: SpinLock<Option<OwnedStack>>,
    vm: SpinLock<Option<Arc<VmContext>>>,
    tls_tcb: AtomicUsize,

    proc: usize,
    arg: u64,
    result: AtomicU64,

    /// The `invoke` task that spawned this thread, if any; reaping posts
    /// its completion.
    task: AtomicPtr<StorpuTask>,

    exit_state: Mutex<bool>,
    exited: Condvar,

    pub(crate) pi_lock: SpinLock<PiState>,
    cpu: AtomicU32,
    wake_cpu: AtomicU32,
    pub(crate) on_cpu: AtomicU32,
    pub(crate) on_rq: AtomicU32,
    pub cpus_mask: CpuMask,
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    fn new(id: Tid, attr: ThreadAttr, proc: usize, arg: u64) -> Self {
        Self {
            id,
            attr,
            state: AtomicU32::new(ThreadState::DEAD.bits()),
            ctx: UnsafeCell::new(CpuContext::zeroed()),
            stack: spinlock(None),
            vm: spinlock(None),
            tls_tcb: AtomicUsize::new(0),
            proc,
            arg,
            result: AtomicU64::new(0),
            task: AtomicPtr::new(core::ptr::null_mut()),
            exit_state: mutex(false),
            exited: Condvar::new(),
            pi_lock: spinlock(PiState {
                migration_pending: core::ptr::null_mut(),
            }),
            cpu: AtomicU32::new(0),
            wake_cpu: AtomicU32::new(0),
            on_cpu: AtomicU32::new(0),
            on_rq: AtomicU32::new(0),
            cpus_mask: CpuMask::empty(),
        }
    }

    pub const fn tid(&self) -> Tid {
        self.id
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_bits_truncate(self.state.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn state_acquire(&self) -> ThreadState {
        ThreadState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    /// Publishes a new state with release ordering, so a waker that
    /// observes it also observes everything written before.
    #[inline]
    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state.bits(), Ordering::Release);
    }

    #[inline]
    pub(crate) fn set_state_relaxed(&self, state: ThreadState) {
        self.state.store(state.bits(), Ordering::Relaxed);
    }

    pub fn is_dead(&self) -> bool {
        self.state().contains(ThreadState::DEAD)
    }

    #[inline]
    pub fn cpu(&self) -> usize {
        self.cpu.load(Ordering::Relaxed) as usize
    }

    #[inline]
    pub fn wake_cpu(&self) -> usize {
        self.wake_cpu.load(Ordering::Relaxed) as usize
    }

    /// Moves the thread's home cpu; callers hold whatever lock the path
    /// requires (pi-lock or the owning run queue lock).
    pub(crate) fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu as u32, Ordering::Release);
        self.wake_cpu.store(cpu as u32, Ordering::Relaxed);
    }

    pub(crate) fn set_wake_cpu(&self, cpu: usize) {
        self.wake_cpu.store(cpu as u32, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn on_rq_queued(&self) -> bool {
        self.on_rq.load(Ordering::Acquire) == ON_RQ_QUEUED
    }

    #[inline]
    pub(crate) fn on_rq_migrating(&self) -> bool {
        self.on_rq.load(Ordering::Relaxed) == ON_RQ_MIGRATING
    }

    pub fn vm_context(&self) -> Option<Arc<VmContext>> {
        self.vm.lock().clone()
    }

    pub fn tls_tcb(&self) -> usize {
        self.tls_tcb.load(Ordering::Relaxed)
    }

    pub fn result(&self) -> u64 {
        self.result.load(Ordering::Relaxed)
    }

    pub(crate) fn task_ptr(&self) -> *mut StorpuTask {
        self.task.load(Ordering::Relaxed)
    }

    /// # Safety
    /// Only the scheduler may use the context record, on the cpu that owns
    /// the thread.
    pub(crate) unsafe fn ctx_ptr(&self) -> *mut CpuContext {
        self.ctx.get()
    }

    /// Drops everything the thread owns, recycling a default-sized stack
    /// into the pool. The thread must not be running.
    fn reset(&self) {
        self.vm.lock().take();

        if self.attr.stack_addr.is_none()
            && let Some(stack) = self.stack.lock().take()
        {
            recycle_stack(stack);
        }

        self.set_state(ThreadState::DEAD);
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("cpu", &self.cpu())
            .finish_non_exhaustive()
    }
}

/// The thread IDR. Reads vastly outnumber writes (every `thread_find`),
/// hence the reader-writer lock.
static THREAD_IDR: RwLock<Slab<Arc<Thread>>> = rwlock(Slab::new());

static FREE_STACKS: SpinLock<Vec<OwnedStack>> = spinlock(Vec::new());

fn recycle_stack(stack: OwnedStack) {
    if stack.size != THREAD_STACK_MIN {
        return; // drop frees it
    }
    let mut pool = FREE_STACKS.lock();
    if pool.len() < MAX_FREE_STACKS {
        pool.push(stack);
    }
}

fn take_stack(size: usize) -> Option<OwnedStack> {
    if size == THREAD_STACK_MIN
        && let Some(stack) = FREE_STACKS.lock().pop()
    {
        return Some(stack);
    }
    OwnedStack::allocate(size)
}

pub fn init() {
    // The IDR and the stack pool are statics; nothing to do yet, the hook
    // stays for symmetry with the other subsystems.
}

pub fn find(tid: Tid) -> Option<Arc<Thread>> {
    if tid == 0 || tid == MAIN_THREAD {
        return None;
    }
    THREAD_IDR.read().get((tid - 1) as usize).cloned()
}

extern "C" fn thread_trampoline() -> ! {
    scheduler::schedule_tail();

    // This stack is torn down without destructors when the thread is
    // reaped, so no Arc may live across the exit call.
    let (proc, arg) = {
        let thread = current::current();
        (thread.proc, thread.arg)
    };

    let proc: ThreadProc = unsafe { core::mem::transmute(proc) };
    let result = proc(arg);

    exit(result)
}

fn init_thread_body(
    thread: &Arc<Thread>,
    vm: Option<Arc<VmContext>>,
    task: *mut StorpuTask,
    cpu: usize,
) -> Result<(), Errno> {
    let mut stack_size = thread.attr.stack_size.max(THREAD_STACK_MIN);
    stack_size = crate::memory::align_up(stack_size, PAGE_SIZE);

    let stack_top = match thread.attr.stack_addr {
        Some(addr) => addr + stack_size,
        None => {
            let stack = take_stack(stack_size).ok_or(Errno::ENOMEM)?;
            let top = stack.top();
            *thread.stack.lock() = Some(stack);
            top
        }
    };

    if let Some(ref ctx) = vm {
        let tcb = crate::vm::exec::allocate_tls(ctx)?;
        thread.tls_tcb.store(tcb, Ordering::Relaxed);
    }

    *thread.vm.lock() = vm;
    thread.task.store(task, Ordering::Relaxed);

    thread.set_cpu(cpu);
    thread.cpus_mask.copy_from(&CpuMask::all());

    crate::arch::threading::init_context(
        unsafe { &mut *thread.ctx.get() },
        stack_top,
        thread_trampoline,
    );

    scheduler::wake_up_new_thread(thread);

    Ok(())
}

/// Creates a thread and queues it on `cpu`'s run queue.
pub fn create_on_cpu(
    vm: Option<Arc<VmContext>>,
    task: *mut StorpuTask,
    attr: Option<ThreadAttr>,
    cpu: usize,
    proc: usize,
    arg: u64,
) -> Result<Arc<Thread>, Errno> {
    if proc == 0 {
        return Err(Errno::EINVAL);
    }

    let mut attr = attr.unwrap_or_default();
    if attr.stack_size < THREAD_STACK_MIN {
        attr = ThreadAttr::default();
    }

    let thread = {
        let mut idr = THREAD_IDR.write();
        let entry = idr.vacant_entry();
        let tid = (entry.key() + 1) as Tid;
        let thread = Arc::new(Thread::new(tid, attr, proc, arg));
        entry.insert(thread.clone());
        thread
    };

    if let Err(err) = init_thread_body(&thread, vm, task, cpu) {
        THREAD_IDR.write().try_remove((thread.id - 1) as usize);
        thread.reset();
        return Err(err);
    }

    Ok(thread)
}

/// Creates a thread homed on the calling cpu.
pub fn create(
    vm: Option<Arc<VmContext>>,
    task: *mut StorpuTask,
    attr: Option<ThreadAttr>,
    proc: usize,
    arg: u64,
) -> Result<Arc<Thread>, Errno> {
    create_on_cpu(vm, task, attr, crate::smp::cpu_id(), proc, arg)
}

/// Registers the calling core's boot context as its main thread and
/// builds its idle thread.
pub fn init_cpu() {
    let cpu = crate::smp::cpu_id();

    let main = Arc::new(Thread::new(MAIN_THREAD, ThreadAttr::default(), 0, 0));
    main.set_state_relaxed(ThreadState::RUNNING);
    main.set_cpu(cpu);
    main.cpus_mask.copy_from(&CpuMask::of(cpu));
    main.on_cpu.store(1, Ordering::Relaxed);

    unsafe {
        crate::arch::threading::set_current_thread(Arc::as_ptr(&main) as usize);
    }

    let idle = Arc::new(Thread::new(
        MAIN_THREAD,
        ThreadAttr {
            stack_size: PAGE_SIZE,
            stack_addr: None,
        },
        scheduler::idle_main as usize,
        cpu as u64,
    ));
    idle.set_state_relaxed(ThreadState::RUNNING);
    idle.set_cpu(cpu);
    idle.cpus_mask.copy_from(&CpuMask::of(cpu));

    let stack = OwnedStack::allocate(PAGE_SIZE).expect("no memory for the idle stack");
    crate::arch::threading::init_context(
        unsafe { &mut *idle.ctx.get() },
        stack.top(),
        idle_trampoline,
    );
    *idle.stack.lock() = Some(stack);

    scheduler::install_cpu_threads(main.clone(), idle);
    scheduler::wake_up_new_thread(&main);

    debug!(Threads, "cpu {cpu} main and idle threads ready");
}

extern "C" fn idle_trampoline() -> ! {
    scheduler::schedule_tail();
    scheduler::idle_main(crate::smp::cpu_id() as u64);
    unreachable!()
}

/// Terminates the calling thread, publishing `result` for joiners or, for
/// task-born threads, marking the record reapable so the scheduler's
/// epilogue posts the completion.
pub fn exit(result: u64) -> ! {
    // Scoped: the dying stack is freed without destructors at reap time,
    // so the reference must not outlive this block.
    {
        let thread = current::current();

        if !thread.state().contains(ThreadState::EXITING) {
            thread.result.store(result, Ordering::Relaxed);

            if !thread.task_ptr().is_null() {
                thread.set_state(ThreadState::REAPABLE);
            } else {
                let mut exited = thread.exit_state.lock();
                *exited = true;
                thread.set_state(ThreadState::EXITING);
                thread.exited.signal();
                drop(exited);
            }
        }
    }

    loop {
        scheduler::schedule();
    }
}

/// Waits for `thread` to exit and returns its result.
pub fn join(thread: &Arc<Thread>, value: Option<&mut u64>) -> Result<(), Errno> {
    let current = current::current();
    if Arc::ptr_eq(thread, &current) {
        return Err(Errno::EDEADLK);
    }

    if thread.is_dead() {
        return Err(Errno::ESRCH);
    }

    let mut exited = thread.exit_state.lock();
    while !*exited {
        thread.exited.wait(&mut exited);
    }
    drop(exited);

    if let Some(value) = value {
        *value = thread.result();
    }

    stop(thread);
    Ok(())
}

/// Retires an exited thread: out of the IDR, resources dropped.
fn stop(thread: &Arc<Thread>) {
    if thread.is_dead() {
        return;
    }

    if !Arc::ptr_eq(thread, &current::current()) {
        THREAD_IDR.write().try_remove((thread.id - 1) as usize);
        thread.reset();
    }
}

/// The thread executing this code right now.
pub fn current() -> Arc<Thread> {
    current::current()
}

/// Called from the scheduler's switch epilogue for a reapable previous
/// thread: posts the invoke completion and retires the record.
pub(crate) fn reap(thread: &Arc<Thread>) {
    debug_assert!(thread.state().contains(ThreadState::REAPABLE));

    let task = thread.task_ptr();
    debug_assert!(!task.is_null());

    unsafe {
        (*task).retval = 0;
        (*task).payload.invoke.result = thread.result();
        tasks::enqueue_storpu_completion(task);
    }

    THREAD_IDR.write().try_remove((thread.id - 1) as usize);
    thread.reset();
}

