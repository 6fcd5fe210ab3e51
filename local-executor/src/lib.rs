//! A single-threaded cooperative executor.
//!
//! This crate provides an [`Executor`] that runs every spawned task on the thread that created
//! it. Tasks interleave only at `.await` points, so state shared between them through `Rc` and
//! `RefCell` is never touched by two tasks at once.
//!
//! Wakers produced by the executor are `Send` and may be invoked from any thread (for example a
//! timer reactor). A wake enqueues the task and unparks the executor thread; the task itself is
//! always polled on the executor thread.
//!
//! # Example
//!
//! ```
//! # use local_executor::Executor;
//! let executor = Executor::new();
//!
//! let task = executor.spawn_local(async {
//!    println!("Hello, world!");
//!    42
//! });
//!
//! assert_eq!(executor.block_on(task), 42);
//! ```

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::pin::{Pin, pin};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};

use async_task::Runnable;

/// Upper bound on runnables polled before the `block_on` future gets another chance to run.
const BUDGET: usize = 64;

/// An executor that runs async tasks on the thread that created it.
///
/// `Executor` is `!Send` and `!Sync`. Cloning it yields another handle to the same run queue.
#[derive(Clone)]
pub struct Executor {
    shared: Arc<Shared>,
    phantom: PhantomData<*mut ()>,
}

struct Shared {
    queue: Mutex<VecDeque<Runnable>>,
    thread: Thread,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<Runnable>> {
        // A poisoned queue only means a task panicked while another thread held the lock; the
        // queue contents are still consistent.
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn schedule(&self, runnable: Runnable) {
        self.queue().push_back(runnable);
        self.thread.unpark();
    }

    fn pop(&self) -> Option<Runnable> {
        self.queue().pop_front()
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("thread", &self.shared.thread.id())
            .field("queued", &self.shared.queue().len())
            .finish()
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    /// Creates a new executor bound to the current thread.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                thread: thread::current(),
            }),
            phantom: PhantomData,
        }
    }

    /// Spawns a new asynchronous task, returning a [`Task`] that can be used to await its result.
    ///
    /// Dropping the `Task` will cancel it. If you want the task to run independently, you must
    /// call [`detach()`][Task::detach]
    pub fn spawn<R>(&self, future: impl Future<Output = R> + Send + 'static) -> Task<R>
    where
        R: Send + 'static,
    {
        let shared = self.shared.clone();
        let (runnable, task) =
            async_task::spawn(future, move |runnable: Runnable| shared.schedule(runnable));
        runnable.schedule();
        Task(TaskState::Spawned(task))
    }

    /// Spawns a `!Send` future on this executor.
    ///
    /// The future is only ever polled on the executor thread. Because `Executor` is `!Send`, the
    /// caller is necessarily on that thread.
    pub fn spawn_local<R>(&self, future: impl Future<Output = R> + 'static) -> Task<R>
    where
        R: 'static,
    {
        let shared = self.shared.clone();
        let (runnable, task) =
            async_task::spawn_local(future, move |runnable: Runnable| shared.schedule(runnable));
        runnable.schedule();
        Task(TaskState::Spawned(task))
    }

    /// Runs queued tasks until none are ready to make progress.
    ///
    /// Returns the number of task polls performed.
    pub fn run_until_stalled(&self) -> usize {
        let mut polls = 0;
        while let Some(runnable) = self.shared.pop() {
            runnable.run();
            polls += 1;
        }
        polls
    }

    /// Drives `future` to completion, running spawned tasks while it is pending.
    ///
    /// The current thread parks whenever neither `future` nor any spawned task can make progress.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let signal = Arc::new(Signal {
            woken: AtomicBool::new(true),
            thread: self.shared.thread.clone(),
        });
        let waker = Waker::from(signal.clone());
        let mut cx = Context::from_waker(&waker);
        let mut future = pin!(future);

        loop {
            if signal.woken.swap(false, Ordering::AcqRel) {
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    return output;
                }
            }

            let mut polls = 0;
            while polls < BUDGET {
                let Some(runnable) = self.shared.pop() else {
                    break;
                };
                runnable.run();
                polls += 1;
            }

            if polls == 0 && !signal.woken.load(Ordering::Acquire) {
                thread::park();
            }
        }
    }
}

struct Signal {
    woken: AtomicBool,
    thread: Thread,
}

impl Wake for Signal {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if !self.woken.swap(true, Ordering::AcqRel) {
            self.thread.unpark();
        }
    }
}

#[derive(Debug)]
enum TaskState<T> {
    Ready(Option<T>),
    Spawned(async_task::Task<T>),
}

/// A future that resolves to the result of an asynchronous task.
///
/// Dropping a [`Task`] cancels it, which means its future won't be polled again. To drop the
/// [`Task`] handle without canceling it, use [`detach()`][`Task::detach()`] instead.
#[derive(Debug)]
pub struct Task<T>(TaskState<T>);

// The output value is only ever moved out, never pinned.
impl<T> Unpin for Task<T> {}

impl<T> Task<T> {
    /// Creates a new task that is already completed with the given value.
    pub fn ready(val: T) -> Self {
        Task(TaskState::Ready(Some(val)))
    }

    /// Detaches the task, allowing it to run in the background.
    pub fn detach(self) {
        match self {
            Task(TaskState::Ready(_)) => (),
            Task(TaskState::Spawned(task)) => task.detach(),
        }
    }

    /// Returns `true` if the task has completed, whether or not its output has been taken.
    pub fn is_finished(&self) -> bool {
        match &self.0 {
            TaskState::Ready(_) => true,
            TaskState::Spawned(task) => task.is_finished(),
        }
    }
}

impl<T> Future for Task<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match &mut self.get_mut().0 {
            TaskState::Ready(val) => match val.take() {
                Some(val) => Poll::Ready(val),
                None => Poll::Pending,
            },
            TaskState::Spawned(task) => Pin::new(task).poll(cx),
        }
    }
}
