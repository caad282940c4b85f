//! # Command dispatching
//!
//! Every service instance processes its state changes on a single worker thread, the
//! [SerialExecutor]. Tasks carry a [TaskOrigin]: tasks issued by the local application are
//! always executed before pending tasks originating from the peer or from the data
//! production, and tasks of the same origin are executed in submission order.
//!
//! Deadlines are handled by the [TimerService], a timer thread with a deadline heap. Timer
//! callbacks should not touch the service state directly but submit a task to the executor
//! of the instance.
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskOrigin {
    FromUser = 0,
    FromProvider = 1,
}

type Task<C> = Box<dyn FnOnce(&mut C) + Send>;

struct QueuedTask<C> {
    origin: TaskOrigin,
    seq: u64,
    task: Task<C>,
}

impl<C> PartialEq for QueuedTask<C> {
    fn eq(&self, other: &Self) -> bool {
        self.origin == other.origin && self.seq == other.seq
    }
}

impl<C> Eq for QueuedTask<C> {}

impl<C> PartialOrd for QueuedTask<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for QueuedTask<C> {
    // Reversed, the max-heap must yield the lowest origin and sequence first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .origin
            .cmp(&self.origin)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TaskQueue<C> {
    heap: BinaryHeap<QueuedTask<C>>,
    next_seq: u64,
    shutdown: bool,
}

struct ExecutorShared<C> {
    queue: Mutex<TaskQueue<C>>,
    available: Condvar,
}

impl<C> ExecutorShared<C> {
    fn submit(&self, origin: TaskOrigin, task: Task<C>) -> bool {
        let mut queue = self.queue.lock();
        if queue.shutdown {
            return false;
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(QueuedTask { origin, seq, task });
        drop(queue);
        self.available.notify_one();
        true
    }
}

/// Cloneable submission handle of a [SerialExecutor].
pub struct ExecutorHandle<C> {
    shared: Arc<ExecutorShared<C>>,
}

impl<C> Clone for ExecutorHandle<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C> ExecutorHandle<C> {
    /// Submit a task. Returns false if the executor was already shut down.
    pub fn submit(&self, origin: TaskOrigin, task: impl FnOnce(&mut C) + Send + 'static) -> bool {
        self.shared.submit(origin, Box::new(task))
    }
}

/// Worker thread which exclusively owns a context and runs the submitted tasks on it.
pub struct SerialExecutor<C> {
    shared: Arc<ExecutorShared<C>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl<C: Send + 'static> SerialExecutor<C> {
    pub fn new(name: &str, context: C) -> std::io::Result<Self> {
        Self::new_with(name, |_| context)
    }

    /// Create the executor with a context which needs a submission handle of its own
    /// executor, for example to queue follow-up tasks from timer callbacks.
    pub fn new_with(
        name: &str,
        make_context: impl FnOnce(ExecutorHandle<C>) -> C,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(ExecutorShared {
            queue: Mutex::new(TaskQueue {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
        });
        let mut context = make_context(ExecutorHandle {
            shared: shared.clone(),
        });
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                let mut queue = worker_shared.queue.lock();
                while queue.heap.is_empty() && !queue.shutdown {
                    worker_shared.available.wait(&mut queue);
                }
                if queue.shutdown {
                    break;
                }
                let Some(next) = queue.heap.pop() else {
                    continue;
                };
                drop(queue);
                (next.task)(&mut context);
            })?;
        let worker_id = worker.thread().id();
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
            worker_id,
        })
    }
}

impl<C> SerialExecutor<C> {
    pub fn handle(&self) -> ExecutorHandle<C> {
        ExecutorHandle {
            shared: self.shared.clone(),
        }
    }

    /// Submit a task. Returns false if the executor was already shut down.
    pub fn submit(&self, origin: TaskOrigin, task: impl FnOnce(&mut C) + Send + 'static) -> bool {
        self.shared.submit(origin, Box::new(task))
    }

    #[inline]
    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.queue.lock().shutdown
    }

    /// Stop the worker. Pending tasks are dropped without being run. The worker thread is
    /// joined unless this is called from a task running on the worker itself.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            queue.heap.clear();
        }
        self.shared.available.notify_all();
        if self.is_worker_thread() {
            return;
        }
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl<C> Drop for SerialExecutor<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct TimerEntry {
    deadline: Instant,
    id: u64,
    callback: Box<dyn FnOnce() + Send>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    pending: HashSet<u64>,
    next_id: u64,
    shutdown: bool,
}

#[derive(Default)]
struct TimerShared {
    state: Mutex<TimerState>,
    changed: Condvar,
}

/// Cloneable scheduling handle of a [TimerService].
#[derive(Clone)]
pub struct TimerHandle {
    shared: Arc<TimerShared>,
}

impl TimerHandle {
    /// Run the callback on the timer thread after the given delay. Returns [None] if the
    /// timer service was already shut down.
    pub fn schedule(
        &self,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> Option<TimerId> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return None;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.pending.insert(id);
        state.heap.push(TimerEntry {
            deadline: Instant::now() + delay,
            id,
            callback: Box::new(callback),
        });
        drop(state);
        self.shared.changed.notify_one();
        Some(TimerId(id))
    }

    /// Cancel a timer. Returns true if the callback had not run yet and now never will.
    pub fn cancel(&self, id: TimerId) -> bool {
        self.shared.state.lock().pending.remove(&id.0)
    }

    #[cfg(test)]
    pub fn pending_timers(&self) -> usize {
        self.shared.state.lock().pending.len()
    }
}

pub struct TimerService {
    handle: TimerHandle,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl TimerService {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let shared = Arc::new(TimerShared::default());
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run(&worker_shared))?;
        let worker_id = worker.thread().id();
        Ok(Self {
            handle: TimerHandle { shared },
            worker: Mutex::new(Some(worker)),
            worker_id,
        })
    }

    fn run(shared: &TimerShared) {
        let mut state = shared.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            let Some(deadline) = state.heap.peek().map(|entry| entry.deadline) else {
                shared.changed.wait(&mut state);
                continue;
            };
            if deadline > Instant::now() {
                shared.changed.wait_until(&mut state, deadline);
                continue;
            }
            let Some(entry) = state.heap.pop() else {
                continue;
            };
            if !state.pending.remove(&entry.id) {
                // cancelled
                continue;
            }
            drop(state);
            (entry.callback)();
            state = shared.state.lock();
        }
    }

    pub fn handle(&self) -> TimerHandle {
        self.handle.clone()
    }

    pub fn schedule(
        &self,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> Option<TimerId> {
        self.handle.schedule(delay, callback)
    }

    pub fn cancel(&self, id: TimerId) -> bool {
        self.handle.cancel(id)
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.handle.shared.state.lock();
            state.shutdown = true;
            state.heap.clear();
            state.pending.clear();
        }
        self.handle.shared.changed.notify_all();
        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
