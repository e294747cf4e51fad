//! Single-threaded cooperative executors.
//!
//! Every long-lived component of the stack is confined to one [`TaskQueue`]:
//! a dedicated OS thread running a message loop. Tasks run in submission
//! order and never concurrently with each other. Cross-queue communication
//! is by posting closures.

use std::cell::Cell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

use crate::units::TimeDelta;

type Task = Box<dyn FnOnce() + Send + 'static>;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_QUEUE_ID: Cell<u64> = const { Cell::new(0) };
}

struct DelayedTask {
    run_at: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.seq == other.seq
    }
}

impl Eq for DelayedTask {}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the BinaryHeap pops the earliest deadline first;
        // submission order breaks ties.
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    immediate: VecDeque<Task>,
    delayed: BinaryHeap<DelayedTask>,
    next_seq: u64,
    quit: bool,
}

struct Shared {
    id: u64,
    name: String,
    state: Mutex<QueueState>,
    cv: Condvar,
}

struct Inner {
    shared: Arc<Shared>,
    worker_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.quit = true;
        }
        self.shared.cv.notify_all();
        if let Some(handle) = self.worker_thread.lock().unwrap().take() {
            // Joining from the queue's own thread would deadlock; tasks that
            // drop the last handle to their own queue just detach it.
            if CURRENT_QUEUE_ID.with(|id| id.get()) != self.shared.id {
                let _ = handle.join();
            }
        }
    }
}

/// A single-threaded task executor.
///
/// Cloning yields another handle to the same queue. The backing thread stops
/// once the last handle is dropped; queued immediate tasks still run,
/// pending delayed tasks are discarded.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    pub fn new(name: &str) -> Self {
        let shared = Arc::new(Shared {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            state: Mutex::new(QueueState::default()),
            cv: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(worker_shared))
            .expect("spawn task queue thread");
        TaskQueue {
            inner: Arc::new(Inner {
                shared,
                worker_thread: Mutex::new(Some(handle)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.shared.name
    }

    /// True when called from a task running on this queue.
    pub fn is_current(&self) -> bool {
        CURRENT_QUEUE_ID.with(|id| id.get()) == self.inner.shared.id
    }

    /// Appends `task` to the queue.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.shared.state.lock().unwrap();
        if state.quit {
            return;
        }
        state.immediate.push_back(Box::new(task));
        drop(state);
        self.inner.shared.cv.notify_one();
    }

    /// Runs `task` inline when the caller is already on this queue,
    /// otherwise posts it.
    pub fn dispatch(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_current() {
            task();
        } else {
            self.post(task);
        }
    }

    /// Schedules `task` to run at or after `delay` from now. Non-positive
    /// and non-finite delays degrade to an immediate post.
    pub fn post_delayed(&self, delay: TimeDelta, task: impl FnOnce() + Send + 'static) {
        let duration = match delay.to_duration() {
            Some(d) => d,
            None => return self.post(task),
        };
        let run_at = Instant::now() + duration;
        let mut state = self.inner.shared.state.lock().unwrap();
        if state.quit {
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.delayed.push(DelayedTask {
            run_at,
            seq,
            task: Box::new(task),
        });
        drop(state);
        self.inner.shared.cv.notify_one();
    }
}

fn run_loop(shared: Arc<Shared>) {
    CURRENT_QUEUE_ID.with(|id| id.set(shared.id));
    loop {
        let task = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if let Some(task) = state.immediate.pop_front() {
                    break task;
                }
                let now = Instant::now();
                let timeout = match state.delayed.peek() {
                    Some(head) if head.run_at <= now => {
                        let head = state.delayed.pop().unwrap();
                        break head.task;
                    }
                    Some(head) => Some(head.run_at - now),
                    None => None,
                };
                if state.quit {
                    return;
                }
                state = match timeout {
                    Some(wait) => shared.cv.wait_timeout(state, wait).unwrap().0,
                    None => shared.cv.wait(state).unwrap(),
                };
            }
        };
        task();
    }
}

/// Handle to a periodically repeating closure on a task queue.
///
/// The closure returns the delay until its next run; returning
/// [`TimeDelta::ZERO`] stops the repetition. Dropping the handle cancels the
/// next wake-up.
pub struct RepeatingTaskHandle {
    alive: Arc<AtomicBool>,
}

impl RepeatingTaskHandle {
    /// Starts `task` on `queue` after `initial_delay`.
    pub fn start(
        queue: TaskQueue,
        initial_delay: TimeDelta,
        task: impl FnMut() -> TimeDelta + Send + 'static,
    ) -> Self {
        let alive = Arc::new(AtomicBool::new(true));
        schedule(queue, Arc::clone(&alive), Box::new(task), initial_delay);
        RepeatingTaskHandle { alive }
    }

    pub fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

impl Drop for RepeatingTaskHandle {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

fn schedule(
    queue: TaskQueue,
    alive: Arc<AtomicBool>,
    mut task: Box<dyn FnMut() -> TimeDelta + Send>,
    delay: TimeDelta,
) {
    let next_queue = queue.clone();
    let run = move || {
        if !alive.load(Ordering::SeqCst) {
            return;
        }
        let next_delay = task();
        if next_delay.is_zero() {
            alive.store(false, Ordering::SeqCst);
            return;
        }
        schedule(next_queue, alive, task, next_delay);
    };
    if delay <= TimeDelta::ZERO {
        queue.post(run);
    } else {
        queue.post_delayed(delay, run);
    }
}
