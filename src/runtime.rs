//! Timers and background work.
//!
//! The session manager never sleeps or spawns directly; it goes through a
//! [`Scheduler`]. [`ThreadScheduler`] backs it with a timer thread, while
//! [`ManualScheduler`] is a fake clock that only moves when told to.

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Identifier of a scheduled timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Source of timers and background execution.
pub trait Scheduler: Send + Sync {
    /// Run `task` once after `delay`.
    fn schedule(&self, delay: Duration, task: Task) -> TimerId;

    /// Cancel a pending timer. Unknown or fired timers are ignored.
    fn cancel(&self, id: TimerId);

    /// Run `task` off the caller's stack.
    fn spawn(&self, task: Task);
}

enum Command {
    Schedule {
        id: u64,
        deadline: Instant,
        task: Task,
    },
    Cancel(u64),
    Shutdown,
}

/// Scheduler backed by a single timer thread.
///
/// Timer tasks run on the timer thread in deadline order; spawned tasks get
/// their own short-lived thread.
pub struct ThreadScheduler {
    commands: Sender<Command>,
    next_id: AtomicU64,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadScheduler {
    /// Starts the timer thread.
    pub fn new() -> Self {
        let (commands, receiver) = unbounded();

        let handle = std::thread::Builder::new()
            .name("hive-realtime-timer".to_string())
            .spawn(move || {
                let mut deadlines: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
                let mut tasks: HashMap<u64, Task> = HashMap::new();

                loop {
                    // Fire everything that is due
                    let now = Instant::now();
                    while let Some(Reverse((deadline, id))) = deadlines.peek().copied() {
                        if deadline > now {
                            break;
                        }
                        deadlines.pop();
                        if let Some(task) = tasks.remove(&id) {
                            task();
                        }
                    }

                    let command = match deadlines.peek() {
                        Some(Reverse((deadline, _))) => {
                            receiver.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                        }
                        None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
                    };

                    match command {
                        Ok(Command::Schedule { id, deadline, task }) => {
                            tasks.insert(id, task);
                            deadlines.push(Reverse((deadline, id)));
                        }
                        Ok(Command::Cancel(id)) => {
                            tasks.remove(&id);
                        }
                        Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                }
            });

        let timer_thread = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(error = %e, "failed to start timer thread");
                None
            }
        };

        Self {
            commands,
            next_id: AtomicU64::new(1),
            timer_thread: Mutex::new(timer_thread),
        }
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + delay;
        if self
            .commands
            .send(Command::Schedule { id, deadline, task })
            .is_err()
        {
            tracing::warn!(timer = id, "timer thread is gone, dropping timer");
        }
        TimerId(id)
    }

    fn cancel(&self, id: TimerId) {
        let _ = self.commands.send(Command::Cancel(id.0));
    }

    fn spawn(&self, task: Task) {
        if let Err(e) = std::thread::Builder::new()
            .name("hive-realtime-worker".to_string())
            .spawn(task)
        {
            tracing::warn!(error = %e, "failed to spawn background task");
        }
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.timer_thread.lock().take() {
            // A timer task may own the last reference to us.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_id: u64,
    timers: BTreeMap<(Duration, u64), Task>,
    deadlines: HashMap<u64, Duration>,
    spawned: VecDeque<Task>,
    history: Vec<Duration>,
}

/// Deterministic scheduler driven by hand.
///
/// Time only moves on [`advance`](ManualScheduler::advance) and spawned work
/// only runs on [`run_spawned`](ManualScheduler::run_spawned).
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    /// Creates a clock at zero with nothing queued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Time elapsed on the fake clock.
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Move the clock forward, firing due timers in deadline order.
    /// Returns the number of timers fired.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.state.lock().now + by;
        let mut fired = 0;

        loop {
            let task = {
                let mut state = self.state.lock();
                let due = state
                    .timers
                    .keys()
                    .next()
                    .copied()
                    .filter(|(deadline, _)| *deadline <= target);
                match due {
                    Some(key) => {
                        state.now = key.0;
                        state.deadlines.remove(&key.1);
                        state.timers.remove(&key)
                    }
                    None => {
                        state.now = target;
                        None
                    }
                }
            };

            match task {
                Some(task) => {
                    task();
                    fired += 1;
                }
                None => return fired,
            }
        }
    }

    /// Run queued background tasks, including ones they queue.
    pub fn run_spawned(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.state.lock().spawned.pop_front();
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Number of spawned tasks waiting for `run_spawned`.
    pub fn spawned_count(&self) -> usize {
        self.state.lock().spawned.len()
    }

    /// Remaining delay of every pending timer, soonest first.
    pub fn pending_timers(&self) -> Vec<Duration> {
        let state = self.state.lock();
        state
            .timers
            .keys()
            .map(|(deadline, _)| deadline.saturating_sub(state.now))
            .collect()
    }

    /// Every delay ever passed to `schedule`, in call order.
    pub fn scheduled_delays(&self) -> Vec<Duration> {
        self.state.lock().history.clone()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TimerId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        let deadline = state.now + delay;
        state.timers.insert((deadline, id), task);
        state.deadlines.insert(id, deadline);
        state.history.push(delay);
        TimerId(id)
    }

    fn cancel(&self, id: TimerId) {
        let mut state = self.state.lock();
        if let Some(deadline) = state.deadlines.remove(&id.0) {
            state.timers.remove(&(deadline, id.0));
        }
    }

    fn spawn(&self, task: Task) {
        self.state.lock().spawned.push_back(task);
    }
}
