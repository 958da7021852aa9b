use std::collections::{BTreeMap, HashSet};
use std::sync::{mpsc, Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use smallvec::SmallVec;

use crate::engine::EngineCore;
use crate::interp::BoundCallback;
use crate::page::WindowId;

pub(crate) const STOP_GRACE: Duration = Duration::from_millis(500);

/// Handle to one scheduled background job, unique within its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub(crate) u64);

impl JobId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

pub(crate) struct Job {
    pub(crate) id: JobId,
    pub(crate) callback: BoundCallback,
    pub(crate) interval: Option<Duration>,
}

struct SchedState {
    // keyed by fire time, registration order breaking ties
    queue: BTreeMap<(Instant, u64), Job>,
    next_id: u64,
    next_seq: u64,
    in_flight: HashSet<u64>,
    // in-flight ids cancelled mid-run; checked before reschedule
    cancelled: HashSet<u64>,
    stopping: bool,
}

struct SchedulerShared {
    state: Mutex<SchedState>,
    work: Condvar,
}

pub(crate) struct WindowScheduler {
    window: WindowId,
    shared: Arc<SchedulerShared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    done: Mutex<Option<mpsc::Receiver<()>>>,
}

impl WindowScheduler {
    pub(crate) fn spawn(window: WindowId, engine: Weak<EngineCore>) -> Option<Self> {
        let shared = Arc::new(SchedulerShared {
            state: Mutex::new(SchedState {
                queue: BTreeMap::new(),
                next_id: 1,
                next_seq: 0,
                in_flight: HashSet::new(),
                cancelled: HashSet::new(),
                stopping: false,
            }),
            work: Condvar::new(),
        });
        let (done_tx, done_rx) = mpsc::channel();
        let worker_shared = shared.clone();
        let name = format!("petrel-script-{}", window.as_u64());
        match thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(worker_shared, engine, done_tx))
        {
            Ok(handle) => Some(Self {
                window,
                shared,
                worker: Mutex::new(Some(handle)),
                done: Mutex::new(Some(done_rx)),
            }),
            Err(err) => {
                eprintln!("[scheduler] failed to spawn worker for {window}: {err:?}");
                None
            }
        }
    }

    pub(crate) fn enqueue(
        &self,
        callback: BoundCallback,
        delay: Duration,
        interval: Option<Duration>,
    ) -> JobId {
        let id;
        {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            id = JobId(state.next_id);
            state.next_id += 1;
            let seq = state.next_seq;
            state.next_seq += 1;
            let due = Instant::now() + delay;
            state.queue.insert((due, seq), Job { id, callback, interval });
        }
        self.shared.work.notify_all();
        id
    }

    pub(crate) fn cancel(&self, id: JobId) -> bool {
        let removed;
        {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            let before = state.queue.len();
            state.queue.retain(|_, job| job.id != id);
            removed = if state.queue.len() != before {
                true
            } else if state.in_flight.contains(&id.0) {
                state.cancelled.insert(id.0);
                true
            } else {
                false
            };
        }
        self.shared.work.notify_all();
        removed
    }

    pub(crate) fn pending(&self) -> usize {
        let state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.queue.len() + state.in_flight.len()
    }

    pub(crate) fn wait_until_idle(&self, max_wait: Duration) -> usize {
        let deadline = Instant::now() + max_wait;
        let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let pending = state.queue.len() + state.in_flight.len();
            if pending == 0 || state.stopping {
                return pending;
            }
            let now = Instant::now();
            if now >= deadline {
                return pending;
            }
            state = self
                .shared
                .work
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    // callers halt any in-flight evaluation first
    pub(crate) fn stop(&self, grace: Duration) {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.stopping = true;
            state.queue.clear();
        }
        self.shared.work.notify_all();
        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(handle) = handle else { return };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        let done = self.done.lock().unwrap_or_else(PoisonError::into_inner).take();
        let finished = done.map(|rx| rx.recv_timeout(grace).is_ok()).unwrap_or(false);
        if finished {
            let _ = handle.join();
        } else {
            eprintln!("[scheduler] worker for {} did not stop within {:?}", self.window, grace);
        }
    }
}

fn worker_loop(shared: Arc<SchedulerShared>, engine: Weak<EngineCore>, done: mpsc::Sender<()>) {
    loop {
        let mut batch: SmallVec<[Job; 4]> = SmallVec::new();
        {
            let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if state.stopping {
                    drop(state);
                    let _ = done.send(());
                    return;
                }
                let now = Instant::now();
                while state.queue.first_key_value().map(|(&(due, _), _)| due <= now).unwrap_or(false)
                {
                    if let Some((_, job)) = state.queue.pop_first() {
                        batch.push(job);
                    }
                }
                if !batch.is_empty() {
                    state.in_flight.extend(batch.iter().map(|job| job.id.0));
                    break;
                }
                state = match state.queue.first_key_value().map(|(&(due, _), _)| due) {
                    Some(due) => {
                        let wait = due.saturating_duration_since(now);
                        shared
                            .work
                            .wait_timeout(state, wait)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0
                    }
                    None => shared.work.wait(state).unwrap_or_else(PoisonError::into_inner),
                };
            }
        }

        let engine = engine.upgrade();
        for job in batch.drain(..) {
            let reschedule =
                engine.as_ref().map(|core| core.fire_job(&job)).unwrap_or(false);
            let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.in_flight.remove(&job.id.0);
            let cancelled = state.cancelled.remove(&job.id.0);
            if reschedule && !cancelled && !state.stopping {
                if let Some(interval) = job.interval {
                    let due = Instant::now() + interval;
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    state.queue.insert((due, seq), job);
                }
            }
        }
        shared.work.notify_all();
    }
}
