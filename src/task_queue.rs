//! Thread-safe hybrid task queue feeding a worker's event loop.
//!
//! Two containers under one monitor: a FIFO for immediate tasks (host
//! messages, staged evals) and a min-heap keyed on deadline for delayed
//! tasks (timers). At any wake, an immediate task wins; otherwise the
//! earliest delayed task runs once its deadline has passed. Timer tasks
//! can be cancelled lazily by id: cancelled entries are skipped on
//! dequeue without waking anyone.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

/// What a dequeued task asks the worker thread to do. Everything crossing
/// this queue is engine-free (bytes, source text, ids), never engine
/// handles, which are confined to the worker thread.
#[derive(Debug)]
pub(crate) enum TaskWork {
    /// Decode a structured-clone payload and dispatch it to the script's
    /// message handlers.
    Message(Vec<u8>),
    /// Evaluate source text and hand the coerced result back through the
    /// reply slot a host thread is blocked on.
    Eval {
        source: String,
        reply: std::sync::Arc<EvalReply>,
    },
    /// Fire the timer callback registered on the worker thread under this
    /// id, rescheduling it if it repeats.
    Timer { timer_id: u64 },
}

#[derive(Debug)]
pub(crate) struct Task {
    pub id: u64,
    pub work: TaskWork,
}

impl Task {
    fn timer_id(&self) -> Option<u64> {
        match self.work {
            TaskWork::Timer { timer_id } => Some(timer_id),
            _ => None,
        }
    }
}

/// One-shot rendezvous between a host thread waiting on an eval result and
/// the worker thread that produces it.
#[derive(Debug, Default)]
pub(crate) struct EvalReply {
    result: Mutex<Option<Result<String, String>>>,
    cv: Condvar,
}

impl EvalReply {
    pub fn complete(&self, outcome: Result<String, String>) {
        let mut slot = self.result.lock().unwrap();
        *slot = Some(outcome);
        self.cv.notify_all();
    }

    /// Block until the worker completes the eval, re-checking `alive`
    /// periodically so a terminated worker cannot strand the caller.
    pub fn wait(&self, alive: impl Fn() -> bool) -> Option<Result<String, String>> {
        let mut slot = self.result.lock().unwrap();
        loop {
            if let Some(outcome) = slot.take() {
                return Some(outcome);
            }
            if !alive() {
                return None;
            }
            let (guard, _timeout) = self
                .cv
                .wait_timeout(slot, Duration::from_millis(50))
                .unwrap();
            slot = guard;
        }
    }
}

/// Delayed-heap entry. Reverse ordering turns `BinaryHeap` into a
/// min-heap: earliest deadline first, enqueue order breaking ties.
struct DelayedEntry {
    deadline: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    immediate: VecDeque<Task>,
    delayed: BinaryHeap<DelayedEntry>,
    cancelled: HashSet<u64>,
    next_seq: u64,
    shutdown: bool,
}

impl QueueState {
    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Thread-safe immediate/delayed task queue.
#[derive(Default)]
pub(crate) struct TaskQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a task to run as soon as the consumer is free.
    pub fn enqueue(&self, task: Task) {
        {
            let mut state = self.state.lock().unwrap();
            state.immediate.push_back(task);
        }
        self.cv.notify_one();
    }

    /// Queue a task to run no earlier than `delay` from now.
    pub fn enqueue_delayed(&self, task: Task, delay: Duration) {
        {
            let mut state = self.state.lock().unwrap();
            let seq = state.next_seq();
            state.delayed.push(DelayedEntry {
                deadline: Instant::now() + delay,
                seq,
                task,
            });
        }
        self.cv.notify_one();
    }

    /// Lazily cancel a pending timer task. Idempotent; the entry is
    /// discarded the next time dequeue reaches it.
    pub fn cancel(&self, timer_id: u64) {
        let mut state = self.state.lock().unwrap();
        state.cancelled.insert(timer_id);
    }

    /// Block until a task is runnable, the queue shuts down, or `max_wait`
    /// elapses. Immediate tasks are preferred over due delayed tasks.
    /// Cancelled timer tasks are skipped without counting against the
    /// wait.
    pub fn dequeue(&self, max_wait: Duration) -> Option<Task> {
        let mut state = self.state.lock().unwrap();
        let wait_deadline = Instant::now().checked_add(max_wait);

        loop {
            if state.shutdown {
                return None;
            }

            if let Some(task) = state.immediate.pop_front() {
                return Some(task);
            }

            let now = Instant::now();
            loop {
                enum HeapAction {
                    Take,
                    Discard(u64),
                    Stop,
                }
                let action = match state.delayed.peek() {
                    None => HeapAction::Stop,
                    Some(entry) => match entry.task.timer_id() {
                        Some(timer_id) if state.cancelled.contains(&timer_id) => {
                            HeapAction::Discard(timer_id)
                        }
                        _ if entry.deadline <= now => HeapAction::Take,
                        _ => HeapAction::Stop,
                    },
                };
                match action {
                    HeapAction::Take => {
                        return state.delayed.pop().map(|entry| entry.task);
                    }
                    HeapAction::Discard(timer_id) => {
                        state.delayed.pop();
                        state.cancelled.remove(&timer_id);
                    }
                    HeapAction::Stop => break,
                }
            }

            if let Some(deadline) = wait_deadline {
                if now >= deadline {
                    return None;
                }
            }

            // Sleep until the overall deadline or the next timer, whichever
            // comes first; an enqueue signals the condvar either way.
            let mut wait = wait_deadline.map(|deadline| deadline - now);
            if let Some(entry) = state.delayed.peek() {
                let until_due = entry.deadline.saturating_duration_since(now);
                wait = Some(wait.map_or(until_due, |w| w.min(until_due)));
            }
            state = match wait {
                Some(duration) => self.cv.wait_timeout(state, duration).unwrap().0,
                None => self.cv.wait(state).unwrap(),
            };
        }
    }

    /// Time until something is runnable: zero when an immediate or due
    /// delayed task exists, the delta to the earliest timer otherwise, and
    /// `Duration::MAX` when both containers are empty.
    pub fn time_until_next(&self) -> Duration {
        let state = self.state.lock().unwrap();
        if !state.immediate.is_empty() {
            return Duration::ZERO;
        }
        if let Some(entry) = state.delayed.peek() {
            return entry.deadline.saturating_duration_since(Instant::now());
        }
        Duration::MAX
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.immediate.is_empty() && state.delayed.is_empty()
    }

    /// Wake every waiter; all subsequent dequeues return `None`.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.shutdown = true;
            trace!(
                pending_immediate = state.immediate.len(),
                pending_delayed = state.delayed.len(),
                "task queue shut down"
            );
        }
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn message(id: u64) -> Task {
        Task {
            id,
            work: TaskWork::Message(vec![id as u8]),
        }
    }

    fn timer(timer_id: u64) -> Task {
        Task {
            id: timer_id,
            work: TaskWork::Timer { timer_id },
        }
    }

    #[test]
    fn immediate_tasks_come_out_in_fifo_order() {
        let queue = TaskQueue::new();
        queue.enqueue(message(1));
        queue.enqueue(message(2));
        queue.enqueue(message(3));

        for expected in 1..=3 {
            let task = queue.dequeue(Duration::from_millis(100)).unwrap();
            assert_eq!(task.id, expected);
        }
    }

    #[test]
    fn delayed_tasks_come_out_by_deadline() {
        let queue = TaskQueue::new();
        queue.enqueue_delayed(timer(1), Duration::from_millis(60));
        queue.enqueue_delayed(timer(2), Duration::from_millis(10));

        let first = queue.dequeue(Duration::from_millis(500)).unwrap();
        assert_eq!(first.id, 2);
        let second = queue.dequeue(Duration::from_millis(500)).unwrap();
        assert_eq!(second.id, 1);
    }

    #[test]
    fn same_deadline_preserves_enqueue_order() {
        let queue = TaskQueue::new();
        queue.enqueue_delayed(timer(1), Duration::ZERO);
        queue.enqueue_delayed(timer(2), Duration::ZERO);
        queue.enqueue_delayed(timer(3), Duration::ZERO);

        for expected in 1..=3 {
            let task = queue.dequeue(Duration::from_millis(100)).unwrap();
            assert_eq!(task.id, expected);
        }
    }

    #[test]
    fn immediate_wins_over_due_delayed() {
        let queue = TaskQueue::new();
        queue.enqueue_delayed(timer(1), Duration::ZERO);
        queue.enqueue(message(2));

        let first = queue.dequeue(Duration::from_millis(100)).unwrap();
        assert_eq!(first.id, 2);
        let second = queue.dequeue(Duration::from_millis(100)).unwrap();
        assert_eq!(second.id, 1);
    }

    #[test]
    fn delayed_task_does_not_fire_early() {
        let queue = TaskQueue::new();
        let start = Instant::now();
        queue.enqueue_delayed(timer(1), Duration::from_millis(50));

        let task = queue.dequeue(Duration::from_millis(500)).unwrap();
        assert_eq!(task.id, 1);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn dequeue_times_out_when_nothing_is_due() {
        let queue = TaskQueue::new();
        assert!(queue.dequeue(Duration::from_millis(20)).is_none());

        queue.enqueue_delayed(timer(1), Duration::from_secs(60));
        assert!(queue.dequeue(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn cancelled_timer_is_skipped() {
        let queue = TaskQueue::new();
        queue.enqueue_delayed(timer(7), Duration::ZERO);
        queue.cancel(7);
        assert!(queue.dequeue(Duration::from_millis(20)).is_none());

        // Cancellation is idempotent and scoped to timers.
        queue.cancel(7);
        queue.enqueue(message(7));
        assert!(queue.dequeue(Duration::from_millis(100)).is_some());
    }

    #[test]
    fn time_until_next_reflects_queue_contents() {
        let queue = TaskQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.time_until_next(), Duration::MAX);

        queue.enqueue_delayed(timer(1), Duration::from_millis(500));
        assert!(!queue.is_empty());
        let delta = queue.time_until_next();
        assert!(delta > Duration::ZERO && delta <= Duration::from_millis(500));

        queue.enqueue(message(2));
        assert_eq!(queue.time_until_next(), Duration::ZERO);
    }

    #[test]
    fn shutdown_wakes_blocked_dequeue() {
        let queue = Arc::new(TaskQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.dequeue(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        queue.shutdown();
        assert!(waiter.join().unwrap().is_none());

        // A shut-down queue never yields tasks again.
        queue.enqueue(message(1));
        assert!(queue.dequeue(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn enqueue_wakes_blocked_dequeue() {
        let queue = Arc::new(TaskQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.dequeue(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        queue.enqueue(message(9));
        let task = waiter.join().unwrap().unwrap();
        assert_eq!(task.id, 9);
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let queue = Arc::new(TaskQueue::new());
        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..25u64 {
                        queue.enqueue(message(p * 100 + i));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let mut seen = Vec::new();
        while let Some(task) = queue.dequeue(Duration::from_millis(50)) {
            seen.push(task.id);
        }
        assert_eq!(seen.len(), 100);

        // Per-producer order is preserved even though producers interleave.
        for p in 0..4u64 {
            let per_producer: Vec<_> = seen.iter().filter(|id| *id / 100 == p).collect();
            assert!(per_producer.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn eval_reply_rendezvous() {
        let reply = Arc::new(EvalReply::default());
        let producer = {
            let reply = Arc::clone(&reply);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                reply.complete(Ok("42".to_string()));
            })
        };
        let outcome = reply.wait(|| true);
        producer.join().unwrap();
        assert_eq!(outcome, Some(Ok("42".to_string())));
    }

    #[test]
    fn eval_reply_gives_up_when_worker_dies() {
        let reply = EvalReply::default();
        assert_eq!(reply.wait(|| false), None);
    }
}
