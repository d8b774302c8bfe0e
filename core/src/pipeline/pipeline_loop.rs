//! Single-threaded cooperative scheduler owning one pipeline.
//!
//! All pipeline state lives on the loop thread. Other threads submit short
//! closures: `schedule_and_wait` blocks until the closure ran on the loop
//! thread, `schedule_at` queues it for a deadline. The loop interleaves task
//! execution with pipeline processing and sleeps until the earliest of the
//! next task deadline, the pipeline's own deadline, or a wakeup from an I/O
//! thread.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::time::{mono_now, Nanos, SECOND};

/// Pipeline state driven by a [`PipelineLoop`].
pub trait PipelineState: Send + 'static {
    /// Drains inbound queues, refreshes timers, emits control traffic.
    /// Returns the deadline (monotonic ns) at which the loop must call again
    /// even if nothing else happens.
    fn process(&mut self, now_mono: Nanos) -> Nanos;
}

type TaskFn<P> = Box<dyn FnOnce(&mut P) + Send>;

enum Ctl<P> {
    Immediate(TaskFn<P>),
    At {
        id: u64,
        deadline: Nanos,
        task: TaskFn<P>,
    },
    Cancel(u64),
    Shutdown,
}

/// Identifies a task scheduled with [`PipelineLoop::schedule_at`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle(u64);

/// Wakes the loop from an I/O thread after pushing packets.
#[derive(Clone)]
pub struct LoopWaker {
    tx: Sender<()>,
}

impl LoopWaker {
    /// Signals the loop; coalesces when a wake is already pending.
    pub fn wake(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {}
        }
    }
}

/// Handle to a running pipeline loop.
pub struct PipelineLoop<P: PipelineState> {
    ctl_tx: Sender<Ctl<P>>,
    wake_tx: Sender<()>,
    next_id: Arc<AtomicU64>,
    thread: Option<thread::JoinHandle<()>>,
}

impl<P: PipelineState> PipelineLoop<P> {
    /// Moves `state` onto a new loop thread and starts it.
    pub fn spawn(name: &str, state: P) -> Self {
        let (ctl_tx, ctl_rx) = unbounded();
        let (wake_tx, wake_rx) = bounded(1);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(state, ctl_rx, wake_rx))
            .expect("spawn pipeline loop thread");
        PipelineLoop {
            ctl_tx,
            wake_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            thread: Some(thread),
        }
    }

    /// Runs `task` on the loop thread and blocks for its result.
    ///
    /// Mutations of pipeline state from other threads go through here; they
    /// never touch the state directly. Tasks must not call back into the
    /// loop: a task waiting on its own loop deadlocks.
    pub fn schedule_and_wait<R, F>(&self, task: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut P) -> R + Send + 'static,
    {
        let (done_tx, done_rx) = bounded(1);
        let wrapped: TaskFn<P> = Box::new(move |state| {
            let _ = done_tx.send(task(state));
        });
        self.ctl_tx
            .send(Ctl::Immediate(wrapped))
            .map_err(|_| Error::BadOperation)?;
        // A dropped task (loop gone or cancelled) disconnects the channel.
        done_rx.recv().map_err(|_| Error::Aborted)
    }

    /// Schedules `task` to run at `deadline` (monotonic ns), fire-and-forget.
    pub fn schedule_at<F>(&self, deadline: Nanos, task: F) -> Result<TaskHandle>
    where
        F: FnOnce(&mut P) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.ctl_tx
            .send(Ctl::At {
                id,
                deadline,
                task: Box::new(task),
            })
            .map_err(|_| Error::BadOperation)?;
        Ok(TaskHandle(id))
    }

    /// Cancels a pending scheduled task.
    ///
    /// A task already running is allowed to finish. A pending task is
    /// dropped; any completion channel it embeds disconnects, so its waiter
    /// observes `Aborted`.
    pub fn async_cancel(&self, handle: TaskHandle) {
        let _ = self.ctl_tx.send(Ctl::Cancel(handle.0));
    }

    /// Waker for I/O threads feeding this loop.
    pub fn waker(&self) -> LoopWaker {
        LoopWaker {
            tx: self.wake_tx.clone(),
        }
    }
}

impl<P: PipelineState> Drop for PipelineLoop<P> {
    fn drop(&mut self) {
        let _ = self.ctl_tx.send(Ctl::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("pipeline loop thread panicked");
            }
        }
    }
}

fn run_loop<P: PipelineState>(mut state: P, ctl_rx: Receiver<Ctl<P>>, wake_rx: Receiver<()>) {
    let mut deadlines: BinaryHeap<Reverse<(Nanos, u64)>> = BinaryHeap::new();
    let mut pending: HashMap<u64, TaskFn<P>> = HashMap::new();

    debug!("pipeline loop started");
    loop {
        let now = mono_now();

        // Run all due scheduled tasks.
        while let Some(&Reverse((deadline, id))) = deadlines.peek() {
            if deadline > now {
                break;
            }
            deadlines.pop();
            if let Some(task) = pending.remove(&id) {
                task(&mut state);
            }
        }

        let pipeline_deadline = state.process(now);
        let task_deadline = deadlines
            .peek()
            .map(|&Reverse((deadline, _))| deadline)
            .unwrap_or(Nanos::MAX);
        let sleep_ns = pipeline_deadline
            .min(task_deadline)
            .saturating_sub(mono_now())
            .clamp(0, SECOND);

        crossbeam_channel::select! {
            recv(ctl_rx) -> msg => match msg {
                Ok(Ctl::Immediate(task)) => task(&mut state),
                Ok(Ctl::At { id, deadline, task }) => {
                    deadlines.push(Reverse((deadline, id)));
                    pending.insert(id, task);
                }
                Ok(Ctl::Cancel(id)) => {
                    if pending.remove(&id).is_some() {
                        debug!(id, "pipeline loop: task cancelled");
                    }
                }
                Ok(Ctl::Shutdown) | Err(_) => break,
            },
            recv(wake_rx) -> _ => {},
            default(Duration::from_nanos(sleep_ns as u64)) => {},
        }
    }
    debug!("pipeline loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::MILLISECOND;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        processed: Arc<AtomicUsize>,
        value: u64,
    }

    impl PipelineState for Counter {
        fn process(&mut self, now_mono: Nanos) -> Nanos {
            self.processed.fetch_add(1, Ordering::Relaxed);
            now_mono + 50 * MILLISECOND
        }
    }

    fn new_loop() -> (PipelineLoop<Counter>, Arc<AtomicUsize>) {
        let processed = Arc::new(AtomicUsize::new(0));
        let state = Counter {
            processed: Arc::clone(&processed),
            value: 0,
        };
        (PipelineLoop::spawn("test-loop", state), processed)
    }

    #[test]
    fn test_schedule_and_wait_returns_result() {
        let (pipeline, _) = new_loop();
        let result = pipeline
            .schedule_and_wait(|state| {
                state.value += 5;
                state.value
            })
            .unwrap();
        assert_eq!(result, 5);
        let result = pipeline.schedule_and_wait(|state| state.value).unwrap();
        assert_eq!(result, 5);
    }

    #[test]
    fn test_ordering_between_waits() {
        let (pipeline, _) = new_loop();
        for n in 1..=10u64 {
            pipeline
                .schedule_and_wait(move |state| state.value = state.value * 10 + n)
                .unwrap();
        }
        let value = pipeline.schedule_and_wait(|state| state.value).unwrap();
        assert_eq!(value, 12_345_678_910);
    }

    #[test]
    fn test_scheduled_task_fires_by_deadline() {
        let (pipeline, _) = new_loop();
        let fired = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&fired);
        pipeline
            .schedule_at(mono_now() + 20 * MILLISECOND, move |_| {
                flag.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_cancel_pending_task() {
        let (pipeline, _) = new_loop();
        let fired = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&fired);
        let handle = pipeline
            .schedule_at(mono_now() + SECOND, move |_| {
                flag.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        pipeline.async_cancel(handle);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_cancelled_waiter_sees_aborted() {
        let (pipeline, _) = new_loop();
        let (done_tx, done_rx) = bounded::<()>(1);
        let handle = pipeline
            .schedule_at(mono_now() + SECOND, move |_| {
                let _ = done_tx.send(());
            })
            .unwrap();
        pipeline.async_cancel(handle);
        // The embedded channel disconnects once the task is dropped.
        assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_waker_triggers_processing() {
        let (pipeline, processed) = new_loop();
        thread::sleep(Duration::from_millis(10));
        let before = processed.load(Ordering::Relaxed);
        let waker = pipeline.waker();
        for _ in 0..3 {
            waker.wake();
            thread::sleep(Duration::from_millis(5));
        }
        assert!(processed.load(Ordering::Relaxed) > before);
    }
}
