//! A serialized task runner: one thread executing posted tasks in order, plus
//! repeating timers.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use thiserror::Error;

/// The runloop error.
///
/// When this error is occurred, either the runloop is actively stopped or the
/// thread is panicked.
#[derive(Error, Debug)]
#[error("sending event on a stopped runloop")]
pub struct Error;

/// Identifies a repeating task, see [`Runloop::post_repeating`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct RepeatingId(u64);

type Task = Box<dyn FnOnce() + Send + 'static>;
type RepeatingTask = Box<dyn FnMut() + Send + 'static>;

/// Events that the runloop thread can receive.
enum Event {
    Task(Task),
    Repeat(Timer),
    Cancel(RepeatingId),
    Stop,
}

struct Timer {
    id: RepeatingId,
    task: RepeatingTask,
    interval: Duration,
    due: Instant,
    /// `None` repeats until cancelled.
    remaining: Option<u64>,
}

pub(crate) struct Runloop {
    sender: mpsc::Sender<Event>,
    thread_handle: Option<JoinHandle<()>>,
    next_id: AtomicU64,
}

impl Runloop {
    /// Starts a new runloop on its own thread.
    pub(crate) fn new(name: impl Into<String>) -> Result<Self, std::io::Error> {
        let (sender, receiver) = mpsc::channel();
        let thread_handle =
            thread::Builder::new().name(name.into()).spawn(move || Scheduler::new().run(receiver))?;

        Ok(Self { sender, thread_handle: Some(thread_handle), next_id: AtomicU64::new(0) })
    }

    /// Enqueues a task and returns immediately. Tasks run in posting order.
    ///
    /// When the runloop has stopped, it returns [`Err`].
    #[inline]
    pub(crate) fn post(&self, task: impl FnOnce() + Send + 'static) -> Result<(), Error> {
        self.send(Event::Task(Box::new(task)))
    }

    /// Blocks until every task posted before this call has run.
    pub(crate) fn wait_idle(&self) -> Result<(), Error> {
        let (done, barrier) = mpsc::sync_channel(1);
        self.post(move || {
            _ = done.send(());
        })?;
        // The sender is dropped without a message if the thread dies first.
        barrier.recv().map_err(|_| Error)
    }

    /// Runs `task` every `interval`, the first time one interval from now. A `repeat`
    /// of `None` runs it until it is cancelled.
    pub(crate) fn post_repeating(
        &self,
        task: impl FnMut() + Send + 'static,
        interval: Duration,
        repeat: Option<u64>,
    ) -> Result<RepeatingId, Error> {
        let id = RepeatingId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let due = Instant::now() + interval;
        let timer = Timer { id, task: Box::new(task), interval, due, remaining: repeat };
        self.send(Event::Repeat(timer))?;
        Ok(id)
    }

    /// Cancels a repeating task. Unknown or finished ids are ignored.
    #[inline]
    pub(crate) fn cancel(&self, id: RepeatingId) -> Result<(), Error> {
        self.send(Event::Cancel(id))
    }

    #[inline]
    fn send(&self, event: Event) -> Result<(), Error> {
        self.sender.send(event).map_err(|_| Error)
    }
}

impl Drop for Runloop {
    /// Stops the runloop once the already posted tasks have run, and waits for its
    /// thread.
    fn drop(&mut self) {
        _ = self.sender.send(Event::Stop);
        if let Some(thread_handle) = self.thread_handle.take() {
            // A panicked task has already been reported by the panic hook.
            _ = thread_handle.join();
        }
    }
}

/// The state living on the runloop thread.
struct Scheduler {
    timers: Vec<Timer>,
}

impl Scheduler {
    #[inline]
    fn new() -> Self {
        Self { timers: Vec::new() }
    }

    fn run(mut self, receiver: mpsc::Receiver<Event>) {
        loop {
            self.fire_due_timers();

            let event = match self.timers.iter().map(|t| t.due).min() {
                None => receiver.recv().ok(),
                Some(due) => {
                    match receiver.recv_timeout(due.saturating_duration_since(Instant::now())) {
                        Ok(event) => Some(event),
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => None,
                    }
                }
            };

            match event {
                Some(Event::Task(task)) => task(),
                Some(Event::Repeat(timer)) => self.schedule(timer),
                Some(Event::Cancel(id)) => self.timers.retain(|t| t.id != id),
                Some(Event::Stop) | None => break,
            }
        }
    }

    #[inline]
    fn schedule(&mut self, timer: Timer) {
        if timer.remaining != Some(0) {
            self.timers.push(timer);
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        for timer in self.timers.iter_mut().filter(|t| t.due <= now) {
            (timer.task)();
            timer.due = now + timer.interval;
            if let Some(remaining) = timer.remaining.as_mut() {
                *remaining -= 1;
            }
        }
        self.timers.retain(|t| t.remaining != Some(0));
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        thread,
        time::Duration,
    };

    use crate::runloop::Runloop;

    #[test]
    fn test_tasks_run_in_order() {
        let runloop = Runloop::new("test").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let order = Arc::clone(&order);
            runloop.post(move || order.lock().unwrap().push(i)).unwrap();
        }
        runloop.wait_idle().unwrap();

        assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_repeating_count() {
        let runloop = Runloop::new("test").unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        runloop
            .post_repeating(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                Duration::from_millis(5),
                Some(3),
            )
            .unwrap();

        thread::sleep(Duration::from_millis(200));
        runloop.wait_idle().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cancel() {
        let runloop = Runloop::new("test").unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let id = runloop
            .post_repeating(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                Duration::from_millis(5),
                None,
            )
            .unwrap();

        thread::sleep(Duration::from_millis(50));
        runloop.cancel(id).unwrap();
        runloop.wait_idle().unwrap();
        let fired = count.load(Ordering::SeqCst);
        assert!(fired > 0);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), fired);
    }

    #[test]
    fn test_drop_runs_pending_tasks() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let runloop = Runloop::new("test").unwrap();
            for _ in 0..10 {
                let count = Arc::clone(&count);
                runloop
                    .post(move || {
                        thread::sleep(Duration::from_millis(1));
                        count.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            }
        }
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_stopped_runloop() {
        let runloop = Runloop::new("test").unwrap();
        runloop.post(|| panic!("task failure")).unwrap();
        // The thread is gone once the panicking task has run.
        assert!(runloop.wait_idle().is_err());
        assert!(runloop.post(|| {}).is_err());
    }
}
