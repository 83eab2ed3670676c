//! The job dispatcher: a fixed pool of worker threads, each with its own
//! mutex/condvar-protected queue, plus a shared overflow queue and a
//! delayed-job heap. Jobs reschedule themselves cooperatively; a parked
//! job sleeps until an explicit unpark.

use log::debug;
use parking_lot::{Condvar, Mutex};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type JobId = u64;

/// What a job wants to happen after one invocation.
pub enum JobOutcome {
    /// Drop the job.
    Done,
    /// Run again as soon as a thread is free.
    Reschedule,
    /// Run again after a real-time delay.
    RescheduleAfter(Duration),
    /// Hold the job until [`JobDispatcher::unpark`].
    Park,
}

/// A cooperatively-scheduled unit of work. `run` performs one slice and
/// tells the dispatcher how to continue.
pub trait Job: Send {
    fn run(&mut self, dispatcher: &Arc<JobDispatcher>) -> JobOutcome;
}

struct QueuedJob {
    id: JobId,
    job: Box<dyn Job>,
}

struct DelayedJob {
    due: Instant,
    queued: QueuedJob,
}

impl PartialEq for DelayedJob {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}
impl Eq for DelayedJob {}
impl PartialOrd for DelayedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DelayedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Min-heap on the deadline.
        other.due.cmp(&self.due)
    }
}

struct WorkerQueue {
    queue: Mutex<VecDeque<QueuedJob>>,
    condvar: Condvar,
}

/// Process-wide work scheduler. Modeled as an owned object handed around
/// by reference so tests stay hermetic.
pub struct JobDispatcher {
    workers: Vec<Arc<WorkerQueue>>,
    shared: Mutex<VecDeque<QueuedJob>>,
    delayed: Mutex<BinaryHeap<DelayedJob>>,
    parked: Mutex<HashMap<JobId, Box<dyn Job>>>,
    next_id: AtomicU64,
    next_worker: AtomicU64,
    terminating: AtomicBool,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl JobDispatcher {
    /// Spawns the pool. `num_threads == 0` sizes from available
    /// parallelism.
    pub fn new(num_threads: usize) -> Arc<Self> {
        let num_threads = if num_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .max(2)
        } else {
            num_threads
        };

        let dispatcher = Arc::new(Self {
            workers: (0..num_threads)
                .map(|_| {
                    Arc::new(WorkerQueue {
                        queue: Mutex::new(VecDeque::new()),
                        condvar: Condvar::new(),
                    })
                })
                .collect(),
            shared: Mutex::new(VecDeque::new()),
            delayed: Mutex::new(BinaryHeap::new()),
            parked: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_worker: AtomicU64::new(0),
            terminating: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        });

        let mut threads = dispatcher.threads.lock();
        for index in 0..num_threads {
            let dispatcher = Arc::clone(&dispatcher);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("island-worker-{index}"))
                    .spawn(move || worker_loop(dispatcher, index))
                    .expect("spawning worker thread"),
            );
        }
        drop(threads);

        debug!("job dispatcher started with {num_threads} threads");
        dispatcher
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Enqueues a job, round-robined onto a worker queue.
    pub fn schedule(&self, job: Box<dyn Job>) -> JobId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.enqueue(QueuedJob { id, job });
        id
    }

    /// Enqueues a job to run after a real-time delay.
    pub fn schedule_after(&self, delay: Duration, job: Box<dyn Job>) -> JobId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.delayed.lock().push(DelayedJob {
            due: Instant::now() + delay,
            queued: QueuedJob { id, job },
        });
        self.notify_one();
        id
    }

    /// Moves a parked job back onto a run queue. Unknown ids are ignored;
    /// the job may have finished meanwhile.
    pub fn unpark(&self, id: JobId) {
        if let Some(job) = self.parked.lock().remove(&id) {
            self.enqueue(QueuedJob { id, job });
        }
    }

    /// Hands the job to the first idle worker queue, falling back to the
    /// shared overflow queue when everyone is busy.
    fn enqueue(&self, queued: QueuedJob) {
        let start = self.next_worker.fetch_add(1, Ordering::Relaxed) as usize;
        let mut queued = Some(queued);

        for offset in 0..self.workers.len() {
            let worker = &self.workers[(start + offset) % self.workers.len()];
            let mut queue = worker.queue.lock();
            if queue.is_empty() {
                queue.push_back(queued.take().unwrap());
                drop(queue);
                worker.condvar.notify_one();
                return;
            }
        }

        self.shared.lock().push_back(queued.take().unwrap());
        self.notify_one();
    }

    fn notify_one(&self) {
        for worker in &self.workers {
            worker.condvar.notify_one();
        }
    }

    /// Signals shutdown and joins every worker thread. Parked and queued
    /// jobs are dropped.
    pub fn shutdown(&self) {
        self.terminating.store(true, Ordering::SeqCst);
        for worker in &self.workers {
            worker.condvar.notify_all();
        }
        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        self.parked.lock().clear();
        self.shared.lock().clear();
        self.delayed.lock().clear();
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    /// Promotes due delayed jobs and reports the next deadline.
    fn promote_due(&self) -> Option<Instant> {
        let mut delayed = self.delayed.lock();
        let now = Instant::now();
        while let Some(top) = delayed.peek() {
            if top.due <= now {
                let job = delayed.pop().unwrap();
                drop(delayed);
                self.enqueue(job.queued);
                delayed = self.delayed.lock();
            } else {
                return Some(top.due);
            }
        }
        None
    }
}

fn worker_loop(dispatcher: Arc<JobDispatcher>, index: usize) {
    let own = Arc::clone(&dispatcher.workers[index]);

    loop {
        if dispatcher.is_terminating() {
            break;
        }

        let next_deadline = dispatcher.promote_due();

        // Own queue first, then the shared overflow queue.
        let queued = own
            .queue
            .lock()
            .pop_front()
            .or_else(|| dispatcher.shared.lock().pop_front());

        let Some(mut queued) = queued else {
            let mut guard = own.queue.lock();
            if guard.is_empty() && !dispatcher.is_terminating() {
                match next_deadline {
                    Some(due) => {
                        let timeout = due.saturating_duration_since(Instant::now());
                        own.condvar
                            .wait_for(&mut guard, timeout.min(Duration::from_millis(50)));
                    }
                    None => {
                        own.condvar.wait_for(&mut guard, Duration::from_millis(50));
                    }
                }
            }
            continue;
        };

        match queued.job.run(&dispatcher) {
            JobOutcome::Done => {}
            JobOutcome::Reschedule => dispatcher.enqueue(queued),
            JobOutcome::RescheduleAfter(delay) => {
                dispatcher.delayed.lock().push(DelayedJob {
                    due: Instant::now() + delay,
                    queued,
                });
            }
            JobOutcome::Park => {
                dispatcher.parked.lock().insert(queued.id, queued.job);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountJob {
        counter: Arc<AtomicUsize>,
        remaining: usize,
    }

    impl Job for CountJob {
        fn run(&mut self, _dispatcher: &Arc<JobDispatcher>) -> JobOutcome {
            self.counter.fetch_add(1, Ordering::SeqCst);
            self.remaining -= 1;
            if self.remaining == 0 {
                JobOutcome::Done
            } else {
                JobOutcome::Reschedule
            }
        }
    }

    #[test]
    fn rescheduling_job_runs_repeatedly() {
        let dispatcher = JobDispatcher::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher.schedule(Box::new(CountJob {
            counter: Arc::clone(&counter),
            remaining: 5,
        }));

        let deadline = Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        dispatcher.shutdown();
    }

    #[test]
    fn parked_job_waits_for_unpark() {
        struct ParkOnce {
            counter: Arc<AtomicUsize>,
            parked_once: bool,
        }
        impl Job for ParkOnce {
            fn run(&mut self, _dispatcher: &Arc<JobDispatcher>) -> JobOutcome {
                if self.parked_once {
                    self.counter.fetch_add(1, Ordering::SeqCst);
                    JobOutcome::Done
                } else {
                    self.parked_once = true;
                    JobOutcome::Park
                }
            }
        }

        let dispatcher = JobDispatcher::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let id = dispatcher.schedule(Box::new(ParkOnce {
            counter: Arc::clone(&counter),
            parked_once: false,
        }));

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        dispatcher.unpark(id);
        let deadline = Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        dispatcher.shutdown();
    }

    #[test]
    fn delayed_job_respects_its_deadline() {
        struct Stamp {
            created: Instant,
            observed: Arc<Mutex<Option<Duration>>>,
        }
        impl Job for Stamp {
            fn run(&mut self, _dispatcher: &Arc<JobDispatcher>) -> JobOutcome {
                *self.observed.lock() = Some(self.created.elapsed());
                JobOutcome::Done
            }
        }

        let dispatcher = JobDispatcher::new(2);
        let observed = Arc::new(Mutex::new(None));
        dispatcher.schedule_after(
            Duration::from_millis(40),
            Box::new(Stamp {
                created: Instant::now(),
                observed: Arc::clone(&observed),
            }),
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while observed.lock().is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let elapsed = observed.lock().expect("job should have run");
        assert!(elapsed >= Duration::from_millis(35));
        dispatcher.shutdown();
    }
}
