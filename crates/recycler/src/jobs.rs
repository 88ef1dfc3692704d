//! Generic job queues.
//!
//! Jobs belong to a [`JobManager`] that processes them and is told about
//! every outcome. A [`JobProcessor`] runs jobs on the calling thread when
//! asked; a [`BackgroundJobProcessor`] runs them on its own threads or on a
//! host [`ThreadService`]. Once a processor is closed, queued jobs fail
//! except critical ones, which still run to completion.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::background::ThreadService;
use crate::error::GcError;

/// Identifies a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

/// Identifies a manager registered with a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManagerId(u64);

/// A unit of work owned by one manager.
pub struct Job {
    id: JobId,
    manager: ManagerId,
    critical: bool,
    payload: Box<dyn Any + Send>,
}

impl Job {
    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    #[must_use]
    pub const fn manager(&self) -> ManagerId {
        self.manager
    }

    /// Critical jobs are processed even after the processor is closed.
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        self.critical
    }

    #[must_use]
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref()
    }

    pub fn payload_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.payload.downcast_mut()
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("manager", &self.manager)
            .field("critical", &self.critical)
            .finish_non_exhaustive()
    }
}

/// Owner of a family of jobs.
pub trait JobManager: Send + Sync {
    /// Does the work. Returns whether it succeeded.
    fn process(&self, job: &mut Job) -> bool;

    /// Called exactly once per job, with `succeeded == false` for jobs that
    /// failed or were dropped from the queue.
    fn job_processed(&self, job: Job, succeeded: bool);

    /// Called when the manager has no more jobs queued or running.
    fn last_job_processed(&self) {}
}

struct ManagerEntry {
    id: ManagerId,
    manager: Arc<dyn JobManager>,
    outstanding: usize,
}

/// Deferred manager callbacks, run after the queue lock is released.
enum Notice {
    Processed(Arc<dyn JobManager>, Job, bool),
    Last(Arc<dyn JobManager>),
}

impl Notice {
    fn deliver(self) {
        match self {
            Self::Processed(manager, job, succeeded) => manager.job_processed(job, succeeded),
            Self::Last(manager) => manager.last_job_processed(),
        }
    }
}

fn deliver_all(notices: Vec<Notice>) {
    for notice in notices {
        notice.deliver();
    }
}

#[derive(Default)]
struct JobQueue {
    managers: Vec<ManagerEntry>,
    jobs: VecDeque<Job>,
    running: usize,
    closed: bool,
    next_id: u64,
}

impl JobQueue {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn entry(&mut self, id: ManagerId) -> Option<&mut ManagerEntry> {
        self.managers.iter_mut().find(|m| m.id == id)
    }

    fn manager(&self, id: ManagerId) -> Option<Arc<dyn JobManager>> {
        self.managers
            .iter()
            .find(|m| m.id == id)
            .map(|m| Arc::clone(&m.manager))
    }

    fn add_manager(&mut self, manager: Arc<dyn JobManager>) -> Result<ManagerId, GcError> {
        if self.closed {
            return Err(GcError::Shutdown);
        }
        let id = ManagerId(self.next_id());
        self.managers.push(ManagerEntry {
            id,
            manager,
            outstanding: 0,
        });
        Ok(id)
    }

    fn add_job(
        &mut self,
        manager: ManagerId,
        payload: Box<dyn Any + Send>,
        critical: bool,
        prioritize: bool,
    ) -> Result<JobId, GcError> {
        if self.closed {
            return Err(GcError::Shutdown);
        }
        let id = JobId(self.next_id());
        let entry = self.entry(manager).ok_or(GcError::Shutdown)?;
        entry.outstanding += 1;
        let job = Job {
            id,
            manager,
            critical,
            payload,
        };
        if prioritize {
            self.jobs.push_front(job);
        } else {
            self.jobs.push_back(job);
        }
        Ok(id)
    }

    fn take_job(&mut self, id: JobId) -> Option<Job> {
        let index = self.jobs.iter().position(|job| job.id == id)?;
        self.jobs.remove(index)
    }

    /// Moves the manager's jobs to the front, keeping their relative order.
    fn prioritize_manager(&mut self, manager: ManagerId) {
        let (mut front, rest): (VecDeque<Job>, VecDeque<Job>) =
            self.jobs.drain(..).partition(|job| job.manager == manager);
        front.extend(rest);
        self.jobs = front;
    }

    fn prioritize_job(&mut self, id: JobId) -> bool {
        match self.take_job(id) {
            Some(job) => {
                self.jobs.push_front(job);
                true
            }
            None => false,
        }
    }

    /// Accounts for a finished job and queues the notices for it.
    fn finish(&mut self, job: Job, succeeded: bool, notices: &mut Vec<Notice>) {
        let Some(entry) = self.entry(job.manager) else {
            return;
        };
        entry.outstanding -= 1;
        let last = entry.outstanding == 0;
        let manager = Arc::clone(&entry.manager);
        notices.push(Notice::Processed(Arc::clone(&manager), job, succeeded));
        if last {
            notices.push(Notice::Last(manager));
        }
    }

    /// Fails every queued job of `manager` and unregisters it.
    fn remove_manager(&mut self, manager: ManagerId) -> Vec<Notice> {
        let mut notices = Vec::new();
        let (removed, kept): (VecDeque<Job>, VecDeque<Job>) =
            self.jobs.drain(..).partition(|job| job.manager == manager);
        self.jobs = kept;
        let had_jobs = !removed.is_empty();
        for job in removed {
            self.finish(job, false, &mut notices);
        }
        if let Some(index) = self.managers.iter().position(|m| m.id == manager) {
            let entry = self.managers.remove(index);
            if !had_jobs && entry.outstanding == 0 {
                notices.push(Notice::Last(entry.manager));
            }
        }
        notices
    }

    /// Fails non-critical jobs and marks the queue closed. Critical jobs stay.
    fn close(&mut self) -> Vec<Notice> {
        let mut notices = Vec::new();
        let (critical, failed): (VecDeque<Job>, VecDeque<Job>) =
            self.jobs.drain(..).partition(Job::is_critical);
        self.jobs = critical;
        for job in failed {
            self.finish(job, false, &mut notices);
        }
        self.closed = true;
        notices
    }
}

/// Runs a job outside the lock and reports its outcome.
fn run_job(queue: &Mutex<JobQueue>, mut job: Job) -> Vec<Notice> {
    let manager = queue.lock().manager(job.manager);
    let succeeded = manager.is_some_and(|m| m.process(&mut job));
    let mut notices = Vec::new();
    queue.lock().finish(job, succeeded, &mut notices);
    notices
}

/// Processes jobs on the calling thread.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use recycler::jobs::{Job, JobManager, JobProcessor};
///
/// struct Adder(AtomicUsize);
///
/// impl JobManager for Adder {
///     fn process(&self, job: &mut Job) -> bool {
///         self.0.fetch_add(*job.payload::<usize>().unwrap(), Ordering::SeqCst);
///         true
///     }
///     fn job_processed(&self, _job: Job, _succeeded: bool) {}
/// }
///
/// let adder = Arc::new(Adder(AtomicUsize::new(0)));
/// let processor = JobProcessor::new();
/// let manager = processor.add_manager(adder.clone()).unwrap();
/// processor.add_job(manager, Box::new(2usize), false, false).unwrap();
/// processor.add_job(manager, Box::new(3usize), false, false).unwrap();
/// assert_eq!(processor.process_all(), 2);
/// assert_eq!(adder.0.load(Ordering::SeqCst), 5);
/// ```
#[derive(Default)]
pub struct JobProcessor {
    queue: Mutex<JobQueue>,
}

impl std::fmt::Debug for JobProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobProcessor")
            .field("queued", &self.queued_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl JobProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_manager(&self, manager: Arc<dyn JobManager>) -> Result<ManagerId, GcError> {
        self.queue.lock().add_manager(manager)
    }

    pub fn add_job(
        &self,
        manager: ManagerId,
        payload: Box<dyn Any + Send>,
        critical: bool,
        prioritize: bool,
    ) -> Result<JobId, GcError> {
        self.queue.lock().add_job(manager, payload, critical, prioritize)
    }

    pub fn prioritize_manager(&self, manager: ManagerId) {
        self.queue.lock().prioritize_manager(manager);
    }

    /// Processes `job` now. Returns `false` if it is no longer queued.
    pub fn prioritize_job(&self, job: JobId) -> bool {
        let Some(job) = self.queue.lock().take_job(job) else {
            return false;
        };
        deliver_all(run_job(&self.queue, job));
        true
    }

    /// Processes queued jobs in order until the queue is empty.
    pub fn process_all(&self) -> usize {
        let mut count = 0;
        loop {
            let Some(job) = self.queue.lock().jobs.pop_front() else {
                return count;
            };
            deliver_all(run_job(&self.queue, job));
            count += 1;
        }
    }

    pub fn remove_manager(&self, manager: ManagerId) {
        let notices = self.queue.lock().remove_manager(manager);
        deliver_all(notices);
    }

    /// Fails queued jobs, runs critical ones, and refuses new work.
    pub fn close(&self) {
        let notices = {
            let mut queue = self.queue.lock();
            if queue.closed {
                return;
            }
            queue.close()
        };
        deliver_all(notices);
        loop {
            let Some(job) = self.queue.lock().jobs.pop_front() else {
                break;
            };
            deliver_all(run_job(&self.queue, job));
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.queue.lock().closed
    }

    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.queue.lock().jobs.len()
    }
}

struct Shared {
    queue: Mutex<JobQueue>,
    job_ready: Condvar,
    idle: Condvar,
}

impl Shared {
    /// Worker loop. With a thread service the loop returns once the queue
    /// is drained instead of waiting for more work.
    fn run(&self, wait_for_jobs: bool) {
        let mut queue = self.queue.lock();
        while !queue.closed || queue.jobs.front().is_some_and(Job::is_critical) {
            let Some(job) = queue.jobs.pop_front() else {
                if !wait_for_jobs {
                    break;
                }
                self.job_ready.wait(&mut queue);
                continue;
            };
            queue.running += 1;
            drop(queue);

            deliver_all(run_job(&self.queue, job));

            queue = self.queue.lock();
            queue.running -= 1;
            if queue.jobs.is_empty() && queue.running == 0 {
                self.idle.notify_all();
            }
        }
        if queue.jobs.is_empty() && queue.running == 0 {
            self.idle.notify_all();
        }
    }
}

/// Processes jobs on background threads.
pub struct BackgroundJobProcessor {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_service: Option<Arc<dyn ThreadService>>,
}

impl std::fmt::Debug for BackgroundJobProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundJobProcessor")
            .field("threads", &self.threads.lock().len())
            .field("thread_service", &self.thread_service.is_some())
            .finish_non_exhaustive()
    }
}

impl BackgroundJobProcessor {
    fn with_shared(thread_service: Option<Arc<dyn ThreadService>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(JobQueue::default()),
                job_ready: Condvar::new(),
                idle: Condvar::new(),
            }),
            threads: Mutex::new(Vec::new()),
            thread_service,
        }
    }

    /// Starts up to `thread_count` worker threads.
    ///
    /// Fails only if not a single thread could be started.
    pub fn new(thread_count: usize) -> Result<Self, GcError> {
        let processor = Self::with_shared(None);
        let mut threads = Vec::with_capacity(thread_count);
        let mut last_error = None;
        for index in 0..thread_count.max(1) {
            let shared = Arc::clone(&processor.shared);
            match thread::Builder::new()
                .name(format!("recycler-job-{index}"))
                .spawn(move || shared.run(true))
            {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %err, index, "job_thread_spawn_failed");
                    last_error = Some(err);
                    break;
                }
            }
        }
        if threads.is_empty() {
            return Err(GcError::ThreadSpawn(
                last_error.unwrap_or_else(|| std::io::Error::other("no job threads started")),
            ));
        }
        *processor.threads.lock() = threads;
        Ok(processor)
    }

    /// Runs jobs on `service` instead of dedicated threads.
    #[must_use]
    pub fn with_thread_service(service: Arc<dyn ThreadService>) -> Self {
        Self::with_shared(Some(service))
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn add_manager(&self, manager: Arc<dyn JobManager>) -> Result<ManagerId, GcError> {
        self.shared.queue.lock().add_manager(manager)
    }

    pub fn add_job(
        &self,
        manager: ManagerId,
        payload: Box<dyn Any + Send>,
        critical: bool,
        prioritize: bool,
    ) -> Result<JobId, GcError> {
        let id = self
            .shared
            .queue
            .lock()
            .add_job(manager, payload, critical, prioritize)?;
        self.indicate_new_job();
        Ok(id)
    }

    fn indicate_new_job(&self) {
        match &self.thread_service {
            Some(service) => {
                let shared = Arc::clone(&self.shared);
                // A refused request leaves the job queued for a later request
                // or for `prioritize_job`.
                let _ = service.invoke(Box::new(move || shared.run(false)));
            }
            None => {
                self.shared.job_ready.notify_one();
            }
        }
    }

    pub fn prioritize_manager(&self, manager: ManagerId) {
        self.shared.queue.lock().prioritize_manager(manager);
    }

    /// Moves `job` to the front of the queue.
    pub fn prioritize_job(&self, job: JobId) -> bool {
        self.shared.queue.lock().prioritize_job(job)
    }

    /// Takes `job` off the queue and processes it on the calling thread.
    pub fn process_job_now(&self, job: JobId) -> bool {
        let Some(job) = self.shared.queue.lock().take_job(job) else {
            return false;
        };
        deliver_all(run_job(&self.shared.queue, job));
        true
    }

    /// Waits until no job is queued or running.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.queue.lock();
        while !queue.jobs.is_empty() || queue.running > 0 {
            if self.shared.idle.wait_until(&mut queue, deadline).timed_out() {
                return queue.jobs.is_empty() && queue.running == 0;
            }
        }
        true
    }

    pub fn remove_manager(&self, manager: ManagerId) {
        let notices = self.shared.queue.lock().remove_manager(manager);
        deliver_all(notices);
    }

    /// Fails queued jobs, waits for critical ones, and stops the threads.
    pub fn close(&self) {
        let notices = {
            let mut queue = self.shared.queue.lock();
            if queue.closed {
                return;
            }
            queue.close()
        };
        deliver_all(notices);
        self.shared.job_ready.notify_all();

        let threads = std::mem::take(&mut *self.threads.lock());
        if threads.is_empty() {
            self.shared.run(false);
        }
        for handle in threads {
            let _ = handle.join();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.queue.lock().closed
    }

    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }
}

impl Drop for BackgroundJobProcessor {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        order: Mutex<Vec<(u32, bool)>>,
        last: AtomicUsize,
    }

    impl JobManager for Recorder {
        fn process(&self, job: &mut Job) -> bool {
            *job.payload::<u32>().unwrap() % 2 == 0
        }

        fn job_processed(&self, job: Job, succeeded: bool) {
            self.order
                .lock()
                .push((*job.payload::<u32>().unwrap(), succeeded));
        }

        fn last_job_processed(&self) {
            self.last.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_foreground_order_and_outcomes() {
        let recorder = Arc::new(Recorder::default());
        let processor = JobProcessor::new();
        let m = processor.add_manager(recorder.clone()).unwrap();
        for n in [1u32, 2, 3] {
            processor.add_job(m, Box::new(n), false, false).unwrap();
        }
        processor.add_job(m, Box::new(4u32), false, true).unwrap();
        assert_eq!(processor.process_all(), 4);
        assert_eq!(
            *recorder.order.lock(),
            vec![(4, true), (1, false), (2, true), (3, false)]
        );
        assert_eq!(recorder.last.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_prioritize_manager_keeps_relative_order() {
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let processor = JobProcessor::new();
        let ma = processor.add_manager(a.clone()).unwrap();
        let mb = processor.add_manager(b.clone()).unwrap();
        processor.add_job(ma, Box::new(1u32), false, false).unwrap();
        processor.add_job(mb, Box::new(2u32), false, false).unwrap();
        processor.add_job(ma, Box::new(3u32), false, false).unwrap();
        processor.add_job(mb, Box::new(4u32), false, false).unwrap();

        processor.prioritize_manager(mb);
        let queue = processor.queue.lock();
        let managers: Vec<_> = queue.jobs.iter().map(Job::manager).collect();
        assert_eq!(managers, vec![mb, mb, ma, ma]);
    }

    #[test]
    fn test_remove_manager_fails_queued_jobs() {
        let recorder = Arc::new(Recorder::default());
        let processor = JobProcessor::new();
        let m = processor.add_manager(recorder.clone()).unwrap();
        processor.add_job(m, Box::new(2u32), false, false).unwrap();
        processor.add_job(m, Box::new(4u32), false, false).unwrap();
        processor.remove_manager(m);
        assert_eq!(*recorder.order.lock(), vec![(2, false), (4, false)]);
        assert_eq!(recorder.last.load(Ordering::SeqCst), 1);
        assert_eq!(processor.queued_count(), 0);
    }

    #[test]
    fn test_close_runs_critical_jobs_only() {
        let recorder = Arc::new(Recorder::default());
        let processor = JobProcessor::new();
        let m = processor.add_manager(recorder.clone()).unwrap();
        processor.add_job(m, Box::new(2u32), false, false).unwrap();
        processor.add_job(m, Box::new(4u32), true, false).unwrap();
        processor.close();
        assert_eq!(*recorder.order.lock(), vec![(2, false), (4, true)]);
        assert!(matches!(
            processor.add_job(m, Box::new(6u32), false, false),
            Err(GcError::Shutdown)
        ));
    }

    #[test]
    fn test_close_returns_with_critical_job_queued() {
        let recorder = Arc::new(Recorder::default());
        let processor = Arc::new(JobProcessor::new());
        let m = processor.add_manager(recorder.clone()).unwrap();
        processor.add_job(m, Box::new(6u32), true, false).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let closer = {
            let processor = Arc::clone(&processor);
            thread::spawn(move || {
                processor.close();
                tx.send(()).unwrap();
            })
        };
        rx.recv_timeout(Duration::from_secs(5))
            .expect("close did not return with a critical job queued");
        closer.join().unwrap();
        assert_eq!(*recorder.order.lock(), vec![(6, true)]);
        assert_eq!(processor.queued_count(), 0);
    }

    #[test]
    fn test_background_processes_all() {
        let recorder = Arc::new(Recorder::default());
        let processor = BackgroundJobProcessor::new(2).unwrap();
        let m = processor.add_manager(recorder.clone()).unwrap();
        for n in 0..20u32 {
            processor.add_job(m, Box::new(n), false, false).unwrap();
        }
        assert!(processor.wait_until_idle(Duration::from_secs(10)));
        assert_eq!(recorder.order.lock().len(), 20);
        processor.close();
    }
}
