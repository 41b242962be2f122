//! Named timed and interval jobs
//!
//! One timer thread tracks due times and hands ready jobs to a small worker
//! pool. Jobs are addressed by name: scheduling under an existing name
//! replaces the old job, and [`Scheduler::cancel`] reports whether a job of
//! that name was still pending. That report is what makes named jobs usable
//! for long-press detection (cancel succeeded == the handler never ran).

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

type Handler = Arc<dyn Fn() + Send + Sync>;

struct Job {
    due: Instant,
    period: Option<Duration>,
    handler: Handler,
}

struct SchedulerInner {
    jobs: Mutex<HashMap<String, Job>>,
    wakeup: Condvar,
    work_tx: crossbeam_channel::Sender<(String, Handler)>,
}

/// Job scheduler with named one-shot and interval jobs.
///
/// Jobs run on a worker pool; a job that blocks only blocks its worker. No
/// job has an inherent timeout.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Create a scheduler with the given number of pool workers.
    pub fn new(workers: usize) -> Self {
        let (work_tx, work_rx) = crossbeam_channel::unbounded::<(String, Handler)>();

        for index in 0..workers.max(1) {
            let work_rx = work_rx.clone();
            thread::Builder::new()
                .name(format!("sched-worker-{index}"))
                .spawn(move || {
                    for (name, handler) in work_rx {
                        if catch_unwind(AssertUnwindSafe(|| handler())).is_err() {
                            tracing::error!(job = %name, "scheduled job panicked");
                        }
                    }
                })
                .expect("failed to spawn scheduler worker");
        }

        let inner = Arc::new(SchedulerInner {
            jobs: Mutex::new(HashMap::new()),
            wakeup: Condvar::new(),
            work_tx,
        });

        let timer_inner = Arc::clone(&inner);
        thread::Builder::new()
            .name("sched-timer".into())
            .spawn(move || Self::timer_loop(timer_inner))
            .expect("failed to spawn scheduler timer");

        Self { inner }
    }

    fn timer_loop(inner: Arc<SchedulerInner>) {
        let mut jobs = inner.jobs.lock();

        loop {
            let now = Instant::now();

            let next_due = jobs
                .iter()
                .min_by_key(|(_, job)| job.due)
                .map(|(name, job)| (name.clone(), job.due));

            match next_due {
                None => {
                    inner.wakeup.wait(&mut jobs);
                }
                Some((name, due)) if due <= now => {
                    let handler = match jobs.get_mut(&name) {
                        Some(job) => {
                            let handler = Arc::clone(&job.handler);
                            match job.period {
                                Some(period) => job.due = now + period,
                                None => {
                                    jobs.remove(&name);
                                }
                            }
                            handler
                        }
                        None => continue,
                    };

                    // channel send cannot fail while workers are alive
                    let _ = inner.work_tx.send((name, handler));
                }
                Some((_, due)) => {
                    let _ = inner.wakeup.wait_until(&mut jobs, due);
                }
            }
        }
    }

    /// Run `handler` once after `delay`. Replaces any pending job of the
    /// same name.
    pub fn execute_delayed(
        &self,
        name: &str,
        delay: Duration,
        handler: impl Fn() + Send + Sync + 'static,
    ) {
        self.insert(name, delay, None, Arc::new(handler));
    }

    /// Run `handler` every `period`, first firing one period from now.
    /// Replaces any pending job of the same name.
    pub fn execute_interval(
        &self,
        name: &str,
        period: Duration,
        handler: impl Fn() + Send + Sync + 'static,
    ) {
        self.insert(name, period, Some(period), Arc::new(handler));
    }

    fn insert(&self, name: &str, delay: Duration, period: Option<Duration>, handler: Handler) {
        let job = Job {
            due: Instant::now() + delay,
            period,
            handler,
        };

        self.inner.jobs.lock().insert(name.to_string(), job);
        self.inner.wakeup.notify_one();
    }

    /// Cancel the named job.
    ///
    /// Returns `true` iff a job of that name was still scheduled; a one-shot
    /// job that has already been dispatched is gone and yields `false`.
    pub fn cancel(&self, name: &str) -> bool {
        let existed = self.inner.jobs.lock().remove(name).is_some();
        self.inner.wakeup.notify_one();
        existed
    }

    /// Number of currently scheduled jobs
    pub fn pending(&self) -> usize {
        self.inner.jobs.lock().len()
    }
}
