//! Elastic worker pool.
//!
//! The pool starts empty. Enqueueing a job spawns a worker when no worker is
//! idle and the pool is below its cap. A worker that has waited a full idle
//! timeout without work exits unless it is part of the idle reserve.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Notify;
use tracing::{debug, error, trace};

use crate::utils::lock;
use crate::utils::metrics::Metrics;

/// Worker body run for each job.
pub type JobHandler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub workers: usize,
    pub idle: usize,
    pub queued: usize,
    /// Most workers alive at once since the pool was created.
    pub peak: usize,
}

struct PoolState<T> {
    queue: VecDeque<T>,
    workers: usize,
    idle: usize,
    peak: usize,
    closed: bool,
}

struct PoolInner<T> {
    state: Mutex<PoolState<T>>,
    work: Notify,
    exited: Notify,
    handler: JobHandler<T>,
    max_workers: usize,
    reserve: usize,
    idle_timeout: Duration,
    metrics: Arc<Metrics>,
}

pub struct WorkerPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for WorkerPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> WorkerPool<T> {
    /// `max_workers` and `reserve` are clamped to at least one, and the
    /// reserve never exceeds the cap.
    pub fn new(
        max_workers: usize,
        reserve: usize,
        idle_timeout: Duration,
        metrics: Arc<Metrics>,
        handler: JobHandler<T>,
    ) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    workers: 0,
                    idle: 0,
                    peak: 0,
                    closed: false,
                }),
                work: Notify::new(),
                exited: Notify::new(),
                handler,
                max_workers,
                reserve: reserve.clamp(1, max_workers),
                idle_timeout,
                metrics,
            }),
        }
    }

    /// Queue a job. A closed pool hands the job back.
    pub fn enqueue(&self, job: T) -> Result<(), T> {
        let spawn = {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return Err(job);
            }
            state.queue.push_back(job);
            if state.idle == 0 && state.workers < self.inner.max_workers {
                state.workers += 1;
                state.peak = state.peak.max(state.workers);
                true
            } else {
                false
            }
        };
        if spawn {
            self.inner.metrics.worker_spawned();
            trace!("Spawning worker");
            tokio::spawn(worker(self.inner.clone()));
        }
        self.inner.work.notify_one();
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.inner.state);
        PoolStats {
            workers: state.workers,
            idle: state.idle,
            queued: state.queue.len(),
            peak: state.peak,
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }

    /// Refuse new jobs and hand back the queued ones. Running jobs finish.
    pub fn close(&self) -> Vec<T> {
        let unstarted: Vec<T> = {
            let mut state = lock(&self.inner.state);
            state.closed = true;
            state.queue.drain(..).collect()
        };
        if !unstarted.is_empty() {
            debug!(count = unstarted.len(), "Returned queued jobs on close");
        }
        self.inner.work.notify_waiters();
        unstarted
    }

    /// Wait until every worker has exited. Only meaningful after [`close`].
    ///
    /// [`close`]: WorkerPool::close
    pub async fn join(&self) {
        loop {
            let exited = self.inner.exited.notified();
            tokio::pin!(exited);
            {
                if lock(&self.inner.state).workers == 0 {
                    return;
                }
                exited.as_mut().enable();
            }
            exited.await;
        }
    }
}

async fn worker<T: Send + 'static>(inner: Arc<PoolInner<T>>) {
    loop {
        let notified = inner.work.notified();
        tokio::pin!(notified);

        let job = {
            let mut state = lock(&inner.state);
            if let Some(job) = state.queue.pop_front() {
                Some(job)
            } else if state.closed {
                state.workers -= 1;
                drop(state);
                inner.exited.notify_waiters();
                return;
            } else {
                state.idle += 1;
                notified.as_mut().enable();
                None
            }
        };

        if let Some(job) = job {
            let run = AssertUnwindSafe((inner.handler)(job)).catch_unwind();
            if run.await.is_err() {
                error!("Worker job panicked");
            }
            continue;
        }

        let timed_out = tokio::time::timeout(inner.idle_timeout, notified)
            .await
            .is_err();

        let mut state = lock(&inner.state);
        let idle = state.idle;
        state.idle -= 1;
        if state.closed || (timed_out && state.queue.is_empty() && idle > inner.reserve) {
            state.workers -= 1;
            let remaining = state.workers;
            drop(state);
            if timed_out {
                inner.metrics.worker_retired();
                debug!(remaining, "Idle worker retired");
            }
            inner.exited.notify_waiters();
            return;
        }
    }
}
