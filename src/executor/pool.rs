use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use super::{ExecutorImpl, Work};
use crate::Error;

static WORKER_STACK_SIZE: usize = 262144usize;

/// Build a pool with `n_threads` workers; `0` selects a default derived
/// from the available hardware parallelism.
pub fn make_worker_pool(n_threads: usize) -> std::io::Result<ThreadPool> {
    ThreadPool::new(n_threads)
}

/// Fixed set of worker threads draining one FIFO queue.
///
/// Workers survive panicking tasks. Shutdown runs everything already queued
/// before joining; a `post` after that fails with `ExecutorStopped`.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<(Mutex<Locked>, Condvar)>,
}

struct Locked {
    queue: VecDeque<Work>,
    n_idle_workers: usize,
    workers: Vec<JoinHandle<()>>,
    stopping: bool,
}

impl ThreadPool {
    pub fn new(n_threads: usize) -> std::io::Result<Self> {
        let n_threads = if n_threads == 0 {
            Self::default_thread_count()
        } else {
            n_threads
        };
        let thiz = crate::catch_enomem(|| Self {
            inner: Arc::new((
                Mutex::new(Locked {
                    queue: VecDeque::new(),
                    n_idle_workers: 0,
                    workers: Vec::with_capacity(n_threads),
                    stopping: false,
                }),
                Condvar::new(),
            )),
        })?;
        for id in 0..n_threads {
            match Self::worker(thiz.clone(), id) {
                Ok(handle) => thiz.lock().workers.push(handle),
                Err(err) => {
                    thiz.shutdown();
                    return Err(err);
                }
            }
        }
        Ok(thiz)
    }

    pub fn default_thread_count() -> usize {
        let hw_parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1usize);
        num::clamp(hw_parallelism * 2 + 1, 1, 1024)
    }

    /// Stop accepting work, drain the queue and join every worker.
    ///
    /// Idempotent. Must not be called from one of the pool's own workers.
    pub fn shutdown(&self) {
        let workers = {
            let mut pool = self.lock();
            pool.stopping = true;
            std::mem::take(&mut pool.workers)
        };
        self.inner.1.notify_all();
        for worker in workers {
            let _ = worker.join();
        }
    }

    /// Number of queued units not yet picked up by a worker.
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    fn lock(&self) -> MutexGuard<'_, Locked> {
        self.inner.0.lock().expect("Unrecoverable error")
    }

    fn next_job(&self) -> Option<Work> {
        let mut pool = self.lock();
        loop {
            if let Some(work) = pool.queue.pop_front() {
                return Some(work);
            }
            if pool.stopping {
                return None;
            }
            pool.n_idle_workers += 1;
            pool = self.inner.1.wait(pool).expect("Unrecoverable error");
            pool.n_idle_workers -= 1;
        }
    }

    fn worker(pool: ThreadPool, id: usize) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("strand-worker-{id}"))
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || {
                log::trace!("worker {id}: starting");
                while let Some(work) = pool.next_job() {
                    let name = work.name();
                    log::trace!("worker {id}: running `{name}`");
                    if catch_unwind(AssertUnwindSafe(|| work.run())).is_err() {
                        log::error!("worker {id}: task `{name}` panicked");
                    }
                }
                log::trace!("worker {id}: exiting");
            })
    }
}

impl ExecutorImpl for ThreadPool {
    fn post(&self, work: Work) -> Result<(), Error> {
        let need_notify = {
            let mut pool = self.lock();
            if pool.stopping {
                return Err(Error::ExecutorStopped);
            }
            pool.queue.push_back(work);
            pool.n_idle_workers > 0
        };
        if need_notify {
            self.inner.1.notify_one();
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        !self.lock().stopping
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pool = self.lock();
        f.debug_struct("ThreadPool")
            .field("workers", &pool.workers.len())
            .field("pending", &pool.queue.len())
            .field("stopping", &pool.stopping)
            .finish_non_exhaustive()
    }
}
