use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{inline_executor, Executor, ExecutorImpl, Work};
use crate::future::make_promise_future;
use crate::outcome::Outcome;
use crate::{Error, Future};

struct Entry {
    deadline: Instant,
    token: u64,
}

struct Scheduled {
    work: Work,
    target: Executor,
}

/// 4-ary min-heap ordered by deadline. Canceled entries are removed from
/// the live map only; their heap slots remain as tombstones until they
/// reach the head.
struct TimerHeap {
    live: FxHashMap<u64, Scheduled>,
    entries: Vec<Entry>,
}

impl TimerHeap {
    fn new() -> Self {
        Self {
            live: FxHashMap::default(),
            entries: Vec::new(),
        }
    }

    fn push(&mut self, deadline: Instant, token: u64, scheduled: Scheduled) {
        debug_assert!(!self.live.contains_key(&token));
        self.live.insert(token, scheduled);
        let index = self.entries.len();
        self.entries.push(Entry { deadline, token });
        self.restore_up(index);
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_head_tombstones();
        self.entries.first().map(|entry| entry.deadline)
    }

    fn pop_due(&mut self, now: Instant) -> Option<(u64, Scheduled)> {
        self.discard_head_tombstones();
        let head = self.entries.first()?;
        if head.deadline > now {
            return None;
        }
        let token = head.token;
        self.remove_head();
        let scheduled = self
            .live
            .remove(&token)
            .expect("heap entry without a live timer");
        Some((token, scheduled))
    }

    fn remove(&mut self, token: u64) -> Option<Scheduled> {
        let scheduled = self.live.remove(&token);
        if scheduled.is_some() {
            // Clean up removed elements "tombstones"
            self.discard_head_tombstones();
        }
        scheduled
    }

    fn remove_head(&mut self) {
        let new_len = self.entries.len() - 1;
        self.entries.swap(0, new_len);
        self.entries.truncate(new_len);
        if !self.entries.is_empty() {
            self.restore_down(0);
        }
    }

    fn discard_head_tombstones(&mut self) {
        while let Some(head) = self.entries.first() {
            if self.live.contains_key(&head.token) {
                return;
            }
            self.remove_head();
        }
    }

    #[inline]
    fn parent(index: usize) -> usize {
        (index - 1) >> 2
    }
    #[inline]
    fn child(index: usize, child_index: usize) -> usize {
        (index << 2) + 1 + child_index
    }

    fn restore_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = TimerHeap::parent(index);
            if self.entries[index].deadline >= self.entries[parent].deadline {
                return;
            }
            self.entries.swap(index, parent);
            index = parent;
        }
    }

    fn restore_down(&mut self, mut index: usize) {
        let len = self.entries.len();
        loop {
            let mut min_index = index;
            for child_index in 0..4 {
                let child = TimerHeap::child(index, child_index);
                if child < len && self.entries[child].deadline < self.entries[min_index].deadline {
                    min_index = child;
                }
            }
            if min_index == index {
                return;
            }
            self.entries.swap(index, min_index);
            index = min_index;
        }
    }
}

/// Handle to a scheduled timer entry, used to cancel it before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerKey(u64);

/// Start the timer executor and its dedicated thread.
pub fn make_timer_executor() -> std::io::Result<TimerExecutor> {
    let timer = crate::catch_enomem(|| TimerExecutor {
        inner: Arc::new(TimerInner {
            locked: Mutex::new(TimerLocked {
                heap: TimerHeap::new(),
                next_token: 0,
                stopping: false,
                thread: None,
            }),
            cond: Condvar::new(),
        }),
    })?;
    let inner = timer.inner.clone();
    let handle = std::thread::Builder::new()
        .name("strand-timer".to_owned())
        .spawn(move || TimerExecutor::run(inner))?;
    timer.lock().thread = Some(handle);
    Ok(timer)
}

/// Delayed execution: one thread sleeps until the nearest deadline and
/// hands due work to its target executor.
///
/// Firing is "not before" the deadline; there is no upper bound on how
/// late a busy system may run an entry.
#[derive(Clone)]
pub struct TimerExecutor {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    locked: Mutex<TimerLocked>,
    cond: Condvar,
}

struct TimerLocked {
    heap: TimerHeap,
    next_token: u64,
    stopping: bool,
    thread: Option<JoinHandle<()>>,
}

impl TimerExecutor {
    /// Schedule `work` to run on `target` at or after `delay` from now.
    pub fn post_after(
        &self,
        delay: Duration,
        target: &Executor,
        work: Work,
    ) -> Result<TimerKey, Error> {
        let now = Instant::now();
        let deadline = now
            .checked_add(delay)
            .unwrap_or_else(|| now + Duration::from_secs(u32::MAX as u64));
        let token = {
            let mut timer = self.lock();
            if timer.stopping {
                return Err(Error::ExecutorStopped);
            }
            let token = timer.next_token;
            timer.next_token += 1;
            timer.heap.push(
                deadline,
                token,
                Scheduled {
                    work,
                    target: target.clone(),
                },
            );
            token
        };
        // Wake the thread so it can re-evaluate the nearest deadline.
        self.inner.cond.notify_one();
        Ok(TimerKey(token))
    }

    /// Remove a scheduled entry. Returns true when the entry had not fired
    /// yet; its work is dropped without running.
    pub fn cancel(&self, key: TimerKey) -> bool {
        self.lock().heap.remove(key.0).is_some()
    }

    /// Stop the thread and discard unfired entries. Idempotent.
    pub fn shutdown(&self) {
        let thread = {
            let mut timer = self.lock();
            timer.stopping = true;
            timer.thread.take()
        };
        self.inner.cond.notify_all();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimerLocked> {
        self.inner.locked.lock().expect("Unrecoverable error")
    }

    fn run(inner: Arc<TimerInner>) {
        let mut timer = inner.locked.lock().expect("Unrecoverable error");
        loop {
            if timer.stopping {
                return;
            }
            match timer.heap.next_deadline() {
                None => {
                    timer = inner.cond.wait(timer).expect("Unrecoverable error");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline > now {
                        let (guard, _) = inner
                            .cond
                            .wait_timeout(timer, deadline - now)
                            .expect("Unrecoverable error");
                        timer = guard;
                        continue;
                    }
                    let mut due = Vec::new();
                    while let Some(item) = timer.heap.pop_due(now) {
                        due.push(item);
                    }
                    // Posting without the lock, a target may run the work
                    // in place and schedule new timers.
                    drop(timer);
                    for (token, scheduled) in due {
                        let name = scheduled.work.name();
                        log::trace!("timer: firing {token} `{name}`");
                        if let Err(err) = scheduled.target.post(scheduled.work) {
                            log::warn!("timer: dropping `{name}`: {err}");
                        }
                    }
                    timer = inner.locked.lock().expect("Unrecoverable error");
                }
            }
        }
    }
}

impl ExecutorImpl for TimerExecutor {
    fn post(&self, work: Work) -> Result<(), Error> {
        self.post_after(Duration::ZERO, &inline_executor(), work)
            .map(|_| ())
    }

    fn is_running(&self) -> bool {
        !self.lock().stopping
    }
}

impl fmt::Debug for TimerExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let timer = self.lock();
        f.debug_struct("TimerExecutor")
            .field("armed", &timer.heap.live.len())
            .field("stopping", &timer.stopping)
            .finish_non_exhaustive()
    }
}

/// Future that resolves with `()` at or after `delay`, on `target`.
///
/// Cancelable: a cancellation request that wins the race against the
/// deadline resolves the future to `Canceled` and removes the timer entry.
pub fn delay(timer: &TimerExecutor, target: &Executor, delay: Duration) -> Future<()> {
    let (promise, future) = make_promise_future::<()>();
    let token = future.cancellation_token().clone();
    let state = future.shared();
    let fire = Work::named("delay", move || {
        let _ = promise.set_value(());
    });
    match timer.post_after(delay, target, fire) {
        Ok(key) => {
            let timer = timer.clone();
            token.push_callback(move || {
                if state.resolve(Outcome::Canceled).is_ok() {
                    timer.cancel(key);
                }
            });
        }
        // The dropped work resolved the future as a broken promise.
        Err(err) => log::warn!("delay: {err}"),
    }
    future
}
