//! Bounded job scheduler for compression work
//!
//! Every connection that negotiated permessage-deflate draws from the same
//! [`Limiter`], so a burst of connections cannot start an unbounded number
//! of concurrent zlib calls. Excess jobs wait in a FIFO queue; [`Limiter::unshift`]
//! provides a priority lane at the head of that queue.
//!
//! A job receives a [`Done`] token and must release it once its work is
//! finished, either by calling [`Done::finish`] or by dropping it. Releasing
//! the token is what frees the slot, so a job that fails or panics still
//! counts as completed.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

type Job = Box<dyn FnOnce(Done) + Send + 'static>;
type Waiter = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a queued job, used to drop it before it starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

struct State {
    concurrency: usize,
    pending: usize,
    queue: VecDeque<(JobId, Job)>,
    waiters: Vec<Waiter>,
    next_id: u64,
    // set while one caller is draining the queue
    running: bool,
}

impl State {
    fn is_idle(&self) -> bool {
        self.pending == 0 && self.queue.is_empty()
    }
}

/// Shared bounded executor
///
/// Cloning is cheap and every clone schedules against the same pool.
#[derive(Clone)]
pub struct Limiter {
    state: Arc<Mutex<State>>,
}

impl Limiter {
    /// Create a limiter running at most `concurrency` jobs at once
    ///
    /// A concurrency of `0` means unbounded.
    pub fn new(concurrency: usize) -> Self {
        let concurrency = if concurrency == 0 {
            usize::MAX
        } else {
            concurrency
        };

        Self {
            state: Arc::new(Mutex::new(State {
                concurrency,
                pending: 0,
                queue: VecDeque::new(),
                waiters: Vec::new(),
                next_id: 0,
                running: false,
            })),
        }
    }

    /// Create a limiter without a concurrency cap
    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// Maximum number of jobs executing at once
    pub fn concurrency(&self) -> usize {
        self.state.lock().concurrency
    }

    /// Number of jobs currently executing
    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    /// Number of jobs waiting to start
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Queued plus executing jobs
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.pending + state.queue.len()
    }

    /// True when nothing is queued or executing
    pub fn is_empty(&self) -> bool {
        self.state.lock().is_idle()
    }

    /// Append a job to the tail of the queue and try to start work
    pub fn push<F>(&self, job: F) -> JobId
    where
        F: FnOnce(Done) + Send + 'static,
    {
        let id = {
            let mut state = self.state.lock();
            let id = JobId(state.next_id);
            state.next_id += 1;
            state.queue.push_back((id, Box::new(job)));
            id
        };
        self.run();
        id
    }

    /// Insert a job at the head of the queue and try to start work
    pub fn unshift<F>(&self, job: F) -> JobId
    where
        F: FnOnce(Done) + Send + 'static,
    {
        let id = {
            let mut state = self.state.lock();
            let id = JobId(state.next_id);
            state.next_id += 1;
            state.queue.push_front((id, Box::new(job)));
            id
        };
        self.run();
        id
    }

    /// Drop a job that has not started yet
    ///
    /// Returns `false` if the job already started (it then runs to completion).
    pub fn remove(&self, id: JobId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            match state.queue.iter().position(|(queued, _)| *queued == id) {
                Some(index) => state.queue.remove(index).is_some(),
                None => false,
            }
        };
        if removed {
            // removing the last queued job can make the limiter idle
            self.run();
        }
        removed
    }

    /// Register a one-shot callback for the next time the limiter is idle
    ///
    /// The callback never runs inside this call, even when the limiter is
    /// already idle.
    pub fn on_done<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.is_idle() {
            drop(state);
            defer(Box::new(callback));
        } else {
            state.waiters.push(Box::new(callback));
        }
    }

    /// Wait until no job is queued or executing
    pub async fn idle(&self) {
        let (tx, rx) = oneshot::channel();
        self.on_done(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    fn complete_one(&self) {
        {
            let mut state = self.state.lock();
            state.pending = state.pending.saturating_sub(1);
        }
        self.run();
    }

    fn run(&self) {
        {
            let mut state = self.state.lock();
            if state.running {
                return;
            }
            state.running = true;
        }

        loop {
            let mut state = self.state.lock();

            if state.pending < state.concurrency {
                if let Some((_, job)) = state.queue.pop_front() {
                    state.pending += 1;
                    drop(state);

                    let done = Done {
                        limiter: Some(self.clone()),
                    };
                    if panic::catch_unwind(AssertUnwindSafe(|| job(done))).is_err() {
                        tracing::error!("limiter job panicked while starting");
                    }
                    continue;
                }
            }

            state.running = false;
            let waiters = if state.is_idle() {
                std::mem::take(&mut state.waiters)
            } else {
                Vec::new()
            };
            drop(state);

            for waiter in waiters {
                defer(waiter);
            }
            return;
        }
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Limiter")
            .field("concurrency", &state.concurrency)
            .field("pending", &state.pending)
            .field("queued", &state.queue.len())
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// Completion token handed to every job
///
/// The slot is released exactly once: on [`Done::finish`] or on drop.
pub struct Done {
    limiter: Option<Limiter>,
}

impl Done {
    /// Signal that the job has finished
    pub fn finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(limiter) = self.limiter.take() {
            limiter.complete_one();
        }
    }
}

impl Drop for Done {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Done")
            .field("released", &self.limiter.is_none())
            .finish()
    }
}

// Drain waiters run outside the caller's stack frame.
fn defer(waiter: Waiter) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { waiter() });
        }
        Err(_) => {
            std::thread::spawn(waiter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let limiter = Limiter::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let running = running.clone();
            let peak = peak.clone();
            let finished = finished.clone();
            limiter.push(move |done| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    finished.fetch_add(1, Ordering::SeqCst);
                    done.finish();
                });
            });
        }

        assert_eq!(limiter.pending(), 3);
        assert_eq!(limiter.len(), 20);

        limiter.idle().await;
        assert_eq!(finished.load(Ordering::SeqCst), 20);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert!(limiter.is_empty());
    }

    #[tokio::test]
    async fn test_on_done_fires_once_after_all_jobs() {
        let limiter = Limiter::new(2);
        let held = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..5 {
            let held = held.clone();
            limiter.push(move |done| held.lock().push(done));
        }

        let fired = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        {
            let fired = fired.clone();
            limiter.on_done(move || {
                fired.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            });
        }

        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // releasing a token starts the next queued job, which parks its own token
        loop {
            let next = held.lock().pop();
            match next {
                Some(done) => done.finish(),
                None => break,
            }
        }

        rx.await.unwrap();
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(limiter.len(), 0);
    }

    #[tokio::test]
    async fn test_on_done_is_deferred_when_idle() {
        let limiter = Limiter::new(1);
        let fired = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();

        {
            let fired = fired.clone();
            limiter.on_done(move || {
                fired.store(true, Ordering::SeqCst);
                let _ = tx.send(());
            });
        }

        assert!(!fired.load(Ordering::SeqCst));
        rx.await.unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unshift_runs_before_queued_jobs() {
        let limiter = Limiter::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let blocker = Arc::new(Mutex::new(None));

        {
            let blocker = blocker.clone();
            limiter.push(move |done| *blocker.lock() = Some(done));
        }
        for name in ["a", "b"] {
            let order = order.clone();
            limiter.push(move |done| {
                order.lock().push(name);
                done.finish();
            });
        }
        {
            let order = order.clone();
            limiter.unshift(move |done| {
                order.lock().push("priority");
                done.finish();
            });
        }

        assert!(order.lock().is_empty());
        assert_eq!(limiter.queued(), 3);

        let done = blocker.lock().take().unwrap();
        done.finish();

        assert_eq!(*order.lock(), vec!["priority", "a", "b"]);
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_dropped_token_releases_slot() {
        let limiter = Limiter::new(1);
        let ran = Arc::new(AtomicBool::new(false));

        // job drops its token without calling finish
        limiter.push(|_done| {});
        {
            let ran = ran.clone();
            limiter.push(move |done| {
                ran.store(true, Ordering::SeqCst);
                done.finish();
            });
        }

        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(limiter.pending(), 0);
    }

    #[test]
    fn test_panicking_job_keeps_bookkeeping() {
        let limiter = Limiter::new(1);
        let ran = Arc::new(AtomicBool::new(false));

        limiter.push(|_done| panic!("job failure"));
        {
            let ran = ran.clone();
            limiter.push(move |done| {
                ran.store(true, Ordering::SeqCst);
                done.finish();
            });
        }

        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(limiter.pending(), 0);
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_remove_queued_job() {
        let limiter = Limiter::new(1);
        let blocker = Arc::new(Mutex::new(None));
        let ran = Arc::new(AtomicBool::new(false));

        {
            let blocker = blocker.clone();
            limiter.push(move |done| *blocker.lock() = Some(done));
        }
        let id = {
            let ran = ran.clone();
            limiter.push(move |done| {
                ran.store(true, Ordering::SeqCst);
                done.finish();
            })
        };

        assert!(limiter.remove(id));
        assert!(!limiter.remove(id));
        assert_eq!(limiter.len(), 1);

        blocker.lock().take().unwrap().finish();
        assert!(!ran.load(Ordering::SeqCst));
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_bound_holds_across_threads() {
        const PUSHERS: usize = 8;
        const JOBS: usize = 500;

        let limiter = Limiter::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = std::sync::mpsc::channel::<Done>();
        let rx = Arc::new(Mutex::new(rx));

        // tokens are released from threads other than the ones pushing
        let finishers: Vec<_> = (0..4)
            .map(|_| {
                let rx = rx.clone();
                let running = running.clone();
                let finished = finished.clone();
                std::thread::spawn(move || loop {
                    let next = rx.lock().recv();
                    let Ok(done) = next else { break };
                    running.fetch_sub(1, Ordering::SeqCst);
                    finished.fetch_add(1, Ordering::SeqCst);
                    done.finish();
                })
            })
            .collect();

        let pushers: Vec<_> = (0..PUSHERS)
            .map(|_| {
                let limiter = limiter.clone();
                let running = running.clone();
                let peak = peak.clone();
                let tx = tx.clone();
                std::thread::spawn(move || {
                    for _ in 0..JOBS {
                        let running = running.clone();
                        let peak = peak.clone();
                        let tx = tx.clone();
                        let observed = limiter.clone();
                        limiter.push(move |done| {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            assert!(observed.pending() <= 3);
                            let _ = tx.send(done);
                        });
                    }
                })
            })
            .collect();
        drop(tx);

        for pusher in pushers {
            pusher.join().unwrap();
        }
        for finisher in finishers {
            finisher.join().unwrap();
        }

        assert_eq!(finished.load(Ordering::SeqCst), PUSHERS * JOBS);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_zero_concurrency_is_unbounded() {
        let limiter = Limiter::new(0);
        assert_eq!(limiter.concurrency(), usize::MAX);

        let held = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..64 {
            let held = held.clone();
            limiter.push(move |done| held.lock().push(done));
        }
        assert_eq!(limiter.pending(), 64);
        held.lock().clear();
        assert!(limiter.is_empty());
    }
}
