// src/pool.rs
//! Elastic worker pool.
//!
//! A FIFO queue of boxed jobs is shared by `min..=max` worker threads. A
//! manager thread samples the pool every `manager_interval`: it spawns up to
//! `step` workers when jobs are piling up faster than they are taken, and
//! asks up to `step` idle workers to exit when fewer than half of them are
//! busy. Queue and counters live under one mutex.

use crate::error::{EmberError, EmberResult};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub manager_interval: Duration,
    /// Workers added or retired per manager pass.
    pub step: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let min = 2;
        Self {
            min_workers: min,
            max_workers: num_cpus::get().max(min),
            manager_interval: Duration::from_secs(3),
            step: 2,
        }
    }
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    busy: usize,
    alive: usize,
    exit: usize,
    stopped: bool,
    spawned: usize,
}

struct Shared {
    config: PoolConfig,
    state: Mutex<PoolState>,
    not_empty: Condvar,
    manager_wake: Condvar,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    manager: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> EmberResult<Self> {
        if config.min_workers == 0 || config.min_workers > config.max_workers {
            return Err(EmberError::Config(format!(
                "worker pool bounds {}..={} are invalid",
                config.min_workers, config.max_workers
            )));
        }
        let step = config.step.max(1);
        let shared = Arc::new(Shared {
            config: PoolConfig { step, ..config },
            state: Mutex::new(PoolState::default()),
            not_empty: Condvar::new(),
            manager_wake: Condvar::new(),
            workers: Mutex::new(Vec::new()),
        });

        let pool = Self {
            shared: Arc::clone(&shared),
            manager: Mutex::new(None),
        };

        let min = shared.config.min_workers;
        shared.lock().alive = min;
        for _ in 0..min {
            if let Err(e) = spawn_worker(&shared) {
                shared.lock().alive -= 1;
                pool.shutdown();
                return Err(e);
            }
        }

        let manager_shared = Arc::clone(&shared);
        let manager = thread::Builder::new()
            .name("ember-pool-manager".to_string())
            .spawn(move || manage(manager_shared));
        match manager {
            Ok(handle) => {
                *pool.manager.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
            Err(e) => {
                pool.shutdown();
                return Err(e.into());
            }
        }

        info!(
            min = shared.config.min_workers,
            max = shared.config.max_workers,
            "worker pool started"
        );
        Ok(pool)
    }

    /// Queues a job and wakes one idle worker. Fails once the pool is stopped.
    pub fn add_task<F>(&self, job: F) -> EmberResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.lock();
            if state.stopped {
                return Err(EmberError::PoolStopped);
            }
            state.queue.push_back(Box::new(job));
        }
        self.shared.not_empty.notify_one();
        Ok(())
    }

    pub fn queue_len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn busy_count(&self) -> usize {
        self.shared.lock().busy
    }

    pub fn alive_count(&self) -> usize {
        self.shared.lock().alive
    }

    pub fn exit_count(&self) -> usize {
        self.shared.lock().exit
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Stops the pool, drops queued jobs and joins every thread. Jobs already
    /// running are allowed to finish. Idempotent.
    pub fn shutdown(&self) {
        let dropped = {
            let mut state = self.shared.lock();
            state.stopped = true;
            std::mem::take(&mut state.queue)
        };
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "dropping queued jobs on shutdown");
        }
        drop(dropped);

        self.shared.not_empty.notify_all();
        self.shared.manager_wake.notify_all();

        let manager = self
            .manager
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = manager {
            if handle.join().is_err() {
                warn!("pool manager thread panicked");
            }
        }

        let workers = std::mem::take(&mut *self.shared.lock_workers());
        for handle in workers {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(shared: &Arc<Shared>) -> EmberResult<()> {
    let id = {
        let mut state = shared.lock();
        state.spawned += 1;
        state.spawned
    };
    let worker_shared = Arc::clone(shared);
    let handle = thread::Builder::new()
        .name(format!("ember-worker-{}", id))
        .spawn(move || work(worker_shared))?;
    shared.lock_workers().push(handle);
    Ok(())
}

fn work(shared: Arc<Shared>) {
    let min = shared.config.min_workers;
    loop {
        let job = {
            let mut state = shared.lock();
            loop {
                if state.stopped {
                    return;
                }
                if state.exit > 0 {
                    if state.alive > min {
                        state.exit -= 1;
                        state.alive -= 1;
                        debug!(alive = state.alive, "worker retiring");
                        return;
                    }
                    state.exit = 0;
                }
                if let Some(job) = state.queue.pop_front() {
                    state.busy += 1;
                    break job;
                }
                state = shared
                    .not_empty
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            warn!(error = %EmberError::WorkerPanic(msg), "task panicked");
        }

        shared.lock().busy -= 1;
    }
}

fn manage(shared: Arc<Shared>) {
    let PoolConfig {
        min_workers,
        max_workers,
        manager_interval,
        step,
    } = shared.config.clone();

    loop {
        let grow = {
            let state = shared.lock();
            let (mut state, _) = shared
                .manager_wake
                .wait_timeout_while(state, manager_interval, |s| !s.stopped)
                .unwrap_or_else(PoisonError::into_inner);
            if state.stopped {
                return;
            }

            let queued = state.queue.len();
            if queued > state.busy && state.alive < max_workers {
                let n = step.min(max_workers - state.alive);
                state.alive += n;
                debug!(queued, busy = state.busy, alive = state.alive, "growing pool");
                n
            } else {
                let standing = state.alive - state.exit;
                if state.busy * 2 < state.alive && standing > min_workers {
                    let n = step.min(standing - min_workers);
                    state.exit += n;
                    debug!(busy = state.busy, alive = state.alive, retiring = n, "shrinking pool");
                    drop(state);
                    shared.not_empty.notify_all();
                }
                0
            }
        };

        for _ in 0..grow {
            if let Err(e) = spawn_worker(&shared) {
                warn!(error = %e, "failed to spawn worker");
                shared.lock().alive -= 1;
            }
        }

        shared.lock_workers().retain(|h| !h.is_finished());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Instant;

    fn config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min_workers: min,
            max_workers: max,
            manager_interval: Duration::from_millis(20),
            step: 2,
        }
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[derive(Default)]
    struct Gate {
        open: Mutex<bool>,
        cv: Condvar,
    }

    impl Gate {
        fn wait(&self) {
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.cv.wait(open).unwrap();
            }
        }

        fn release(&self) {
            *self.open.lock().unwrap() = true;
            self.cv.notify_all();
        }
    }

    #[test]
    fn runs_every_submitted_task() {
        let pool = WorkerPool::new(config(2, 4)).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..32 {
            let tx = tx.clone();
            pool.add_task(move || tx.send(i).unwrap()).unwrap();
        }
        let mut got: Vec<i32> = (0..32).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        got.sort();
        assert_eq!(got, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn grows_to_max_under_load_and_shrinks_back_to_min() {
        let pool = WorkerPool::new(config(1, 4)).unwrap();
        let gate = Arc::new(Gate::default());
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let gate = Arc::clone(&gate);
            let done = Arc::clone(&done);
            pool.add_task(move || {
                gate.wait();
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || pool.alive_count() == 4));
        assert!(pool.alive_count() <= 4);

        gate.release();
        assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst) == 8));

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.alive_count() > 1 && Instant::now() < deadline {
            assert!(pool.alive_count() >= 1);
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.alive_count(), 1);

        // Several more manager passes must not go below the floor.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(pool.alive_count(), 1);
    }

    #[test]
    fn panicking_task_does_not_kill_the_worker() {
        let pool = WorkerPool::new(config(1, 1)).unwrap();
        pool.add_task(|| panic!("boom")).unwrap();

        let (tx, rx) = mpsc::channel();
        pool.add_task(move || tx.send(()).unwrap()).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert_eq!(pool.alive_count(), 1);
        assert!(wait_until(Duration::from_secs(1), || pool.busy_count() == 0));
    }

    #[test]
    fn rejects_tasks_after_shutdown_and_drops_queue() {
        let pool = WorkerPool::new(config(1, 1)).unwrap();
        let gate = Arc::new(Gate::default());
        let ran = Arc::new(AtomicUsize::new(0));

        {
            let gate = Arc::clone(&gate);
            pool.add_task(move || gate.wait()).unwrap();
        }
        assert!(wait_until(Duration::from_secs(5), || pool.busy_count() == 1));
        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            pool.add_task(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        let releaser = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                gate.release();
            })
        };
        pool.shutdown();
        releaser.join().unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(matches!(pool.add_task(|| {}), Err(EmberError::PoolStopped)));
    }

    #[test]
    fn invalid_bounds_are_rejected() {
        assert!(WorkerPool::new(config(0, 2)).is_err());
        assert!(WorkerPool::new(config(3, 2)).is_err());
    }
}
