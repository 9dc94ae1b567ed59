//! Bounded worker pool with blocking submission.
//!
//! The task queue is bounded at the worker count and `submit` blocks while
//! it is full. That coupling of submission rate to worker throughput is the
//! system's sole flow-control mechanism: it bounds memory and work in
//! flight at the cost of stalling whichever thread submits, including a
//! dispatch thread.

use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
    thread::{Builder, JoinHandle},
};

pub const DEFAULT_POOL_CAPACITY: usize = 4;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
}

struct QueueState {
    tasks: VecDeque<Task>,
    shutdown: bool,
}

pub struct WorkerPool {
    state: Arc<PoolState>,
    workers: Vec<JoinHandle<()>>,
    capacity: usize,
}

impl WorkerPool {
    /// Create a pool of `capacity` workers; the queue is bounded at the
    /// same capacity.
    pub fn new(name: &str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let state = Arc::new(PoolState {
            queue: Mutex::new(QueueState {
                tasks: VecDeque::with_capacity(capacity),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(capacity);
        for id in 0..capacity {
            let state = Arc::clone(&state);
            let thread = Builder::new()
                .name(format!("{name}-worker-{id}"))
                .spawn(move || Self::worker_loop(state))
                .expect("failed to spawn worker thread");
            workers.push(thread);
        }

        Self {
            state,
            workers,
            capacity,
        }
    }

    /// Create a pool sized to the machine's available parallelism.
    pub fn with_default_capacity(name: &str) -> Self {
        let capacity = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(DEFAULT_POOL_CAPACITY);
        Self::new(name, capacity)
    }

    /// Enqueue a task, blocking while the queue is full.
    ///
    /// Tasks are executed in FIFO order; every submitted task runs exactly
    /// once unless the pool shuts down first.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.state.queue.lock().unwrap();
        while queue.tasks.len() == self.capacity && !queue.shutdown {
            queue = self.state.not_full.wait(queue).unwrap();
        }
        if queue.shutdown {
            return;
        }
        queue.tasks.push_back(Box::new(task));
        drop(queue);
        self.state.not_empty.notify_one();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn worker_loop(state: Arc<PoolState>) {
        loop {
            let task = {
                let mut queue = state.queue.lock().unwrap();
                loop {
                    if let Some(task) = queue.tasks.pop_front() {
                        break task;
                    }
                    if queue.shutdown {
                        return;
                    }
                    queue = state.not_empty.wait(queue).unwrap();
                }
            };
            state.not_full.notify_one();
            task();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.state.queue.lock().unwrap().shutdown = true;
        self.state.not_empty.notify_all();
        self.state.not_full.notify_all();
        let current = std::thread::current().id();
        for worker in self.workers.drain(..) {
            // a task may drop the last owner of this pool from inside a
            // worker; that worker cannot join itself and exits on its own
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    #[test]
    fn test_tasks_run_exactly_once() {
        let pool = WorkerPool::new("test", 4);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..64 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        // give workers time to drain, then join on drop
        std::thread::sleep(Duration::from_millis(200));
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn test_submit_blocks_when_full() {
        let pool = Arc::new(WorkerPool::new("test", 1));
        let gate = Arc::new((Mutex::new(false), Condvar::new()));

        // occupy the single worker until the gate opens
        let worker_gate = gate.clone();
        pool.submit(move || {
            let (open, cv) = &*worker_gate;
            let mut open = open.lock().unwrap();
            while !*open {
                open = cv.wait(open).unwrap();
            }
        });
        // fill the queue
        pool.submit(|| {});

        let submitted = Arc::new(AtomicUsize::new(0));
        let submitted_flag = submitted.clone();
        let pool_ref = pool.clone();
        let blocked = std::thread::spawn(move || {
            pool_ref.submit(|| {});
            submitted_flag.store(1, Ordering::SeqCst);
        });

        // the third submit must stay blocked while the worker is gated
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(submitted.load(Ordering::SeqCst), 0);

        let (open, cv) = &*gate;
        *open.lock().unwrap() = true;
        cv.notify_all();

        blocked.join().unwrap();
        assert_eq!(submitted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fifo_execution_order() {
        let pool = WorkerPool::new("test", 1);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..16 {
            let order = order.clone();
            pool.submit(move || order.lock().unwrap().push(i));
        }

        std::thread::sleep(Duration::from_millis(200));
        drop(pool);
        let order = order.lock().unwrap();
        assert_eq!(*order, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_default_capacity_nonzero() {
        let pool = WorkerPool::with_default_capacity("test");
        assert!(pool.capacity() >= 1);
    }
}
