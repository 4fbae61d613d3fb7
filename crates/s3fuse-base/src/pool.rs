use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::error::Result;
use crate::request::{HttpMethod, Request};

/// The two task queues.
///
/// Foreground runs caller-blocking work; background runs prefetch that must
/// never starve a user-facing operation (it gets its own thread set rather
/// than sharing the foreground one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    /// User-facing operations.
    Foreground,
    /// Prefetch and other best-effort work.
    Background,
}

/// A task body: runs on a worker with a borrowed request handle and returns
/// 0 or a negative errno.
pub type TaskFn = Box<dyn FnOnce(&mut Request) -> i32 + Send>;

/// Completion handle for a posted task.
pub struct TaskHandle {
    status: Mutex<Option<i32>>,
    cond: Condvar,
}

impl TaskHandle {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    fn completed(status: i32) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(Some(status)),
            cond: Condvar::new(),
        })
    }

    fn complete(&self, status: i32) {
        let mut slot = self.status.lock().unwrap();
        *slot = Some(status);
        self.cond.notify_all();
    }

    /// Blocks until the task finishes, yielding its status.
    pub fn wait(&self) -> i32 {
        let mut slot = self.status.lock().unwrap();
        while slot.is_none() {
            slot = self.cond.wait(slot).unwrap();
        }
        slot.unwrap()
    }

    /// Status if the task already finished.
    pub fn try_status(&self) -> Option<i32> {
        *self.status.lock().unwrap()
    }
}

/// Bounded pool of request handles, one per worker.
///
/// A worker borrows a handle for the duration of one task; a handle whose
/// deadline fired is replaced with a fresh one on check-in.
pub struct RequestPool {
    free: Mutex<Vec<Request>>,
    cond: Condvar,
    factory: Box<dyn Fn() -> Result<Request> + Send + Sync>,
}

impl RequestPool {
    /// Builds a pool of `capacity` handles from the factory.
    pub fn new(
        capacity: usize,
        factory: Box<dyn Fn() -> Result<Request> + Send + Sync>,
    ) -> Result<Self> {
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(factory()?);
        }

        Ok(Self {
            free: Mutex::new(free),
            cond: Condvar::new(),
            factory,
        })
    }

    /// Borrows a handle, blocking until one is free.
    pub fn acquire(&self) -> Request {
        let mut free = self.free.lock().unwrap();
        loop {
            if let Some(req) = free.pop() {
                return req;
            }
            free = self.cond.wait(free).unwrap();
        }
    }

    /// Returns a handle to the pool, reset and ready for the next borrower.
    pub fn release(&self, mut req: Request) {
        if req.is_cancelled() {
            match (self.factory)() {
                Ok(fresh) => req = fresh,
                Err(e) => {
                    warn!(error = %e, "could not replace cancelled request handle");
                    return;
                }
            }
        } else {
            // leave the handle in a known-clean state for the next task
            let _ = req.init(HttpMethod::Get);
        }

        let mut free = self.free.lock().unwrap();
        free.push(req);
        self.cond.notify_one();
    }
}

struct QueueState {
    tasks: VecDeque<(TaskFn, Arc<TaskHandle>)>,
    shutdown: bool,
}

struct PoolQueue {
    name: &'static str,
    state: Mutex<QueueState>,
    cond: Condvar,
    requests: Arc<RequestPool>,
}

impl PoolQueue {
    fn new(name: &'static str, requests: Arc<RequestPool>) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
            requests,
        })
    }

    fn post(&self, task: TaskFn) -> Arc<TaskHandle> {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return TaskHandle::completed(-libc::EINTR);
        }

        let handle = TaskHandle::new();
        state.tasks.push_back((task, handle.clone()));
        self.cond.notify_one();
        handle
    }

    fn worker_loop(&self) {
        loop {
            let task = {
                let mut state = self.state.lock().unwrap();
                loop {
                    if let Some(task) = state.tasks.pop_front() {
                        break task;
                    }
                    if state.shutdown {
                        return;
                    }
                    state = self.cond.wait(state).unwrap();
                }
            };

            let mut req = self.requests.acquire();
            let status = (task.0)(&mut req);
            task.1.complete(status);
            self.requests.release(req);
        }
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        self.cond.notify_all();
    }
}

/// Fixed thread sets servicing the foreground and background queues.
///
/// Tasks are dispatched in FIFO submission order per queue; completion order
/// is unconstrained.
pub struct WorkerPool {
    fg: Arc<PoolQueue>,
    bg: Arc<PoolQueue>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `fg_workers` + `bg_workers` threads, each queue backed by a
    /// request pool sized to its worker count.
    pub fn new(
        fg_workers: usize,
        bg_workers: usize,
        factory: Arc<dyn Fn(&str) -> Result<Request> + Send + Sync>,
    ) -> Result<Self> {
        let fg_factory = factory.clone();
        let fg_requests = Arc::new(RequestPool::new(
            fg_workers,
            Box::new(move || fg_factory("fs-fg")),
        )?);
        let bg_factory = factory;
        let bg_requests = Arc::new(RequestPool::new(
            bg_workers,
            Box::new(move || bg_factory("fs-bg")),
        )?);

        let fg = PoolQueue::new("fs-fg", fg_requests);
        let bg = PoolQueue::new("fs-bg", bg_requests);

        let mut threads = Vec::with_capacity(fg_workers + bg_workers);
        for (queue, count) in [(&fg, fg_workers), (&bg, bg_workers)] {
            for i in 0..count {
                let queue = queue.clone();
                threads.push(
                    std::thread::Builder::new()
                        .name(format!("{}-{i}", queue.name))
                        .spawn(move || queue.worker_loop())
                        .map_err(crate::error::Error::Io)?,
                );
            }
        }

        debug!(fg_workers, bg_workers, "worker pools started");

        Ok(Self {
            fg,
            bg,
            threads: Mutex::new(threads),
        })
    }

    fn queue(&self, queue: Queue) -> &Arc<PoolQueue> {
        match queue {
            Queue::Foreground => &self.fg,
            Queue::Background => &self.bg,
        }
    }

    /// Submits a task; the handle's `wait()` yields its status.
    pub fn post(
        &self,
        queue: Queue,
        task: impl FnOnce(&mut Request) -> i32 + Send + 'static,
    ) -> Arc<TaskHandle> {
        self.queue(queue).post(Box::new(task))
    }

    /// Submits a task and blocks for its status.
    pub fn call(
        &self,
        queue: Queue,
        task: impl FnOnce(&mut Request) -> i32 + Send + 'static,
    ) -> i32 {
        self.post(queue, task).wait()
    }

    /// Submits a task whose result nobody will look at.
    pub fn call_async(
        &self,
        queue: Queue,
        task: impl FnOnce(&mut Request) -> i32 + Send + 'static,
    ) {
        let _ = self.post(queue, task);
    }

    /// Drains both queues: pending tasks complete, new posts are refused
    /// with `-EINTR`, worker threads join.
    pub fn terminate(&self) {
        self.fg.shutdown();
        self.bg.shutdown();

        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::statistics::Statistics;

    fn test_pool(fg: usize, bg: usize) -> WorkerPool {
        let config = Arc::new(Config::default());
        let statistics = Arc::new(Statistics::new());
        let factory = Arc::new(move |tag: &str| {
            Request::new(tag, config.clone(), None, statistics.clone())
        });
        WorkerPool::new(fg, bg, factory).unwrap()
    }

    #[test]
    fn test_call_returns_task_status() {
        let pool = test_pool(2, 1);
        assert_eq!(pool.call(Queue::Foreground, |_req| 0), 0);
        assert_eq!(
            pool.call(Queue::Foreground, |_req| -libc::ENOENT),
            -libc::ENOENT
        );
    }

    #[test]
    fn test_single_worker_dispatches_fifo() {
        let pool = test_pool(1, 1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let order = order.clone();
                pool.post(Queue::Foreground, move |_req| {
                    order.lock().unwrap().push(i);
                    0
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.wait(), 0);
        }
        assert_eq!(*order.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_queues_are_independent() {
        let pool = test_pool(1, 1);
        let fg = pool.post(Queue::Foreground, |_req| 1);
        let bg = pool.post(Queue::Background, |_req| 2);
        assert_eq!(fg.wait(), 1);
        assert_eq!(bg.wait(), 2);
    }

    #[test]
    fn test_post_after_terminate_is_interrupted() {
        let pool = test_pool(1, 1);
        pool.terminate();

        let handle = pool.post(Queue::Foreground, |_req| 0);
        assert_eq!(handle.try_status(), Some(-libc::EINTR));
        assert_eq!(handle.wait(), -libc::EINTR);
    }

    #[test]
    fn test_pending_tasks_complete_before_join() {
        let pool = test_pool(1, 1);
        let handles: Vec<_> = (0..8).map(|_| pool.post(Queue::Foreground, |_req| 7)).collect();
        pool.terminate();
        for handle in handles {
            assert_eq!(handle.wait(), 7);
        }
    }

    #[test]
    fn test_request_pool_replaces_cancelled_handles() {
        let config = Arc::new(Config::default());
        let statistics = Arc::new(Statistics::new());
        let built = Arc::new(Mutex::new(0usize));
        let built2 = built.clone();
        let pool = RequestPool::new(
            1,
            Box::new(move || {
                *built2.lock().unwrap() += 1;
                Request::new("test", config.clone(), None, statistics.clone())
            }),
        )
        .unwrap();
        assert_eq!(*built.lock().unwrap(), 1);

        let mut req = pool.acquire();
        req.force_cancel();
        pool.release(req);
        assert_eq!(*built.lock().unwrap(), 2);

        let req = pool.acquire();
        assert!(!req.is_cancelled());
        pool.release(req);
    }
}
