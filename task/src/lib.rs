use std::thread;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use lazy_static::lazy_static;
use tracing::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

lazy_static! {
    pub static ref THREAD_POOL: ThreadPool = ThreadPool::new("task", 1024);
}

/// Bounded pool of OS threads for fire-and-forget jobs (push notification
/// dispatch and similar). Jobs submitted while the queue is full are
/// dropped, not queued, so callers never block.
pub struct ThreadPool {
    sender: Sender<Job>,
    name: &'static str,
}

pub struct Worker {
    receiver: Receiver<Job>,
    name: &'static str,
}

impl ThreadPool {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (sender, receiver) = channel::bounded(capacity);
        let n = num_cpus::get();
        for _ in 0..n {
            Worker::new(receiver.clone(), name);
        }
        Self { sender, name }
    }

    pub fn spawn<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(TrySendError::Full(_)) = self.sender.try_send(Box::new(func))
        {
            warn!("{} pool queue full, job dropped", self.name);
        }
    }
}

impl Worker {
    pub fn new(receiver: Receiver<Job>, name: &'static str) {
        let _ = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let worker = Worker { receiver, name };
                worker.run();
            });
    }

    pub fn run(&self) {
        while let Ok(job) = self.receiver.recv() {
            job();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        warn!("{} pool worker dropped, respawning", self.name);
        let receiver = self.receiver.clone();
        Worker::new(receiver, self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn jobs_run_on_the_pool() {
        let pool = ThreadPool::new("test", 16);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            pool.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) < 8 {
            assert!(std::time::Instant::now() < deadline, "jobs did not run");
            thread::sleep(Duration::from_millis(10));
        }
    }
}
