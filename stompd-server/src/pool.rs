//! Fixed-size worker pool for protocol execution.

use crossbeam_channel::{unbounded, Sender};
use std::io;
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A bounded set of threads draining a shared job queue.
///
/// Dropping the pool closes the queue and joins the workers after the
/// queued jobs have drained.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `threads` workers (at least one).
    pub fn new(threads: usize) -> io::Result<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("stompd-worker-{i}"))
                .spawn(move || {
                    for job in receiver {
                        job();
                    }
                })?;
            workers.push(worker);
        }
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Queues a job for execution on some worker.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Box::new(job));
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_all_jobs_run() {
        let pool = WorkerPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool); // joins after draining
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_zero_threads_clamped_to_one() {
        let pool = WorkerPool::new(0).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = counter.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_jobs_run_in_parallel() {
        let pool = WorkerPool::new(2).unwrap();
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        // Two jobs that can only finish if both run at the same time.
        let tx2 = tx.clone();
        let rx2 = rx.clone();
        pool.execute(move || {
            tx.send(()).unwrap();
        });
        pool.execute(move || {
            rx2.recv().unwrap();
        });
        drop(tx2);
        drop(rx);
        drop(pool);
    }
}
