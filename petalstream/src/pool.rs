//! Fixed-size pool of decode worker threads.

use crate::error::{PetalStreamError, Result};
use crate::manager::PrestockJob;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

struct Worker {
    tasks: Option<Sender<PrestockJob>>,
    handle: Option<JoinHandle<()>>,
}

/// Decode threads that each run one prestock job at a time.
///
/// Idle workers announce their index on a shared channel; the dispatcher
/// receives an index and hands that worker exactly one job.
pub struct DecodeThreadPool {
    workers: Vec<Worker>,
    idle_rx: Receiver<usize>,
    stop: Arc<AtomicBool>,
}

impl DecodeThreadPool {
    /// Spawns `num_threads` workers. Running jobs return early once `stop` is set.
    pub fn new(num_threads: usize, stop: Arc<AtomicBool>) -> Result<Self> {
        if num_threads == 0 {
            return Err(PetalStreamError::Configuration(
                "Decode pool needs at least one thread".into(),
            ));
        }

        let (idle_tx, idle_rx) = crossbeam_channel::bounded(num_threads);
        let mut workers = Vec::with_capacity(num_threads);
        for index in 0..num_threads {
            let (task_tx, task_rx) = crossbeam_channel::bounded::<PrestockJob>(1);
            let idle_tx = idle_tx.clone();
            let stop = stop.clone();
            let handle = std::thread::Builder::new()
                .name(format!("petalstream-decode-{}", index))
                .spawn(move || worker_loop(index, task_rx, idle_tx, stop))
                .map_err(|e| {
                    PetalStreamError::Engine(format!("Failed to spawn decode thread: {}", e))
                })?;
            workers.push(Worker {
                tasks: Some(task_tx),
                handle: Some(handle),
            });
        }

        log::debug!("Started {} decode threads", num_threads);
        Ok(Self {
            workers,
            idle_rx,
            stop,
        })
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Yields the index of each worker as it becomes idle.
    pub fn idle_workers(&self) -> &Receiver<usize> {
        &self.idle_rx
    }

    /// Hands `job` to an idle worker previously received from [`idle_workers`](Self::idle_workers).
    pub fn assign(&self, worker: usize, job: PrestockJob) {
        let Some(tasks) = self.workers.get(worker).and_then(|w| w.tasks.as_ref()) else {
            log::error!("No decode worker {}", worker);
            return;
        };
        if tasks.try_send(job).is_err() {
            log::error!("Decode worker {} is not idle, dropping prestock job", worker);
        }
    }

    /// Stops the workers after their current job and joins them.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        for worker in &mut self.workers {
            worker.tasks.take();
        }
        for (index, worker) in self.workers.iter_mut().enumerate() {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    log::error!("Decode thread {} panicked", index);
                }
            }
        }
    }
}

impl Drop for DecodeThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    index: usize,
    tasks: Receiver<PrestockJob>,
    idle: Sender<usize>,
    stop: Arc<AtomicBool>,
) {
    if idle.send(index).is_err() {
        return;
    }
    for job in tasks.iter() {
        job.run(&stop);
        if stop.load(Ordering::Acquire) || idle.send(index).is_err() {
            break;
        }
    }
    log::debug!("Decode thread {} exiting", index);
}
