//! The compile queue. This runs 1 or more worker threads and has them run compilation plans off
//! the main thread, handing each result to a callback.

use crate::compile::{CompilationPlan, CompileResult, compile};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
};

/// Called on a worker thread with the outcome of a compile.
pub type OnCompiled = Box<dyn FnOnce(CompileResult) + Send>;

struct Job {
    plan: CompilationPlan,
    on_compiled: OnCompiled,
}

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    cv: Condvar,
    /// How many worker threads are waiting for work?
    idle: AtomicUsize,
    shutdown: AtomicBool,
}

pub struct CompileQueue {
    /// The hard cap on the number of worker threads.
    max_workers: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl CompileQueue {
    /// Create a queue which will run at most `jobs` compiles at once. Worker threads are only
    /// started when there is work for them.
    pub fn new(jobs: usize) -> Self {
        Self {
            max_workers: jobs.max(1),
            workers: Mutex::new(Vec::new()),
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                cv: Condvar::new(),
                idle: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// How many plans are waiting for a worker?
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Queue `plan` to be compiled on a worker thread. `on_compiled` is called on that thread
    /// once the compile has finished or failed.
    pub fn push(&self, plan: CompilationPlan, on_compiled: OnCompiled) {
        self.shared
            .queue
            .lock()
            .push_back(Job { plan, on_compiled });
        self.shared.cv.notify_one();

        // Is there an idle worker thread that can take the job on? If not, and we are below our
        // cap, start another.
        if self.shared.idle.load(Ordering::Relaxed) == 0 {
            let mut lk = self.workers.lock();
            if lk.len() < self.max_workers {
                self.shared.idle.fetch_add(1, Ordering::Relaxed);
                let shared = Arc::clone(&self.shared);
                lk.push(thread::spawn(move || worker(&shared)));
            }
        }
    }
}

fn worker(shared: &Shared) {
    let mut lk = shared.queue.lock();
    while !shared.shutdown.load(Ordering::Relaxed) {
        match lk.pop_front() {
            Some(job) => {
                shared.idle.fetch_sub(1, Ordering::Relaxed);
                MutexGuard::unlocked(&mut lk, || {
                    let r = compile(&job.plan);
                    (job.on_compiled)(r);
                });
                shared.idle.fetch_add(1, Ordering::Relaxed);
            }
            None => shared.cv.wait(&mut lk),
        }
    }
}

impl Drop for CompileQueue {
    /// Running compiles finish; queued ones are abandoned.
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        {
            let _lk = self.shared.queue.lock();
            self.shared.cv.notify_all();
        }
        for hdl in self.workers.lock().drain(..) {
            if let Err(e) = hdl.join() {
                eprintln!("specjit worker thread error");
                std::panic::resume_unwind(e);
            }
        }
    }
}
