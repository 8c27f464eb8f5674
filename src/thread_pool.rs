// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Fixed-size worker pool with a condvar task queue.
// RPC request handlers run on these workers so a slow handler never
// stalls the socket reader threads.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::info;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    tasks: VecDeque<Task>,
    stop: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cv: Condvar,
}

/// A named pool of worker threads draining a shared task queue.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
    name: String,
}

impl ThreadPool {
    /// Spawn `num_threads` workers named `{name}-{i}`.
    pub fn new(name: &str, num_threads: usize) -> ThreadPool {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                stop: false,
            }),
            cv: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let shared = Arc::clone(&shared);
            let thread_name = format!("{name}-{i}");
            let handle = std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || loop {
                    let task = {
                        let mut st = shared.state.lock().unwrap();
                        loop {
                            if let Some(task) = st.tasks.pop_front() {
                                break task;
                            }
                            if st.stop {
                                return;
                            }
                            st = shared.cv.wait(st).unwrap();
                        }
                    };
                    task();
                })
                .expect("spawn pool worker");
            workers.push(handle);
        }

        ThreadPool {
            shared,
            workers,
            name: name.to_owned(),
        }
    }

    /// Queue a task. Tasks queued after shutdown are dropped.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut st = self.shared.state.lock().unwrap();
            if st.stop {
                return;
            }
            st.tasks.push_back(Box::new(f));
        }
        self.shared.cv.notify_one();
    }

    /// Stop accepting tasks, drain the queue and join every worker.
    pub fn shutdown(&mut self) {
        {
            let mut st = self.shared.state.lock().unwrap();
            if st.stop {
                return;
            }
            st.stop = true;
        }
        self.shared.cv.notify_all();
        for h in self.workers.drain(..) {
            let _ = h.join();
        }
        info!("thread pool {} stopped", self.name);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_all_tasks() {
        let done = Arc::new(AtomicUsize::new(0));
        let mut pool = ThreadPool::new("t", 3);
        for _ in 0..100 {
            let done = Arc::clone(&done);
            pool.execute(move || {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 100);
    }
}
