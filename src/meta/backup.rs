// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Rebuild journal: every blob that reaches DATA_READY is replicated as a
// {key, descriptor} pair to the LocalSvc of its owning rank, and removed
// again on free. After a MetaSvc restart the ranks ship these pairs back
// so the catalog can be rebuilt before serving.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::{error, info};

use crate::error::Result;
use crate::meta::blob::BlobDesc;

/// Journal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JournalOp {
    Add = 0,
    Remove = 1,
}

impl JournalOp {
    pub fn from_u8(v: u8) -> Option<JournalOp> {
        match v {
            0 => Some(JournalOp::Add),
            1 => Some(JournalOp::Remove),
            _ => None,
        }
    }
}

/// One journaled pair.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub op: JournalOp,
    pub key: String,
    pub desc: BlobDesc,
}

/// Where journal entries go: the rank-to-rank replicate RPC, or a test
/// double.
pub trait JournalSink: Send + Sync {
    fn replicate(&self, entry: &JournalEntry) -> Result<()>;
}

struct JournalState {
    queue: VecDeque<JournalEntry>,
    stop: bool,
}

struct JournalShared {
    state: Mutex<JournalState>,
    cv: Condvar,
}

/// Asynchronous journal writer. Entries are queued by the state machine
/// and shipped by one background thread so the control plane never waits
/// on a replicate RPC.
pub struct RebuildJournal {
    shared: Arc<JournalShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RebuildJournal {
    pub fn start(sink: Arc<dyn JournalSink>) -> Arc<RebuildJournal> {
        let shared = Arc::new(JournalShared {
            state: Mutex::new(JournalState {
                queue: VecDeque::new(),
                stop: false,
            }),
            cv: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("mmc-journal".into())
            .spawn(move || Self::drain_loop(thread_shared, sink))
            .expect("spawn journal thread");

        Arc::new(RebuildJournal {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn push(&self, op: JournalOp, key: &str, desc: BlobDesc) {
        {
            let mut st = self.shared.state.lock().unwrap();
            if st.stop {
                return;
            }
            st.queue.push_back(JournalEntry {
                op,
                key: key.to_owned(),
                desc,
            });
        }
        self.shared.cv.notify_all();
    }

    /// Stop the worker after the queue drains.
    pub fn stop(&self) {
        {
            let mut st = self.shared.state.lock().unwrap();
            if st.stop {
                return;
            }
            st.stop = true;
        }
        self.shared.cv.notify_all();
        if let Some(h) = self.worker.lock().unwrap().take() {
            let _ = h.join();
        }
        info!("rebuild journal stopped");
    }

    fn drain_loop(shared: Arc<JournalShared>, sink: Arc<dyn JournalSink>) {
        loop {
            let entry = {
                let mut st = shared.state.lock().unwrap();
                loop {
                    if let Some(entry) = st.queue.pop_front() {
                        break entry;
                    }
                    if st.stop {
                        return;
                    }
                    st = shared.cv.wait(st).unwrap();
                }
            };
            if let Err(e) = sink.replicate(&entry) {
                error!(
                    "journal replicate {:?} key {} to rank {} failed: {e}",
                    entry.op, entry.key, entry.desc.rank
                );
            }
        }
    }
}

impl Drop for RebuildJournal {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink(AtomicUsize);

    impl JournalSink for CountingSink {
        fn replicate(&self, _entry: &JournalEntry) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn queue_drains_before_stop() {
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let journal = RebuildJournal::start(sink.clone());
        for i in 0..32 {
            journal.push(
                JournalOp::Add,
                &format!("k{i}"),
                BlobDesc {
                    rank: 0,
                    media: MediaType::Dram,
                    gva: i,
                    size: 4096,
                },
            );
        }
        journal.stop();
        assert_eq!(sink.0.load(Ordering::SeqCst), 32);
    }
}
