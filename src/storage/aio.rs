//! Asynchronous page reads
//!
//! Read-ahead submits reads and returns immediately; the I/O layer calls the
//! completion once the page image is available. Completions run on the I/O
//! thread and must not block on locks the submitter may hold.
//!
//! # Architecture
//!
//! ```text
//!   submit_read() ──▶ crossbeam channel ──▶ worker 0 ─┐
//!                                     ├──▶ worker 1 ─┼─▶ PageStore::read_page
//!                                     └──▶ worker N ─┘          │
//!                                                               ▼
//!                                                    completion(Result<Vec<u8>>)
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::page::PageId;
use crate::storage::store::PageStore;

/// Callback receiving the page image or the read error
pub type ReadCompletion = Box<dyn FnOnce(Result<Vec<u8>>) + Send + 'static>;

/// A read to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub page: PageId,
    pub len: usize,
}

/// Ticket of a submitted read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRead {
    pub id: u64,
    pub page: PageId,
}

/// Asynchronous read interface
pub trait AsyncIo: Send + Sync {
    /// Queue a read; `completion` runs exactly once
    fn submit_read(&self, request: ReadRequest, completion: ReadCompletion) -> Result<PendingRead>;

    /// Reads submitted but not yet completed
    fn pending_reads(&self) -> usize;
}

struct IoJob {
    id: u64,
    request: ReadRequest,
    completion: ReadCompletion,
}

// =============================================================================
// Threaded I/O
// =============================================================================

/// Worker-thread pool reading from a [`PageStore`]
pub struct ThreadedIo {
    tx: Mutex<Option<Sender<IoJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
    next_id: AtomicU64,
}

impl ThreadedIo {
    pub fn new(store: Arc<dyn PageStore>, threads: usize) -> Result<Self> {
        let (tx, rx) = channel::unbounded::<IoJob>();
        let pending = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(threads);
        for n in 0..threads.max(1) {
            let rx = rx.clone();
            let store = Arc::clone(&store);
            let pending = Arc::clone(&pending);
            let handle = thread::Builder::new()
                .name(format!("page-io-{}", n))
                .spawn(move || {
                    for job in rx.iter() {
                        let mut buf = vec![0u8; job.request.len];
                        let result = store.read_page(job.request.page, &mut buf).map(|_| buf);
                        if let Err(e) = &result {
                            debug!(id = job.id, page = %job.request.page, error = %e, "async read failed");
                        }
                        (job.completion)(result);
                        pending.fetch_sub(1, Ordering::SeqCst);
                    }
                })?;
            workers.push(handle);
        }

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            pending,
            next_id: AtomicU64::new(1),
        })
    }

    /// Stop accepting reads, drain the queue and join the workers.
    ///
    /// Must not be called from a completion.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                warn!("page I/O worker panicked");
            }
        }
    }
}

impl AsyncIo for ThreadedIo {
    fn submit_read(&self, request: ReadRequest, completion: ReadCompletion) -> Result<PendingRead> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "page I/O is shut down",
            )));
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        if tx
            .send(IoJob {
                id,
                request,
                completion,
            })
            .is_err()
        {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "page I/O workers exited",
            )));
        }
        Ok(PendingRead {
            id,
            page: request.page,
        })
    }

    fn pending_reads(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl Drop for ThreadedIo {
    fn drop(&mut self) {
        // Workers exit once the channel is closed; joining here could run on
        // a worker thread that dropped the last pool handle.
        self.tx.get_mut().take();
    }
}

// =============================================================================
// Inline I/O
// =============================================================================

/// Performs the read on the submitting thread and runs the completion before
/// returning. Deterministic; used by tests and single-threaded tools.
pub struct InlineIo {
    store: Arc<dyn PageStore>,
    submitted: Mutex<Vec<PageId>>,
    next_id: AtomicU64,
}

impl InlineIo {
    pub fn new(store: Arc<dyn PageStore>) -> Self {
        Self {
            store,
            submitted: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Pages submitted so far, in order
    pub fn submitted(&self) -> Vec<PageId> {
        self.submitted.lock().clone()
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted.lock().len()
    }
}

impl AsyncIo for InlineIo {
    fn submit_read(&self, request: ReadRequest, completion: ReadCompletion) -> Result<PendingRead> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.submitted.lock().push(request.page);
        let mut buf = vec![0u8; request.len];
        let result = self.store.read_page(request.page, &mut buf).map(|_| buf);
        completion(result);
        Ok(PendingRead {
            id,
            page: request.page,
        })
    }

    fn pending_reads(&self) -> usize {
        0
    }
}
