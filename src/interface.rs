//! Threaded interface for submitting and cancelling merged tag searches.
//!
//! Searches run on a background thread each and report back through a
//! channel, so a caller (a UI event loop, say) can keep going while a search
//! over large base stores completes. Cancellation is cooperative via an
//! `Arc<AtomicBool>`; the same token type stops bulk writer operations
//! between rows.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver};
use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::construct::{TagSearchRequest, TagSearchResult};
use crate::error::{Result, TagDbError};
use crate::merge::MergedReader;

/// Cancellation token shared with a worker thread or a batch operation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);
impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Opaque search identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SearchId(u64);

/// What a finished (or cancelled) search sends back.
#[derive(Debug)]
pub struct SearchOutcome {
    pub id: SearchId,
    pub result: Result<TagSearchResult>,
    pub elapsed: Duration,
}

/// Handle to a running or completed search.
pub struct SearchHandle {
    pub id: SearchId,
    cancel: CancelToken,
    started: Instant,
    join: Option<JoinHandle<()>>,
    pub results: Receiver<SearchOutcome>,
}
impl SearchHandle {
    /// Request cancellation. A search already past its last check still
    /// reports `Cancelled` rather than its rows.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
    /// Wait for the worker and take its outcome.
    pub fn wait(mut self) -> Option<SearchOutcome> {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        self.results.try_recv().ok()
    }
    /// Elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Registry managing search lifecycles.
pub struct SearchInterface {
    reader: Arc<MergedReader>,
    next_id: Mutex<u64>,
    active: Arc<Mutex<HashMap<SearchId, CancelToken>>>,
}

impl SearchInterface {
    pub fn new(reader: Arc<MergedReader>) -> Self {
        Self {
            reader,
            next_id: Mutex::new(0),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn allocate_id(&self) -> SearchId {
        let mut next = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
        *next += 1;
        SearchId(*next)
    }

    /// Run a search on a background thread. The outcome arrives on the
    /// handle's channel exactly once.
    pub fn start_search(&self, request: TagSearchRequest) -> SearchHandle {
        let id = self.allocate_id();
        let cancel = CancelToken::new();
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, cancel.clone());

        let (tx, rx) = mpsc::channel();
        let reader = Arc::clone(&self.reader);
        let active = Arc::clone(&self.active);
        let cancel_for_thread = cancel.clone();
        let started = Instant::now();
        let join = std::thread::spawn(move || {
            // checked before and after, the search itself runs to completion
            let result = if cancel_for_thread.is_cancelled() {
                Err(TagDbError::Cancelled)
            } else {
                match reader.search(&request) {
                    Ok(_) if cancel_for_thread.is_cancelled() => Err(TagDbError::Cancelled),
                    other => other,
                }
            };
            active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            debug!(?id, query = %request.query, ok = result.is_ok(), "search finished");
            // the receiver may be gone; nobody is waiting then
            let _ = tx.send(SearchOutcome {
                id,
                result,
                elapsed: started.elapsed(),
            });
        });

        SearchHandle {
            id,
            cancel,
            started,
            join: Some(join),
            results: rx,
        }
    }

    /// Run a search on the current thread.
    pub fn run_sync(&self, request: &TagSearchRequest) -> Result<TagSearchResult> {
        self.reader.search(request)
    }

    /// Cancel a search by id. Returns false when it is unknown or finished.
    pub fn cancel(&self, id: SearchId) -> bool {
        match self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}
