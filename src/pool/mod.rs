//! Bounded worker pool. Each worker owns one session for its whole life, claims item indices
//! from a shared atomic cursor and writes each result into that index's write-once slot.

mod progress;

pub use progress::{ChannelProgressSink, NoopProgress, ProgressSink};

use crate::fetch::ItemFetcher;
use crate::model::{ErrorKind, ItemDescriptor, ItemResult, ProgressEvent};
use crate::render::ArtifactRenderer;
use crate::sanitize::{ContentSanitizer, SanitizeError};
use crate::session::{Session, SessionError, SessionFactory};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_CONCURRENCY: usize = 3;
pub const DEFAULT_DELAY: Duration = Duration::from_millis(2000);

const NO_ITEM: usize = usize::MAX;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Could not start session {index} of {requested}: {source}")]
    SessionStartup {
        index: usize,
        requested: usize,
        #[source]
        source: SessionError,
    },

    #[error(
        "Item at position {position} has original index {original_index}; \
         indices must be dense and in order"
    )]
    NonDenseIndex {
        position: usize,
        original_index: usize,
    },
}

/// Fetch, sanitize and render for one item. Strictly sequential.
pub struct ItemPipeline {
    fetcher: ItemFetcher,
    sanitizer: ContentSanitizer,
    renderer: ArtifactRenderer,
}

impl ItemPipeline {
    pub fn new(
        fetcher: ItemFetcher,
        sanitizer: ContentSanitizer,
        renderer: ArtifactRenderer,
    ) -> Self {
        Self {
            fetcher,
            sanitizer,
            renderer,
        }
    }

    /// Run every stage for `item`. Failures come back as a failed `ItemResult`, never as an error.
    pub async fn process(&self, session: &mut dyn Session, item: &ItemDescriptor) -> ItemResult {
        let fetched = match self.fetcher.fetch(session, item).await {
            Ok(f) => f,
            Err(e) => return ItemResult::failed(item, e.attempts, e.kind, e.message),
        };
        let doc = match self.sanitizer.sanitize(&fetched.raw) {
            Ok(d) => d,
            Err(e @ SanitizeError::Empty { .. }) => {
                return ItemResult::failed(
                    item,
                    fetched.attempts,
                    ErrorKind::EmptyContent,
                    e.to_string(),
                )
            }
            Err(e) => {
                return ItemResult::failed(item, fetched.attempts, ErrorKind::Unknown, e.to_string())
            }
        };
        match self.renderer.render(session, item, &doc).await {
            Ok(artifact) => ItemResult::rendered(item, fetched.attempts, artifact),
            Err(e) => ItemResult::failed(
                item,
                fetched.attempts,
                ErrorKind::RenderFailure,
                e.to_string(),
            ),
        }
    }
}

/// Results of a pool run, indexed by `original_index`.
#[derive(Debug, Clone)]
pub struct PoolOutcome {
    pub results: Vec<ItemResult>,
    /// The global abort fired before the cursor drained.
    pub aborted: bool,
}

impl PoolOutcome {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

pub struct WorkerPool {
    concurrency: usize,
    inter_item_delay: Duration,
    factory: Arc<dyn SessionFactory>,
}

struct Shared {
    items: Vec<ItemDescriptor>,
    slots: Vec<OnceLock<ItemResult>>,
    cursor: AtomicUsize,
    /// Index each worker is processing, `NO_ITEM` when idle.
    in_flight: Vec<AtomicUsize>,
    completed: Mutex<usize>,
    pipeline: Arc<ItemPipeline>,
    sink: Arc<dyn ProgressSink>,
    delay: Duration,
    cancel: CancellationToken,
}

impl Shared {
    fn record(&self, index: usize, result: ItemResult) {
        let event = ProgressEvent {
            completed: 0,
            total: self.items.len(),
            original_index: index,
            last_item_title: result.title.clone(),
            last_item_success: result.is_success(),
            detail: result.error_message().map(str::to_string),
        };
        if self.slots[index].set(result).is_err() {
            warn!(index, "result slot already written, keeping the first result");
            return;
        }
        let mut completed = self.completed.lock().unwrap_or_else(|p| p.into_inner());
        *completed += 1;
        self.sink.emit(ProgressEvent {
            completed: *completed,
            ..event
        });
    }

    fn drained(&self) -> bool {
        self.cursor.load(Ordering::SeqCst) >= self.items.len()
    }
}

impl WorkerPool {
    pub fn new(
        concurrency: usize,
        inter_item_delay: Duration,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            concurrency: concurrency.max(1),
            inter_item_delay,
            factory,
        }
    }

    /// Process every item and return one result per item, in `original_index` order.
    /// Only session startup failure is fatal; `cancel` stops claiming and drops in-flight items.
    pub async fn run(
        &self,
        items: Vec<ItemDescriptor>,
        pipeline: Arc<ItemPipeline>,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<PoolOutcome, PoolError> {
        if let Some((position, item)) = items
            .iter()
            .enumerate()
            .find(|(i, item)| item.original_index != *i)
        {
            return Err(PoolError::NonDenseIndex {
                position,
                original_index: item.original_index,
            });
        }
        let total = items.len();
        let workers = self.concurrency.min(total);
        if workers == 0 {
            return Ok(PoolOutcome {
                results: Vec::new(),
                aborted: cancel.is_cancelled(),
            });
        }

        let sessions = self.start_sessions(workers).await?;
        info!(items = total, workers, "pool started");

        let shared = Arc::new(Shared {
            slots: (0..total).map(|_| OnceLock::new()).collect(),
            items,
            cursor: AtomicUsize::new(0),
            in_flight: (0..workers).map(|_| AtomicUsize::new(NO_ITEM)).collect(),
            completed: Mutex::new(0),
            pipeline,
            sink,
            delay: self.inter_item_delay,
            cancel,
        });

        let handles: Vec<_> = sessions
            .into_iter()
            .enumerate()
            .map(|(id, session)| tokio::spawn(worker(id, Arc::clone(&shared), session)))
            .collect();

        let mut panicked = Vec::new();
        for (id, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(mut session) => {
                    if let Err(e) = session.close().await {
                        warn!(worker = id, error = %e, "closing session failed");
                    }
                }
                Err(e) => {
                    warn!(worker = id, error = %e, "worker stopped abnormally");
                    let index = shared.in_flight[id].load(Ordering::SeqCst);
                    if index != NO_ITEM {
                        panicked.push(index);
                    }
                }
            }
        }

        let aborted = shared.cancel.is_cancelled();
        let results = shared
            .slots
            .iter()
            .zip(&shared.items)
            .enumerate()
            .map(|(index, (slot, item))| match slot.get() {
                Some(r) => r.clone(),
                None if panicked.contains(&index) => ItemResult::failed(
                    item,
                    0,
                    ErrorKind::Unknown,
                    "worker panicked while processing item",
                ),
                None if aborted => ItemResult::cancelled(item),
                None => ItemResult::failed(
                    item,
                    0,
                    ErrorKind::Unknown,
                    "no worker left to process item",
                ),
            })
            .collect();
        let outcome = PoolOutcome { results, aborted };
        info!(
            succeeded = outcome.succeeded(),
            failed = outcome.failed(),
            aborted,
            "pool shut down"
        );
        Ok(outcome)
    }

    async fn start_sessions(&self, workers: usize) -> Result<Vec<Box<dyn Session>>, PoolError> {
        let mut sessions: Vec<Box<dyn Session>> = Vec::with_capacity(workers);
        for index in 0..workers {
            match self.factory.create().await {
                Ok(s) => sessions.push(s),
                Err(source) => {
                    for mut s in sessions {
                        if let Err(e) = s.close().await {
                            warn!(error = %e, "closing session after startup failure");
                        }
                    }
                    return Err(PoolError::SessionStartup {
                        index,
                        requested: workers,
                        source,
                    });
                }
            }
        }
        Ok(sessions)
    }
}

async fn worker(id: usize, shared: Arc<Shared>, mut session: Box<dyn Session>) -> Box<dyn Session> {
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        let index = shared.cursor.fetch_add(1, Ordering::SeqCst);
        let Some(item) = shared.items.get(index) else {
            break;
        };
        shared.in_flight[id].store(index, Ordering::SeqCst);
        debug!(worker = id, index, title = %item.title, "claimed item");

        let result = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => None,
            r = shared.pipeline.process(session.as_mut(), item) => Some(r),
        };
        let Some(result) = result else {
            debug!(worker = id, index, "abandoning in-flight item on abort");
            break;
        };
        shared.record(index, result);
        shared.in_flight[id].store(NO_ITEM, Ordering::SeqCst);

        if shared.drained() {
            break;
        }
        if !shared.delay.is_zero() {
            tokio::select! {
                _ = shared.cancel.cancelled() => break,
                _ = tokio::time::sleep(shared.delay) => {}
            }
        }
    }
    session
}
