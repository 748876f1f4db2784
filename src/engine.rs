//! AuditEngine: recording facade with asynchronous write-behind
//!
//! # Architecture
//!
//! ```text
//! Request handler ──► record() ──► Hot Cache (bounded ring)
//!        (sync,            └─────► Write Queue ──► Persister Task ──► SQLite
//!    fire-and-forget)                              (flushes every
//!                                                   tick, one batch
//!                                                   per transaction)
//! ```
//!
//! Producers never wait on the database: `record()` touches only in-memory
//! structures behind one short mutex hold. The persister task drains the
//! queue on a repeating interval; each batch is written in a single
//! transaction and requeued whole if the write fails, so the durable store
//! never exposes a partial batch.
//!
//! # Example
//!
//! ```no_run
//! use blackbox::{AuditAction, AuditEngine, AuditEvent, AuditQuery, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> blackbox::Result<()> {
//!     let engine = AuditEngine::open("audit.db", EngineConfig::default()).await?;
//!
//!     engine.record(AuditEvent::new(AuditAction::DiagramCreate, "dgm-1").with_actor("user-7"));
//!
//!     let recent = engine.recent(&AuditQuery::new());
//!     println!("{} recent entries", recent.len());
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backends::sqlite::SqliteAuditStore;
use crate::cache::HotCache;
use crate::config::EngineConfig;
use crate::error::{AuditError, Result};
use crate::query::AuditQuery;
use crate::queue::WriteQueue;
use crate::{AuditDetails, AuditEntry, AuditEvent, AuditStore, MAX_DETAILS_BYTES};

/// Consecutive no-progress flush failures tolerated by the shutdown drain
/// before it reports the stop as unclean.
const DRAIN_FAILURE_LIMIT: u32 = 3;

/// Snapshot of engine health for operational monitoring
///
/// `pending_writes` is the backlog gauge: it grows without bound under a
/// sustained storage outage and must be watched externally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Rows in the durable store
    pub total_entries: u64,
    /// Timestamp of the oldest durable row
    pub oldest_entry: Option<String>,
    /// Timestamp of the newest durable row
    pub newest_entry: Option<String>,
    /// Entries recorded but not yet flushed
    pub pending_writes: usize,
    /// Entries currently held by the hot cache
    pub cache_size: usize,
}

/// In-memory recorder side: everything `record()` touches, behind one lock
struct RecorderState {
    cache: HotCache,
    queue: WriteQueue,
    /// Last issued timestamp; new stamps are clamped to never run backwards
    last_stamp: Option<DateTime<Utc>>,
}

/// Background task bookkeeping
struct Lifecycle {
    started: bool,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<dyn AuditStore>,
    state: Mutex<RecorderState>,
    /// Serializes durable-store transactions (flush ticks, manual flushes,
    /// shutdown drain); reads never take it
    flush_lock: tokio::sync::Mutex<()>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl EngineInner {
    fn state(&self) -> MutexGuard<'_, RecorderState> {
        // A poisoned lock only means another thread panicked mid-append;
        // the queue and cache are still structurally sound.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Embedded audit trail engine
///
/// Cheap to clone; all clones share the same cache, queue, and store.
/// Construct with [`AuditEngine::new`] (any store) or [`AuditEngine::open`]
/// (SQLite at a path), then call [`AuditEngine::init`] to start the
/// background persister.
#[derive(Clone)]
pub struct AuditEngine {
    inner: Arc<EngineInner>,
}

impl AuditEngine {
    /// Create an engine over an existing store
    ///
    /// Validates the configuration and fails fast on unusable values. The
    /// background persister is not started until [`AuditEngine::init`].
    pub fn new(store: Arc<dyn AuditStore>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let state = RecorderState {
            cache: HotCache::new(config.max_memory_entries),
            queue: WriteQueue::new(),
            last_stamp: None,
        };
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                state: Mutex::new(state),
                flush_lock: tokio::sync::Mutex::new(()),
                lifecycle: tokio::sync::Mutex::new(Lifecycle {
                    started: false,
                    shutdown_tx: None,
                    handle: None,
                }),
            }),
        })
    }

    /// Open a SQLite-backed engine at the specified path and start it
    pub async fn open(path: &str, config: EngineConfig) -> Result<Self> {
        let store = SqliteAuditStore::open(path).await?;
        let engine = Self::new(Arc::new(store), config)?;
        engine.init().await?;
        Ok(engine)
    }

    /// Hydrate the hot cache and start the background persister
    ///
    /// Idempotent: repeated calls after the first are no-ops.
    pub async fn init(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.started {
            return Ok(());
        }

        let recent = self
            .inner
            .store
            .load_recent(self.inner.config.max_memory_entries)
            .await?;
        let hydrated = recent.len();
        self.inner.state().cache.hydrate(recent);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_flush_loop(Arc::downgrade(&self.inner), shutdown_rx));
        lifecycle.shutdown_tx = Some(shutdown_tx);
        lifecycle.handle = Some(handle);
        lifecycle.started = true;

        info!(
            hydrated,
            flush_interval_ms = self.inner.config.flush_interval_ms,
            batch_size = self.inner.config.batch_size,
            "Audit engine started"
        );
        Ok(())
    }

    /// Record one audit event (fire-and-forget)
    ///
    /// Synchronous and infallible: the entry is stamped, appended to the hot
    /// cache and the write queue, and the call returns. Persistence happens
    /// later on the flush interval. An unserializable or oversized `details`
    /// payload is dropped (with a warning) rather than failing the caller.
    pub fn record(&self, event: AuditEvent) {
        let details = bounded_details(&event);

        let now = Utc::now();
        let mut state = self.inner.state();
        let stamp = match state.last_stamp {
            Some(last) if now < last => last,
            _ => now,
        };
        state.last_stamp = Some(stamp);

        let entry = AuditEntry {
            timestamp: AuditEntry::format_timestamp(stamp),
            action: event.action,
            actor_id: event.actor_id,
            actor_role: event.actor_role,
            resource_id: event.resource_id,
            details,
            ip_address: event.ip_address,
            user_agent: event.user_agent,
        };

        state.cache.append(entry.clone());
        state.queue.push(entry);
    }

    /// Recent activity from the hot cache only, newest first
    ///
    /// Fast and purely in-memory; sees at most the newest
    /// `max_memory_entries` entries, including ones not yet flushed. Use
    /// [`AuditEngine::query`] for the complete durable history.
    pub fn recent(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        let snapshot = self.inner.state().cache.snapshot();
        snapshot
            .into_iter()
            .rev()
            .filter(|entry| query.matches(entry))
            .take(query.limit)
            .collect()
    }

    /// Filtered scan over the durable store, newest first
    ///
    /// The canonical source of truth beyond the cache window; the only way
    /// to see entries already evicted from the hot cache.
    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        self.inner.store.query(query).await
    }

    /// Engine health counters
    pub async fn stats(&self) -> Result<EngineStats> {
        let store_stats = self.inner.store.stats().await?;
        let (pending_writes, cache_size) = {
            let state = self.inner.state();
            (state.queue.len(), state.cache.len())
        };
        Ok(EngineStats {
            total_entries: store_stats.total_entries,
            oldest_entry: store_stats.oldest_entry,
            newest_entry: store_stats.newest_entry,
            pending_writes,
            cache_size,
        })
    }

    /// Flush one batch immediately, returning the count written
    ///
    /// Zero means the queue was empty. On failure the whole batch is back at
    /// the head of the queue for the next attempt.
    pub async fn flush_now(&self) -> Result<usize> {
        flush_once(&self.inner).await
    }

    /// Delete durable entries past the retention horizon, returning the count
    ///
    /// No-op when `retention_days` is zero (retain forever).
    pub async fn cleanup_now(&self) -> Result<u64> {
        sweep(&self.inner).await
    }

    /// Stop the persister and drain the write queue
    ///
    /// The shutdown signal cancels the flush timer, never an in-flight
    /// transaction. After the task stops, the queue is drained with repeated
    /// flushes; individual batch failures are logged and retried, and only
    /// `DRAIN_FAILURE_LIMIT` consecutive no-progress failures abort the
    /// drain with [`AuditError::DrainIncomplete`]. Safe to call repeatedly.
    pub async fn shutdown(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;

        if let Some(tx) = lifecycle.shutdown_tx.take() {
            let _ = tx.send(());
            debug!("Audit engine shutdown signal sent");
        }
        if let Some(handle) = lifecycle.handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Audit persister task failed to join");
            }
        }

        let mut no_progress = 0u32;
        loop {
            let pending = self.inner.state().queue.len();
            if pending == 0 {
                break;
            }
            match flush_once(&self.inner).await {
                Ok(written) => {
                    no_progress = 0;
                    debug!(written, "Drained batch during shutdown");
                }
                Err(e) => {
                    no_progress += 1;
                    warn!(
                        error = %e,
                        pending,
                        attempt = no_progress,
                        "Flush failed during shutdown drain"
                    );
                    if no_progress >= DRAIN_FAILURE_LIMIT {
                        let remaining = self.inner.state().queue.len();
                        return Err(AuditError::DrainIncomplete { remaining });
                    }
                }
            }
        }

        info!("Audit engine stopped");
        Ok(())
    }
}

/// Enforce the serialized-size bound on a draft's details payload
fn bounded_details(event: &AuditEvent) -> Option<AuditDetails> {
    let details = event.details.as_ref()?;
    match details.to_canonical_json() {
        Ok(raw) if raw.len() <= MAX_DETAILS_BYTES => Some(details.clone()),
        Ok(raw) => {
            warn!(
                action = %event.action,
                resource_id = %event.resource_id,
                size = raw.len(),
                limit = MAX_DETAILS_BYTES,
                "Dropping oversized details payload"
            );
            None
        }
        Err(e) => {
            warn!(
                action = %event.action,
                resource_id = %event.resource_id,
                error = %e,
                "Dropping unserializable details payload"
            );
            None
        }
    }
}

/// The background persister: flushes on a repeating interval until told to
/// stop, sweeping retention every `cleanup_frequency` cycles
async fn run_flush_loop(inner: Weak<EngineInner>, mut shutdown_rx: oneshot::Receiver<()>) {
    let config = match inner.upgrade() {
        Some(strong) => strong.config.clone(),
        None => return,
    };

    let mut interval = tokio::time::interval(Duration::from_millis(config.flush_interval_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        flush_interval_ms = config.flush_interval_ms,
        batch_size = config.batch_size,
        "Audit persister started"
    );

    let mut cycles: u64 = 0;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                // The engine was dropped without shutdown; stop quietly.
                let Some(engine) = inner.upgrade() else { break; };

                cycles += 1;
                let _ = flush_once(&engine).await;

                if config.retention_days > 0 && cycles % config.cleanup_frequency == 0 {
                    match sweep(&engine).await {
                        Ok(0) => {}
                        Ok(deleted) => info!(deleted, "Retention sweep removed aged entries"),
                        Err(e) => warn!(error = %e, "Retention sweep failed"),
                    }
                }
            }

            _ = &mut shutdown_rx => {
                info!("Audit persister shutdown signal received");
                break;
            }
        }
    }
}

/// Pop one batch and write it in a single transaction
///
/// All-or-nothing: on failure the popped batch goes back to the head of the
/// queue, unmodified and in order, for the next attempt.
async fn flush_once(inner: &EngineInner) -> Result<usize> {
    let _guard = inner.flush_lock.lock().await;

    let batch = inner.state().queue.pop_batch(inner.config.batch_size);
    if batch.is_empty() {
        return Ok(0);
    }
    let count = batch.len();

    match inner.store.insert_batch(&batch).await {
        Ok(()) => {
            debug!(written = count, "Flushed audit batch");
            Ok(count)
        }
        Err(e) => {
            let pending = {
                let mut state = inner.state();
                state.queue.requeue_front(batch);
                state.queue.len()
            };
            warn!(error = %e, pending, "Failed to flush audit batch; requeued for retry");
            Err(e)
        }
    }
}

/// Delete durable entries older than the retention horizon
async fn sweep(inner: &EngineInner) -> Result<u64> {
    if inner.config.retention_days == 0 {
        return Ok(0);
    }
    let cutoff = Utc::now() - chrono::Duration::days(inner.config.retention_days as i64);
    let deleted = inner
        .store
        .delete_before(&AuditEntry::format_timestamp(cutoff))
        .await?;
    if deleted > 0 {
        debug!(deleted, "Deleted entries past retention horizon");
    }
    Ok(deleted)
}
