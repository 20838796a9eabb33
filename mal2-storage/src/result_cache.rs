//! Content-addressed result cache with single-flight analysis.
//!
//! The persistent [`RecordStore`] holds completed results. On top of it an
//! in-process claim table guarantees that at most one request analyzes a
//! given SHA-256 at a time; every concurrent request for the same digest
//! joins the holder and receives its result.
//!
//! A claim is released when its [`ClaimGuard`] is dropped without being
//! completed, so a failed or cancelled holder never strands its joiners.
//! Exactly one joiner is promoted to holder after a release.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mal2_core::{ArtifactRecord, CacheError, Mal2Result};
use tokio::sync::watch;

use crate::record_store::RecordStore;

/// Default time a joiner waits for the holder before giving up.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
enum SlotState {
    Pending,
    Completed(ArtifactRecord),
    Released,
}

struct Slot {
    generation: u64,
    tx: watch::Sender<SlotState>,
}

struct Inner {
    store: Arc<dyn RecordStore>,
    inflight: DashMap<String, Slot>,
    generation: AtomicU64,
    join_timeout: Duration,
}

impl Inner {
    /// Remove the slot (if still ours) and wake every joiner.
    fn finish(&self, sha256: &str, generation: u64, state: SlotState) {
        if let Some((_, slot)) = self
            .inflight
            .remove_if(sha256, |_, slot| slot.generation == generation)
        {
            slot.tx.send_replace(state);
        }
    }
}

/// Result cache handle. Cheap to clone; clones share the claim table.
#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("inflight", &self.inner.inflight.len())
            .field("join_timeout", &self.inner.join_timeout)
            .finish()
    }
}

/// Outcome of a non-blocking claim attempt.
pub enum Claim {
    /// The caller owns the analysis of this digest.
    Claimed(ClaimGuard),
    /// Another request is analyzing it; wait on the returned handle.
    Joined(JoinWaiter),
}

/// What a joiner observed when the holder finished.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    Completed(ArtifactRecord),
    /// The holder gave up without a result.
    Released,
}

/// How [`ResultCache::acquire`] resolved a digest.
pub enum Resolution {
    /// A completed record already existed.
    Hit(ArtifactRecord),
    /// Another request produced the record while we waited.
    Joined(ArtifactRecord),
    /// The caller must analyze the artifact and complete the guard.
    Owner(ClaimGuard),
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::Hit(r) => f.debug_tuple("Hit").field(&r.sha256()).finish(),
            Resolution::Joined(r) => f.debug_tuple("Joined").field(&r.sha256()).finish(),
            Resolution::Owner(g) => f.debug_tuple("Owner").field(&g.sha256).finish(),
        }
    }
}

impl ResultCache {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self::with_join_timeout(store, DEFAULT_JOIN_TIMEOUT)
    }

    pub fn with_join_timeout(store: Arc<dyn RecordStore>, join_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                inflight: DashMap::new(),
                generation: AtomicU64::new(0),
                join_timeout,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.inner.store
    }

    pub fn join_timeout(&self) -> Duration {
        self.inner.join_timeout
    }

    /// Number of digests currently being analyzed.
    pub fn inflight_count(&self) -> usize {
        self.inner.inflight.len()
    }

    /// Completed record for `sha256`, if any.
    pub async fn lookup(&self, sha256: &str) -> Mal2Result<Option<ArtifactRecord>> {
        self.inner.store.get_analyzed(sha256).await
    }

    /// Atomically claim `sha256` or join the existing holder.
    pub fn claim(&self, sha256: &str) -> Claim {
        match self.inner.inflight.entry(sha256.to_string()) {
            Entry::Occupied(entry) => Claim::Joined(JoinWaiter {
                sha256: sha256.to_string(),
                rx: entry.get().tx.subscribe(),
            }),
            Entry::Vacant(entry) => {
                let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
                let (tx, _rx) = watch::channel(SlotState::Pending);
                entry.insert(Slot { generation, tx });
                Claim::Claimed(ClaimGuard {
                    inner: Arc::clone(&self.inner),
                    sha256: sha256.to_string(),
                    generation,
                    finished: false,
                })
            }
        }
    }

    /// Resolve `sha256` to a completed record or to ownership of its analysis.
    ///
    /// Waits at most the configured join timeout in total across re-claims.
    pub async fn acquire(&self, sha256: &str) -> Mal2Result<Resolution> {
        let started = Instant::now();
        loop {
            if let Some(record) = self.lookup(sha256).await? {
                return Ok(Resolution::Hit(record));
            }

            match self.claim(sha256) {
                Claim::Claimed(guard) => {
                    // A holder may have completed between our lookup and claim.
                    if let Some(record) = self.lookup(sha256).await? {
                        guard.release();
                        return Ok(Resolution::Hit(record));
                    }
                    return Ok(Resolution::Owner(guard));
                }
                Claim::Joined(waiter) => {
                    let remaining = self.inner.join_timeout.saturating_sub(started.elapsed());
                    tracing::debug!(sha256, ?remaining, "Joining in-flight analysis");
                    match waiter.wait(remaining).await {
                        Ok(JoinOutcome::Completed(record)) => return Ok(Resolution::Joined(record)),
                        Ok(JoinOutcome::Released) => {
                            tracing::debug!(sha256, "Holder released claim, retrying");
                        }
                        Err(CacheError::AnalysisInProgress { sha256, .. }) => {
                            return Err(CacheError::AnalysisInProgress {
                                sha256,
                                waited_ms: duration_ms(started.elapsed()),
                            }
                            .into());
                        }
                        Err(other) => return Err(other.into()),
                    }
                }
            }
        }
    }
}

/// Exclusive right to analyze one digest.
///
/// Dropping the guard without calling [`ClaimGuard::complete`] releases it.
pub struct ClaimGuard {
    inner: Arc<Inner>,
    sha256: String,
    generation: u64,
    finished: bool,
}

impl ClaimGuard {
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    /// Claim generation; a re-claim after a release gets a new one.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Persist the finished record and hand it to every joiner.
    ///
    /// If persistence fails the claim is released and the error returned.
    /// Returns the stored record, which is the earlier one if the digest was
    /// already analyzed.
    pub async fn complete(mut self, record: ArtifactRecord) -> Mal2Result<ArtifactRecord> {
        if record.sha256() != self.sha256 {
            return Err(CacheError::Inconsistency {
                sha256: self.sha256.clone(),
                reason: format!("completed with record for {}", record.sha256()),
            }
            .into());
        }

        let stored = self.inner.store.record_analysis(&record).await?;
        self.inner.finish(
            &self.sha256,
            self.generation,
            SlotState::Completed(stored.clone()),
        );
        self.finished = true;
        Ok(stored)
    }

    /// Give up the claim without a result.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.finished {
            self.finished = true;
            self.inner
                .finish(&self.sha256, self.generation, SlotState::Released);
        }
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(sha256 = %self.sha256, "Claim dropped without result, releasing");
        }
        self.release_inner();
    }
}

/// Handle for waiting on another request's analysis.
pub struct JoinWaiter {
    sha256: String,
    rx: watch::Receiver<SlotState>,
}

impl JoinWaiter {
    /// Wait until the holder completes or releases, or `timeout` passes.
    pub async fn wait(mut self, timeout: Duration) -> Result<JoinOutcome, CacheError> {
        let waited = tokio::time::timeout(
            timeout,
            self.rx.wait_for(|state| !matches!(state, SlotState::Pending)),
        )
        .await;

        match waited {
            Err(_) => Err(CacheError::AnalysisInProgress {
                sha256: self.sha256,
                waited_ms: duration_ms(timeout),
            }),
            Ok(Err(_closed)) => Ok(JoinOutcome::Released),
            Ok(Ok(state)) => match &*state {
                SlotState::Completed(record) => Ok(JoinOutcome::Completed(record.clone())),
                SlotState::Released | SlotState::Pending => Ok(JoinOutcome::Released),
            },
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// =============================================================================
// TESTS
// =============================================================================
