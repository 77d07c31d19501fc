// ========== Follow-up Work ==========
//
// Work that must not run inside the transaction that caused it: guest
// account cleanup after shares disappear, and sequence touches after a lock
// runs out. Both are queued at commit time and drained by a worker.

use crate::config::InfostoreConfig;
use crate::engine::InfostoreEngine;
use async_trait::async_trait;
use infostore_lib::{
    ContextId, EntityId, GuestCleanupScheduler, InfostoreResult, Lock, LockExpiryListener,
};
use log::{debug, error, info, warn};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackgroundTaskKind {
    /// Targets are entities that may have lost their last share.
    GuestCleanup,
    /// Targets are documents whose lock expired.
    TouchDocument,
}

impl BackgroundTaskKind {
    const ALL: [BackgroundTaskKind; 2] = [
        BackgroundTaskKind::GuestCleanup,
        BackgroundTaskKind::TouchDocument,
    ];
}

/// Targets of one kind in one context, handed to the executor together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackgroundBatch {
    pub kind: BackgroundTaskKind,
    pub context_id: ContextId,
    pub targets: Vec<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackgroundTaskPolicy {
    /// Minimum time between two sweeps of one kind.
    pub interval: Duration,
    /// No new batch is started once a sweep has run this long.
    pub max_run_time: Duration,
    /// Upper bound on targets per batch.
    pub max_batch: usize,
}

impl BackgroundTaskPolicy {
    pub fn new(interval: Duration, max_run_time: Duration) -> Self {
        Self {
            interval,
            max_run_time,
            max_batch: 64,
        }
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }
}

#[derive(Debug, Default, Clone)]
pub struct BackgroundRunStats {
    pub batches: usize,
    pub executed: usize,
    pub failed: usize,
    /// Targets still queued when the sweep ran out of time.
    pub deferred: usize,
}

#[async_trait]
pub trait BackgroundTaskExecutor: Send + Sync {
    async fn execute(&self, batch: BackgroundBatch) -> Result<(), String>;
}

/// Queue of one kind; a target is queued at most once per context.
struct KindQueue {
    policy: BackgroundTaskPolicy,
    order: VecDeque<(ContextId, i64)>,
    queued: HashSet<(ContextId, i64)>,
    last_sweep: Instant,
}

impl KindQueue {
    fn new(policy: BackgroundTaskPolicy, now: Instant) -> Self {
        Self {
            policy,
            order: VecDeque::new(),
            queued: HashSet::new(),
            last_sweep: now,
        }
    }

    fn push(&mut self, context_id: ContextId, target: i64, urgent: bool) {
        let key = (context_id, target);
        if !self.queued.insert(key) {
            if !urgent {
                return;
            }
            self.order.retain(|queued| *queued != key);
        }
        if urgent {
            self.order.push_front(key);
        } else {
            self.order.push_back(key);
        }
    }

    /// Up to `max_batch` targets sharing the context of the oldest entry.
    fn pop_batch(&mut self) -> Option<(ContextId, Vec<i64>)> {
        let (context_id, _) = *self.order.front()?;
        let mut targets = Vec::new();
        let mut rest = VecDeque::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if key.0 == context_id && targets.len() < self.policy.max_batch {
                self.queued.remove(&key);
                targets.push(key.1);
            } else {
                rest.push_back(key);
            }
        }
        self.order = rest;
        Some((context_id, targets))
    }

    fn is_due(&self, now: Instant) -> bool {
        !self.order.is_empty() && now.duration_since(self.last_sweep) >= self.policy.interval
    }
}

pub struct BackgroundMgr {
    queues: HashMap<BackgroundTaskKind, KindQueue>,
}

impl BackgroundMgr {
    pub fn new() -> Self {
        Self::with_policy(BackgroundTaskPolicy::new(
            Duration::from_secs(30),
            Duration::from_secs(5),
        ))
    }

    pub fn from_config(config: &InfostoreConfig) -> Self {
        Self::with_policy(
            BackgroundTaskPolicy::new(
                Duration::from_millis(config.background_interval_ms),
                Duration::from_millis(config.background_budget_ms),
            )
            .with_max_batch(config.batch_size()),
        )
    }

    fn with_policy(policy: BackgroundTaskPolicy) -> Self {
        let now = Instant::now();
        Self {
            queues: BackgroundTaskKind::ALL
                .into_iter()
                .map(|kind| (kind, KindQueue::new(policy, now)))
                .collect(),
        }
    }

    fn queue(&mut self, kind: BackgroundTaskKind) -> &mut KindQueue {
        self.queues.entry(kind).or_insert_with(|| {
            KindQueue::new(
                BackgroundTaskPolicy::new(Duration::ZERO, Duration::from_secs(5)),
                Instant::now(),
            )
        })
    }

    pub fn set_policy(&mut self, kind: BackgroundTaskKind, policy: BackgroundTaskPolicy) {
        self.queue(kind).policy = policy;
    }

    pub fn policy(&self, kind: BackgroundTaskKind) -> Option<BackgroundTaskPolicy> {
        self.queues.get(&kind).map(|q| q.policy)
    }

    /// Queue `target`; a target already queued keeps its place.
    pub fn enqueue(&mut self, kind: BackgroundTaskKind, context_id: ContextId, target: i64) {
        self.queue(kind).push(context_id, target, false);
    }

    /// Queue `target` ahead of everything else of its kind.
    pub fn enqueue_urgent(&mut self, kind: BackgroundTaskKind, context_id: ContextId, target: i64) {
        self.queue(kind).push(context_id, target, true);
    }

    pub fn pending(&self, kind: BackgroundTaskKind) -> Vec<(ContextId, i64)> {
        self.queues
            .get(&kind)
            .map(|q| q.order.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_pending_tasks(&self) -> bool {
        self.queues.values().any(|q| !q.order.is_empty())
    }

    fn due_kinds(&mut self, now: Instant) -> Vec<(BackgroundTaskKind, BackgroundTaskPolicy)> {
        let mut due = Vec::new();
        for kind in BackgroundTaskKind::ALL {
            if let Some(queue) = self.queues.get_mut(&kind) {
                if queue.is_due(now) {
                    queue.last_sweep = now;
                    due.push((kind, queue.policy));
                }
            }
        }
        due
    }

    fn next_batch(&mut self, kind: BackgroundTaskKind) -> Option<BackgroundBatch> {
        let (context_id, targets) = self.queues.get_mut(&kind)?.pop_batch()?;
        Some(BackgroundBatch {
            kind,
            context_id,
            targets,
        })
    }

    fn with_locked<T>(
        mgr: &Mutex<BackgroundMgr>,
        what: &str,
        f: impl FnOnce(&mut BackgroundMgr) -> T,
    ) -> Option<T> {
        match mgr.lock() {
            Ok(mut guard) => Some(f(&mut guard)),
            Err(e) => {
                error!("background queue poisoned while {}: {}", what, e);
                None
            }
        }
    }

    /// Drain every due kind within its time budget.
    pub async fn run_once(
        mgr: &Arc<Mutex<BackgroundMgr>>,
        executor: &(dyn BackgroundTaskExecutor + Send + Sync),
    ) -> BackgroundRunStats {
        let mut stats = BackgroundRunStats::default();
        let Some(due) = Self::with_locked(mgr, "taking due kinds", |m| m.due_kinds(Instant::now()))
        else {
            return stats;
        };

        for (kind, policy) in due {
            let started = Instant::now();
            while started.elapsed() < policy.max_run_time {
                let Some(Some(batch)) = Self::with_locked(mgr, "popping a batch", |m| m.next_batch(kind))
                else {
                    break;
                };
                let size = batch.targets.len();
                let context_id = batch.context_id;
                let batch_started = Instant::now();
                stats.batches += 1;
                match executor.execute(batch).await {
                    Ok(()) => {
                        stats.executed += size;
                        debug!(
                            "background batch done: kind={:?}, ctx={}, size={}, elapsed={:?}",
                            kind,
                            context_id,
                            size,
                            batch_started.elapsed()
                        );
                    }
                    Err(e) => {
                        stats.failed += size;
                        warn!(
                            "background batch failed: kind={:?}, ctx={}, size={}, err={}",
                            kind, context_id, size, e
                        );
                    }
                }
            }
            stats.deferred += Self::with_locked(mgr, "counting leftovers", |m| m.pending(kind).len())
                .unwrap_or(0);
        }

        if stats.batches > 0 {
            info!(
                "background sweep: batches={}, executed={}, failed={}, deferred={}",
                stats.batches, stats.executed, stats.failed, stats.deferred
            );
        }
        stats
    }

    pub fn spawn_worker(
        mgr: Arc<Mutex<BackgroundMgr>>,
        executor: Arc<dyn BackgroundTaskExecutor + Send + Sync>,
        poll_interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let _ = Self::run_once(&mgr, executor.as_ref()).await;
            }
        })
    }
}

impl Default for BackgroundMgr {
    fn default() -> Self {
        Self::new()
    }
}

/// Queues guest cleanup for entities whose shares went away.
pub struct QueuedGuestCleanup {
    mgr: Arc<Mutex<BackgroundMgr>>,
}

impl QueuedGuestCleanup {
    pub fn new(mgr: Arc<Mutex<BackgroundMgr>>) -> Self {
        Self { mgr }
    }
}

impl GuestCleanupScheduler for QueuedGuestCleanup {
    fn schedule(&self, context_id: ContextId, entities: &BTreeSet<EntityId>) -> InfostoreResult<()> {
        BackgroundMgr::with_locked(&self.mgr, "scheduling guest cleanup", |m| {
            for entity in entities {
                m.enqueue(BackgroundTaskKind::GuestCleanup, context_id, *entity);
            }
        });
        Ok(())
    }
}

/// Queues a sequence touch for documents whose lock ran out.
pub struct TouchOnLockExpiry {
    mgr: Arc<Mutex<BackgroundMgr>>,
}

impl TouchOnLockExpiry {
    pub fn new(mgr: Arc<Mutex<BackgroundMgr>>) -> Self {
        Self { mgr }
    }
}

impl LockExpiryListener for TouchOnLockExpiry {
    fn lock_expired(&self, lock: &Lock) {
        BackgroundMgr::with_locked(&self.mgr, "queueing a touch", |m| {
            m.enqueue_urgent(
                BackgroundTaskKind::TouchDocument,
                lock.context_id,
                lock.document_id,
            )
        });
    }
}

/// Removes guest accounts that no document is shared with anymore.
pub trait GuestAccountHandler: Send + Sync {
    /// Called for entities that hold no object permission in the context.
    /// Implementations ignore entities that are not guests.
    fn remove_guests(&self, context_id: ContextId, entities: &[EntityId]) -> InfostoreResult<()>;
}

/// Runs queued batches against the engine on the blocking pool.
#[derive(Clone)]
pub struct EngineTaskExecutor {
    engine: Arc<InfostoreEngine>,
    guests: Option<Arc<dyn GuestAccountHandler>>,
}

impl EngineTaskExecutor {
    pub fn new(engine: Arc<InfostoreEngine>) -> Self {
        Self {
            engine,
            guests: None,
        }
    }

    pub fn with_guest_handler(mut self, guests: Arc<dyn GuestAccountHandler>) -> Self {
        self.guests = Some(guests);
        self
    }

    fn run_blocking(&self, batch: &BackgroundBatch) -> InfostoreResult<()> {
        match batch.kind {
            BackgroundTaskKind::TouchDocument => {
                for id in batch.targets.iter() {
                    self.engine.touch_after_lock_expiry(batch.context_id, *id)?;
                }
            }
            BackgroundTaskKind::GuestCleanup => {
                let mut unshared = Vec::new();
                for entity in batch.targets.iter() {
                    if self.engine.remaining_shares(batch.context_id, *entity)? == 0 {
                        unshared.push(*entity);
                    }
                }
                if unshared.is_empty() {
                    return Ok(());
                }
                match self.guests.as_ref() {
                    Some(guests) => guests.remove_guests(batch.context_id, &unshared)?,
                    None => debug!("no guest handler, {} entities left alone", unshared.len()),
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BackgroundTaskExecutor for EngineTaskExecutor {
    async fn execute(&self, batch: BackgroundBatch) -> Result<(), String> {
        let executor = self.clone();
        tokio::task::spawn_blocking(move || executor.run_blocking(&batch))
            .await
            .map_err(|e| format!("background batch panicked: {}", e))?
            .map_err(|e| e.to_string())
    }
}
