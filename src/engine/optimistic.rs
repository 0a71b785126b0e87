// Cziczere Sync Engine: Optimistic Mutation Tracker
//
// Speculative local writes show up in the store immediately, keyed by a
// client fingerprint `(owner, timestamp, nonce)`. When the authoritative
// record arrives (create-call response or push feed), it replaces the draft
// in place. Drafts that see nothing within the grace period are marked
// Failed and stay visible; a late authoritative record still heals them.

use crate::atoms::constants::FAILED_WRITE_RETENTION_MS;
use crate::atoms::error::SyncError;
use crate::atoms::types::{Fingerprint, MemoryRecord, SyncStatus};
use crate::engine::store::{Action, StateStore};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct PendingWrite {
    fingerprint: Fingerprint,
    seq: u64,
    deadline: Instant,
    failed: bool,
}

#[derive(Default)]
struct Ledger {
    next_seq: u64,
    /// nonce → write
    writes: HashMap<String, PendingWrite>,
}

pub struct OptimisticTracker {
    store: Arc<StateStore>,
    grace: Duration,
    ledger: Mutex<Ledger>,
}

impl OptimisticTracker {
    pub fn new(store: Arc<StateStore>, grace: Duration) -> Self {
        OptimisticTracker { store, grace, ledger: Mutex::new(Ledger::default()) }
    }

    /// Insert `candidate` as a pending draft and return its fingerprint.
    /// Any id on the candidate is dropped; the timestamp is set to now.
    pub fn begin_optimistic(&self, mut candidate: MemoryRecord) -> Fingerprint {
        let nonce = uuid::Uuid::new_v4().to_string();
        candidate.id = None;
        candidate.timestamp = chrono::Utc::now().timestamp_millis();
        candidate.client_ref = Some(nonce.clone());
        candidate.status = SyncStatus::Pending;

        let fingerprint = Fingerprint {
            owner_id: candidate.owner_id.clone(),
            timestamp: candidate.timestamp,
            nonce: nonce.clone(),
        };
        {
            let mut ledger = self.ledger.lock();
            let seq = ledger.next_seq;
            ledger.next_seq += 1;
            ledger.writes.insert(
                nonce,
                PendingWrite {
                    fingerprint: fingerprint.clone(),
                    seq,
                    deadline: Instant::now() + self.grace,
                    failed: false,
                },
            );
        }
        self.store.dispatch(Action::AddOptimistic(candidate));
        debug!("[optimistic] begin {}", fingerprint);
        fingerprint
    }

    /// Apply an authoritative record. Returns the fingerprint of the draft it
    /// answered, if any; unmatched records are upserted by id.
    pub fn reconcile(&self, record: MemoryRecord) -> Option<Fingerprint> {
        let matched = self.take_match(&record);
        self.store.dispatch(Action::Reconcile { fingerprint: matched.clone(), record });
        if let Some(fp) = &matched {
            debug!("[optimistic] reconciled {}", fp);
        }
        matched
    }

    /// Reconcile against a known fingerprint, e.g. the response of the create
    /// call that started it.
    pub fn reconcile_with(&self, fingerprint: &Fingerprint, record: MemoryRecord) {
        self.ledger.lock().writes.remove(&fingerprint.nonce);
        self.store.dispatch(Action::Reconcile { fingerprint: Some(fingerprint.clone()), record });
    }

    /// Replace the authoritative list with an initial result set. Drafts the
    /// set answers stop being tracked; the rest stay pending.
    pub fn load_snapshot(&self, records: Vec<MemoryRecord>) {
        for record in &records {
            self.take_match(record);
        }
        self.store.dispatch(Action::LoadSuccess(records));
    }

    /// Nonce match first. A record without a nonce falls back to the oldest
    /// write with the same owner and timestamp; one whose nonce is no longer
    /// tracked matches nothing.
    fn take_match(&self, record: &MemoryRecord) -> Option<Fingerprint> {
        let mut ledger = self.ledger.lock();
        if let Some(nonce) = record.client_ref.as_deref() {
            return ledger.writes.remove(nonce).map(|w| w.fingerprint);
        }
        let nonce = ledger
            .writes
            .values()
            .filter(|w| w.fingerprint.owner_id == record.owner_id && w.fingerprint.timestamp == record.timestamp)
            .min_by_key(|w| w.seq)
            .map(|w| w.fingerprint.nonce.clone())?;
        ledger.writes.remove(&nonce).map(|w| w.fingerprint)
    }

    /// Mark a draft failed now, e.g. when its create call errored.
    pub fn fail(&self, fingerprint: &Fingerprint) {
        let newly_failed = match self.ledger.lock().writes.get_mut(&fingerprint.nonce) {
            Some(write) if !write.failed => {
                write.failed = true;
                true
            }
            _ => false,
        };
        if newly_failed {
            self.store.dispatch(Action::OptimisticFailed(fingerprint.clone()));
        }
    }

    /// Mark every draft past its grace period as Failed. Returns how many.
    /// Failed writes older than the retention window are dropped from the
    /// ledger.
    pub fn expire_overdue(&self) -> usize {
        let now = Instant::now();
        let retention = Duration::from_millis(FAILED_WRITE_RETENTION_MS);
        let overdue: Vec<Fingerprint> = {
            let mut ledger = self.ledger.lock();
            let before = ledger.writes.len();
            ledger.writes.retain(|_, w| !(w.failed && w.deadline + retention <= now));
            let pruned = before - ledger.writes.len();
            if pruned > 0 {
                debug!("[optimistic] pruned {} failed write(s)", pruned);
            }
            ledger
                .writes
                .values_mut()
                .filter(|w| !w.failed && w.deadline <= now)
                .map(|w| {
                    w.failed = true;
                    w.fingerprint.clone()
                })
                .collect()
        };
        for fp in &overdue {
            warn!("[optimistic] {}", SyncError::ReconciliationMismatch { fingerprint: fp.to_string() });
            self.store.dispatch(Action::OptimisticFailed(fp.clone()));
        }
        overdue.len()
    }

    /// Forget every tracked write (identity change).
    pub fn reset(&self) -> usize {
        let mut ledger = self.ledger.lock();
        let count = ledger.writes.len();
        ledger.writes.clear();
        count
    }

    pub fn pending_count(&self) -> usize {
        self.ledger.lock().writes.values().filter(|w| !w.failed).count()
    }

    pub fn spawn_grace_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                this.expire_overdue();
            }
        })
    }
}
