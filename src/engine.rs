//! Incremental balance engine.
//!
//! Each call advances the checkpoint of every requested organization to one
//! shared cutoff. Only the facts in `(latest checkpoint, cutoff]` are read,
//! so repeated calls cost O(new facts) rather than O(history).
//!
//! # Concurrency
//!
//! Advancing an organization is a read-aggregate-append sequence. Within a
//! process it runs under an organization-scoped lock; across processes the
//! checkpoint store's compare-and-append rejects a write whose base
//! checkpoint is no longer the latest one. Ingestors handed out by
//! [`BalanceEngine::ingestor`] take the same locks.

use crate::checkpoint::{Baseline, Checkpoint, CheckpointWrite, WindowTotals};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::fact::OrganizationId;
use crate::ingest::BatchIngestor;
use crate::lock::OrganizationLocks;
use crate::money::Money;
use crate::store::{CheckpointStore, LedgerStore};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Outcome of one `recompute` call.
///
/// Organizations either have a committed checkpoint or a failure; the two
/// maps never share a key.
#[derive(Debug)]
pub struct RecomputeReport {
    /// Logical upper bound shared by every checkpoint written in the call.
    pub cutoff: DateTime<Utc>,

    /// Checkpoints actually written, by organization.
    pub committed: BTreeMap<OrganizationId, Checkpoint>,

    /// Organizations left untouched, with the reason.
    pub failures: BTreeMap<OrganizationId, EngineError>,
}

impl RecomputeReport {
    fn new(cutoff: DateTime<Utc>) -> Self {
        RecomputeReport {
            cutoff,
            committed: BTreeMap::new(),
            failures: BTreeMap::new(),
        }
    }

    /// New balance of every organization that was committed.
    pub fn balances(&self) -> BTreeMap<OrganizationId, Money> {
        self.committed
            .iter()
            .map(|(&org, cp)| (org, cp.balance))
            .collect()
    }

    pub fn balance(&self, organization_id: OrganizationId) -> Option<Money> {
        self.committed.get(&organization_id).map(|cp| cp.balance)
    }

    /// Returns `true` if no organization failed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, checkpoint: Checkpoint) {
        self.committed.insert(checkpoint.organization_id, checkpoint);
    }

    fn fail(&mut self, organization_id: OrganizationId, error: EngineError) {
        warn!("Organization {}: {}", organization_id, error);
        self.failures.insert(organization_id, error);
    }
}

/// The balance engine.
///
/// Holds shared handles to both stores; it is `Send + Sync` whenever they
/// are, so a single engine can serve event-driven and periodic callers at
/// once.
pub struct BalanceEngine<L, C> {
    ledger: Arc<L>,
    checkpoints: Arc<C>,
    config: EngineConfig,
    locks: Arc<OrganizationLocks>,
}

impl<L, C> BalanceEngine<L, C>
where
    L: LedgerStore,
    C: CheckpointStore,
{
    pub fn new(ledger: Arc<L>, checkpoints: Arc<C>) -> Self {
        Self::with_config(ledger, checkpoints, EngineConfig::default())
    }

    pub fn with_config(ledger: Arc<L>, checkpoints: Arc<C>, config: EngineConfig) -> Self {
        BalanceEngine {
            ledger,
            checkpoints,
            config,
            locks: Arc::new(OrganizationLocks::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// An ingestor over the same stores, sharing this engine's locks.
    ///
    /// Facts must go through an ingestor built here: it refuses facts that
    /// an existing checkpoint already covers, which only holds while the
    /// check and the engine's commits are serialized per organization.
    pub fn ingestor(&self) -> BatchIngestor<L, C> {
        BatchIngestor::new(
            Arc::clone(&self.ledger),
            Arc::clone(&self.checkpoints),
            Arc::clone(&self.locks),
        )
    }

    /// Advances the given organizations to the current time.
    ///
    /// An empty slice sweeps every organization the ledger knows.
    pub fn recompute(&self, organization_ids: &[OrganizationId]) -> Result<RecomputeReport> {
        self.recompute_at(organization_ids, Utc::now())
    }

    /// Advances the given organizations to `cutoff`, within the configured
    /// timeout.
    ///
    /// Returns `Err` only if the cutoff lies in the future or the
    /// organization set itself cannot be resolved. Everything after that is
    /// reported per organization: committed checkpoints stay committed even
    /// when other organizations fail.
    pub fn recompute_at(
        &self,
        organization_ids: &[OrganizationId],
        cutoff: DateTime<Utc>,
    ) -> Result<RecomputeReport> {
        let deadline = self
            .config
            .timeout
            .and_then(|timeout| Instant::now().checked_add(timeout));
        self.recompute_until(organization_ids, cutoff, deadline)
    }

    /// Same as [`recompute_at`](Self::recompute_at), but bounded by the
    /// caller's `deadline` instead of the configured timeout. `None` runs
    /// without a deadline.
    pub fn recompute_until(
        &self,
        organization_ids: &[OrganizationId],
        cutoff: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> Result<RecomputeReport> {
        // A window reaching past now would swallow facts not yet ingested.
        let now = Utc::now();
        if cutoff > now {
            return Err(EngineError::FutureCutoff { cutoff, now });
        }
        let ids = self.resolve(organization_ids)?;
        let mut report = RecomputeReport::new(cutoff);

        for chunk in ids.chunks(self.config.chunk_size.max(1)) {
            if expired(deadline) {
                for &org in chunk {
                    report.fail(org, EngineError::TimedOut { organization_id: org });
                }
                continue;
            }
            self.advance_chunk(chunk, cutoff, deadline, &mut report);
        }

        info!(
            "Recomputed {} organizations at {}: {} committed, {} failed",
            ids.len(),
            cutoff,
            report.committed.len(),
            report.failures.len()
        );
        Ok(report)
    }

    fn resolve(&self, organization_ids: &[OrganizationId]) -> Result<Vec<OrganizationId>> {
        let mut ids = if organization_ids.is_empty() {
            self.ledger.organization_ids()?
        } else {
            organization_ids.to_vec()
        };
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Locks, aggregates and commits one chunk of organizations.
    fn advance_chunk(
        &self,
        chunk: &[OrganizationId],
        cutoff: DateTime<Utc>,
        deadline: Option<Instant>,
        report: &mut RecomputeReport,
    ) {
        // `chunk` is sorted, so every caller locks in the same order.
        let slots = self.locks.slots(chunk);
        let _guards: Vec<_> = slots.iter().map(|slot| slot.lock()).collect();

        let mut writes = Vec::with_capacity(chunk.len());
        for &org in chunk {
            match self.prepare(org, cutoff) {
                Ok(write) => writes.push(write),
                Err(e) => report.fail(org, e),
            }
        }

        if expired(deadline) {
            for write in writes {
                let org = write.checkpoint.organization_id;
                report.fail(org, EngineError::TimedOut { organization_id: org });
            }
            return;
        }

        self.commit(writes, report);
    }

    /// Reads the organization's window and builds its next checkpoint.
    fn prepare(&self, org: OrganizationId, cutoff: DateTime<Utc>) -> Result<CheckpointWrite> {
        let latest = self.checkpoints.latest(org)?;
        let baseline = Baseline::from_latest(org, latest.as_ref());
        let facts = self.ledger.query(org, baseline.timestamp, cutoff)?;
        let totals = WindowTotals::aggregate(org, &facts)?;

        debug!(
            "Organization {}: {} transactions, {} payments in ({}, {}], cost {}, paid {}",
            org,
            totals.transactions,
            totals.payments,
            baseline.timestamp,
            cutoff,
            totals.cost_sum,
            totals.payment_sum
        );

        baseline.advance(&totals, cutoff)
    }

    /// Commits the chunk's writes as one unit.
    ///
    /// An organization whose base checkpoint moved is dropped and the rest
    /// is committed without it. Any other error fails the whole remainder.
    fn commit(&self, mut writes: Vec<CheckpointWrite>, report: &mut RecomputeReport) {
        while !writes.is_empty() {
            match self.checkpoints.append_all(writes.clone()) {
                Ok(committed) => {
                    for checkpoint in committed {
                        debug!(
                            "Organization {}: checkpoint {} balance {}",
                            checkpoint.organization_id, checkpoint.id, checkpoint.balance
                        );
                        report.record(checkpoint);
                    }
                    return;
                }
                Err(EngineError::ConcurrentUpdateConflict {
                    organization_id,
                    expected,
                    found,
                }) => {
                    let before = writes.len();
                    writes.retain(|w| w.checkpoint.organization_id != organization_id);
                    report.fail(
                        organization_id,
                        EngineError::ConcurrentUpdateConflict {
                            organization_id,
                            expected,
                            found,
                        },
                    );
                    if writes.len() == before {
                        fail_all(
                            writes,
                            "conflict reported for an organization outside the batch",
                            report,
                        );
                        return;
                    }
                }
                Err(EngineError::StorageUnavailable(message)) => {
                    fail_all(writes, &message, report);
                    return;
                }
                Err(other) => {
                    fail_all(writes, &other.to_string(), report);
                    return;
                }
            }
        }
    }
}

fn fail_all(writes: Vec<CheckpointWrite>, message: &str, report: &mut RecomputeReport) {
    for write in writes {
        report.fail(
            write.checkpoint.organization_id,
            EngineError::StorageUnavailable(message.to_string()),
        );
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.map_or(false, |d| Instant::now() >= d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointId;
    use crate::fact::{Fact, Payment};
    use crate::store::{MemoryCheckpoints, MemoryLedger};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    /// Lets one outside writer slip in between the engine's read and its
    /// commit, the first time a batch is committed.
    struct RacingCheckpoints {
        inner: MemoryCheckpoints,
        victim: OrganizationId,
        raced: AtomicBool,
    }

    impl CheckpointStore for RacingCheckpoints {
        fn latest(&self, organization_id: OrganizationId) -> Result<Option<Checkpoint>> {
            self.inner.latest(organization_id)
        }

        fn append_all(&self, writes: Vec<CheckpointWrite>) -> Result<Vec<Checkpoint>> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                let base = self.inner.latest(self.victim)?;
                let baseline = Baseline::from_latest(self.victim, base.as_ref());
                self.inner
                    .append(baseline.advance(&WindowTotals::default(), at(1))?)?;
            }
            self.inner.append_all(writes)
        }

        fn history(&self, organization_id: OrganizationId) -> Result<Vec<Checkpoint>> {
            self.inner.history(organization_id)
        }
    }

    fn ledger_with(orgs: &[u32]) -> Arc<MemoryLedger> {
        let ledger = MemoryLedger::new();
        for &org in orgs {
            ledger.register_organization(OrganizationId(org));
        }
        Arc::new(ledger)
    }

    #[test]
    fn test_conflicting_organization_is_dropped_from_commit() {
        let ledger = ledger_with(&[1, 2]);
        ledger
            .append(Fact::Payment(Payment {
                organization_id: OrganizationId(2),
                timestamp: at(5),
                amount: Money::from_units(3),
            }))
            .unwrap();
        let checkpoints = Arc::new(RacingCheckpoints {
            inner: MemoryCheckpoints::new(),
            victim: OrganizationId(1),
            raced: AtomicBool::new(false),
        });
        let engine = BalanceEngine::new(ledger, Arc::clone(&checkpoints));

        let report = engine.recompute_at(&[], at(10)).unwrap();

        assert!(matches!(
            report.failures.get(&OrganizationId(1)),
            Some(EngineError::ConcurrentUpdateConflict {
                expected: None,
                found: Some(CheckpointId(0)),
                ..
            })
        ));
        assert_eq!(report.balance(OrganizationId(2)), Some(Money::from_units(3)));
        // The outside writer's checkpoint is the only one for organization 1.
        assert_eq!(checkpoints.history(OrganizationId(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_ids_are_deduplicated_and_sorted() {
        let engine = BalanceEngine::new(ledger_with(&[]), Arc::new(MemoryCheckpoints::new()));
        let ids = engine
            .resolve(&[OrganizationId(3), OrganizationId(1), OrganizationId(3)])
            .unwrap();
        assert_eq!(ids, vec![OrganizationId(1), OrganizationId(3)]);
    }

    #[test]
    fn test_future_cutoff_is_rejected() {
        let checkpoints = Arc::new(MemoryCheckpoints::new());
        let engine = BalanceEngine::new(ledger_with(&[1]), Arc::clone(&checkpoints));
        let cutoff = Utc::now() + chrono::Duration::days(365);

        let err = engine.recompute_at(&[], cutoff).unwrap_err();

        assert!(matches!(err, EngineError::FutureCutoff { .. }));
        assert!(checkpoints.snapshot().is_empty());
    }

    #[test]
    fn test_caller_deadline_replaces_configured_timeout() {
        let checkpoints = Arc::new(MemoryCheckpoints::new());
        let engine = BalanceEngine::new(ledger_with(&[1, 2]), Arc::clone(&checkpoints));
        assert_eq!(engine.config().timeout, None);

        let report = engine
            .recompute_until(&[], at(10), Some(Instant::now()))
            .unwrap();
        assert!(report.committed.is_empty());
        assert!(report
            .failures
            .values()
            .all(|e| matches!(e, EngineError::TimedOut { .. })));
        assert!(checkpoints.snapshot().is_empty());

        let later = Instant::now() + std::time::Duration::from_secs(60);
        let report = engine.recompute_until(&[], at(10), Some(later)).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.committed.len(), 2);
    }
}
