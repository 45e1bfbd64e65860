//! Ledger and checkpoint storage contracts, with in-memory implementations.
//!
//! Both stores are append-only. Facts are never mutated once committed and
//! checkpoints form an id-versioned log per organization; the row with the
//! highest id is the organization's current balance.

use crate::checkpoint::{Checkpoint, CheckpointId, CheckpointWrite};
use crate::error::{EngineError, Result};
use crate::fact::{Fact, OrganizationId};
use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Durable, immutable usage and payment facts.
pub trait LedgerStore: Send + Sync {
    /// Every organization the ledger knows about.
    fn organization_ids(&self) -> Result<Vec<OrganizationId>>;

    fn has_organization(&self, organization_id: OrganizationId) -> Result<bool>;

    /// Appends a batch of facts. Either all become visible or none do.
    fn append_batch(&self, facts: Vec<Fact>) -> Result<()>;

    /// Appends a single fact.
    fn append(&self, fact: Fact) -> Result<()> {
        self.append_batch(vec![fact])
    }

    /// Returns every fact of the organization with `after < timestamp <= upto`,
    /// in no particular order.
    fn query(
        &self,
        organization_id: OrganizationId,
        after: DateTime<Utc>,
        upto: DateTime<Utc>,
    ) -> Result<Vec<Fact>>;
}

/// Append-only log of balance checkpoints.
pub trait CheckpointStore: Send + Sync {
    /// The organization's current checkpoint, if it has one.
    fn latest(&self, organization_id: OrganizationId) -> Result<Option<Checkpoint>>;

    /// Commits a set of conditional writes atomically.
    ///
    /// Every write must still match its organization's latest checkpoint id;
    /// otherwise nothing is written and the first mismatch is reported as
    /// [`EngineError::ConcurrentUpdateConflict`]. Returned checkpoints are in
    /// the order of `writes`.
    fn append_all(&self, writes: Vec<CheckpointWrite>) -> Result<Vec<Checkpoint>>;

    /// Commits a single conditional write.
    fn append(&self, write: CheckpointWrite) -> Result<Checkpoint> {
        let organization_id = write.checkpoint.organization_id;
        self.append_all(vec![write])?
            .into_iter()
            .next()
            .ok_or_else(|| {
                EngineError::StorageUnavailable(format!(
                    "no checkpoint returned for organization {}",
                    organization_id
                ))
            })
    }

    /// The organization's checkpoints, oldest first.
    fn history(&self, organization_id: OrganizationId) -> Result<Vec<Checkpoint>>;
}

#[derive(Debug, Default)]
struct LedgerTables {
    organizations: BTreeSet<OrganizationId>,
    facts: HashMap<OrganizationId, Vec<Fact>>,
}

/// In-process [`LedgerStore`].
#[derive(Debug, Default)]
pub struct MemoryLedger {
    tables: RwLock<LedgerTables>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes an organization known to the ledger. Registering twice is a no-op.
    pub fn register_organization(&self, organization_id: OrganizationId) {
        self.tables.write().organizations.insert(organization_id);
    }

    /// Number of committed facts, across all organizations.
    pub fn len(&self) -> usize {
        self.tables.read().facts.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LedgerStore for MemoryLedger {
    fn organization_ids(&self) -> Result<Vec<OrganizationId>> {
        Ok(self.tables.read().organizations.iter().copied().collect())
    }

    fn has_organization(&self, organization_id: OrganizationId) -> Result<bool> {
        Ok(self.tables.read().organizations.contains(&organization_id))
    }

    fn append_batch(&self, facts: Vec<Fact>) -> Result<()> {
        let mut tables = self.tables.write();

        // Check the whole batch before touching the tables.
        if let Some((index, fact)) = facts
            .iter()
            .enumerate()
            .find(|(_, fact)| !tables.organizations.contains(&fact.organization_id()))
        {
            return Err(EngineError::Validation {
                index,
                message: format!("unknown organization {}", fact.organization_id()),
            });
        }

        for fact in facts {
            tables
                .facts
                .entry(fact.organization_id())
                .or_default()
                .push(fact);
        }
        Ok(())
    }

    fn query(
        &self,
        organization_id: OrganizationId,
        after: DateTime<Utc>,
        upto: DateTime<Utc>,
    ) -> Result<Vec<Fact>> {
        let tables = self.tables.read();
        Ok(tables
            .facts
            .get(&organization_id)
            .map(|facts| {
                facts
                    .iter()
                    .filter(|fact| fact.in_window(after, upto))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Debug, Default)]
struct CheckpointLog {
    rows: Vec<Checkpoint>,
    /// Index into `rows` of each organization's latest checkpoint.
    latest: HashMap<OrganizationId, usize>,
    next_id: u64,
}

impl CheckpointLog {
    fn latest_id(&self, organization_id: OrganizationId) -> Option<CheckpointId> {
        self.latest
            .get(&organization_id)
            .map(|&idx| self.rows[idx].id)
    }

    /// Callers make sure `checkpoint.id` is below `u64::MAX`.
    fn push(&mut self, checkpoint: Checkpoint) {
        self.next_id = self.next_id.max(checkpoint.id.0.saturating_add(1));
        self.latest.insert(checkpoint.organization_id, self.rows.len());
        self.rows.push(checkpoint);
    }
}

/// In-process [`CheckpointStore`].
#[derive(Debug, Default)]
pub struct MemoryCheckpoints {
    log: RwLock<CheckpointLog>,
}

impl MemoryCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the log from persisted rows.
    ///
    /// Rows may arrive in any order; ids must be unique. Ids of later appends
    /// continue after the highest id seen.
    pub fn from_history(mut rows: Vec<Checkpoint>) -> Result<Self> {
        rows.sort_by_key(|cp| cp.id);

        let mut log = CheckpointLog::default();
        for (row, checkpoint) in rows.into_iter().enumerate() {
            if log.rows.last().map(|prev| prev.id) == Some(checkpoint.id) {
                return Err(EngineError::InvalidRecord {
                    row: row + 1,
                    message: format!("duplicate checkpoint id {}", checkpoint.id),
                });
            }
            if checkpoint.id.0 == u64::MAX {
                return Err(EngineError::InvalidRecord {
                    row: row + 1,
                    message: format!(
                        "checkpoint id {} leaves no room for later ids",
                        checkpoint.id
                    ),
                });
            }
            log.push(checkpoint);
        }
        debug!("Restored {} checkpoints", log.rows.len());

        Ok(MemoryCheckpoints {
            log: RwLock::new(log),
        })
    }

    /// Every committed checkpoint, ordered by id.
    pub fn snapshot(&self) -> Vec<Checkpoint> {
        self.log.read().rows.clone()
    }
}

impl CheckpointStore for MemoryCheckpoints {
    fn latest(&self, organization_id: OrganizationId) -> Result<Option<Checkpoint>> {
        let log = self.log.read();
        Ok(log
            .latest
            .get(&organization_id)
            .map(|&idx| log.rows[idx].clone()))
    }

    fn append_all(&self, writes: Vec<CheckpointWrite>) -> Result<Vec<Checkpoint>> {
        let mut log = self.log.write();

        let mut seen = HashSet::with_capacity(writes.len());
        for write in &writes {
            let organization_id = write.checkpoint.organization_id;
            let found = log.latest_id(organization_id);
            // A second write for the same organization in one batch would
            // be based on a checkpoint this batch is about to replace.
            if found != write.expected || !seen.insert(organization_id) {
                return Err(EngineError::ConcurrentUpdateConflict {
                    organization_id,
                    expected: write.expected,
                    found,
                });
            }
        }

        let room = u64::MAX - log.next_id;
        if writes.len() as u64 > room {
            return Err(EngineError::StorageUnavailable(
                "checkpoint ids exhausted".to_string(),
            ));
        }

        let mut committed = Vec::with_capacity(writes.len());
        for write in writes {
            let checkpoint = write.checkpoint.commit(CheckpointId(log.next_id));
            log.push(checkpoint.clone());
            committed.push(checkpoint);
        }
        Ok(committed)
    }

    fn history(&self, organization_id: OrganizationId) -> Result<Vec<Checkpoint>> {
        Ok(self
            .log
            .read()
            .rows
            .iter()
            .filter(|cp| cp.organization_id == organization_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::PendingCheckpoint;
    use crate::fact::{Payment, Transaction};
    use crate::money::Money;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn payment(org: u32, secs: i64) -> Fact {
        Fact::Payment(Payment {
            organization_id: OrganizationId(org),
            timestamp: at(secs),
            amount: Money::from_units(1),
        })
    }

    fn write(org: u32, expected: Option<u64>, secs: i64) -> CheckpointWrite {
        CheckpointWrite {
            expected: expected.map(CheckpointId),
            checkpoint: PendingCheckpoint {
                organization_id: OrganizationId(org),
                timestamp: at(secs),
                prompt_token_sum: 0,
                completion_token_sum: 0,
                balance: Money::ZERO,
            },
        }
    }

    #[test]
    fn test_ledger_query_is_half_open() {
        let ledger = MemoryLedger::new();
        ledger.register_organization(OrganizationId(1));
        ledger
            .append_batch(vec![payment(1, 1), payment(1, 2), payment(1, 3)])
            .unwrap();

        let facts = ledger.query(OrganizationId(1), at(1), at(3)).unwrap();
        let mut stamps: Vec<_> = facts.iter().map(Fact::timestamp).collect();
        stamps.sort();
        assert_eq!(stamps, vec![at(2), at(3)]);
    }

    #[test]
    fn test_ledger_batch_with_unknown_organization_writes_nothing() {
        let ledger = MemoryLedger::new();
        ledger.register_organization(OrganizationId(1));

        let err = ledger
            .append_batch(vec![payment(1, 1), payment(2, 2)])
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { index: 1, .. }));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_ledger_single_append() {
        let ledger = MemoryLedger::new();
        ledger.register_organization(OrganizationId(3));
        ledger
            .append(Fact::Transaction(Transaction {
                organization_id: OrganizationId(3),
                timestamp: at(1),
                prompt_tokens: 1,
                completion_tokens: 1,
                price: Money::from_units(2),
            }))
            .unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.organization_ids().unwrap(), vec![OrganizationId(3)]);
    }

    #[test]
    fn test_checkpoint_append_assigns_increasing_ids() {
        let store = MemoryCheckpoints::new();
        let first = store.append(write(1, None, 1)).unwrap();
        let second = store.append(write(1, Some(first.id.0), 2)).unwrap();

        assert!(second.id > first.id);
        assert_eq!(store.latest(OrganizationId(1)).unwrap(), Some(second.clone()));
        assert_eq!(store.history(OrganizationId(1)).unwrap(), vec![first, second]);
    }

    #[test]
    fn test_checkpoint_stale_expectation_conflicts() {
        let store = MemoryCheckpoints::new();
        store.append(write(1, None, 1)).unwrap();

        let err = store.append(write(1, None, 2)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::ConcurrentUpdateConflict {
                expected: None,
                found: Some(_),
                ..
            }
        ));
        assert_eq!(store.history(OrganizationId(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_checkpoint_batch_is_all_or_nothing() {
        let store = MemoryCheckpoints::new();
        let err = store
            .append_all(vec![write(1, None, 1), write(2, Some(9), 1)])
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::ConcurrentUpdateConflict { organization_id, .. }
                if organization_id == OrganizationId(2)
        ));
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_checkpoint_batch_rejects_duplicate_organization() {
        let store = MemoryCheckpoints::new();
        assert!(store
            .append_all(vec![write(1, None, 1), write(1, None, 2)])
            .is_err());
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_restore_from_history_continues_ids() {
        let store = MemoryCheckpoints::new();
        let a = store.append(write(1, None, 1)).unwrap();
        let b = store.append(write(2, None, 1)).unwrap();

        let restored = MemoryCheckpoints::from_history(vec![b.clone(), a.clone()]).unwrap();
        assert_eq!(restored.snapshot(), vec![a.clone(), b]);

        let c = restored.append(write(1, Some(a.id.0), 2)).unwrap();
        assert_eq!(c.id, CheckpointId(2));
    }

    #[test]
    fn test_restore_rejects_duplicate_ids() {
        let store = MemoryCheckpoints::new();
        let a = store.append(write(1, None, 1)).unwrap();
        assert!(MemoryCheckpoints::from_history(vec![a.clone(), a]).is_err());
    }

    #[test]
    fn test_restore_rejects_highest_possible_id() {
        let store = MemoryCheckpoints::new();
        let mut last = store.append(write(1, None, 1)).unwrap();
        last.id = CheckpointId(u64::MAX);

        match MemoryCheckpoints::from_history(vec![last]) {
            Err(EngineError::InvalidRecord { row, .. }) => assert_eq!(row, 1),
            other => panic!("unexpected result: {:?}", other.map(|s| s.snapshot())),
        }
    }

    #[test]
    fn test_append_fails_once_ids_are_exhausted() {
        let store = MemoryCheckpoints::new();
        let mut near_end = store.append(write(1, None, 1)).unwrap();
        near_end.id = CheckpointId(u64::MAX - 1);
        let restored = MemoryCheckpoints::from_history(vec![near_end]).unwrap();

        let err = restored
            .append(write(1, Some(u64::MAX - 1), 2))
            .unwrap_err();
        assert!(matches!(err, EngineError::StorageUnavailable(_)));
        assert_eq!(restored.snapshot().len(), 1);
    }
}
