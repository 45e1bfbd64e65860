//! Atomic batch ingestion into the ledger.

use crate::error::{EngineError, Result};
use crate::fact::{Fact, OrganizationId};
use crate::lock::OrganizationLocks;
use crate::store::{CheckpointStore, LedgerStore};
use chrono::{DateTime, Utc};
use log::info;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Validates and commits batches of facts.
///
/// A batch is checked in full before anything is appended, and the append
/// itself is all-or-nothing, so a rejected batch leaves no trace in the
/// ledger. Usually obtained from
/// [`BalanceEngine::ingestor`](crate::BalanceEngine::ingestor).
pub struct BatchIngestor<L, C> {
    ledger: Arc<L>,
    checkpoints: Arc<C>,
    locks: Arc<OrganizationLocks>,
}

impl<L, C> BatchIngestor<L, C>
where
    L: LedgerStore,
    C: CheckpointStore,
{
    /// `locks` must be the ones the balance engine over `checkpoints` uses.
    pub fn new(ledger: Arc<L>, checkpoints: Arc<C>, locks: Arc<OrganizationLocks>) -> Self {
        BatchIngestor {
            ledger,
            checkpoints,
            locks,
        }
    }

    /// Commits `batch` and returns the number of facts written.
    ///
    /// Fails with [`EngineError::Validation`] on the first malformed fact,
    /// fact for an unknown organization, or fact timestamped at or before
    /// its organization's latest checkpoint. Storage failures propagate
    /// as-is.
    pub fn ingest(&self, batch: Vec<Fact>) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        for (index, fact) in batch.iter().enumerate() {
            fact.check()
                .map_err(|message| EngineError::Validation { index, message })?;
            if !self.ledger.has_organization(fact.organization_id())? {
                return Err(EngineError::Validation {
                    index,
                    message: format!("unknown organization {}", fact.organization_id()),
                });
            }
        }

        // Held until the append lands, so no checkpoint can move past a fact
        // between the check below and the write.
        let orgs: Vec<OrganizationId> = batch
            .iter()
            .map(Fact::organization_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let slots = self.locks.slots(&orgs);
        let _guards: Vec<_> = slots.iter().map(|slot| slot.lock()).collect();

        let mut covered_until: HashMap<OrganizationId, DateTime<Utc>> = HashMap::new();
        for &org in &orgs {
            if let Some(checkpoint) = self.checkpoints.latest(org)? {
                covered_until.insert(org, checkpoint.timestamp);
            }
        }
        for (index, fact) in batch.iter().enumerate() {
            if let Some(&until) = covered_until.get(&fact.organization_id()) {
                if fact.timestamp() <= until {
                    return Err(EngineError::Validation {
                        index,
                        message: format!(
                            "timestamp {} is not after organization {}'s checkpoint at {}",
                            fact.timestamp(),
                            fact.organization_id(),
                            until
                        ),
                    });
                }
            }
        }

        let count = batch.len();
        self.ledger.append_batch(batch)?;
        info!("Ingested {} facts", count);
        Ok(count)
    }
}
