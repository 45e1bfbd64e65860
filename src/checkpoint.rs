//! Balance checkpoints and window aggregation.
//!
//! A checkpoint states the balance of one organization as of a timestamp,
//! plus the token usage aggregated since the previous checkpoint.
//!
//! # Invariants
//!
//! - `balance == previous.balance - cost_sum + payment_sum` for every
//!   transition built by [`Baseline::advance`]
//! - a new checkpoint's timestamp is strictly after its predecessor's

use crate::error::{EngineError, Result};
use crate::fact::{Fact, OrganizationId, EPOCH_START};
use crate::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-assigned checkpoint identity. Strictly increasing across the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(pub u64);

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A committed checkpoint row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub organization_id: OrganizationId,
    /// Every fact at or before this instant is reflected in `balance`.
    pub timestamp: DateTime<Utc>,
    /// Prompt tokens consumed since the previous checkpoint.
    pub prompt_token_sum: u64,
    /// Completion tokens consumed since the previous checkpoint.
    pub completion_token_sum: u64,
    pub balance: Money,
}

/// A checkpoint that has been computed but not yet assigned an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCheckpoint {
    pub organization_id: OrganizationId,
    pub timestamp: DateTime<Utc>,
    pub prompt_token_sum: u64,
    pub completion_token_sum: u64,
    pub balance: Money,
}

impl PendingCheckpoint {
    /// Assigns the id under which the store committed this checkpoint.
    pub fn commit(self, id: CheckpointId) -> Checkpoint {
        Checkpoint {
            id,
            organization_id: self.organization_id,
            timestamp: self.timestamp,
            prompt_token_sum: self.prompt_token_sum,
            completion_token_sum: self.completion_token_sum,
            balance: self.balance,
        }
    }
}

/// A conditional checkpoint write: only valid while the organization's
/// latest checkpoint is still `expected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointWrite {
    pub expected: Option<CheckpointId>,
    pub checkpoint: PendingCheckpoint,
}

/// Where the next window of an organization starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Baseline {
    pub organization_id: OrganizationId,
    /// `None` when the organization has never been checkpointed.
    pub id: Option<CheckpointId>,
    pub timestamp: DateTime<Utc>,
    pub balance: Money,
}

impl Baseline {
    /// Derives the baseline from the organization's latest checkpoint,
    /// defaulting to a zero balance at [`EPOCH_START`].
    pub fn from_latest(organization_id: OrganizationId, latest: Option<&Checkpoint>) -> Self {
        match latest {
            Some(cp) => Baseline {
                organization_id,
                id: Some(cp.id),
                timestamp: cp.timestamp,
                balance: cp.balance,
            },
            None => Baseline {
                organization_id,
                id: None,
                timestamp: EPOCH_START,
                balance: Money::ZERO,
            },
        }
    }

    /// Applies the window totals and produces the conditional write that
    /// moves the organization to `cutoff`.
    pub fn advance(&self, totals: &WindowTotals, cutoff: DateTime<Utc>) -> Result<CheckpointWrite> {
        if cutoff <= self.timestamp {
            return Err(EngineError::StaleCutoff {
                organization_id: self.organization_id,
                latest: self.timestamp,
                cutoff,
            });
        }

        let balance = self
            .balance
            .checked_sub(totals.cost_sum)
            .and_then(|b| b.checked_add(totals.payment_sum))
            .ok_or(EngineError::Overflow {
                organization_id: self.organization_id,
            })?;

        Ok(CheckpointWrite {
            expected: self.id,
            checkpoint: PendingCheckpoint {
                organization_id: self.organization_id,
                timestamp: cutoff,
                prompt_token_sum: totals.prompt_token_sum,
                completion_token_sum: totals.completion_token_sum,
                balance,
            },
        })
    }
}

/// Sums over the facts of one window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowTotals {
    pub cost_sum: Money,
    pub payment_sum: Money,
    pub prompt_token_sum: u64,
    pub completion_token_sum: u64,
    pub transactions: usize,
    pub payments: usize,
}

impl WindowTotals {
    /// Aggregates the facts of one organization's window.
    pub fn aggregate<'a, I>(organization_id: OrganizationId, facts: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a Fact>,
    {
        let mut totals = WindowTotals::default();
        for fact in facts {
            totals
                .absorb(fact)
                .ok_or(EngineError::Overflow { organization_id })?;
        }
        Ok(totals)
    }

    /// Adds one fact. Returns `None` on overflow, leaving `self` partially
    /// updated.
    fn absorb(&mut self, fact: &Fact) -> Option<()> {
        match fact {
            Fact::Transaction(tx) => {
                self.cost_sum = self.cost_sum.checked_add(tx.price)?;
                self.prompt_token_sum = self.prompt_token_sum.checked_add(tx.prompt_tokens)?;
                self.completion_token_sum =
                    self.completion_token_sum.checked_add(tx.completion_tokens)?;
                self.transactions += 1;
            }
            Fact::Payment(payment) => {
                self.payment_sum = self.payment_sum.checked_add(payment.amount)?;
                self.payments += 1;
            }
        }
        Some(())
    }

    pub fn is_empty(&self) -> bool {
        self.transactions == 0 && self.payments == 0
    }
}
