//! Ledger facts: usage transactions and payments.
//!
//! Facts are immutable once committed. The raw [`FactRecord`] is the CSV
//! shape; [`Fact`] is the validated, typed form every store works with.

use crate::error::{EngineError, Result};
use crate::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The lower bound of every organization's first window.
///
/// An organization without a checkpoint behaves as if it had one at this
/// instant with a zero balance.
pub const EPOCH_START: DateTime<Utc> = DateTime::<Utc>::MIN_UTC;

/// Opaque organization identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrganizationId(pub u32);

impl fmt::Display for OrganizationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A usage charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub organization_id: OrganizationId,
    pub timestamp: DateTime<Utc>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Amount debited from the organization's balance.
    pub price: Money,
}

/// A credit to an organization's balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub organization_id: OrganizationId,
    pub timestamp: DateTime<Utc>,
    pub amount: Money,
}

/// An immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fact {
    Transaction(Transaction),
    Payment(Payment),
}

impl Fact {
    pub fn organization_id(&self) -> OrganizationId {
        match self {
            Fact::Transaction(tx) => tx.organization_id,
            Fact::Payment(payment) => payment.organization_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Fact::Transaction(tx) => tx.timestamp,
            Fact::Payment(payment) => payment.timestamp,
        }
    }

    /// Returns `true` if the fact falls in the window `(after, upto]`.
    pub fn in_window(&self, after: DateTime<Utc>, upto: DateTime<Utc>) -> bool {
        let ts = self.timestamp();
        ts > after && ts <= upto
    }

    /// Checks the fact's own fields.
    ///
    /// Token counts are unsigned by construction; everything else that the
    /// type system cannot rule out is checked here.
    pub fn check(&self) -> std::result::Result<(), String> {
        if self.timestamp() <= EPOCH_START {
            return Err("timestamp must be after the epoch start".to_string());
        }
        match self {
            Fact::Transaction(tx) if tx.price.is_negative() => {
                Err(format!("transaction price {} is negative", tx.price))
            }
            Fact::Payment(payment) if payment.amount.is_negative() => {
                Err(format!("payment amount {} is negative", payment.amount))
            }
            _ => Ok(()),
        }
    }
}

impl From<Transaction> for Fact {
    fn from(tx: Transaction) -> Self {
        Fact::Transaction(tx)
    }
}

impl From<Payment> for Fact {
    fn from(payment: Payment) -> Self {
        Fact::Payment(payment)
    }
}

/// Raw fact record as read from CSV.
///
/// Token counts are read signed so that a negative count is reported as a
/// validation failure rather than an opaque deserialization error.
#[derive(Debug, Deserialize)]
pub struct FactRecord {
    /// `transaction` or `payment`
    #[serde(rename = "type")]
    pub kind: String,

    pub organization: u32,

    /// RFC 3339 timestamp
    pub timestamp: String,

    /// Present for transactions only
    pub prompt_tokens: Option<i64>,

    /// Present for transactions only
    pub completion_tokens: Option<i64>,

    /// Price for a transaction, credited amount for a payment
    pub amount: Option<String>,
}

impl FactRecord {
    /// Parses the raw record into a typed fact.
    ///
    /// `row` is only used to label the error.
    pub fn parse(&self, row: usize) -> Result<Fact> {
        let invalid = |message: String| EngineError::InvalidRecord { row, message };

        let organization_id = OrganizationId(self.organization);
        let timestamp = DateTime::parse_from_rfc3339(self.timestamp.trim())
            .map_err(|e| invalid(format!("bad timestamp {:?}: {}", self.timestamp, e)))?
            .with_timezone(&Utc);
        let amount = match self.amount.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => Money::from_str(s).map_err(|e| invalid(e.to_string()))?,
            _ => return Err(invalid("missing amount".to_string())),
        };

        let fact = match self.kind.trim().to_lowercase().as_str() {
            "transaction" => Fact::Transaction(Transaction {
                organization_id,
                timestamp,
                prompt_tokens: token_count("prompt_tokens", self.prompt_tokens).map_err(invalid)?,
                completion_tokens: token_count("completion_tokens", self.completion_tokens)
                    .map_err(invalid)?,
                price: amount,
            }),
            "payment" => Fact::Payment(Payment {
                organization_id,
                timestamp,
                amount,
            }),
            other => return Err(invalid(format!("unknown fact type {:?}", other))),
        };

        fact.check().map_err(invalid)?;
        Ok(fact)
    }
}

fn token_count(field: &str, value: Option<i64>) -> std::result::Result<u64, String> {
    match value {
        None => Ok(0),
        Some(n) => u64::try_from(n).map_err(|_| format!("{} must not be negative, got {}", field, n)),
    }
}
