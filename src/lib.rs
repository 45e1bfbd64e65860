//! # Usage Ledger
//!
//! An incremental balance engine for per-organization usage charges and
//! payments.
//!
//! Facts (transactions and payments) are appended to a ledger and never
//! change. The balance engine periodically folds the facts of each
//! organization into an append-only log of checkpoints, reading only the
//! window since the previous checkpoint.
//!
//! ## Design Principles
//!
//! - **Fixed-point arithmetic**: amounts are `rust_decimal` values at a fixed
//!   scale; balances never drift
//! - **Windows, not rescans**: each recompute reads `(last checkpoint, cutoff]`
//! - **Append-only checkpoints**: the latest row per organization is current,
//!   older rows are the audit trail
//! - **Compare-and-append**: a checkpoint is only written on top of the one it
//!   was computed from
//! - **Closed windows stay closed**: ingestion refuses facts at or before an
//!   organization's latest checkpoint, and cutoffs never lie in the future
//!
//! ## Example
//!
//! ```
//! use std::str::FromStr;
//! use std::sync::Arc;
//! use chrono::Utc;
//! use usage_ledger::{
//!     BalanceEngine, Fact, MemoryCheckpoints, MemoryLedger, Money,
//!     OrganizationId, Transaction,
//! };
//!
//! let ledger = Arc::new(MemoryLedger::new());
//! ledger.register_organization(OrganizationId(1));
//!
//! let engine = BalanceEngine::new(ledger, Arc::new(MemoryCheckpoints::new()));
//! engine
//!     .ingestor()
//!     .ingest(vec![Fact::Transaction(Transaction {
//!         organization_id: OrganizationId(1),
//!         timestamp: Utc::now(),
//!         prompt_tokens: 1000,
//!         completion_tokens: 200,
//!         price: Money::from_str("0.42").unwrap(),
//!     })])
//!     .unwrap();
//!
//! let report = engine.recompute(&[]).unwrap();
//! assert_eq!(report.balance(OrganizationId(1)), Some(-Money::from_str("0.42").unwrap()));
//! ```

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod fact;
pub mod ingest;
pub mod io;
pub mod lock;
pub mod money;
pub mod store;

pub use checkpoint::{
    Baseline, Checkpoint, CheckpointId, CheckpointWrite, PendingCheckpoint, WindowTotals,
};
pub use config::EngineConfig;
pub use engine::{BalanceEngine, RecomputeReport};
pub use error::{EngineError, Result};
pub use fact::{Fact, FactRecord, OrganizationId, Payment, Transaction, EPOCH_START};
pub use ingest::BatchIngestor;
pub use lock::OrganizationLocks;
pub use money::{Money, ParseMoneyError};
pub use store::{CheckpointStore, LedgerStore, MemoryCheckpoints, MemoryLedger};
