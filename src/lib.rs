//! Aggregator core for signed operations submitted by smart-contract wallets.
//!
//! Clients submit `(sender, nonce, reward, payload, signature)` records; the
//! aggregator admits them, keeps them ordered per sender, and batch-submits
//! them to the settlement layer through an external [`wallet::WalletService`].
//!
//! ## Flow
//! 1. [`txs::TxService::add`] validates a submission and routes it to the
//!    Ready or Future queue (or replaces a competing Ready record)
//! 2. The [`txs::BatchTimer`] debounces a flush deadline; a full Ready page
//!    triggers a flush immediately
//! 3. [`txs::TxService::run_batch`] selects the highest-priority Ready
//!    records, pay-checks them against reward balances and executes them as
//!    one settlement batch
//!
//! HTTP routing, signature verification and the on-chain settlement call
//! itself live outside this crate.

pub mod config;
pub mod db;
pub mod txs;
pub mod wallet;

pub use config::AggregatorConfig;
pub use db::{Database, QueueTable, FUTURE_TABLE, READY_TABLE};
pub use txs::{
    BatchTimer, TxFailure, TxFailureKind, TxRecord, TxService, TxServiceError, TxServiceStats,
    TxSubmission,
};
pub use wallet::{CheckTxOutcome, WalletError, WalletService};
