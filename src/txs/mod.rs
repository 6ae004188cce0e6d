//! Transaction admission, ordering and batching engine.
//!
//! ## Flow
//! 1. `TxService::add` validates a record and routes it to Ready, Future or
//!    the replacement path inside one query group
//! 2. `BatchTimer` debounces a flush deadline; a full Ready page triggers one
//!    immediately
//! 3. `TxService::run_batch` pay-checks the highest-priority Ready records
//!    and executes them as one settlement batch

pub mod batch_timer;
pub mod query_group;
pub mod service;
pub mod types;


pub use batch_timer::BatchTimer;
pub use query_group::{LockRegistry, QueryGroup};
pub use service::{TxService, TxServiceStats};
pub use types::{TxFailure, TxFailureKind, TxRecord, TxServiceError, TxSubmission};
