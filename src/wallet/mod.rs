//! Wallet/chain service seam.
//!
//! Everything that touches the settlement layer lives behind this trait:
//! validation against current chain state, batch submission, reward-token
//! balances and wallet address resolution. The aggregator core never signs,
//! estimates gas or broadcasts on its own.

use async_trait::async_trait;

use crate::txs::types::{TxFailure, TxRecord, TxSubmission};

/// Result of validating a submission against current settlement state.
#[derive(Debug, Clone)]
pub struct CheckTxOutcome {
    /// Client-facing rejections; empty means the submission is admissible
    pub failures: Vec<TxFailure>,
    /// The sender's authoritative next nonce as the chain sees it
    pub next_nonce: u64,
}

/// Faults raised by a wallet service implementation.
#[derive(Debug, Clone)]
pub enum WalletError {
    /// Gas estimation failed for the call. The service converts this into a
    /// structured `unpredictable-gas-limit` rejection instead of propagating.
    CannotEstimateGas(String),
    /// Any other chain/RPC fault; propagates to the caller.
    Rpc(String),
}

impl std::fmt::Display for WalletError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalletError::CannotEstimateGas(reason) => {
                write!(f, "cannot estimate gas: {reason}")
            }
            WalletError::Rpc(reason) => write!(f, "rpc error: {reason}"),
        }
    }
}

impl std::error::Error for WalletError {}

/// External collaborator handling all chain interaction.
#[async_trait]
pub trait WalletService: Send + Sync {
    /// Validate a submission against current settlement state. Must not
    /// mutate anything.
    async fn check_tx(&self, tx: &TxSubmission) -> Result<CheckTxOutcome, WalletError>;

    /// Submit one settlement batch.
    async fn send_txs(&self, txs: &[TxRecord]) -> Result<(), WalletError>;

    /// Current reward-token balance of a wallet address.
    async fn get_reward_balance_of(&self, address: &str) -> Result<u128, WalletError>;

    /// Resolve the wallet contract address for a sender key, if the wallet
    /// has been created.
    async fn wallet_address_of(&self, sender: &str) -> Result<Option<String>, WalletError>;
}
