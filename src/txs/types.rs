//! Transaction record and failure types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::wallet::WalletError;

/// What clients submit: a signed operation for a smart-contract wallet.
///
/// `reward` is the amount offered to the aggregator for settling this record;
/// it arbitrates competing offers for the same (sender, nonce) slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSubmission {
    /// Public key identifying whose operation sequence this belongs to
    pub sender: String,
    /// Position of this record within the sender's required execution order
    pub nonce: u64,
    /// Reward offered to the aggregator (reward-token base units)
    pub reward: u128,
    /// Target contract address
    pub contract_address: String,
    /// Method selector on the target contract
    pub method_id: String,
    /// ABI-encoded call parameters
    pub encoded_params: String,
    /// Sender's signature over the call
    pub signature: String,
}

/// A stored record: submission payload plus the table-scoped insertion id
/// that defines its batch-selection priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    pub id: i64,
    pub sender: String,
    pub nonce: u64,
    pub reward: u128,
    pub contract_address: String,
    pub method_id: String,
    pub encoded_params: String,
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

impl TxRecord {
    /// The submission payload without the storage identity. Reinsertion and
    /// cross-table moves go through this.
    pub fn to_submission(&self) -> TxSubmission {
        TxSubmission {
            sender: self.sender.clone(),
            nonce: self.nonce,
            reward: self.reward,
            contract_address: self.contract_address.clone(),
            method_id: self.method_id.clone(),
            encoded_params: self.encoded_params.clone(),
            signature: self.signature.clone(),
        }
    }
}

/// Tag identifying why a submission was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxFailureKind {
    InvalidFormat,
    InvalidSignature,
    DuplicateNonce,
    InsufficientReward,
    UnpredictableGasLimit,
    InvalidCreation,
}

impl std::fmt::Display for TxFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxFailureKind::InvalidFormat => write!(f, "invalid-format"),
            TxFailureKind::InvalidSignature => write!(f, "invalid-signature"),
            TxFailureKind::DuplicateNonce => write!(f, "duplicate-nonce"),
            TxFailureKind::InsufficientReward => write!(f, "insufficient-reward"),
            TxFailureKind::UnpredictableGasLimit => write!(f, "unpredictable-gas-limit"),
            TxFailureKind::InvalidCreation => write!(f, "invalid-creation"),
        }
    }
}

/// A client-facing rejection. Returned as a value, never thrown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxFailure {
    #[serde(rename = "type")]
    pub kind: TxFailureKind,
    pub description: String,
}

impl TxFailure {
    pub fn new(kind: TxFailureKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    pub fn duplicate_nonce(nonce: u64) -> Self {
        Self::new(
            TxFailureKind::DuplicateNonce,
            format!("a transaction with nonce {nonce} is already settled or in flight"),
        )
    }

    pub fn insufficient_reward(existing_reward: u128) -> Self {
        Self::new(
            TxFailureKind::InsufficientReward,
            format!("reward must exceed the competing offer of {existing_reward}"),
        )
    }

    pub fn unpredictable_gas_limit(reason: impl std::fmt::Display) -> Self {
        Self::new(
            TxFailureKind::UnpredictableGasLimit,
            format!("cannot estimate gas for this call: {reason}"),
        )
    }
}

impl std::fmt::Display for TxFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.description)
    }
}

/// Infrastructure faults. Client-facing rejections never travel this path.
#[derive(Debug)]
pub enum TxServiceError {
    /// Queue storage failed
    Store(rusqlite::Error),
    /// The wallet/chain service failed outside the recognized patterns
    Wallet(WalletError),
}

impl std::fmt::Display for TxServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxServiceError::Store(e) => write!(f, "queue storage error: {e}"),
            TxServiceError::Wallet(e) => write!(f, "wallet service error: {e}"),
        }
    }
}

impl std::error::Error for TxServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TxServiceError::Store(e) => Some(e),
            TxServiceError::Wallet(e) => Some(e),
        }
    }
}

impl From<rusqlite::Error> for TxServiceError {
    fn from(e: rusqlite::Error) -> Self {
        TxServiceError::Store(e)
    }
}

impl From<WalletError> for TxServiceError {
    fn from(e: WalletError) -> Self {
        TxServiceError::Wallet(e)
    }
}
