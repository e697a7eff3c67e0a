//! Chain plumbing: block-height tracking, gRPC queries and transaction
//! broadcast.

pub mod grpc;
pub mod height;
pub mod msgs;
pub mod signer;
mod tx;

pub use grpc::GrpcClient;
pub use height::ChainHeightTracker;
pub use signer::{KeyringSigner, TxSigner};
pub use tx::ChainClient;

/// The subset of the on-chain `x/oracle` module parameters the feeder
/// acts on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OracleParams {
    pub vote_period: u64,
    /// Symbols the chain expects rates for, upper-cased.
    pub accept_list: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("expected positive block height")]
    NonPositiveHeight,

    #[error("chain height unavailable: {0}")]
    Height(String),

    #[error("rpc request failed: {0}")]
    Rpc(String),

    #[error("grpc request failed: {0}")]
    Grpc(String),

    #[error("broadcasting tx timed out")]
    BroadcastTimeout,

    #[error("tx failed with code {code}: {log}")]
    Broadcast { code: u32, log: String },

    #[error("signer error: {0}")]
    Signer(String),

    #[error("shutting down")]
    Cancelled,
}

// ABCI codes the mempool hands back for transient conditions.
const CODE_TX_IN_MEMPOOL: u32 = 19;
const CODE_MEMPOOL_FULL: u32 = 20;
const CODE_SEQUENCE_MISMATCH: u32 = 32;

impl ChainError {
    /// Whether a broadcast failure is worth retrying after the next
    /// block.
    pub fn is_retryable(&self) -> bool {
        match self {
            ChainError::Broadcast { code, .. } => matches!(
                *code,
                CODE_TX_IN_MEMPOOL | CODE_MEMPOOL_FULL | CODE_SEQUENCE_MISMATCH
            ),
            ChainError::Rpc(msg) => msg.contains("not found"),
            _ => false,
        }
    }
}
