//! Capability interfaces consumed by the engine: [`Initiator`], [`Responder`],
//! [`MultiResponder`], and the optional [`StateManager`].
//!
//! These are the engine's only seam onto the outside world. Concrete ledger
//! adapters (smart-contract clients, hash-anchoring HTTP clients, chaincode
//! clients) are out of scope for this crate and implement these traits.

use async_trait::async_trait;

use crate::transfer::{AbortResult, CommitResult, ErrorCode, SendResult, Status, Transfer};

/// The error type returned by adapter trait methods.
///
/// An `Err` here is *not* the normal way to signal "the destination
/// rejected the transfer" (that is `status: false` inside an `Ok(..)`
/// result record). `Err` means the adapter itself broke its contract (e.g. a
/// transport it depends on panicked internally and it has nothing sensible
/// to report); the engine treats it as fatal to `run()`. Adapters are
/// expected to translate ordinary failures (timeouts, rejections,
/// application errors) into result records instead of returning `Err`.
pub type AdapterError = Box<dyn std::error::Error + Send + Sync>;

/// A coarse classifier for the ledger behind an adapter.
///
/// Used for exactly one policy decision: when a [`Responder`]'s
/// `ledger_type` is [`LedgerType::Ksi`], the engine passes the responder's
/// `tx_hash` as auxiliary commit data to the initiator (see
/// [`Initiator::commit_sending`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerType {
    /// A smart-contract-based ledger (e.g. an EVM chain).
    Ethereum,
    /// A Hyperledger Fabric chaincode network.
    HyperledgerFabric,
    /// A Hyperledger Indy ledger.
    HyperledgerIndy,
    /// A KSI hash-anchoring notary.
    Ksi,
}

/// Observes a source ledger and applies commit/abort.
#[async_trait]
pub trait Initiator: Send + Sync {
    /// Produce the next batch of transfers whose `payload.id` and
    /// `payload.data` are populated.
    ///
    /// Blocks until at least one event is available, or until the engine
    /// drops its reference (cancellation is implicit: adapters are expected
    /// to tolerate the engine walking away from an in-flight call).
    async fn listen_for_events(&self) -> Result<Vec<crate::transfer::Payload>, AdapterError>;

    /// Commit the transfer identified by `id` on the source ledger.
    ///
    /// `data`, when present, carries the destination ledger's receipt (see
    /// the KSI commit-data rule on [`LedgerType::Ksi`]).
    async fn commit_sending(
        &self,
        id: &str,
        data: Option<Vec<u8>>,
    ) -> Result<CommitResult, AdapterError>;

    /// Abort the transfer identified by `id` on the source ledger, with the
    /// given `reason`.
    async fn abort_sending(&self, id: &str, reason: ErrorCode) -> Result<AbortResult, AdapterError>;

    /// The ledger type this initiator observes.
    fn ledger_type(&self) -> LedgerType;
}

/// Applies a payload to a destination ledger.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Forward `data` to the destination ledger under the given `nonce`.
    ///
    /// `status: true` in the reply means the destination accepted the
    /// payload; `status: false` means it was rejected. Both are normal,
    /// successful completions of this call.
    async fn send_data(&self, nonce: &str, data: &[u8]) -> Result<SendResult, AdapterError>;

    /// The ledger type this responder writes to.
    fn ledger_type(&self) -> LedgerType;
}

/// Extends [`Responder`] with the pre-flight inquiry and best-effort abort
/// used by the multi-responder quorum variant.
#[async_trait]
pub trait MultiResponder: Responder {
    /// Ask the destination ledger whether it would accept `data`, without
    /// committing to sending it.
    async fn send_data_inquire(&self, nonce: &str, data: &[u8]) -> Result<SendResult, AdapterError>;

    /// Best-effort notification that the transfer identified by `nonce` will
    /// not be sent, because the quorum inquiry vote failed. The engine
    /// ignores the reply to this call for its commit decision.
    async fn abort_send_data(&self, nonce: &str, reason: ErrorCode) -> Result<SendResult, AdapterError>;
}

/// Externalises the transfer map for the decentralised variant, so that
/// multiple engine instances can coordinate over a shared store.
#[async_trait]
pub trait StateManager: Send + Sync {
    /// Create an entry for `id`. Returns `false` if the id already exists,
    /// in which case the decentralised engine drops the transfer.
    async fn create_entry(&self, id: &str, transfer: &Transfer) -> bool;

    /// Claim the send leg for `id` on behalf of this engine instance.
    /// Returns `false` if another peer already claimed it.
    async fn signal_send_acceptance(&self, id: &str) -> bool;

    /// Push a new status (and, optionally, the updated transfer) outward to
    /// the shared store.
    async fn update_entry(&self, id: &str, status: Status, transfer: Option<&Transfer>) -> bool;

    /// Ask the store for every transfer currently recorded in the given
    /// status, to refill the engine's local working set.
    async fn receive_entry_events(&self, status: Status) -> Vec<Transfer>;
}
