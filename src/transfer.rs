//! The [`Transfer`] record and its [`Status`] state machine

use uuid::Uuid;

/// The transactional bundle carried by a [`Transfer`]: the source-ledger
/// handle, the opaque payload, and the engine-assigned nonce.
///
/// The engine reads and writes only these three fields; adapters are free to
/// carry additional context of their own alongside a `Transfer` (e.g. inside
/// `id`-keyed side tables) without the engine needing to know about it.
#[derive(Debug, Clone)]
pub struct Payload {
    /// The source-ledger handle for this event (e.g. a tx id or event id).
    pub id: String,
    /// The opaque content to forward to the destination ledger.
    pub data: Vec<u8>,
    /// Engine-assigned unique identifier, distinct from `id`.
    ///
    /// Empty until the transfer is admitted by [`Engine::receive`](crate::Engine);
    /// see [`Status::Ready`].
    pub nonce: String,
}

impl Payload {
    /// Construct a payload for an incoming event, before the engine has
    /// assigned a nonce.
    pub fn new(id: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            data: data.into(),
            nonce: String::new(),
        }
    }
}

/// The state of a [`Transfer`] as it is driven through the pipeline.
///
/// Single-responder mode only ever uses the `Ready, Sent, Responded,
/// Confirming, Finalized` subset; `Inquired`/`Answered` are used by the
/// multi-responder quorum variant only. Status advances monotonically along
/// the edges below; it never goes backwards:
///
/// ```text
/// Ready -> [Inquired -> Answered ->] Sent -> Responded -> Confirming -> Finalized
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    /// Admitted into the working set, nonce assigned, not yet dispatched.
    Ready,
    /// Multi-mode only: inquiry calls are outstanding on every responder.
    Inquired,
    /// Multi-mode only: all inquiry replies are in and `inquiry_decision` is set.
    Answered,
    /// `send_data` (or its multi-mode inquiry/execution equivalent) is outstanding.
    Sent,
    /// The responder(s) have replied; `result` is populated.
    Responded,
    /// `commit_sending`/`abort_sending` is outstanding.
    Confirming,
    /// The confirm leg has completed; eligible for removal from the working set.
    Finalized,
}

/// Wire-stable error codes carried in result records.
///
/// These integers are part of the contract with adapters: `2` always means
/// `TRANSACTION_FAILURE`, `5` always means `INQUIRY_REJECT`, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// The adapter call did not complete within its own deadline.
    Timeout = 1,
    /// The destination ledger rejected or failed to apply the transaction.
    TransactionFailure = 2,
    /// A KSI hash anchoring scheme the responder does not support.
    UnsupportedKsiHash = 3,
    /// The destination application layer rejected the payload.
    ApplicationReject = 4,
    /// The multi-responder inquiry vote did not reach quorum.
    InquiryReject = 5,
}

/// A reply from [`Responder::send_data`](crate::Responder::send_data) (and,
/// in multi-mode, from `send_data_inquire`/`abort_send_data`).
#[derive(Debug, Clone)]
pub struct SendResult {
    /// `true` if the destination ledger accepted the payload, `false` if it
    /// was rejected. Both are normal, successful completions of the send leg.
    pub status: bool,
    /// The destination-ledger transaction hash, if any.
    pub tx_hash: String,
    /// Present only when `status` is `false`.
    pub error_code: Option<ErrorCode>,
    /// Present only when `status` is `false`.
    pub message: Option<String>,
}

/// A reply from [`Initiator::commit_sending`](crate::Initiator::commit_sending).
#[derive(Debug, Clone)]
pub struct CommitResult {
    /// Whether the source ledger committed the transaction.
    pub commit_status: bool,
    /// The source-ledger commit transaction hash.
    pub commit_tx_hash: String,
    /// Present only when `commit_status` is `false`.
    pub commit_error_code: Option<ErrorCode>,
    /// Present only when `commit_status` is `false`.
    pub commit_message: Option<String>,
}

/// A reply from [`Initiator::abort_sending`](crate::Initiator::abort_sending).
#[derive(Debug, Clone)]
pub struct AbortResult {
    /// Whether the source ledger acknowledged the abort.
    pub abort_status: bool,
    /// The source-ledger abort transaction hash.
    pub abort_tx_hash: String,
    /// Present only when `abort_status` is `false`.
    pub abort_error_code: Option<ErrorCode>,
    /// Present only when `abort_status` is `false`.
    pub abort_message: Option<String>,
}

/// The terminal record published to `results_commit()`/`results_abort()`:
/// the responder's reply merged with the initiator's commit or abort reply.
#[derive(Debug, Clone)]
pub struct TransferResult {
    /// The nonce of the finalized transfer.
    pub nonce: String,
    /// The source-ledger id of the finalized transfer.
    pub id: String,
    /// The responder's reply (`status: true` if accepted by the destination).
    pub send: SendResult,
    /// The initiator's commit reply, if this transfer committed.
    pub commit: Option<CommitResult>,
    /// The initiator's abort reply, if this transfer aborted.
    pub abort: Option<AbortResult>,
}

/// One record per incoming event, mutated only by the engine, destroyed
/// after `FINALIZED` is observed by the cleanup pass.
#[derive(Debug, Clone)]
pub struct Transfer {
    /// The transactional bundle: `id`, `data`, `nonce`.
    pub payload: Payload,
    /// Current state-machine position.
    pub status: Status,
    /// Populated once the responder has replied.
    pub result: Option<SendResult>,
    /// Multi-mode only: `true` once a quorum of inquiry replies agreed to proceed.
    pub inquiry_decision: Option<bool>,
}

impl Transfer {
    /// Admit a freshly observed event: assigns a fresh globally-unique nonce
    /// and sets `status` to [`Status::Ready`].
    ///
    /// This is the only place a nonce is ever assigned; see invariant 2 in
    /// the data model.
    pub fn admit(mut payload: Payload) -> Self {
        payload.nonce = Uuid::new_v4().to_string();
        Self {
            payload,
            status: Status::Ready,
            result: None,
            inquiry_decision: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_assigns_a_nonce_and_starts_ready() {
        let transfer = Transfer::admit(Payload::new("a", b"data".to_vec()));
        assert!(!transfer.payload.nonce.is_empty());
        assert_eq!(transfer.status, Status::Ready);
    }

    #[test]
    fn admit_assigns_distinct_nonces() {
        let a = Transfer::admit(Payload::new("a", b"x".to_vec()));
        let b = Transfer::admit(Payload::new("a", b"x".to_vec()));
        assert_ne!(a.payload.nonce, b.payload.nonce);
    }

    #[test]
    fn status_order_matches_the_state_machine() {
        assert!(Status::Ready < Status::Inquired);
        assert!(Status::Inquired < Status::Answered);
        assert!(Status::Answered < Status::Sent);
        assert!(Status::Sent < Status::Responded);
        assert!(Status::Responded < Status::Confirming);
        assert!(Status::Confirming < Status::Finalized);
    }
}
