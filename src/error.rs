//! Error types raised by engine construction and by [`Engine::run`](crate::Engine::run)

use thiserror::Error;

/// Raised when an engine variant is constructed with parameters that violate
/// an invariant.
///
/// These are configuration errors: they are detected before any adapter call
/// is made and never occur mid-run.
#[derive(Debug, Error)]
pub enum ConstructionError {
    /// The quorum `threshold` was outside `1..=N` for `N` responders.
    #[error("threshold {threshold} is invalid for {responder_count} responder(s); must be in 1..={responder_count}")]
    InvalidThreshold {
        /// The threshold that was supplied.
        threshold: usize,
        /// The number of responders the engine was constructed with.
        responder_count: usize,
    },

    /// Multi-responder mode was constructed with zero responders.
    #[error("multi-responder engine requires at least one responder")]
    NoResponders,

    /// A [`Builder`](crate::engine::Builder)'s control-channel buffer size was zero.
    #[error("control channel buffer size must be non-zero")]
    InvalidBufferSize,
}

/// Raised from the engine's `run` loop when the engine itself detects a
/// contract violation, as opposed to a normal `status: false` outcome
/// reported by an adapter.
///
/// A `status: false` reply is never an [`EngineError`]. It is the
/// sanctioned channel for "destination rejected" and is handled entirely
/// within the state machine. This variant is reserved for adapters that
/// break their contract by returning `Err` from a trait method.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An adapter call returned `Err` instead of translating the failure
    /// into a result record with `status: false`.
    #[error("adapter for transfer {nonce} violated its contract: {source}")]
    Adapter {
        /// The nonce of the transfer whose adapter call failed.
        nonce: String,
        /// The underlying adapter error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}
