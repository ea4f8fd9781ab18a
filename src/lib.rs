#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs, missing_debug_implementations)]

//! A one-directional, ledger-agnostic bridge engine that observes a source
//! ledger, forwards payloads to a destination ledger, and drives each
//! transfer to a committed or aborted outcome on the source.
//!
//! The engine is ledger-agnostic: it knows nothing about any particular
//! chain or notary. Callers supply [`Initiator`]/[`Responder`] adapters that
//! translate the engine's generic `Payload` into ledger-specific calls.
//!
//! # Variants
//!
//! - [`Engine`]: one [`Initiator`], one [`Responder`].
//! - [`MultiEngine`]: one [`Initiator`], `N` [`MultiResponder`]s, commits
//!   once `threshold` of them agree.
//! - [`DecentralisedEngine`]: wraps the single-responder pipeline, but
//!   externalises the in-flight transfer set to a [`StateManager`] shared
//!   by multiple engine processes.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use interledger_engine::{Engine, Initiator, Responder};
//! # use interledger_engine::{adapter::{AdapterError, LedgerType}, Payload, SendResult, CommitResult, AbortResult, ErrorCode};
//! # struct MyInitiator;
//! # #[async_trait::async_trait]
//! # impl Initiator for MyInitiator {
//! #     async fn listen_for_events(&self) -> Result<Vec<Payload>, AdapterError> { Ok(vec![]) }
//! #     async fn commit_sending(&self, _id: &str, _data: Option<Vec<u8>>) -> Result<CommitResult, AdapterError> { unimplemented!() }
//! #     async fn abort_sending(&self, _id: &str, _reason: ErrorCode) -> Result<AbortResult, AdapterError> { unimplemented!() }
//! #     fn ledger_type(&self) -> LedgerType { LedgerType::Ethereum }
//! # }
//! # struct MyResponder;
//! # #[async_trait::async_trait]
//! # impl Responder for MyResponder {
//! #     async fn send_data(&self, _nonce: &str, _data: &[u8]) -> Result<SendResult, AdapterError> { unimplemented!() }
//! #     fn ledger_type(&self) -> LedgerType { LedgerType::Ethereum }
//! # }
//!
//! #[tokio::main]
//! async fn main() {
//!     let (engine, handle) = Engine::new(Arc::new(MyInitiator), Arc::new(MyResponder));
//!     let join = engine.spawn();
//!
//!     // ... run until told to stop, from any other task or context:
//!     handle.stop();
//!     let _ = join.await;
//! }
//! ```
//!
//! A bidirectional pairing (left-to-right and right-to-left) is just two
//! independently spawned engines sharing the same `tokio` runtime; the
//! engine has no notion of "the other direction".

pub(crate) mod control;
pub(crate) mod util;

pub mod adapter;
pub mod decentralised;
pub mod engine;
pub mod error;
pub mod multi;
pub mod transfer;

pub use adapter::{Initiator, LedgerType, MultiResponder, Responder, StateManager};
pub use control::EngineHandle;
pub use decentralised::{Builder as DecentralisedEngineBuilder, DecentralisedEngine};
pub use engine::{Builder as EngineBuilder, Engine};
pub use error::{ConstructionError, EngineError};
pub use multi::{Builder as MultiEngineBuilder, MultiEngine, QuorumTransferResult};
pub use transfer::{
    AbortResult, CommitResult, ErrorCode, Payload, SendResult, Status, Transfer, TransferResult,
};
