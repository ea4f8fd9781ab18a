//! In-process mock adapters shared by the integration tests.
//!
//! These stand in for the docker-backed ledger fixtures a real adapter
//! crate would use: no network, no chain, just scripted replies and a
//! record of every call made so assertions can inspect them afterward.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use interledger_engine::adapter::{AdapterError, Initiator, LedgerType, MultiResponder, Responder, StateManager};
use interledger_engine::{AbortResult, CommitResult, ErrorCode, Payload, SendResult, Status, Transfer};
use tokio::sync::mpsc;

/// Feeds a scripted stream of events to the engine and records every
/// commit/abort call made against it.
pub struct MockInitiator {
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<Payload>>,
    commits: Mutex<Vec<(String, Option<Vec<u8>>)>>,
    aborts: Mutex<Vec<(String, ErrorCode)>>,
    ledger_type: LedgerType,
}

impl MockInitiator {
    /// Construct a mock initiator and the sender used to feed it events.
    pub fn new(ledger_type: LedgerType) -> (Self, mpsc::UnboundedSender<Payload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let initiator = Self {
            events: tokio::sync::Mutex::new(rx),
            commits: Mutex::new(Vec::new()),
            aborts: Mutex::new(Vec::new()),
            ledger_type,
        };
        (initiator, tx)
    }

    /// Every `(id, data)` passed to `commit_sending`, in call order.
    pub fn commits(&self) -> Vec<(String, Option<Vec<u8>>)> {
        self.commits.lock().unwrap().clone()
    }

    /// Every `(id, reason)` passed to `abort_sending`, in call order.
    pub fn aborts(&self) -> Vec<(String, ErrorCode)> {
        self.aborts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Initiator for MockInitiator {
    async fn listen_for_events(&self) -> Result<Vec<Payload>, AdapterError> {
        let mut rx = self.events.lock().await;
        match rx.recv().await {
            Some(payload) => Ok(vec![payload]),
            // The feed is exhausted for this test: block forever rather than
            // error, matching "blocks until at least one event is available".
            None => std::future::pending().await,
        }
    }

    async fn commit_sending(&self, id: &str, data: Option<Vec<u8>>) -> Result<CommitResult, AdapterError> {
        self.commits.lock().unwrap().push((id.to_string(), data));
        Ok(CommitResult {
            commit_status: true,
            commit_tx_hash: format!("commit-{id}"),
            commit_error_code: None,
            commit_message: None,
        })
    }

    async fn abort_sending(&self, id: &str, reason: ErrorCode) -> Result<AbortResult, AdapterError> {
        self.aborts.lock().unwrap().push((id.to_string(), reason));
        Ok(AbortResult {
            abort_status: true,
            abort_tx_hash: format!("abort-{id}"),
            abort_error_code: Some(reason),
            abort_message: None,
        })
    }

    fn ledger_type(&self) -> LedgerType {
        self.ledger_type
    }
}

/// A [`Responder`] that replies from a fixed script, in call order, falling
/// back to an unconditional accept once the script is exhausted.
pub struct MockResponder {
    ledger_type: LedgerType,
    script: Mutex<VecDeque<SendResult>>,
    calls: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockResponder {
    /// Construct a responder that replies with each of `script`, in order.
    pub fn new(ledger_type: LedgerType, script: Vec<SendResult>) -> Self {
        Self {
            ledger_type,
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every `(nonce, data)` passed to `send_data`, in call order.
    pub fn calls(&self) -> Vec<(String, Vec<u8>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Responder for MockResponder {
    async fn send_data(&self, nonce: &str, data: &[u8]) -> Result<SendResult, AdapterError> {
        self.calls.lock().unwrap().push((nonce.to_string(), data.to_vec()));
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or(SendResult {
            status: true,
            tx_hash: format!("tx-{nonce}"),
            error_code: None,
            message: None,
        }))
    }

    fn ledger_type(&self) -> LedgerType {
        self.ledger_type
    }
}

/// A [`MultiResponder`] with independent scripts for the inquiry and
/// execution phases, keyed by the order calls arrive in.
pub struct MockMultiResponder {
    ledger_type: LedgerType,
    inquire_script: Mutex<VecDeque<SendResult>>,
    send_script: Mutex<VecDeque<SendResult>>,
    aborts: Mutex<Vec<String>>,
}

impl MockMultiResponder {
    /// Construct a multi-responder replying `inquire_script` to
    /// `send_data_inquire` calls and `send_script` to `send_data` calls, in order.
    pub fn new(ledger_type: LedgerType, inquire_script: Vec<SendResult>, send_script: Vec<SendResult>) -> Self {
        Self {
            ledger_type,
            inquire_script: Mutex::new(inquire_script.into()),
            send_script: Mutex::new(send_script.into()),
            aborts: Mutex::new(Vec::new()),
        }
    }

    /// Every nonce passed to `abort_send_data`, in call order.
    pub fn aborts(&self) -> Vec<String> {
        self.aborts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Responder for MockMultiResponder {
    async fn send_data(&self, nonce: &str, _data: &[u8]) -> Result<SendResult, AdapterError> {
        let next = self.send_script.lock().unwrap().pop_front();
        Ok(next.unwrap_or(SendResult {
            status: true,
            tx_hash: format!("tx-{nonce}"),
            error_code: None,
            message: None,
        }))
    }

    fn ledger_type(&self) -> LedgerType {
        self.ledger_type
    }
}

#[async_trait]
impl MultiResponder for MockMultiResponder {
    async fn send_data_inquire(&self, nonce: &str, _data: &[u8]) -> Result<SendResult, AdapterError> {
        let next = self.inquire_script.lock().unwrap().pop_front();
        Ok(next.unwrap_or(SendResult {
            status: true,
            tx_hash: format!("inquire-{nonce}"),
            error_code: None,
            message: None,
        }))
    }

    async fn abort_send_data(&self, nonce: &str, reason: ErrorCode) -> Result<SendResult, AdapterError> {
        self.aborts.lock().unwrap().push(nonce.to_string());
        Ok(SendResult {
            status: false,
            tx_hash: String::new(),
            error_code: Some(reason),
            message: Some("inquiry quorum not reached".into()),
        })
    }
}

/// An in-memory [`StateManager`], keyed by source-ledger `id`.
///
/// `receive_entry_events` reads a filtered view of the requested status
/// without removing anything from the backing map, so a later `update_entry`
/// against the same id still finds it — matching a real store, where the
/// record lives on after being reported and is mutated in place by every
/// subsequent status transition.
pub struct MockStateManager {
    entries: Mutex<HashMap<String, Transfer>>,
    reject_acceptance: Mutex<HashSet<String>>,
}

impl MockStateManager {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            reject_acceptance: Mutex::new(HashSet::new()),
        }
    }

    /// Configure `signal_send_acceptance` to reject `id`, simulating a peer
    /// engine instance winning the race to claim it.
    pub fn reject_acceptance_for(&self, id: &str) {
        self.reject_acceptance.lock().unwrap().insert(id.to_string());
    }
}

impl Default for MockStateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateManager for MockStateManager {
    async fn create_entry(&self, id: &str, transfer: &Transfer) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(id) {
            return false;
        }
        entries.insert(id.to_string(), transfer.clone());
        true
    }

    async fn signal_send_acceptance(&self, id: &str) -> bool {
        if self.reject_acceptance.lock().unwrap().contains(id) {
            self.entries.lock().unwrap().remove(id);
            return false;
        }
        true
    }

    async fn update_entry(&self, id: &str, status: Status, transfer: Option<&Transfer>) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(id) {
            Some(entry) => {
                if let Some(t) = transfer {
                    *entry = t.clone();
                }
                entry.status = status;
                true
            }
            None => false,
        }
    }

    async fn receive_entry_events(&self, status: Status) -> Vec<Transfer> {
        let entries = self.entries.lock().unwrap();
        entries.values().filter(|t| t.status == status).cloned().collect()
    }
}
