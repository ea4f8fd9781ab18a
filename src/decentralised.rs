//! The decentralised variant: the single-responder pipeline with its
//! `transfers` working set externalised to a [`StateManager`], so that
//! multiple engine processes can share the same in-flight set.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace};

use crate::adapter::{AdapterError, Initiator, LedgerType, Responder, StateManager};
use crate::control::{Control, EngineHandle};
use crate::error::{ConstructionError, EngineError};
use crate::transfer::{
    AbortResult, CommitResult, ErrorCode, Payload, SendResult, Status, Transfer, TransferResult,
};
use crate::util::Running;

const DEFAULT_CONTROL_CHAN_BUF: usize = 16;

/// Builder for [`DecentralisedEngine`].
#[derive(Debug, Clone)]
pub struct Builder {
    /// Buffer size of the control channel used to signal `stop()`.
    pub control_buffer: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            control_buffer: DEFAULT_CONTROL_CHAN_BUF,
        }
    }
}

impl Builder {
    /// Start building a [`DecentralisedEngine`] with the default control-channel buffer size.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer size of the control channel used to signal `stop()`.
    pub fn control_buffer(mut self, control_buffer: usize) -> Self {
        self.control_buffer = control_buffer;
        self
    }

    /// Construct the engine and its handle.
    pub fn build(
        self,
        initiator: Arc<dyn Initiator>,
        responder: Arc<dyn Responder>,
        state_manager: Arc<dyn StateManager>,
    ) -> Result<(DecentralisedEngine, EngineHandle), ConstructionError> {
        if self.control_buffer == 0 {
            return Err(ConstructionError::InvalidBufferSize);
        }
        let (tx, rx) = mpsc::channel(self.control_buffer);
        let engine = DecentralisedEngine {
            initiator,
            responder,
            state_manager,
            control: rx,
            transfers: HashMap::new(),
            send_futures: FuturesUnordered::new(),
            confirm_futures: FuturesUnordered::new(),
            results_commit: Vec::new(),
            results_abort: Vec::new(),
        };
        Ok((engine, EngineHandle { control: tx }))
    }
}

type SendFuture = Pin<Box<dyn Future<Output = (String, Result<SendResult, AdapterError>)> + Send>>;
type ConfirmFuture =
    Pin<Box<dyn Future<Output = (String, Result<ConfirmOutcome, AdapterError>)> + Send>>;

enum ConfirmOutcome {
    Commit(CommitResult),
    Abort(AbortResult),
}

/// Drives the same `READY -> SENT -> RESPONDED -> CONFIRMING -> FINALIZED`
/// pipeline as [`Engine`](crate::Engine), but every status transition is
/// mirrored out to a [`StateManager`] and the working set is refilled from
/// it rather than owned outright (see [`StateManager::receive_entry_events`]).
pub struct DecentralisedEngine {
    initiator: Arc<dyn Initiator>,
    responder: Arc<dyn Responder>,
    state_manager: Arc<dyn StateManager>,
    control: mpsc::Receiver<Control>,

    transfers: HashMap<String, Transfer>,
    send_futures: FuturesUnordered<SendFuture>,
    confirm_futures: FuturesUnordered<ConfirmFuture>,

    results_commit: Vec<TransferResult>,
    results_abort: Vec<TransferResult>,
}

impl std::fmt::Debug for DecentralisedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecentralisedEngine")
            .field("transfers", &self.transfers.len())
            .finish()
    }
}

impl DecentralisedEngine {
    /// Wrap a single-responder pipeline around a shared [`StateManager`], with
    /// a default-sized control channel. Use [`DecentralisedEngine::builder`]
    /// to customise it.
    pub fn new(
        initiator: Arc<dyn Initiator>,
        responder: Arc<dyn Responder>,
        state_manager: Arc<dyn StateManager>,
    ) -> (Self, EngineHandle) {
        Builder::default()
            .build(initiator, responder, state_manager)
            .expect("default control buffer is non-zero")
    }

    /// Start building a [`DecentralisedEngine`] with a non-default control-channel buffer size.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Result records for every transfer that committed, in finalisation order.
    pub fn results_commit(&self) -> &[TransferResult] {
        &self.results_commit
    }

    /// Result records for every transfer that aborted, in finalisation order.
    pub fn results_abort(&self) -> &[TransferResult] {
        &self.results_abort
    }

    /// Spawn the event loop onto its own task.
    ///
    /// The returned handle resolves to the engine itself once stopped, so
    /// its `results_commit()`/`results_abort()` logs remain reachable after
    /// the loop exits.
    pub fn spawn(self) -> JoinHandle<Result<Self, EngineError>> {
        tokio::spawn(self.run())
    }

    /// Drive the event loop until [`EngineHandle::stop`] is called, then
    /// return the engine itself so its result logs can be inspected.
    #[instrument(name = "DecentralisedEngine::run", skip(self))]
    pub async fn run(mut self) -> Result<Self, EngineError> {
        loop {
            let running = tokio::select! {
                events = self.initiator.listen_for_events() => self.receive(events).await?,
                result = self.send_futures.next(), if !self.send_futures.is_empty() => {
                    self.transfer_result(result).await?
                }
                result = self.confirm_futures.next(), if !self.confirm_futures.is_empty() => {
                    self.confirm_transfer(result).await?
                }
                control = self.control.recv() => self.on_control(control),
            };

            self.send_transfer().await;
            self.process_result().await;
            self.cleanup();

            if running == Running::Stop {
                break;
            }
        }

        self.transfers.clear();
        debug!("Stopped");
        Ok(self)
    }

    fn on_control(&mut self, control: Option<Control>) -> Running {
        match control {
            Some(Control::Stop) | None => Running::Stop,
        }
    }

    /// Trigger: admit every freshly observed event, create its entry at the
    /// state layer, claim the send leg, then refill from every entry the
    /// store reports as `READY` (which may include entries created by a
    /// peer engine instance).
    #[instrument(skip(self, events))]
    async fn receive(
        &mut self,
        events: Result<Vec<Payload>, AdapterError>,
    ) -> Result<Running, EngineError> {
        let payloads = events.map_err(|source| EngineError::Adapter {
            nonce: String::new(),
            source,
        })?;

        for payload in payloads {
            let id = payload.id.clone();
            let transfer = Transfer::admit(payload);

            if !self.state_manager.create_entry(&id, &transfer).await {
                trace!(id = %id, "duplicate id, dropped at create_entry");
                continue;
            }

            // Per dil.py: acceptance is signalled unconditionally for every
            // entry create_entry accepts; a `StateManager` that wants real
            // filtering applies it inside `signal_send_acceptance` itself.
            if !self.state_manager.signal_send_acceptance(&id).await {
                trace!(id = %id, "lost the send-acceptance race to a peer");
                continue;
            }
        }

        for transfer in self.state_manager.receive_entry_events(Status::Ready).await {
            self.transfers.insert(transfer.payload.nonce.clone(), transfer);
        }

        Ok(Running::Continue)
    }

    /// Action: every `READY` transfer transitions to `SENT`, launches
    /// `send_data`, and mirrors the transition out to the state manager.
    #[instrument(skip(self))]
    async fn send_transfer(&mut self) {
        let ready: Vec<String> = self
            .transfers
            .values()
            .filter(|t| t.status == Status::Ready)
            .map(|t| t.payload.nonce.clone())
            .collect();

        for nonce in ready {
            let transfer = self.transfers.get_mut(&nonce).expect("ready transfer exists");
            transfer.status = Status::Sent;
            let id = transfer.payload.id.clone();
            let data = transfer.payload.data.clone();
            let responder = self.responder.clone();
            trace!(nonce = %nonce, "send_data");
            self.send_futures.push(Box::pin(async move {
                let result = responder.send_data(&nonce, &data).await;
                (nonce, result)
            }));
            self.state_manager.update_entry(&id, Status::Sent, None).await;
        }
    }

    /// Trigger: store the result of the first completed `send_data` call,
    /// mirror the transition out to the state manager, then refill from
    /// every entry the store reports as `RESPONDED` (which may include
    /// entries a peer engine instance produced), the same pull-after-push
    /// this engine already does for `READY` in `receive`.
    ///
    /// An `Err` here means the responder broke its contract; the engine
    /// aborts the run rather than leaving the transfer parked at `SENT`
    /// forever.
    #[instrument(skip(self, completed))]
    async fn transfer_result(
        &mut self,
        completed: Option<(String, Result<SendResult, AdapterError>)>,
    ) -> Result<Running, EngineError> {
        if let Some((nonce, outcome)) = completed {
            match outcome {
                Ok(result) => {
                    if let Some(transfer) = self.transfers.get_mut(&nonce) {
                        let id = transfer.payload.id.clone();
                        trace!(nonce = %nonce, status = result.status, "responded");
                        transfer.result = Some(result);
                        transfer.status = Status::Responded;
                        self.state_manager
                            .update_entry(&id, Status::Responded, Some(transfer))
                            .await;
                    }
                }
                Err(source) => {
                    tracing::error!(nonce = %nonce, error = %source, "responder violated its contract");
                    return Err(EngineError::Adapter { nonce, source });
                }
            }
        }

        for transfer in self.state_manager.receive_entry_events(Status::Responded).await {
            self.transfers.insert(transfer.payload.nonce.clone(), transfer);
        }

        Ok(Running::Continue)
    }

    /// Action: every `RESPONDED` transfer transitions to `CONFIRMING`,
    /// launches the appropriate commit or abort, and mirrors the transition
    /// out to the state manager.
    #[instrument(skip(self))]
    async fn process_result(&mut self) {
        let responded: Vec<String> = self
            .transfers
            .values()
            .filter(|t| t.status == Status::Responded)
            .map(|t| t.payload.nonce.clone())
            .collect();

        for nonce in responded {
            let transfer = self.transfers.get_mut(&nonce).expect("responded transfer exists");
            let result = transfer.result.clone().expect("RESPONDED transfer always has a result");
            transfer.status = Status::Confirming;

            let id = transfer.payload.id.clone();
            let initiator = self.initiator.clone();

            if result.status {
                let commit_data = match self.responder.ledger_type() {
                    LedgerType::Ksi => Some(result.tx_hash.as_bytes().to_vec()),
                    _ => None,
                };
                trace!(nonce = %nonce, "commit_sending");
                self.confirm_futures.push(Box::pin(async move {
                    let outcome = initiator
                        .commit_sending(&id, commit_data)
                        .await
                        .map(ConfirmOutcome::Commit);
                    (nonce, outcome)
                }));
            } else {
                trace!(nonce = %nonce, "abort_sending");
                self.confirm_futures.push(Box::pin(async move {
                    let outcome = initiator
                        .abort_sending(&id, ErrorCode::TransactionFailure)
                        .await
                        .map(ConfirmOutcome::Abort);
                    (nonce, outcome)
                }));
            }

            self.state_manager.update_entry(&id, Status::Confirming, None).await;
        }
    }

    /// Trigger: finalize the first completed `commit_sending`/`abort_sending`
    /// call and mirror the transition out to the state manager.
    ///
    /// An `Err` here means the initiator broke its contract; the engine
    /// aborts the run rather than leaving the transfer parked at
    /// `CONFIRMING` forever.
    #[instrument(skip(self, completed))]
    async fn confirm_transfer(
        &mut self,
        completed: Option<(String, Result<ConfirmOutcome, AdapterError>)>,
    ) -> Result<Running, EngineError> {
        if let Some((nonce, outcome)) = completed {
            match outcome {
                Ok(ConfirmOutcome::Commit(commit)) => {
                    if let Some(transfer) = self.transfers.get_mut(&nonce) {
                        let send = transfer.result.clone().expect("committed transfer has a result");
                        transfer.status = Status::Finalized;
                        let id = transfer.payload.id.clone();
                        trace!(nonce = %nonce, "finalized (commit)");
                        self.state_manager
                            .update_entry(&id, Status::Finalized, Some(transfer))
                            .await;
                        self.results_commit.push(TransferResult {
                            nonce,
                            id,
                            send,
                            commit: Some(commit),
                            abort: None,
                        });
                    }
                }
                Ok(ConfirmOutcome::Abort(abort)) => {
                    if let Some(transfer) = self.transfers.get_mut(&nonce) {
                        let send = transfer.result.clone().expect("aborted transfer has a result");
                        transfer.status = Status::Finalized;
                        let id = transfer.payload.id.clone();
                        trace!(nonce = %nonce, "finalized (abort)");
                        self.state_manager
                            .update_entry(&id, Status::Finalized, Some(transfer))
                            .await;
                        self.results_abort.push(TransferResult {
                            nonce,
                            id,
                            send,
                            commit: None,
                            abort: Some(abort),
                        });
                    }
                }
                Err(source) => {
                    tracing::error!(nonce = %nonce, error = %source, "initiator violated its contract");
                    return Err(EngineError::Adapter { nonce, source });
                }
            }
        }
        Ok(Running::Continue)
    }

    /// Drop every `FINALIZED` transfer from the local working set (the
    /// state manager retains its own copy of the finalized entry).
    fn cleanup(&mut self) {
        self.transfers.retain(|_, t| t.status != Status::Finalized);
    }
}
