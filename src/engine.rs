//! The single-responder engine: the pipelined state machine described in
//! the crate's top-level documentation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace};

use crate::adapter::{AdapterError, Initiator, LedgerType, Responder};
use crate::control::{Control, EngineHandle};
use crate::error::{ConstructionError, EngineError};
use crate::transfer::{
    AbortResult, CommitResult, ErrorCode, Payload, SendResult, Status, Transfer, TransferResult,
};
use crate::util::Running;

const DEFAULT_CONTROL_CHAN_BUF: usize = 16;

/// Builder for [`Engine`].
///
/// Plain struct, plain setter methods, validated at a single [`build`](Builder::build)
/// call. There is no type-state here because nothing about an `Engine`
/// changes shape based on which methods were called.
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
    /// Start building an [`Engine`] with the default control-channel buffer size.
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
    ) -> Result<(Engine, EngineHandle), ConstructionError> {
        if self.control_buffer == 0 {
            return Err(ConstructionError::InvalidBufferSize);
        }
        let (tx, rx) = mpsc::channel(self.control_buffer);
        let engine = Engine {
            initiator,
            responder,
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

/// Drives every incoming transfer through `READY -> SENT -> RESPONDED ->
/// CONFIRMING -> FINALIZED` against one [`Initiator`] and one [`Responder`].
///
/// Construct with [`Engine::new`], which also returns an [`EngineHandle`] to
/// stop the loop from elsewhere. Call [`Engine::run`] to drive it to
/// completion, or [`Engine::spawn`] to run it on its own task.
pub struct Engine {
    initiator: Arc<dyn Initiator>,
    responder: Arc<dyn Responder>,
    control: mpsc::Receiver<Control>,

    /// Master working set, keyed by nonce. Pruned of `FINALIZED` entries by
    /// `cleanup` once per loop iteration; every other bucket is an implicit
    /// view over this map (a transfer is "in transfers_sent" exactly when
    /// its nonce has an outstanding future in `send_futures`).
    transfers: HashMap<String, Transfer>,
    send_futures: FuturesUnordered<SendFuture>,
    confirm_futures: FuturesUnordered<ConfirmFuture>,

    results_commit: Vec<TransferResult>,
    results_abort: Vec<TransferResult>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("transfers", &self.transfers.len())
            .field("results_commit", &self.results_commit.len())
            .field("results_abort", &self.results_abort.len())
            .finish()
    }
}

impl Engine {
    /// Construct a single-responder engine and a handle to stop it, with a
    /// default-sized control channel. Use [`Engine::builder`] to customise it.
    pub fn new(initiator: Arc<dyn Initiator>, responder: Arc<dyn Responder>) -> (Self, EngineHandle) {
        Builder::default()
            .build(initiator, responder)
            .expect("default control buffer is non-zero")
    }

    /// Start building an [`Engine`] with a non-default control-channel buffer size.
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
    #[instrument(name = "Engine::run", skip(self))]
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

            self.send_transfer();
            self.process_result();
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

    /// Trigger: admit every transfer `listen_for_events` returned, assigning
    /// each a fresh nonce.
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
            let transfer = Transfer::admit(payload);
            trace!(nonce = %transfer.payload.nonce, "admitted");
            self.transfers.insert(transfer.payload.nonce.clone(), transfer);
        }
        Ok(Running::Continue)
    }

    /// Action: every `READY` transfer transitions to `SENT` and launches `send_data`.
    #[instrument(skip(self))]
    fn send_transfer(&mut self) {
        for transfer in self.transfers.values_mut() {
            if transfer.status != Status::Ready {
                continue;
            }
            transfer.status = Status::Sent;
            let nonce = transfer.payload.nonce.clone();
            let data = transfer.payload.data.clone();
            let responder = self.responder.clone();
            trace!(nonce = %nonce, "send_data");
            self.send_futures.push(Box::pin(async move {
                let result = responder.send_data(&nonce, &data).await;
                (nonce, result)
            }));
        }
    }

    /// Trigger: store the result of the first completed `send_data` call.
    ///
    /// An `Err` here means the responder broke its contract (see
    /// [`AdapterError`]'s doc comment); the engine aborts the run rather than
    /// leaving the transfer parked at `SENT` forever.
    #[instrument(skip(self, completed))]
    async fn transfer_result(
        &mut self,
        completed: Option<(String, Result<SendResult, AdapterError>)>,
    ) -> Result<Running, EngineError> {
        if let Some((nonce, outcome)) = completed {
            match outcome {
                Ok(result) => {
                    if let Some(transfer) = self.transfers.get_mut(&nonce) {
                        trace!(nonce = %nonce, status = result.status, "responded");
                        transfer.result = Some(result);
                        transfer.status = Status::Responded;
                    }
                }
                Err(source) => {
                    tracing::error!(nonce = %nonce, error = %source, "responder violated its contract");
                    return Err(EngineError::Adapter { nonce, source });
                }
            }
        }
        Ok(Running::Continue)
    }

    /// Action: every `RESPONDED` transfer transitions to `CONFIRMING` and
    /// launches the appropriate commit or abort.
    #[instrument(skip(self))]
    fn process_result(&mut self) {
        for transfer in self.transfers.values_mut() {
            if transfer.status != Status::Responded {
                continue;
            }
            let result = transfer
                .result
                .clone()
                .expect("RESPONDED transfer always has a result");
            transfer.status = Status::Confirming;

            let id = transfer.payload.id.clone();
            let nonce = transfer.payload.nonce.clone();
            let initiator = self.initiator.clone();

            if result.status {
                // Commit-data rule: KSI responders require the tx_hash bytes
                // to be carried through to the initiator's commit call.
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
        }
    }

    /// Trigger: finalize the first completed `commit_sending`/`abort_sending` call.
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
                        trace!(nonce = %nonce, "finalized (commit)");
                        self.results_commit.push(TransferResult {
                            nonce,
                            id: transfer.payload.id.clone(),
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
                        trace!(nonce = %nonce, "finalized (abort)");
                        self.results_abort.push(TransferResult {
                            nonce,
                            id: transfer.payload.id.clone(),
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

    /// Drop every `FINALIZED` transfer from the master working set.
    fn cleanup(&mut self) {
        self.transfers.retain(|_, t| t.status != Status::Finalized);
    }
}
