//! The multi-responder quorum engine: fans each transfer out to `N`
//! responders and commits only once a `threshold` of them agree.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::future::join_all;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace};

use crate::adapter::{AdapterError, Initiator, MultiResponder};
use crate::control::{Control, EngineHandle};
use crate::error::{ConstructionError, EngineError};
use crate::transfer::{AbortResult, CommitResult, ErrorCode, Payload, SendResult, Status, Transfer};
use crate::util::Running;

const DEFAULT_CONTROL_CHAN_BUF: usize = 16;

/// One reply per responder from an inquiry or execution phase fan-out.
type Votes = Vec<Result<SendResult, AdapterError>>;

type InquiryFuture = Pin<Box<dyn Future<Output = (String, Votes)> + Send>>;
type ExecutionFuture = Pin<Box<dyn Future<Output = (String, Votes)> + Send>>;
type ConfirmFuture = Pin<Box<dyn Future<Output = (String, Votes, Result<ConfirmOutcome, AdapterError>)> + Send>>;

enum ConfirmOutcome {
    Commit(CommitResult),
    Abort(AbortResult),
}

/// The result record published to `results_commit()`/`results_abort()` by
/// [`MultiEngine`].
///
/// Unlike the single-responder [`TransferResult`](crate::TransferResult),
/// the execution-phase reply is a vote from every responder rather than a
/// single reply, so it is carried through as a `Vec`.
#[derive(Debug, Clone)]
pub struct QuorumTransferResult {
    /// The nonce of the finalized transfer.
    pub nonce: String,
    /// The source-ledger id of the finalized transfer.
    pub id: String,
    /// Whether the inquiry phase reached quorum.
    pub inquiry_decision: bool,
    /// One reply per responder from the execution phase (`send_data` if the
    /// inquiry passed, `abort_send_data` otherwise). Adapter failures are
    /// flattened to their message, since the engine only needs to count them.
    pub execution: Vec<Result<SendResult, String>>,
    /// The initiator's commit reply, if this transfer committed.
    pub commit: Option<CommitResult>,
    /// The initiator's abort reply, if this transfer aborted.
    pub abort: Option<AbortResult>,
}

/// Drives every incoming transfer through the two-phase quorum protocol
/// (`READY -> INQUIRED -> ANSWERED -> SENT -> RESPONDED -> CONFIRMING ->
/// FINALIZED`) against one [`Initiator`] and `N` [`MultiResponder`]s.
pub struct MultiEngine {
    initiator: Arc<dyn Initiator>,
    responders: Vec<Arc<dyn MultiResponder>>,
    threshold: usize,
    control: mpsc::Receiver<Control>,

    transfers: HashMap<String, Transfer>,
    inquiry_futures: FuturesUnordered<InquiryFuture>,
    execution_futures: FuturesUnordered<ExecutionFuture>,
    confirm_futures: FuturesUnordered<ConfirmFuture>,

    /// Votes from the execution phase, parked between `transfer_result`
    /// storing them and `process_result` consuming them to decide the
    /// commit/abort call, and then again threaded through to
    /// `confirm_transfer` via the `ConfirmFuture`'s own output.
    awaiting_confirm: HashMap<String, Votes>,

    results_commit: Vec<QuorumTransferResult>,
    results_abort: Vec<QuorumTransferResult>,
}

/// Builder for [`MultiEngine`].
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
    /// Start building a [`MultiEngine`] with the default control-channel buffer size.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer size of the control channel used to signal `stop()`.
    pub fn control_buffer(mut self, control_buffer: usize) -> Self {
        self.control_buffer = control_buffer;
        self
    }

    /// Construct the engine and its handle. `threshold` must be in `1..=responders.len()`.
    pub fn build(
        self,
        initiator: Arc<dyn Initiator>,
        responders: Vec<Arc<dyn MultiResponder>>,
        threshold: usize,
    ) -> Result<(MultiEngine, EngineHandle), ConstructionError> {
        if responders.is_empty() {
            return Err(ConstructionError::NoResponders);
        }
        if threshold < 1 || threshold > responders.len() {
            return Err(ConstructionError::InvalidThreshold {
                threshold,
                responder_count: responders.len(),
            });
        }
        if self.control_buffer == 0 {
            return Err(ConstructionError::InvalidBufferSize);
        }

        let (tx, rx) = mpsc::channel(self.control_buffer);
        let engine = MultiEngine {
            initiator,
            responders,
            threshold,
            control: rx,
            transfers: HashMap::new(),
            inquiry_futures: FuturesUnordered::new(),
            execution_futures: FuturesUnordered::new(),
            confirm_futures: FuturesUnordered::new(),
            awaiting_confirm: HashMap::new(),
            results_commit: Vec::new(),
            results_abort: Vec::new(),
        };
        Ok((engine, EngineHandle { control: tx }))
    }
}

impl std::fmt::Debug for MultiEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiEngine")
            .field("responders", &self.responders.len())
            .field("threshold", &self.threshold)
            .field("transfers", &self.transfers.len())
            .finish()
    }
}

impl MultiEngine {
    /// Construct a quorum engine with a default-sized control channel.
    /// `threshold` must be in `1..=responders.len()`. Use
    /// [`MultiEngine::builder`] to customise the control buffer.
    pub fn new(
        initiator: Arc<dyn Initiator>,
        responders: Vec<Arc<dyn MultiResponder>>,
        threshold: usize,
    ) -> Result<(Self, EngineHandle), ConstructionError> {
        Builder::default().build(initiator, responders, threshold)
    }

    /// Start building a [`MultiEngine`] with a non-default control-channel buffer size.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Result records for every transfer that committed, in finalisation order.
    pub fn results_commit(&self) -> &[QuorumTransferResult] {
        &self.results_commit
    }

    /// Result records for every transfer that aborted, in finalisation order.
    pub fn results_abort(&self) -> &[QuorumTransferResult] {
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
    #[instrument(name = "MultiEngine::run", skip(self))]
    pub async fn run(mut self) -> Result<Self, EngineError> {
        loop {
            let running = tokio::select! {
                events = self.initiator.listen_for_events() => self.receive(events).await?,
                result = self.inquiry_futures.next(), if !self.inquiry_futures.is_empty() => {
                    self.transfer_inquiry(result)
                }
                result = self.execution_futures.next(), if !self.execution_futures.is_empty() => {
                    self.transfer_result(result)
                }
                result = self.confirm_futures.next(), if !self.confirm_futures.is_empty() => {
                    self.confirm_transfer(result)?
                }
                control = self.control.recv() => self.on_control(control),
            };

            self.send_inquiry();
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

    fn fan_out<F, Fut>(
        responders: &[Arc<dyn MultiResponder>],
        call: F,
    ) -> Pin<Box<dyn Future<Output = Votes> + Send>>
    where
        F: Fn(Arc<dyn MultiResponder>) -> Fut,
        Fut: Future<Output = Result<SendResult, AdapterError>> + Send + 'static,
    {
        let calls = responders.iter().cloned().map(call).collect::<Vec<_>>();
        Box::pin(join_all(calls))
    }

    /// Action: every `READY` transfer transitions to `INQUIRED` and fans out
    /// `send_data_inquire` to every responder, waiting for all `N`.
    #[instrument(skip(self))]
    fn send_inquiry(&mut self) {
        for transfer in self.transfers.values_mut() {
            if transfer.status != Status::Ready {
                continue;
            }
            transfer.status = Status::Inquired;
            let nonce = transfer.payload.nonce.clone();
            let data = transfer.payload.data.clone();
            trace!(nonce = %nonce, "send_data_inquire x{}", self.responders.len());
            let votes = Self::fan_out(&self.responders, move |r| {
                let nonce = nonce.clone();
                let data = data.clone();
                async move { r.send_data_inquire(&nonce, &data).await }
            });
            let nonce_for_key = transfer.payload.nonce.clone();
            self.inquiry_futures
                .push(Box::pin(async move { (nonce_for_key, votes.await) }));
        }
    }

    /// Trigger: store the inquiry decision for the first transfer whose `N`
    /// inquiry replies are all in.
    #[instrument(skip(self, completed))]
    fn transfer_inquiry(&mut self, completed: Option<(String, Votes)>) -> Running {
        if let Some((nonce, votes)) = completed {
            if let Some(transfer) = self.transfers.get_mut(&nonce) {
                let agreed = votes.iter().filter(|r| matches!(r, Ok(send) if send.status)).count();
                let decision = agreed >= self.threshold;
                trace!(nonce = %nonce, agreed, threshold = self.threshold, decision, "answered");
                transfer.inquiry_decision = Some(decision);
                transfer.status = Status::Answered;
            }
        }
        Running::Continue
    }

    /// Action: every `ANSWERED` transfer transitions to `SENT` and fans out
    /// `send_data` (if the inquiry passed) or `abort_send_data` (if it
    /// didn't) to every responder, waiting for all `N`.
    #[instrument(skip(self))]
    fn send_transfer(&mut self) {
        for transfer in self.transfers.values_mut() {
            if transfer.status != Status::Answered {
                continue;
            }
            transfer.status = Status::Sent;
            let nonce = transfer.payload.nonce.clone();
            let data = transfer.payload.data.clone();
            let inquiry_passed = transfer.inquiry_decision.unwrap_or(false);
            trace!(nonce = %nonce, inquiry_passed, "execution phase x{}", self.responders.len());
            let votes = Self::fan_out(&self.responders, move |r| {
                let nonce = nonce.clone();
                let data = data.clone();
                async move {
                    if inquiry_passed {
                        r.send_data(&nonce, &data).await
                    } else {
                        r.abort_send_data(&nonce, ErrorCode::InquiryReject).await
                    }
                }
            });
            let nonce_for_key = transfer.payload.nonce.clone();
            self.execution_futures
                .push(Box::pin(async move { (nonce_for_key, votes.await) }));
        }
    }

    /// Trigger: store the execution-phase replies for the first transfer
    /// whose `N` calls are all in.
    #[instrument(skip(self, completed))]
    fn transfer_result(&mut self, completed: Option<(String, Votes)>) -> Running {
        if let Some((nonce, votes)) = completed {
            if let Some(transfer) = self.transfers.get_mut(&nonce) {
                // `result` holds a representative reply purely for observability;
                // `process_result` re-derives the quorum count from `votes` itself.
                transfer.result = votes.iter().find_map(|r| r.as_ref().ok().cloned());
                transfer.status = Status::Responded;
                self.awaiting_confirm.insert(nonce, votes);
            }
        }
        Running::Continue
    }

    /// Action: every `RESPONDED` transfer transitions to `CONFIRMING` and
    /// launches the source-ledger commit or abort.
    #[instrument(skip(self))]
    fn process_result(&mut self) {
        let responded: Vec<String> = self
            .transfers
            .values()
            .filter(|t| t.status == Status::Responded)
            .map(|t| t.payload.nonce.clone())
            .collect();

        for nonce in responded {
            let votes = match self.awaiting_confirm.remove(&nonce) {
                Some(votes) => votes,
                None => continue,
            };
            let transfer = self.transfers.get_mut(&nonce).expect("responded transfer exists");
            transfer.status = Status::Confirming;

            let id = transfer.payload.id.clone();
            let inquiry_decision = transfer.inquiry_decision.unwrap_or(false);
            let initiator = self.initiator.clone();

            let reason = if !inquiry_decision {
                Some(ErrorCode::InquiryReject)
            } else {
                let agreed = votes.iter().filter(|r| matches!(r, Ok(send) if send.status)).count();
                if agreed >= self.threshold {
                    None
                } else {
                    Some(ErrorCode::TransactionFailure)
                }
            };

            match reason {
                None => {
                    trace!(nonce = %nonce, "commit_sending");
                    self.confirm_futures.push(Box::pin(async move {
                        let outcome = initiator.commit_sending(&id, None).await.map(ConfirmOutcome::Commit);
                        (nonce, votes, outcome)
                    }));
                }
                Some(reason) => {
                    trace!(nonce = %nonce, ?reason, "abort_sending");
                    self.confirm_futures.push(Box::pin(async move {
                        let outcome = initiator.abort_sending(&id, reason).await.map(ConfirmOutcome::Abort);
                        (nonce, votes, outcome)
                    }));
                }
            }
        }
    }

    /// Trigger: finalize the first completed `commit_sending`/`abort_sending` call.
    ///
    /// An `Err` here means the initiator broke its contract; the engine
    /// aborts the run rather than leaving the transfer parked at
    /// `CONFIRMING` forever. Per-responder failures during the inquiry or
    /// execution phase are not contract violations (they are votes, and
    /// are already counted as such in `transfer_inquiry`/`process_result`).
    #[instrument(skip(self, completed))]
    fn confirm_transfer(
        &mut self,
        completed: Option<(String, Votes, Result<ConfirmOutcome, AdapterError>)>,
    ) -> Result<Running, EngineError> {
        if let Some((nonce, votes, outcome)) = completed {
            let execution: Vec<Result<SendResult, String>> =
                votes.into_iter().map(|v| v.map_err(|e| e.to_string())).collect();
            match outcome {
                Ok(ConfirmOutcome::Commit(commit)) => {
                    if let Some(transfer) = self.transfers.get_mut(&nonce) {
                        transfer.status = Status::Finalized;
                        trace!(nonce = %nonce, "finalized (commit)");
                        self.results_commit.push(QuorumTransferResult {
                            nonce,
                            id: transfer.payload.id.clone(),
                            inquiry_decision: transfer.inquiry_decision.unwrap_or(false),
                            execution,
                            commit: Some(commit),
                            abort: None,
                        });
                    }
                }
                Ok(ConfirmOutcome::Abort(abort)) => {
                    if let Some(transfer) = self.transfers.get_mut(&nonce) {
                        transfer.status = Status::Finalized;
                        trace!(nonce = %nonce, "finalized (abort)");
                        self.results_abort.push(QuorumTransferResult {
                            nonce,
                            id: transfer.payload.id.clone(),
                            inquiry_decision: transfer.inquiry_decision.unwrap_or(false),
                            execution,
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

    fn cleanup(&mut self) {
        self.transfers.retain(|_, t| t.status != Status::Finalized);
    }
}
