//! End-to-end flow through assembled pipelines: round trips, internal
//! links, failure propagation, teardown, and credit-based backpressure.

use assert_matches::assert_matches;
use mediator::registry::{consumer_async, producer, transform};
use mediator::{assemble, Message, PipelineConfig, StageConfig};
use mediator_e2e_tests::{assert_quiet, init_tracing, next_item, next_message};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn identity_processor_round_trips_one_message() {
    init_tracing();
    let graph = assemble(
        vec![transform("identity", "in", "out", |x: i64| Ok(x))],
        &PipelineConfig::new(),
    )
    .unwrap();
    let mut pipeline = graph.activate();
    let input = pipeline.input("in").unwrap();
    let mut output = pipeline.take_output("out").unwrap();

    let inbound = Message::of(41i64);
    let inbound_ack = inbound.acknowledgment().clone();
    input.publish(inbound.erase()).await.unwrap();

    let outbound = next_message(&mut output).await;
    assert_eq!(outbound.payload_ref::<i64>(), Some(&41));
    assert_quiet(&mut output, 100).await;

    // Post-acknowledge default: the inbound message resolves only once
    // the outbound one does.
    assert!(!inbound_ack.is_resolved());
    outbound.ack().unwrap();
    assert!(inbound_ack.outcome().unwrap().is_acked());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn internal_links_join_stages_by_channel_name() {
    init_tracing();
    let counter = Arc::new(AtomicUsize::new(0));
    let produced = Arc::clone(&counter);

    let graph = assemble(
        vec![
            producer("ticks", "raw", move || {
                Ok(produced.fetch_add(1, Ordering::SeqCst) as i64)
            }),
            transform("add_one", "raw", "out", |x: i64| Ok(x + 1)),
        ],
        &PipelineConfig::new(),
    )
    .unwrap();
    assert!(graph.is_direct_link("raw"));
    let mut pipeline = graph.activate();
    let mut output = pipeline.take_output("out").unwrap();

    for expected in 1..=3i64 {
        let message = next_message(&mut output).await;
        assert_eq!(message.payload_ref::<i64>(), Some(&expected));
        message.ack().unwrap();
    }
    pipeline.shutdown().await;
}

#[tokio::test]
async fn invocation_failure_propagates_and_stops_the_segment() {
    init_tracing();
    let graph = assemble(
        vec![
            transform("explode", "in", "mid", |x: i64| {
                if x == 2 {
                    Err(anyhow::anyhow!("boom"))
                } else {
                    Ok(x)
                }
            }),
            transform("pass", "mid", "out", |x: i64| Ok(x)),
        ],
        &PipelineConfig::new(),
    )
    .unwrap();
    let mut pipeline = graph.activate();
    let input = pipeline.input("in").unwrap();
    let mut output = pipeline.take_output("out").unwrap();

    input.publish(Message::of(1i64).erase()).await.unwrap();
    let first = next_message(&mut output).await;
    assert_eq!(first.payload_ref::<i64>(), Some(&1));
    first.ack().unwrap();

    let poisoned = Message::of(2i64);
    let poisoned_ack = poisoned.acknowledgment().clone();
    input.publish(poisoned.erase()).await.unwrap();

    // The failure crosses the intermediate stage and reaches the output.
    let item = next_item(&mut output).await;
    assert_matches!(item, Err(ref failure) if failure.stage == "explode");
    let outcome = poisoned_ack.outcome().unwrap();
    assert_eq!(outcome.cause().unwrap().to_string(), "boom");

    // Both stages stopped consuming; the channel rejects new messages.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(input.publish(Message::of(3i64).erase()).await.is_err());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn teardown_nacks_the_held_message_exactly_once() {
    init_tracing();
    let graph = assemble(
        vec![consumer_async("stuck", "in", |_x: i64| async {
            futures::future::pending::<()>().await;
            Ok(())
        })],
        &PipelineConfig::new(),
    )
    .unwrap();
    let pipeline = graph.activate();
    let input = pipeline.input("in").unwrap();

    let held = Message::of(7i64);
    let listener = held.acknowledgment().listen();
    input.publish(held.erase()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    pipeline.shutdown().await;

    let outcome = listener.outcome().await;
    assert!(!outcome.is_acked());
    assert!(outcome.cause().unwrap().to_string().contains("torn down"));
}

#[tokio::test]
async fn credit_bounds_outstanding_elements() {
    init_tracing();
    let invoked = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&invoked);
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let permits = Arc::clone(&gate);

    let config = PipelineConfig::new().with_stage(
        "slow",
        StageConfig {
            credit: 2,
            ..Default::default()
        },
    );
    let graph = assemble(
        vec![consumer_async("slow", "in", move |_x: i64| {
            seen.fetch_add(1, Ordering::SeqCst);
            let permits = Arc::clone(&permits);
            async move {
                let _permit = permits.acquire().await?;
                Ok(())
            }
        })],
        &config,
    )
    .unwrap();
    let pipeline = graph.activate();
    let input = pipeline.input("in").unwrap();

    // One in flight plus two buffered fills the granted credit.
    for i in 0..3i64 {
        input.publish(Message::of(i).erase()).await.unwrap();
    }
    let over_credit =
        tokio::time::timeout(Duration::from_millis(100), input.publish(Message::of(99i64).erase()))
            .await;
    assert!(over_credit.is_err(), "publish beyond credit must wait");

    // Sequential invocation: only one element presented to the method.
    assert_eq!(invoked.load(Ordering::SeqCst), 1);

    gate.add_permits(16);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while invoked.load(Ordering::SeqCst) < 3 {
        assert!(tokio::time::Instant::now() < deadline, "consumer stalled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    pipeline.shutdown().await;
}
