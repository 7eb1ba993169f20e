//! Acknowledgment propagation under each policy.

use mediator::registry::{consumer, transform, transform_message};
use mediator::{assemble, nack_cause, AckPolicy, Message, PipelineConfig};
use mediator_e2e_tests::{init_tracing, next_message};
use std::time::Duration;

#[tokio::test]
async fn post_ack_nack_reaches_the_inbound_message_with_the_same_cause() {
    init_tracing();
    let graph = assemble(
        vec![transform("identity", "in", "out", |x: i64| Ok(x))],
        &PipelineConfig::new(),
    )
    .unwrap();
    let mut pipeline = graph.activate();
    let input = pipeline.input("in").unwrap();
    let mut output = pipeline.take_output("out").unwrap();

    let inbound = Message::of(5i64);
    let listener = inbound.acknowledgment().listen();
    input.publish(inbound.erase()).await.unwrap();

    let outbound = next_message(&mut output).await;
    outbound
        .nack(nack_cause(anyhow::anyhow!("consumer refused")))
        .unwrap();

    let outcome = listener.outcome().await;
    assert!(!outcome.is_acked());
    assert_eq!(outcome.cause().unwrap().to_string(), "consumer refused");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn pre_ack_resolves_before_the_downstream_outcome() {
    init_tracing();
    let registration =
        transform("identity", "in", "out", |x: i64| Ok(x)).with_ack_policy(AckPolicy::Pre);
    let graph = assemble(vec![registration], &PipelineConfig::new()).unwrap();
    let mut pipeline = graph.activate();
    let input = pipeline.input("in").unwrap();
    let mut output = pipeline.take_output("out").unwrap();

    let inbound = Message::of(5i64);
    let inbound_ack = inbound.acknowledgment().clone();
    input.publish(inbound.erase()).await.unwrap();

    let outbound = next_message(&mut output).await;
    assert!(inbound_ack.outcome().unwrap().is_acked());

    // The downstream outcome no longer touches the inbound message.
    outbound
        .nack(nack_cause(anyhow::anyhow!("late failure")))
        .unwrap();
    assert!(inbound_ack.outcome().unwrap().is_acked());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn manual_policy_leaves_acknowledgment_to_the_method() {
    init_tracing();
    let registration = transform_message("double", "in", "out", |message: Message<i64>| {
        let doubled = *message.payload() * 2;
        message.ack().map_err(anyhow::Error::from)?;
        Ok(Message::of(doubled))
    })
    .with_ack_policy(AckPolicy::Manual);
    let graph = assemble(vec![registration], &PipelineConfig::new()).unwrap();
    let mut pipeline = graph.activate();
    let input = pipeline.input("in").unwrap();
    let mut output = pipeline.take_output("out").unwrap();

    let inbound = Message::of(21i64);
    let inbound_ack = inbound.acknowledgment().clone();
    input.publish(inbound.erase()).await.unwrap();

    let outbound = next_message(&mut output).await;
    assert_eq!(outbound.payload_ref::<i64>(), Some(&42));
    assert!(inbound_ack.outcome().unwrap().is_acked());

    // No chain was installed: resolving the outbound message changes
    // nothing about the inbound one.
    outbound
        .nack(nack_cause(anyhow::anyhow!("unrelated")))
        .unwrap();
    assert!(inbound_ack.outcome().unwrap().is_acked());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn manual_policy_on_a_payload_shape_fails_wiring() {
    init_tracing();
    let registration =
        transform("identity", "in", "out", |x: i64| Ok(x)).with_ack_policy(AckPolicy::Manual);
    let err = assemble(vec![registration], &PipelineConfig::new()).unwrap_err();
    assert!(err.is_wiring_error());
    assert!(err.to_string().contains("identity"));
}

#[tokio::test]
async fn consumer_acks_after_successful_completion_and_nacks_failures() {
    init_tracing();
    let graph = assemble(
        vec![consumer("checked", "in", |x: i64| {
            if x < 0 {
                Err(anyhow::anyhow!("negative input"))
            } else {
                Ok(())
            }
        })],
        &PipelineConfig::new(),
    )
    .unwrap();
    let pipeline = graph.activate();
    let input = pipeline.input("in").unwrap();

    let good = Message::of(1i64);
    let good_listener = good.acknowledgment().listen();
    input.publish(good.erase()).await.unwrap();
    assert!(good_listener.outcome().await.is_acked());

    let bad = Message::of(-1i64);
    let bad_listener = bad.acknowledgment().listen();
    input.publish(bad.erase()).await.unwrap();
    let outcome = bad_listener.outcome().await;
    assert_eq!(outcome.cause().unwrap().to_string(), "negative input");

    // A failed element does not stop a consumer.
    let again = Message::of(2i64);
    let again_listener = again.acknowledgment().listen();
    input.publish(again.erase()).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(2), again_listener.outcome())
        .await
        .expect("consumer stopped after a failed element");
    assert!(outcome.is_acked());

    pipeline.shutdown().await;
}
