//! Signature-shape scenarios: async completion processors, stream
//! builders, and producer streams driven end to end.

use futures::stream::BoxStream;
use futures::StreamExt;
use mediator::registry::{
    producer_stream, stream_builder, stream_builder_values, transform_message_async,
};
use mediator::{assemble, AckPolicy, Message, PipelineConfig, Shape};
use mediator_e2e_tests::{assert_quiet, init_tracing, next_message};
use std::time::Duration;

#[tokio::test]
async fn async_message_processor_resolves_to_one_output() {
    init_tracing();
    let registration =
        transform_message_async("process", "count", "sink", |message: Message<i64>| {
            let next = *message.payload() + 1;
            async move { Ok(message.with_payload(next.to_string())) }
        });
    let graph = assemble(vec![registration], &PipelineConfig::new()).unwrap();
    assert!(matches!(
        graph.shape_of("process"),
        Some(Shape::ProcessorAsync { .. })
    ));
    let mut pipeline = graph.activate();
    let input = pipeline.input("count").unwrap();
    let mut output = pipeline.take_output("sink").unwrap();

    input.publish(Message::of(41i64).erase()).await.unwrap();

    let outbound = next_message(&mut output).await;
    assert_eq!(outbound.payload_ref::<String>(), Some(&"42".to_string()));
    outbound.ack().unwrap();
    assert_quiet(&mut output, 100).await;

    pipeline.shutdown().await;
}

#[tokio::test]
async fn stream_builder_duplicates_each_incremented_element() {
    init_tracing();
    let registration = stream_builder(
        "duplicate",
        "count",
        "sink",
        |source: BoxStream<'static, Message<i64>>| {
            source
                .flat_map(|message| {
                    let next = *message.payload() + 1;
                    let _ = message.ack();
                    futures::stream::iter(vec![next, next])
                })
                .map(|value| Message::of(value.to_string()))
                .boxed()
        },
    );
    let graph = assemble(vec![registration], &PipelineConfig::new()).unwrap();
    assert!(matches!(
        graph.shape_of("duplicate"),
        Some(Shape::ProcessorStreamBuilder { .. })
    ));
    let mut pipeline = graph.activate();
    let input = pipeline.input("count").unwrap();
    let mut output = pipeline.take_output("sink").unwrap();

    for value in [1i64, 2, 3] {
        input.publish(Message::of(value).erase()).await.unwrap();
    }

    let expected = ["2", "2", "3", "3", "4", "4"];
    for text in expected {
        let message = next_message(&mut output).await;
        assert_eq!(message.payload_ref::<String>(), Some(&text.to_string()));
        message.ack().unwrap();
    }
    assert_quiet(&mut output, 100).await;

    pipeline.shutdown().await;
}

#[tokio::test]
async fn payload_stream_builder_auto_acks_at_the_boundary() {
    init_tracing();
    let registration = stream_builder_values(
        "triple",
        "count",
        "sink",
        |source: BoxStream<'static, i64>| source.map(|value| value * 3).boxed(),
    );
    let graph = assemble(vec![registration], &PipelineConfig::new()).unwrap();
    let mut pipeline = graph.activate();
    let input = pipeline.input("count").unwrap();
    let mut output = pipeline.take_output("sink").unwrap();

    let inbound = Message::of(5i64);
    let inbound_ack = inbound.acknowledgment().clone();
    input.publish(inbound.erase()).await.unwrap();

    let outbound = next_message(&mut output).await;
    assert_eq!(outbound.payload_ref::<i64>(), Some(&15));
    // The envelope was unwrapped (and acknowledged) on entry to the user
    // stream; the outbound message carries a fresh acknowledgment.
    assert!(inbound_ack.outcome().unwrap().is_acked());
    assert!(!outbound.acknowledgment().is_resolved());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn producer_stream_round_completes_only_after_every_ack() {
    init_tracing();
    let registration = producer_stream("burst", "sink", || {
        futures::stream::iter((0..3i64).map(Message::of)).boxed()
    })
    .with_ack_policy(AckPolicy::Post);
    let graph = assemble(vec![registration], &PipelineConfig::new()).unwrap();
    let mut pipeline = graph.activate();
    let mut output = pipeline.take_output("sink").unwrap();

    let mut messages = Vec::new();
    for _ in 0..3 {
        messages.push(next_message(&mut output).await);
    }

    // Acknowledging N-1 of N must not complete the round: the stage still
    // holds its outbound endpoint open.
    messages[0].ack().unwrap();
    messages[1].ack().unwrap();
    let early = tokio::time::timeout(Duration::from_millis(100), output.recv()).await;
    assert!(early.is_err(), "round completed before the final ack");

    messages[2].ack().unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(2), output.recv())
        .await
        .expect("round did not complete after the final ack");
    assert!(closed.is_none());

    pipeline.shutdown().await;
}
