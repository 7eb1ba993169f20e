//! Shared helpers for the mediator end-to-end suite.

use mediator::{AnyMessage, PipelineOutput, StageItem};
use std::time::Duration;

/// Install a subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// Receive the next item, failing the test on timeout.
pub async fn next_item(output: &mut PipelineOutput) -> StageItem {
    tokio::time::timeout(Duration::from_secs(2), output.recv())
        .await
        .expect("timed out waiting for pipeline output")
        .expect("pipeline output closed unexpectedly")
}

/// Receive the next message, failing the test on a stream failure.
pub async fn next_message(output: &mut PipelineOutput) -> AnyMessage {
    match next_item(output).await {
        Ok(message) => message,
        Err(failure) => panic!("unexpected stream failure: {failure}"),
    }
}

/// Assert that no further item arrives within `millis`.
pub async fn assert_quiet(output: &mut PipelineOutput, millis: u64) {
    let quiet = tokio::time::timeout(Duration::from_millis(millis), output.recv()).await;
    assert!(quiet.is_err(), "expected no further output");
}
