//! Pipeline integration tests
//!
//! Drives the full reader -> workers -> bus -> writer loop over in-memory
//! channels and checks the externally visible behaviour:
//! - request lines come back in arrival order, whatever the worker count
//! - bad lines and uncorrelated messages are dropped, not fatal
//! - shutdown drains what was read; handler faults abort the run

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use bytes::Bytes;
use kaiku_gateway::{
    Continuation, GatewayError, HandlerError, LatencyRecorder, Message, MetricsAggregator,
    Outcome, Pipeline, PipelineMetrics, RequestHandler, RunOutcome, Stage, codec,
};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};

// ============================================================================
// Helpers
// ============================================================================

fn line(stage: Stage, id: &str, extra: &[&str], payload: &str) -> Vec<u8> {
    let msg = Message::new(
        stage,
        id.to_string(),
        extra.iter().map(|f| Bytes::from(f.to_string())),
        Bytes::from(payload.to_string()),
    )
    .unwrap();
    codec::encode(&msg).to_vec()
}

fn request(id: &str, path: &str) -> Vec<u8> {
    line(Stage::Request, id, &["1"], &format!("GET {path} HTTP/1.1\r\nHost: a\r\n\r\n"))
}

fn transaction(id: &str, path: &str, status: u16, latency_us: u64) -> Vec<Vec<u8>> {
    let latency = latency_us.to_string();
    vec![
        request(id, path),
        line(Stage::Response, id, &["2", "100"], &format!("HTTP/1.1 {status} X\r\n\r\n")),
        line(
            Stage::Replay,
            id,
            &["3", latency.as_str()],
            &format!("HTTP/1.1 {status} X\r\n\r\n"),
        ),
    ]
}

fn decode_all(output: &[u8]) -> Vec<Message> {
    output
        .split(|b| *b == b'\n')
        .filter(|l| !l.is_empty())
        .map(|l| codec::decode(l).unwrap())
        .collect()
}

/// Sleeps a per-id amount so workers finish out of order, then tags the request
struct Jitter;

#[async_trait]
impl RequestHandler for Jitter {
    fn name(&self) -> &'static str {
        "jitter"
    }

    async fn on_request(&self, msg: &Message) -> Result<Outcome, HandlerError> {
        let n: u64 = msg.id().as_str().unwrap().parse().unwrap();
        tokio::time::sleep(Duration::from_millis((7 * n) % 13)).await;
        let tagged = format!("{}X-Seen: {n}\r\n", msg.payload_str().unwrap());
        Ok(Outcome::rewrite(msg.with_payload(tagged)))
    }
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn output_keeps_arrival_order_across_workers() {
    let mut input = Vec::new();
    for i in 0..50 {
        input.extend(request(&i.to_string(), "/a"));
    }

    let mut output = Vec::new();
    let outcome = Pipeline::new()
        .concurrency(4)
        .queue_capacity(8)
        .handler(Jitter)
        .build()
        .run(Cursor::new(input), &mut output, std::future::pending())
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    let written = decode_all(&output);
    assert_eq!(written.len(), 50);
    for (i, msg) in written.iter().enumerate() {
        assert_eq!(msg.id(), &i.to_string().as_str());
        assert!(msg.payload_str().unwrap().ends_with(&format!("X-Seen: {i}\r\n")));
    }
}

#[tokio::test]
async fn tiny_queue_still_processes_everything() {
    let mut input = Vec::new();
    for i in 0..20 {
        input.extend(request(&i.to_string(), "/"));
    }

    let mut output = Vec::new();
    Pipeline::new()
        .concurrency(1)
        .queue_capacity(1)
        .build()
        .run(Cursor::new(input.clone()), &mut output, std::future::pending())
        .await
        .unwrap();

    assert_eq!(output, input);
}

#[tokio::test]
async fn only_requests_are_written() {
    let input: Vec<u8> = transaction("1", "/a", 200, 10).concat();

    let mut output = Vec::new();
    Pipeline::new()
        .build()
        .run(Cursor::new(input), &mut output, std::future::pending())
        .await
        .unwrap();

    let written = decode_all(&output);
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].stage(), Stage::Request);
}

// ============================================================================
// Drops
// ============================================================================

#[tokio::test]
async fn undecodable_lines_are_dropped_and_counted() {
    let registry = prometheus::Registry::new();
    let metrics = Arc::new(PipelineMetrics::new(&registry).unwrap());

    let mut input = request("1", "/a");
    input.extend_from_slice(b"zz-not-hex\n");
    input.extend(request("2", "/b"));

    let mut output = Vec::new();
    let outcome = Pipeline::new()
        .metrics(Arc::clone(&metrics))
        .build()
        .run(Cursor::new(input), &mut output, std::future::pending())
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    let ids: Vec<_> = decode_all(&output).iter().map(|m| m.id().to_string()).collect();
    assert_eq!(ids, vec!["1", "2"]);
    assert_eq!(metrics.dropped_count("decode_error"), 1);
    assert_eq!(metrics.lines_read.get(), 3);
    assert_eq!(metrics.lines_written.get(), 2);
}

#[tokio::test]
async fn uncorrelated_replay_is_a_miss() {
    let registry = prometheus::Registry::new();
    let metrics = Arc::new(PipelineMetrics::new(&registry).unwrap());
    let latency = Arc::new(MetricsAggregator::new());

    let mut input = line(Stage::Replay, "ghost", &["3", "10"], "HTTP/1.1 200 OK\r\n\r\n");
    input.extend(request("1", "/a"));

    let mut output = Vec::new();
    let runner = Pipeline::new()
        .handler(LatencyRecorder::new(latency))
        .metrics(Arc::clone(&metrics))
        .build();
    let bus = Arc::clone(runner.bus());
    runner
        .run(Cursor::new(input), &mut output, std::future::pending())
        .await
        .unwrap();

    assert_eq!(bus.misses(), 1);
    assert_eq!(metrics.dropped_count("correlation_miss"), 1);
    assert_eq!(decode_all(&output).len(), 1);
}

// ============================================================================
// Staged handlers under concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_replay_is_recorded_with_many_workers() {
    let latency = Arc::new(MetricsAggregator::new());

    let mut input = Vec::new();
    for i in 0..100 {
        let path = if i % 2 == 0 { "/even/x" } else { "/odd/y" };
        input.extend(transaction(&i.to_string(), path, 200, 1_000).concat());
    }

    let mut output = Vec::new();
    let runner = Pipeline::new()
        .concurrency(4)
        .handler(LatencyRecorder::new(Arc::clone(&latency)))
        .build();
    let bus = Arc::clone(runner.bus());
    runner
        .run(Cursor::new(input), &mut output, std::future::pending())
        .await
        .unwrap();

    // The recorder skips the response stage, so only responses miss
    assert_eq!(bus.misses(), 100);
    assert_eq!(bus.pending_count(), 0);
    for path in ["/even", "/odd"] {
        assert_eq!(
            latency.sample_count(&[
                ("http_method", "GET"),
                ("http_path", path),
                ("http_status", "200"),
            ]),
            Some(50)
        );
    }
}

// ============================================================================
// Shutdown and faults
// ============================================================================

#[tokio::test]
async fn shutdown_drains_lines_already_read() {
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    for i in 0..5 {
        client.write_all(&request(&i.to_string(), "/")).await.unwrap();
    }
    // `client` stays open: the input never ends on its own

    let mut output = Vec::new();
    let outcome = Pipeline::new()
        .build()
        .run(
            BufReader::new(server),
            &mut output,
            tokio::time::sleep(Duration::from_millis(200)),
        )
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Interrupted);
    assert_eq!(decode_all(&output).len(), 5);
    drop(client);
}

struct FailOn(&'static str);

#[async_trait]
impl RequestHandler for FailOn {
    fn name(&self) -> &'static str {
        "fail-on"
    }

    async fn on_request(&self, msg: &Message) -> Result<Outcome, HandlerError> {
        if msg.id() == &self.0 {
            return Err(HandlerError::failed(self.name(), "refused"));
        }
        Ok(Outcome::pass())
    }
}

#[tokio::test]
async fn handler_error_aborts_the_run() {
    let mut input = request("1", "/");
    input.extend(request("bad", "/"));
    input.extend(request("3", "/"));

    let mut output = Vec::new();
    let err = Pipeline::new()
        .handler(FailOn("bad"))
        .build()
        .run(Cursor::new(input), &mut output, std::future::pending())
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Handler(HandlerError::Failed { .. })));
    assert_eq!(err.to_string(), "handler 'fail-on' failed: refused");
}

struct PanicOnReplay;

struct Explode;

#[async_trait]
impl RequestHandler for PanicOnReplay {
    fn name(&self) -> &'static str {
        "panic-on-replay"
    }

    async fn on_request(&self, _msg: &Message) -> Result<Outcome, HandlerError> {
        Ok(Outcome::pass().then(Stage::Replay, Explode))
    }
}

#[async_trait]
impl Continuation for Explode {
    async fn resume(self: Box<Self>, _msg: &Message) -> Result<Outcome, HandlerError> {
        panic!("replay handler exploded");
    }
}

#[tokio::test]
async fn handler_panic_aborts_the_run() {
    let input = transaction("1", "/", 200, 5).concat();

    let mut output = Vec::new();
    let err = Pipeline::new()
        .handler(PanicOnReplay)
        .build()
        .run(Cursor::new(input), &mut output, std::future::pending())
        .await
        .unwrap_err();

    match err {
        GatewayError::Handler(HandlerError::Panicked(msg)) => {
            assert_eq!(msg, "replay handler exploded");
        }
        other => panic!("unexpected error: {other}"),
    }
}
