//! Tap Input end to end: client → tap → backend, exchanges → Output.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use traffic_replay::config::plugin::TapSettings;
use traffic_replay::config::schema::{CaptureConfig, ProcessConfig};
use traffic_replay::emitter::DeliverySettings;
use traffic_replay::input::TapInput;
use traffic_replay::lifecycle::{Pipeline, PipelineState};
use traffic_replay::protocol::http::response_status;
use traffic_replay::shaping::ExchangeFilter;

mod common;
use common::{start_mock_backend, CollectingOutput};

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within 5s");
}

#[tokio::test]
async fn proxied_exchanges_are_captured_and_forwarded() {
    let backend = start_mock_backend(200, "pong").await;
    let settings = TapSettings {
        name: None,
        listen: "127.0.0.1:0".to_string(),
        upstream: backend.to_string(),
        buffer_capacity: 64,
        connection_timeout_secs: 2,
        max_connections: 8,
    };
    let tap = Arc::new(TapInput::new("tap-0".to_string(), &settings, &CaptureConfig::default()));

    let mut pipeline = Pipeline::new(ProcessConfig::default(), ExchangeFilter::default());
    pipeline.add_input(tap.clone()).unwrap();
    let output = CollectingOutput::new("collect");
    pipeline.add_output(output.clone(), DeliverySettings::default()).await.unwrap();
    let mut handle = pipeline.handle();
    let running = tokio::spawn(pipeline.run(None));
    handle.wait_for(PipelineState::Running).await;
    let addr = tap.local_addr().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET /ping HTTP/1.1\r\nHost: svc\r\n\r\nGET /again HTTP/1.1\r\nHost: svc\r\n\r\n")
        .await
        .unwrap();
    let one = "HTTP/1.1 200 X\r\nContent-Length: 4\r\n\r\npong";
    let mut reply = Vec::new();
    while reply.len() < one.len() * 2 {
        let mut buf = [0u8; 512];
        let n = client.read(&mut buf).await.unwrap();
        assert!(n > 0, "tap closed the connection early");
        reply.extend_from_slice(&buf[..n]);
    }
    // Live traffic is untouched by capture.
    assert_eq!(reply, format!("{one}{one}").as_bytes());
    drop(client);

    wait_until(|| output.len() == 2).await;
    handle.stop();
    let summary = running.await.unwrap().unwrap();
    assert!(summary.is_clean());

    let seen = output.seen();
    assert_eq!(seen[0].id().stream, seen[1].id().stream);
    assert_eq!((seen[0].id().seq, seen[1].id().seq), (0, 1));
    assert!(seen[0].request().payload().starts_with(b"GET /ping"));
    assert!(seen[1].request().payload().starts_with(b"GET /again"));
    for exchange in &seen {
        assert_eq!(response_status(exchange.response().unwrap().payload()), Some(200));
        assert_eq!(exchange.request().meta().get("upstream"), Some(&backend.to_string()));
        assert!(exchange.request().meta().contains_key("source"));
    }
    assert_eq!(summary.inputs[0].1.captured, 2);
    assert_eq!(summary.inputs[0].1.framing_errors, 0);
}

#[tokio::test]
async fn garbage_stream_is_forwarded_but_not_emitted() {
    let backend = start_mock_backend(200, "").await;
    let settings = TapSettings {
        name: Some("edge".to_string()),
        listen: "127.0.0.1:0".to_string(),
        upstream: backend.to_string(),
        buffer_capacity: 64,
        connection_timeout_secs: 2,
        max_connections: 8,
    };
    let tap = Arc::new(TapInput::new("edge".to_string(), &settings, &CaptureConfig::default()));
    let mut pipeline = Pipeline::new(ProcessConfig::default(), ExchangeFilter::default());
    pipeline.add_input(tap.clone()).unwrap();
    let output = CollectingOutput::new("collect");
    pipeline.add_output(output.clone(), DeliverySettings::default()).await.unwrap();
    let handle = pipeline.handle();
    let running = tokio::spawn(pipeline.run(None));
    let addr = tap.local_addr().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"\x16\x03\x01 definitely not http\r\n\r\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(client);

    wait_until(|| handle.status().inputs[0].stats.framing_errors == 1).await;
    handle.stop();
    let summary = running.await.unwrap().unwrap();
    assert_eq!(output.len(), 0);
    assert_eq!(summary.inputs[0].1.captured, 0);
}
