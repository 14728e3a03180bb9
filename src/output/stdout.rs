//! Line-per-exchange printer, mostly for debugging a pipeline.

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::Output;
use crate::config::plugin::StdoutFormat;
use crate::error::OutputError;
use crate::protocol::http::{parse_request, response_status, start_line};
use crate::protocol::CorrelatedExchange;

type Sink = Box<dyn AsyncWrite + Send + Unpin>;

pub struct StdoutOutput {
    name: String,
    format: StdoutFormat,
    writer: Mutex<Sink>,
}

impl StdoutOutput {
    pub fn new(name: String, format: StdoutFormat) -> Self {
        Self::with_writer(name, format, Box::new(tokio::io::stdout()))
    }

    pub fn with_writer(name: String, format: StdoutFormat, writer: Sink) -> Self {
        Self {
            name,
            format,
            writer: Mutex::new(writer),
        }
    }
}

/// `<id> <method> <target> -> <status> (<latency>)`, or `-> -` without a response.
fn summary(exchange: &CorrelatedExchange) -> String {
    let request = exchange.request().payload();
    let line = match parse_request(request) {
        Ok(view) => format!("{} {}", view.method, view.target),
        Err(_) => start_line(request),
    };
    match exchange.response() {
        Some(response) => {
            let status = response_status(response.payload())
                .map_or_else(|| "?".to_string(), |s| s.to_string());
            let latency = exchange.latency().unwrap_or_default();
            format!("{} {line} -> {status} ({latency:?})\n", exchange.id())
        }
        None => format!("{} {line} -> -\n", exchange.id()),
    }
}

fn to_json(exchange: &CorrelatedExchange) -> Result<String, OutputError> {
    let request = exchange.request();
    let response = exchange.response().map(|r| {
        json!({
            "status": response_status(r.payload()),
            "timestamp_ns": r.timestamp_ns(),
            "payload": String::from_utf8_lossy(r.payload()),
        })
    });
    let value = json!({
        "id": exchange.id().to_string(),
        "timestamp_ns": request.timestamp_ns(),
        "meta": request.meta(),
        "request": String::from_utf8_lossy(request.payload()),
        "response": response,
    });
    let mut line = serde_json::to_string(&value)
        .map_err(|e| OutputError::Rejected(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

#[async_trait]
impl Output for StdoutOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "stdout"
    }

    async fn send(&self, exchange: &CorrelatedExchange) -> Result<(), OutputError> {
        let line = match self.format {
            StdoutFormat::Summary => summary(exchange),
            StdoutFormat::Json => to_json(exchange)?,
        };
        self.writer.lock().await.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), OutputError> {
        self.writer.lock().await.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Direction, Message, MessageId, StreamId};
    use bytes::Bytes;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::task::{Context, Poll};

    #[derive(Clone, Default)]
    struct Shared(Arc<StdMutex<Vec<u8>>>);

    impl AsyncWrite for Shared {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn exchange() -> CorrelatedExchange {
        let id = MessageId::new(StreamId::from_raw(3), 0);
        let request = Message::new(
            id,
            Direction::Request,
            Bytes::from_static(b"GET /a?x=1 HTTP/1.1\r\nHost: h\r\n\r\n"),
            1_000,
        )
        .with_meta("source", "10.0.0.1:1234");
        let response = Message::new(
            id,
            Direction::Response,
            Bytes::from_static(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n"),
            2_001_000,
        );
        CorrelatedExchange::matched(request, response)
    }

    #[tokio::test]
    async fn summary_line() {
        let buf = Shared::default();
        let out = StdoutOutput::with_writer("stdout-0".into(), StdoutFormat::Summary, Box::new(buf.clone()));
        out.send(&exchange()).await.unwrap();
        out.flush().await.unwrap();
        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text, "stream-3/0 GET /a?x=1 -> 404 (2ms)\n");
    }

    #[tokio::test]
    async fn json_line() {
        let buf = Shared::default();
        let out = StdoutOutput::with_writer("stdout-0".into(), StdoutFormat::Json, Box::new(buf.clone()));
        out.send(&exchange()).await.unwrap();
        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let value: serde_json::Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(value["id"], "stream-3/0");
        assert_eq!(value["response"]["status"], 404);
        assert_eq!(value["meta"]["source"], "10.0.0.1:1234");
    }
}
