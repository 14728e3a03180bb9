//! Replay from a recording.
//!
//! Exchanges are re-emitted in recorded order. The gap between two records is
//! the gap between their request timestamps divided by `speed`; a record whose
//! time has already passed goes out immediately. An appended segment restarts
//! the clock: its first record follows the previous one without delay.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::BufReader;
use tokio::time::Instant;
use tracing::{info, warn};

use super::Input;
use crate::config::plugin::FileInputSettings;
use crate::emitter::ExchangeSink;
use crate::error::ReplayError;
use crate::lifecycle::shutdown::ShutdownSignal;
use crate::protocol::CorrelatedExchange;
use crate::record::{Entry, RecordReader};

pub struct FileInput {
    name: String,
    path: PathBuf,
    speed: f64,
    looping: bool,
}

enum Pass {
    /// Reached the end of the recording.
    Finished { records: u64 },
    Stopped,
}

impl FileInput {
    pub fn new(name: String, settings: &FileInputSettings) -> Self {
        Self {
            name,
            path: settings.path.clone(),
            speed: if settings.speed > 0.0 { settings.speed } else { 1.0 },
            looping: settings.looping,
        }
    }

    async fn open(&self) -> Result<RecordReader<BufReader<File>>, ReplayError> {
        let file = File::open(&self.path)
            .await
            .map_err(|source| ReplayError::ResourceExhaustion {
                input: self.name.clone(),
                source,
            })?;
        RecordReader::open(BufReader::new(file)).await
    }

    async fn replay(
        &self,
        pass: u64,
        sink: &ExchangeSink,
        shutdown: &mut ShutdownSignal,
    ) -> Result<Pass, ReplayError> {
        let mut reader = self.open().await?;
        let session = reader.session().to_string();
        let mut started = Instant::now();
        let mut base_ns = None;

        loop {
            let next = tokio::select! {
                _ = shutdown.recv() => return Ok(Pass::Stopped),
                next = reader.next_entry() => next,
            };
            let exchange = match next {
                Ok(Some(Entry::Exchange(exchange))) => exchange,
                Ok(Some(Entry::Segment)) => {
                    started = Instant::now();
                    base_ns = None;
                    continue;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        input = %self.name,
                        path = %self.path.display(),
                        record = reader.records_read(),
                        error = %e,
                        "recording unreadable past this point"
                    );
                    break;
                }
            };

            let offset = exchange.request().timestamp_ns();
            let base = *base_ns.get_or_insert(offset);
            let due = started + self.scaled(offset.saturating_sub(base));
            tokio::select! {
                _ = shutdown.recv() => return Ok(Pass::Stopped),
                _ = tokio::time::sleep_until(due) => {}
            }

            sink.emit(annotate(exchange, &self.name, &session, pass)).await;
        }

        Ok(Pass::Finished {
            records: reader.records_read(),
        })
    }

    fn scaled(&self, gap_ns: u64) -> Duration {
        Duration::from_secs_f64(gap_ns as f64 / 1e9 / self.speed)
    }
}

fn annotate(exchange: CorrelatedExchange, input: &str, session: &str, pass: u64) -> CorrelatedExchange {
    let (request, response) = exchange.into_parts();
    let mut request = request
        .with_meta("input", input)
        .with_meta("session", session);
    if pass > 0 {
        request = request.with_meta("loop", pass.to_string());
    }
    match response {
        Some(response) => CorrelatedExchange::matched(request, response),
        None => CorrelatedExchange::new(request),
    }
}

#[async_trait]
impl Input for FileInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "file"
    }

    async fn run(&self, sink: ExchangeSink, mut shutdown: ShutdownSignal) -> Result<(), ReplayError> {
        info!(input = %self.name, path = %self.path.display(), speed = self.speed, "replaying recording");
        let mut pass = 0;
        loop {
            match self.replay(pass, &sink, &mut shutdown).await? {
                Pass::Stopped => return Ok(()),
                Pass::Finished { records } => {
                    info!(input = %self.name, pass, records, "recording finished");
                    if !self.looping || records == 0 {
                        return Ok(());
                    }
                }
            }
            pass += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::FilterConfig;
    use crate::emitter::{DeliverySettings, Emitter};
    use crate::error::OutputError;
    use crate::lifecycle::shutdown::Shutdown;
    use crate::observability::InputStats;
    use crate::output::Output;
    use crate::protocol::{Direction, Message, MessageId, StreamId};
    use crate::record::RecordWriter;
    use crate::shaping::ExchangeFilter;
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Timed(Mutex<Vec<(String, Instant, Option<String>)>>);

    #[async_trait]
    impl Output for Timed {
        fn name(&self) -> &str {
            "timed"
        }

        fn kind(&self) -> &'static str {
            "test"
        }

        async fn send(&self, exchange: &CorrelatedExchange) -> Result<(), OutputError> {
            let path = String::from_utf8_lossy(&exchange.request().payload()[4..6]).to_string();
            let pass = exchange.request().meta().get("loop").cloned();
            self.0.lock().unwrap().push((path, Instant::now(), pass));
            Ok(())
        }
    }

    async fn recording(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("capture.trpl");
        let file = File::create(&path).await.unwrap();
        let mut writer = RecordWriter::create(file, uuid::Uuid::new_v4()).await.unwrap();
        let stream = StreamId::from_raw(1);
        for (seq, (path, at)) in [("/a", 0u64), ("/b", 1_000_000_000), ("/c", 3_000_000_000)]
            .into_iter()
            .enumerate()
        {
            let request = Message::new(
                MessageId::new(stream, seq as u64),
                Direction::Request,
                Bytes::from(format!("GET {path} HTTP/1.1\r\n\r\n")),
                at,
            );
            writer.write_exchange(&CorrelatedExchange::new(request)).await.unwrap();
        }
        writer.flush().await.unwrap();
        path
    }

    async fn replay(settings: FileInputSettings) -> Vec<(String, Instant, Option<String>)> {
        let shutdown = Shutdown::new();
        let emitter = Emitter::new(ExchangeFilter::from_config(&FilterConfig::default()).unwrap(), shutdown.subscribe());
        let timed = Arc::new(Timed::default());
        emitter.add_output(timed.clone(), DeliverySettings::default()).await.unwrap();
        let sink = emitter.sink("file-0", Arc::new(InputStats::default()));

        FileInput::new("file-0".to_string(), &settings)
            .run(sink, shutdown.subscribe())
            .await
            .unwrap();
        emitter.drain(Duration::from_secs(5)).await;
        let seen = timed.0.lock().unwrap().clone();
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn gaps_scaled_by_speed() {
        let dir = tempfile::tempdir().unwrap();
        let path = recording(&dir).await;
        let seen = replay(FileInputSettings {
            name: None,
            path,
            speed: 2.0,
            looping: false,
        })
        .await;

        let paths: Vec<_> = seen.iter().map(|(p, _, _)| p.as_str()).collect();
        assert_eq!(paths, ["/a", "/b", "/c"]);
        assert!(seen[1].1 - seen[0].1 >= Duration::from_millis(500));
        assert!(seen[2].1 - seen[1].1 >= Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn missing_file_is_resource_exhaustion() {
        let shutdown = Shutdown::new();
        let emitter = Emitter::new(ExchangeFilter::default(), shutdown.subscribe());
        let sink = emitter.sink("file-0", Arc::new(InputStats::default()));
        let input = FileInput::new(
            "file-0".to_string(),
            &FileInputSettings {
                name: None,
                path: PathBuf::from("/nonexistent/capture.trpl"),
                speed: 1.0,
                looping: false,
            },
        );
        let err = input.run(sink, shutdown.subscribe()).await.unwrap_err();
        assert!(matches!(err, ReplayError::ResourceExhaustion { .. }));
    }

    #[tokio::test]
    async fn loop_replays_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = recording(&dir).await;

        let shutdown = Shutdown::new();
        let emitter = Emitter::new(ExchangeFilter::default(), shutdown.subscribe());
        let timed = Arc::new(Timed::default());
        emitter.add_output(timed.clone(), DeliverySettings::default()).await.unwrap();
        let sink = emitter.sink("file-0", Arc::new(InputStats::default()));
        let input = FileInput::new(
            "file-0".to_string(),
            &FileInputSettings {
                name: None,
                path,
                speed: 100.0,
                looping: true,
            },
        );

        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stopper.trigger();
        });
        input.run(sink, shutdown.subscribe()).await.unwrap();
        emitter.drain(Duration::from_secs(5)).await;

        let seen = timed.0.lock().unwrap();
        assert!(seen.len() > 3);
        assert_eq!(seen[0].2, None);
        assert_eq!(seen[3].2.as_deref(), Some("1"));
    }
}
