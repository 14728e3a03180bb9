//! Durable recorder: appends exchanges to a recording file.
//!
//! `flush` pushes the write buffer to the file and `fsync`s it, so everything
//! sent before a flush survives a crash. With `append = true` an existing
//! recording is continued under its original session id; its header must be
//! valid.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, BufWriter};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use super::Output;
use crate::config::plugin::RecorderSettings;
use crate::error::{OutputError, ReplayError};
use crate::protocol::CorrelatedExchange;
use crate::record::{decode_header, RecordWriter, HEADER_LEN};

type FileWriter = RecordWriter<BufWriter<File>>;

pub struct RecorderOutput {
    name: String,
    path: PathBuf,
    /// `None` once closed.
    writer: Mutex<Option<FileWriter>>,
}

impl RecorderOutput {
    pub async fn open(name: String, settings: &RecorderSettings) -> Result<Self, ReplayError> {
        let writer = if settings.append {
            match existing_session(&settings.path).await? {
                Some(session) => {
                    let file = OpenOptions::new().append(true).open(&settings.path).await?;
                    info!(output = %name, path = %settings.path.display(), %session, "appending to recording");
                    RecordWriter::append(BufWriter::new(file), session).await?
                }
                None => create(&name, &settings.path).await?,
            }
        } else {
            create(&name, &settings.path).await?
        };

        Ok(Self {
            name,
            path: settings.path.clone(),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn create(name: &str, path: &Path) -> Result<FileWriter, ReplayError> {
    let file = File::create(path).await?;
    let session = Uuid::new_v4();
    info!(output = %name, path = %path.display(), %session, "recording to new file");
    RecordWriter::create(BufWriter::new(file), session).await
}

/// Session id of an existing, non-empty recording.
async fn existing_session(path: &Path) -> Result<Option<Uuid>, ReplayError> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if file.metadata().await?.len() == 0 {
        return Ok(None);
    }
    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header)
        .await
        .map_err(|_| ReplayError::Recording(format!("{} has a truncated header", path.display())))?;
    decode_header(&header).map(Some)
}

fn output_error(e: ReplayError) -> OutputError {
    match e {
        ReplayError::Io(e) => OutputError::Io(e),
        other => OutputError::Rejected(other.to_string()),
    }
}

async fn sync(writer: &mut FileWriter) -> Result<(), OutputError> {
    writer.flush().await.map_err(output_error)?;
    writer.get_ref().get_ref().sync_data().await?;
    Ok(())
}

#[async_trait]
impl Output for RecorderOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "file"
    }

    async fn send(&self, exchange: &CorrelatedExchange) -> Result<(), OutputError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(OutputError::Closed)?;
        writer.write_exchange(exchange).await.map_err(output_error)
    }

    async fn flush(&self) -> Result<(), OutputError> {
        match self.writer.lock().await.as_mut() {
            Some(writer) => sync(writer).await,
            None => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), OutputError> {
        let Some(mut writer) = self.writer.lock().await.take() else {
            return Ok(());
        };
        sync(&mut writer).await?;
        info!(output = %self.name, records = writer.records_written(), "recording closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Direction, Message, MessageId, StreamId};
    use crate::record::RecordReader;
    use bytes::Bytes;

    fn exchange(seq: u64) -> CorrelatedExchange {
        let id = MessageId::new(StreamId::from_raw(9), seq);
        let request = Message::new(id, Direction::Request, Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"), seq * 10);
        let response = Message::new(
            id,
            Direction::Response,
            Bytes::from_static(b"HTTP/1.1 204 No Content\r\n\r\n"),
            seq * 10 + 5,
        );
        CorrelatedExchange::matched(request, response)
    }

    fn settings(path: PathBuf, append: bool) -> RecorderSettings {
        RecorderSettings {
            name: None,
            path,
            append,
            sample_rate: 1.0,
            rate_limit: None,
            buffer_capacity: 16,
            overload: Default::default(),
            max_attempts: None,
        }
    }

    async fn read_all(path: &Path) -> (Uuid, Vec<CorrelatedExchange>) {
        let file = File::open(path).await.unwrap();
        let mut reader = RecordReader::open(file).await.unwrap();
        let mut all = Vec::new();
        while let Some(exchange) = reader.next_exchange().await.unwrap() {
            all.push(exchange);
        }
        (reader.session(), all)
    }

    #[tokio::test]
    async fn records_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.trpl");
        let recorder = RecorderOutput::open("rec".into(), &settings(path.clone(), false)).await.unwrap();
        recorder.send(&exchange(0)).await.unwrap();
        recorder.send(&exchange(1)).await.unwrap();
        recorder.flush().await.unwrap();
        recorder.close().await.unwrap();
        assert!(matches!(recorder.send(&exchange(2)).await, Err(OutputError::Closed)));

        let (_, all) = read_all(&path).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].id().seq, 1);
        assert_eq!(all[1].response().unwrap().timestamp_ns(), 15);
    }

    #[tokio::test]
    async fn append_keeps_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.trpl");

        let first = RecorderOutput::open("rec".into(), &settings(path.clone(), false)).await.unwrap();
        first.send(&exchange(0)).await.unwrap();
        first.close().await.unwrap();
        let (session, _) = read_all(&path).await;

        let second = RecorderOutput::open("rec".into(), &settings(path.clone(), true)).await.unwrap();
        second.send(&exchange(1)).await.unwrap();
        second.close().await.unwrap();

        let (again, all) = read_all(&path).await;
        assert_eq!(again, session);
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn append_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, b"definitely not a recording").await.unwrap();
        let err = RecorderOutput::open("rec".into(), &settings(path, true)).await.err().unwrap();
        assert!(matches!(err, ReplayError::Recording(_)));
    }
}
