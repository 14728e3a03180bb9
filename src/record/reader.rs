use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use super::{
    build_message, decode_entry_head, decode_header, ENTRY_HEAD_LEN, HEADER_LEN,
    MAX_PAYLOAD_BYTES, SEGMENT_MARK,
};
use crate::error::ReplayError;
use crate::protocol::{CorrelatedExchange, Direction, Message, Meta};

/// One item of a recording.
#[derive(Debug)]
pub enum Entry {
    Exchange(CorrelatedExchange),
    /// An appended run starts; its offsets are relative to its own first record.
    Segment,
}

/// Streams exchanges out of a recording, one record at a time.
pub struct RecordReader<R> {
    inner: R,
    session: Uuid,
    records: u64,
    segments: u64,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    /// Read and validate the header.
    pub async fn open(mut inner: R) -> Result<Self, ReplayError> {
        let mut header = [0u8; HEADER_LEN];
        inner.read_exact(&mut header).await.map_err(truncated)?;
        let session = decode_header(&header)?;
        Ok(Self {
            inner,
            session,
            records: 0,
            segments: 1,
        })
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn records_read(&self) -> u64 {
        self.records
    }

    /// Segments seen so far, counting the initial one.
    pub fn segments(&self) -> u64 {
        self.segments
    }

    /// Next exchange, skipping segment marks, or `None` at a clean end of file.
    pub async fn next_exchange(&mut self) -> Result<Option<CorrelatedExchange>, ReplayError> {
        loop {
            match self.next_entry().await? {
                Some(Entry::Exchange(exchange)) => return Ok(Some(exchange)),
                Some(Entry::Segment) => continue,
                None => return Ok(None),
            }
        }
    }

    /// Next exchange or segment mark, or `None` at a clean end of file.
    pub async fn next_entry(&mut self) -> Result<Option<Entry>, ReplayError> {
        let count = match self.inner.read_u8().await {
            Ok(count) => count,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let exchange = match count {
            SEGMENT_MARK => {
                self.segments += 1;
                return Ok(Some(Entry::Segment));
            }
            1 => {
                let request = self.read_message().await?;
                expect_direction(&request, Direction::Request)?;
                CorrelatedExchange::new(request)
            }
            2 => {
                let request = self.read_message().await?;
                expect_direction(&request, Direction::Request)?;
                let response = self.read_message().await?;
                expect_direction(&response, Direction::Response)?;
                CorrelatedExchange::matched(request, response)
            }
            other => {
                return Err(ReplayError::Recording(format!(
                    "invalid message count {other} in record {}",
                    self.records
                )))
            }
        };
        self.records += 1;
        Ok(Some(Entry::Exchange(exchange)))
    }

    async fn read_message(&mut self) -> Result<Message, ReplayError> {
        let mut raw = [0u8; ENTRY_HEAD_LEN];
        self.inner.read_exact(&mut raw).await.map_err(truncated)?;
        let head = decode_entry_head(&raw)?;

        let mut meta = Meta::new();
        for _ in 0..head.meta_count {
            let key = self.read_string().await?;
            let value = self.read_string().await?;
            meta.insert(key, value);
        }

        let len = self.inner.read_u32().await.map_err(truncated)? as usize;
        if len > MAX_PAYLOAD_BYTES {
            return Err(ReplayError::Recording(format!(
                "payload length {len} exceeds the {MAX_PAYLOAD_BYTES} byte limit"
            )));
        }
        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await.map_err(truncated)?;

        Ok(build_message(head, &meta, Bytes::from(payload)))
    }

    async fn read_string(&mut self) -> Result<String, ReplayError> {
        let len = self.inner.read_u16().await.map_err(truncated)? as usize;
        let mut raw = vec![0u8; len];
        self.inner.read_exact(&mut raw).await.map_err(truncated)?;
        String::from_utf8(raw).map_err(|_| ReplayError::Recording("metadata is not UTF-8".into()))
    }
}

fn expect_direction(message: &Message, direction: Direction) -> Result<(), ReplayError> {
    if message.direction() != direction {
        return Err(ReplayError::Recording(format!(
            "expected {} entry, found {}",
            direction.as_str(),
            message.direction().as_str()
        )));
    }
    Ok(())
}

fn truncated(e: io::Error) -> ReplayError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ReplayError::Recording("recording is truncated".into())
    } else {
        ReplayError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageId, StreamId};
    use crate::record::RecordWriter;

    fn exchange(seq: u64, ts: u64, with_response: bool) -> CorrelatedExchange {
        let stream = StreamId::from_raw(11);
        let request = Message::new(
            MessageId::new(stream, seq),
            Direction::Request,
            Bytes::from(format!("GET /{seq} HTTP/1.1\r\n\r\n")),
            ts,
        )
        .with_meta("input", "tap");
        if !with_response {
            return CorrelatedExchange::new(request);
        }
        let response = Message::new(
            MessageId::new(stream, seq),
            Direction::Response,
            Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"),
            ts + 100,
        );
        CorrelatedExchange::matched(request, response)
    }

    async fn encode(exchanges: &[CorrelatedExchange]) -> Vec<u8> {
        let mut writer = RecordWriter::create(Vec::new(), Uuid::new_v4()).await.unwrap();
        for e in exchanges {
            writer.write_exchange(e).await.unwrap();
        }
        writer.into_inner()
    }

    #[tokio::test]
    async fn offsets_relative_to_first_record() {
        let bytes = encode(&[exchange(0, 5_000, true), exchange(1, 8_000, false)]).await;
        let mut reader = RecordReader::open(&bytes[..]).await.unwrap();

        let first = reader.next_exchange().await.unwrap().unwrap();
        assert_eq!(first.request().timestamp_ns(), 0);
        assert_eq!(first.response().unwrap().timestamp_ns(), 100);
        assert_eq!(first.request().meta()["input"], "tap");

        let second = reader.next_exchange().await.unwrap().unwrap();
        assert_eq!(second.request().timestamp_ns(), 3_000);
        assert!(second.response().is_none());

        assert!(reader.next_exchange().await.unwrap().is_none());
        assert_eq!(reader.records_read(), 2);
    }

    #[tokio::test]
    async fn appended_segment_restarts_offsets() {
        let mut bytes = encode(&[exchange(0, 5_000, false)]).await;
        let session = Uuid::new_v4();
        let mut writer = RecordWriter::append(Vec::new(), session).await.unwrap();
        writer.write_exchange(&exchange(1, 90_000, false)).await.unwrap();
        writer.write_exchange(&exchange(2, 94_000, false)).await.unwrap();
        bytes.extend_from_slice(&writer.into_inner());

        let mut reader = RecordReader::open(&bytes[..]).await.unwrap();
        let mut offsets = Vec::new();
        let mut marks = 0;
        while let Some(entry) = reader.next_entry().await.unwrap() {
            match entry {
                Entry::Exchange(e) => offsets.push(e.request().timestamp_ns()),
                Entry::Segment => marks += 1,
            }
        }
        assert_eq!(offsets, [0, 0, 4_000]);
        assert_eq!(marks, 1);
        assert_eq!(reader.segments(), 2);
        assert_eq!(reader.records_read(), 3);
    }

    #[tokio::test]
    async fn truncated_record_is_an_error() {
        let bytes = encode(&[exchange(0, 0, true)]).await;
        let cut = &bytes[..bytes.len() - 3];
        let mut reader = RecordReader::open(cut).await.unwrap();
        let err = reader.next_exchange().await.unwrap_err();
        assert!(matches!(err, ReplayError::Recording(_)));
    }

    #[tokio::test]
    async fn oversized_payload_rejected() {
        let mut bytes = encode(&[]).await;
        bytes.push(1);
        bytes.extend_from_slice(&[0u8; ENTRY_HEAD_LEN]);
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        let mut reader = RecordReader::open(&bytes[..]).await.unwrap();
        let err = reader.next_exchange().await.unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[tokio::test]
    async fn bad_magic() {
        let err = RecordReader::open(&b"NOPE\x01................"[..])
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("bad magic"));
    }
}
