use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use super::{encode_header, encode_message, SEGMENT_MARK};
use crate::error::ReplayError;
use crate::protocol::CorrelatedExchange;

/// Appends exchanges to a recording.
pub struct RecordWriter<W> {
    inner: W,
    session: Uuid,
    /// Timestamp of the first exchange written; offsets are relative to it.
    base_ns: Option<u64>,
    buf: BytesMut,
    records: u64,
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    /// Start a new recording: writes the header.
    pub async fn create(mut inner: W, session: Uuid) -> Result<Self, ReplayError> {
        inner.write_all(&encode_header(session)).await?;
        Ok(Self::new(inner, session))
    }

    /// Continue an existing recording whose header was already validated.
    /// Writes a segment mark, so offsets of this run start again at zero.
    pub async fn append(mut inner: W, session: Uuid) -> Result<Self, ReplayError> {
        inner.write_all(&[SEGMENT_MARK]).await?;
        Ok(Self::new(inner, session))
    }

    fn new(inner: W, session: Uuid) -> Self {
        Self {
            inner,
            session,
            base_ns: None,
            buf: BytesMut::with_capacity(16 * 1024),
            records: 0,
        }
    }

    pub async fn write_exchange(&mut self, exchange: &CorrelatedExchange) -> Result<(), ReplayError> {
        let base_ns = *self
            .base_ns
            .get_or_insert(exchange.request().timestamp_ns());

        self.buf.clear();
        let count = if exchange.response().is_some() { 2 } else { 1 };
        self.buf.put_u8(count);
        encode_message(&mut self.buf, exchange.request(), base_ns)?;
        if let Some(response) = exchange.response() {
            encode_message(&mut self.buf, response, base_ns)?;
        }

        self.inner.write_all(&self.buf).await?;
        self.records += 1;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), ReplayError> {
        self.inner.flush().await?;
        Ok(())
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
