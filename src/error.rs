//! Error taxonomy for the replay pipeline.
//!
//! | Error | Scope | Fatal |
//! |-------|-------|-------|
//! | `Framing` | one stream | No, the stream is abandoned |
//! | `CorrelationTimeout` | one exchange | No, counted |
//! | `OutputUnavailable` | one send | No, retried then dropped |
//! | `Configuration` | startup | Yes |
//! | `ResourceExhaustion` | one Input | Only for that Input |
//! | `Recording` | one recording | No for replay, yes for the recorder |
//!
//! Stream- and exchange-level errors are absorbed where they happen and only
//! show up as counters and log events.

use thiserror::Error;

use crate::protocol::{MessageId, StreamId};

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Errors surfaced by pipeline components.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// Malformed byte stream. The stream is abandoned, its Input keeps running.
    #[error("framing error on {stream}: {source}")]
    Framing {
        stream: StreamId,
        #[source]
        source: FramingError,
    },

    /// A request never saw its response within the configured bounds.
    #[error("exchange {0} orphaned: no response within bounds")]
    CorrelationTimeout(MessageId),

    /// An Output could not deliver an exchange after all retries.
    #[error("output {output} unavailable: {source}")]
    OutputUnavailable {
        output: String,
        #[source]
        source: OutputError,
    },

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A capture source (socket, file) could not be opened.
    #[error("cannot open capture source for {input}: {source}")]
    ResourceExhaustion {
        input: String,
        #[source]
        source: std::io::Error,
    },

    /// A recording is corrupt or has an unsupported version.
    #[error("recording error: {0}")]
    Recording(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why a byte stream could not be split into HTTP messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("malformed start line")]
    MalformedStartLine,

    #[error("malformed header line")]
    MalformedHeader,

    #[error("invalid Content-Length")]
    InvalidContentLength,

    #[error("both Content-Length and chunked Transfer-Encoding present")]
    ConflictingLength,

    #[error("unsupported Transfer-Encoding on a request")]
    UnsupportedTransferEncoding,

    #[error("invalid chunk framing")]
    InvalidChunk,

    #[error("message head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    #[error("message exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
}

/// Errors returned by [`Output::send`](crate::output::Output::send) and friends.
#[derive(Error, Debug)]
pub enum OutputError {
    /// The target could not be reached or timed out.
    #[error("target unavailable: {0}")]
    Unavailable(String),

    /// The exchange cannot be replayed by this Output.
    #[error("exchange rejected: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("output closed")]
    Closed,
}

impl OutputError {
    /// Whether the send should be attempted again after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OutputError::Unavailable(_))
    }
}

impl ReplayError {
    /// Whether the error must stop the whole process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReplayError::Configuration(_))
    }

    /// Process exit status for an error that ends the run: 2 for bad
    /// configuration, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        match self {
            ReplayError::Configuration(_) => 2,
            _ => 1,
        }
    }
}
