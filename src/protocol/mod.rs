//! HTTP/1.x capture protocol: framing, correlation, stream state.
//!
//! # Responsibilities
//! - Split raw byte streams into complete messages ([`Framer`])
//! - Pair requests with responses per stream ([`Correlator`])
//! - Own per-stream state for one Input ([`Assembler`])
//!
//! # Data Flow
//! ```text
//! Input ──CaptureEvent──► Assembler ──► Framer ──► Correlator ──► CorrelatedExchange
//! ```

pub mod assembler;
pub mod correlator;
pub mod http;
pub mod message;
pub mod parser;
pub mod stream;

pub use assembler::{Assembler, AssemblerConfig, AssemblerStats, CaptureEvent};
pub use correlator::{Correlator, CorrelatorConfig, CorrelatorStats};
pub use message::{
    CorrelatedExchange, Direction, Message, MessageId, Meta, SessionClock, SharedExchange,
    StreamId,
};
pub use parser::{Framer, FramerLimits};
pub use stream::{StreamState, StreamTable};
