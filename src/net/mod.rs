//! Network plumbing shared by the socket Inputs.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (lifecycle tracking, one StreamId per connection)
//!     → Hand off to the Input's connection handler
//! ```
//!
//! # Design Decisions
//! - Bounded accept: a permit is taken before `accept`, so a full Input
//!   stops accepting instead of growing without limit
//! - Each connection is tracked so shutdown can wait for in-flight streams

pub mod connection;
pub mod listener;

pub use connection::{ConnectionGuard, ConnectionTracker};
pub use listener::{ConnectionPermit, Listener, ListenerError};
