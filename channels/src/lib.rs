//! Fast, lock-free MPMC channels with a multi-way select.
//!
//! Weft provides one channel type in three capacity modes - rendezvous,
//! fixed-capacity buffered, and unbounded - plus a [`select`] operation that
//! atomically commits to exactly one of several pending send/receive
//! operations across independent channels.
//!
//! The implementation follows the "fast and scalable channels" design: the
//! channel is a logical infinite array of single-use rendezvous cells,
//! realized as a lock-free chain of 32-cell segments with reference-counted
//! reclamation. Senders and receivers reserve cells from monotonic counters
//! and meet in them; there is no lock anywhere on the hot path.
//!
//! ### Quick start
//!
//! ```
//! use std::thread;
//! use weft::Channel;
//!
//! let channel = Channel::rendezvous();
//! let producer = {
//!   let channel = channel.clone();
//!   thread::spawn(move || {
//!     for i in 0..3 {
//!       channel.send(i).unwrap();
//!     }
//!     channel.done().unwrap();
//!   })
//! };
//!
//! let mut received = Vec::new();
//! while let Ok(value) = channel.receive() {
//!   received.push(value);
//! }
//! assert_eq!(received, [0, 1, 2]);
//! producer.join().unwrap();
//! ```
//!
//! ### Logging
//!
//! Cold paths (closing, select re-registration, segment reclamation) emit
//! [`log`] records; install any `log`-compatible logger to see them.

pub mod channel;
pub mod error;
pub mod select;

// Internal utilities - not part of the public API.
mod internal;

pub use channel::Channel;
pub use error::{
  ChannelClosed, ErrorCause, ReceiveTimeoutError, SelectTimeoutError, SendError, SendTimeoutError,
  TryReceiveError, TrySendError,
};
pub use select::{default_clause, default_clause_with, select, select_within, SelectClause};
