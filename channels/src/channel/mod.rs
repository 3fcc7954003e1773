//! A high-throughput MPMC channel with rendezvous, buffered and unbounded
//! modes.
//!
//! A [`Channel`] is a single cloneable handle: any number of threads may
//! send and receive through clones of it concurrently. Values travel in
//! send order per channel. There are three capacity modes:
//!
//! - [`Channel::rendezvous`]: capacity zero; a send blocks until a receive
//!   arrives and both complete together.
//! - [`Channel::buffered`]: a fixed number of sends may complete without a
//!   receiver before subsequent sends block.
//! - [`Channel::unbounded`]: sends never block.
//!
//! Channels are closed with [`done`](Channel::done) (graceful: buffered and
//! in-flight values are still delivered) or [`error`](Channel::error)
//! (abnormal: everything pending fails with the cause). All blocking
//! operations have deadline-bounded variants, and every operation has a
//! clause form usable with [`select`](crate::select()).
//!
//! ### Example
//!
//! ```
//! use weft::Channel;
//!
//! let channel = Channel::buffered(2);
//! channel.send(1).unwrap();
//! channel.send(2).unwrap();
//! channel.done().unwrap();
//!
//! assert_eq!(channel.receive(), Ok(1));
//! assert_eq!(channel.receive(), Ok(2));
//! assert!(channel.receive().is_err());
//! ```

pub(crate) mod cell;
pub(crate) mod core;
pub(crate) mod segment;

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use self::core::{ChannelCore, Mode, ReceiveOutcome, SendOutcome};
use crate::error::{
  ChannelClosed, ReceiveTimeoutError, SendError, SendTimeoutError, TryReceiveError, TrySendError,
};
use crate::select::instance::SelectCore;
use crate::select::SelectClause;

/// A multi-producer multi-consumer channel.
///
/// Cloning the handle is cheap and shares the same channel. Dropping handles
/// does not close the channel; closing is always explicit via
/// [`done`](Channel::done) or [`error`](Channel::error).
pub struct Channel<T: Send> {
  pub(crate) core: Arc<ChannelCore<T>>,
}

impl<T: Send> Clone for Channel<T> {
  fn clone(&self) -> Self {
    Channel {
      core: Arc::clone(&self.core),
    }
  }
}

impl<T: Send> Channel<T> {
  /// Creates a rendezvous channel: every send must meet a receive.
  pub fn rendezvous() -> Self {
    Channel {
      core: Arc::new(ChannelCore::new(Mode::Rendezvous)),
    }
  }

  /// Creates a buffered channel. `capacity` sends may complete without a
  /// receiver before the next one blocks; a capacity of zero is the same as
  /// [`Channel::rendezvous`].
  pub fn buffered(capacity: usize) -> Self {
    let mode = if capacity == 0 {
      Mode::Rendezvous
    } else {
      Mode::Buffered(capacity)
    };
    Channel {
      core: Arc::new(ChannelCore::new(mode)),
    }
  }

  /// Creates an unbounded channel: sends never block.
  pub fn unbounded() -> Self {
    Channel {
      core: Arc::new(ChannelCore::new(Mode::Unbounded)),
    }
  }

  /// The channel's capacity: `Some(0)` for rendezvous, `Some(n)` for
  /// buffered, `None` for unbounded.
  pub fn capacity(&self) -> Option<usize> {
    match self.core.mode {
      Mode::Rendezvous => Some(0),
      Mode::Buffered(capacity) => Some(capacity),
      Mode::Unbounded => None,
    }
  }

  /// Sends a value, blocking the calling thread until it is handed off,
  /// buffered, or the channel is closed.
  ///
  /// The error carries the value back together with the close reason.
  pub fn send(&self, value: T) -> Result<(), SendError<T>> {
    match self.core.do_send(value, None, None) {
      SendOutcome::Sent => Ok(()),
      SendOutcome::Closed { value, reason } => Err(SendError { value, reason }),
      SendOutcome::TimedOut { .. } | SendOutcome::Stored(_) => {
        unreachable!("plain send neither times out nor registers")
      }
    }
  }

  /// Sends a value, giving up once `timeout` elapses.
  ///
  /// A timed-out send leaves its reserved cell permanently dead; the
  /// channel stays fully usable and the value comes back in the error.
  pub fn send_timeout(&self, value: T, timeout: Duration) -> Result<(), SendTimeoutError<T>> {
    match self.core.do_send(value, None, Some(Instant::now() + timeout)) {
      SendOutcome::Sent => Ok(()),
      SendOutcome::Closed { value, reason } => Err(SendTimeoutError::Closed { value, reason }),
      SendOutcome::TimedOut { value } => Err(SendTimeoutError::Timeout(value)),
      SendOutcome::Stored(_) => unreachable!("plain send does not register"),
    }
  }

  /// Receives a value, blocking the calling thread until one is available
  /// or the channel is closed.
  ///
  /// A channel closed with [`done`](Channel::done) keeps delivering values
  /// that were sent before the close; only then does `receive` report the
  /// close.
  pub fn receive(&self) -> Result<T, ChannelClosed> {
    match self.core.do_receive(None, None) {
      ReceiveOutcome::Received(value) => Ok(value),
      ReceiveOutcome::Closed(reason) => Err(reason),
      ReceiveOutcome::TimedOut | ReceiveOutcome::Stored(_) => {
        unreachable!("plain receive neither times out nor registers")
      }
    }
  }

  /// Receives a value, giving up once `timeout` elapses.
  pub fn receive_timeout(&self, timeout: Duration) -> Result<T, ReceiveTimeoutError> {
    match self.core.do_receive(None, Some(Instant::now() + timeout)) {
      ReceiveOutcome::Received(value) => Ok(value),
      ReceiveOutcome::Closed(reason) => Err(ReceiveTimeoutError::Closed(reason)),
      ReceiveOutcome::TimedOut => Err(ReceiveTimeoutError::Timeout),
      ReceiveOutcome::Stored(_) => unreachable!("plain receive does not register"),
    }
  }

  /// Closes the channel gracefully: no more values can be sent, but values
  /// already sent or buffered are still delivered.
  ///
  /// Fails with the original close reason when the channel is already
  /// closed.
  pub fn done(&self) -> Result<(), ChannelClosed> {
    self.core.close_channel(ChannelClosed::Done)
  }

  /// Like [`done`](Channel::done), but reports an already-closed channel by
  /// returning its existing close reason instead of failing.
  pub fn done_or_closed(&self) -> Option<ChannelClosed> {
    self.core.close_channel(ChannelClosed::Done).err()
  }

  /// Closes the channel with an error: buffered values are discarded, and
  /// all pending and future operations fail with the cause.
  ///
  /// Fails with the original close reason when the channel is already
  /// closed.
  pub fn error(&self, cause: impl Into<Box<dyn StdError + Send + Sync>>) -> Result<(), ChannelClosed> {
    self.core.close_channel(ChannelClosed::Error(Arc::from(cause.into())))
  }

  /// Like [`error`](Channel::error), but reports an already-closed channel
  /// by returning its existing close reason instead of failing.
  pub fn error_or_closed(&self, cause: impl Into<Box<dyn StdError + Send + Sync>>) -> Option<ChannelClosed> {
    self
      .core
      .close_channel(ChannelClosed::Error(Arc::from(cause.into())))
      .err()
  }

  /// `true` once the channel is closed in any way; sends fail from then on.
  pub fn is_closed_for_send(&self) -> bool {
    self.core.closed_for_send().is_some()
  }

  /// `true` once receives are guaranteed to fail: the channel is in error,
  /// or it is done and every value sent before the close was received.
  pub fn is_closed_for_receive(&self) -> bool {
    self.core.closed_for_receive().is_some()
  }

  /// The close reason senders observe, if any.
  pub fn closed_for_send(&self) -> Option<ChannelClosed> {
    self.core.closed_for_send()
  }

  /// The close reason receivers observe, if any. A done channel that still
  /// holds deliverable values reports `None`.
  pub fn closed_for_receive(&self) -> Option<ChannelClosed> {
    self.core.closed_for_receive()
  }

  /// Number of live segments backing this channel. Stays bounded by a small
  /// constant plus the number of in-flight operations, independent of how
  /// many values have passed through; exposed for diagnostics and tests.
  pub fn segment_count(&self) -> usize {
    self.core.segment_count()
  }
}

impl<T: Send + 'static> Channel<T> {
  /// Attempts to send without blocking.
  ///
  /// Implemented by racing the real send against an always-ready default
  /// clause inside the select engine, so its outcome is atomic under
  /// contention: the value is either handed off/buffered, or comes back in
  /// the error.
  pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
    let engine = Arc::new(SelectCore::new());
    match self.core.do_send(value, Some((&engine, 0)), None) {
      SendOutcome::Sent => Ok(()),
      SendOutcome::Closed { value, reason } => Err(TrySendError::Closed { value, reason }),
      SendOutcome::Stored(stored) => {
        // no partner and no buffer space: the default clause (registered
        // second) wins during registration, after which no peer can claim
        // the stored send
        engine.select_immediately(1);
        self.core.cleanup_stored(&stored);
        let value = stored.take_payload().expect("unselected send clause kept its value");
        Err(TrySendError::Full(value))
      }
      SendOutcome::TimedOut { .. } => unreachable!("registration does not block"),
    }
  }

  /// Attempts to receive without blocking.
  ///
  /// Implemented like [`try_send`](Channel::try_send), by racing the real
  /// receive against an always-ready default clause.
  pub fn try_receive(&self) -> Result<T, TryReceiveError> {
    let engine = Arc::new(SelectCore::new());
    match self.core.do_receive(Some((&engine, 0)), None) {
      ReceiveOutcome::Received(value) => Ok(value),
      ReceiveOutcome::Closed(reason) => Err(TryReceiveError::Closed(reason)),
      ReceiveOutcome::Stored(stored) => {
        engine.select_immediately(1);
        self.core.cleanup_stored(&stored);
        Err(TryReceiveError::Empty)
      }
      ReceiveOutcome::TimedOut => unreachable!("registration does not block"),
    }
  }

  /// A clause that receives from this channel, for use with
  /// [`select`](crate::select()).
  pub fn receive_clause(&self) -> SelectClause<T> {
    SelectClause::receive(self.clone(), |value| value)
  }

  /// A clause that receives from this channel and transforms the value.
  pub fn receive_clause_map<U: 'static, F>(&self, transform: F) -> SelectClause<U>
  where
    F: FnOnce(T) -> U + Send + 'static,
  {
    SelectClause::receive(self.clone(), transform)
  }

  /// A clause that sends `value` into this channel, yielding `()` when
  /// selected.
  pub fn send_clause(&self, value: T) -> SelectClause<()> {
    SelectClause::send(self.clone(), value, || ())
  }

  /// A clause that sends `value` into this channel, yielding the callback's
  /// result when selected.
  pub fn send_clause_with<U: 'static, F>(&self, value: T, callback: F) -> SelectClause<U>
  where
    F: FnOnce() -> U + Send + 'static,
  {
    SelectClause::send(self.clone(), value, callback)
  }
}

impl<T: Send> fmt::Debug for Channel<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let (senders, receivers, buffer_end, closed) = self.core.debug_counters();
    f.debug_struct("Channel")
      .field("mode", &self.core.mode)
      .field("senders", &senders)
      .field("receivers", &receivers)
      .field("buffer_end", &buffer_end)
      .field("closed", &closed)
      .field("segments", &self.core.segment_count())
      .finish()
  }
}
