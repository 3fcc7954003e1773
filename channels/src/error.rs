//! Error and close-state types shared across the crate.
//!
//! A channel, once closed, never reopens; `ChannelClosed` is therefore both
//! the terminal close state stored inside a channel and the error value every
//! operation reports after observing it. Operations that consume a value hand
//! it back inside their error, so nothing is lost when a send fails.

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// The cause attached to a channel closed with [`Channel::error`].
///
/// Shared behind an `Arc` so that every pending and future operation observes
/// the same cause.
///
/// [`Channel::error`]: crate::Channel::error
pub type ErrorCause = Arc<dyn StdError + Send + Sync + 'static>;

/// The terminal close state of a channel.
///
/// `Done` is the graceful close: values already sent or buffered are still
/// delivered, and only then do receivers observe the close. `Error` is the
/// abnormal close: buffered values are discarded and all pending and future
/// operations fail immediately with the stored cause.
#[derive(Debug, Clone, Error)]
pub enum ChannelClosed {
  /// The channel was closed gracefully; no more values will be sent.
  #[error("channel is done")]
  Done,
  /// The channel was closed with an error.
  #[error("channel is in error: {0}")]
  Error(ErrorCause),
}

/// Close reasons compare by identity: `Done` equals `Done`, and two `Error`
/// states are equal when they share the same stored cause (which all
/// observers of one channel do).
impl PartialEq for ChannelClosed {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (ChannelClosed::Done, ChannelClosed::Done) => true,
      (ChannelClosed::Error(a), ChannelClosed::Error(b)) => Arc::ptr_eq(a, b),
      _ => false,
    }
  }
}

impl Eq for ChannelClosed {}

impl ChannelClosed {
  /// Returns `true` for the graceful [`ChannelClosed::Done`] state.
  pub fn is_done(&self) -> bool {
    matches!(self, ChannelClosed::Done)
  }

  /// The cause of an abnormal close, if any.
  pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
    match self {
      ChannelClosed::Done => None,
      ChannelClosed::Error(cause) => Some(cause.as_ref()),
    }
  }
}

/// Error returned by [`Channel::send`](crate::Channel::send) when the channel
/// is closed. Carries the unsent value back to the caller.
#[derive(Debug, Error)]
#[error("channel closed while sending: {reason}")]
pub struct SendError<T> {
  /// The value that could not be sent.
  pub value: T,
  /// Why the channel is closed.
  pub reason: ChannelClosed,
}

impl<T> SendError<T> {
  /// Consumes the error, returning the unsent value.
  pub fn into_value(self) -> T {
    self.value
  }
}

/// Error returned by [`Channel::try_send`](crate::Channel::try_send).
#[derive(Debug, Error)]
pub enum TrySendError<T> {
  /// No receiver was waiting and there was no free buffer space.
  #[error("channel is full")]
  Full(T),
  /// The channel is closed.
  #[error("channel closed while sending: {reason}")]
  Closed {
    /// The value that could not be sent.
    value: T,
    /// Why the channel is closed.
    reason: ChannelClosed,
  },
}

impl<T> TrySendError<T> {
  /// Consumes the error, returning the unsent value.
  pub fn into_value(self) -> T {
    match self {
      TrySendError::Full(value) => value,
      TrySendError::Closed { value, .. } => value,
    }
  }
}

/// Error returned by [`Channel::try_receive`](crate::Channel::try_receive).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TryReceiveError {
  /// No value was immediately available.
  #[error("channel is empty")]
  Empty,
  /// The channel is closed.
  #[error("channel closed while receiving: {0}")]
  Closed(ChannelClosed),
}

/// Error returned by [`Channel::send_timeout`](crate::Channel::send_timeout).
#[derive(Debug, Error)]
pub enum SendTimeoutError<T> {
  /// The deadline elapsed before the value could be handed off or buffered.
  #[error("timed out before the value could be sent")]
  Timeout(T),
  /// The channel is closed.
  #[error("channel closed while sending: {reason}")]
  Closed {
    /// The value that could not be sent.
    value: T,
    /// Why the channel is closed.
    reason: ChannelClosed,
  },
}

impl<T> SendTimeoutError<T> {
  /// Consumes the error, returning the unsent value.
  pub fn into_value(self) -> T {
    match self {
      SendTimeoutError::Timeout(value) => value,
      SendTimeoutError::Closed { value, .. } => value,
    }
  }
}

/// Error returned by
/// [`Channel::receive_timeout`](crate::Channel::receive_timeout).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReceiveTimeoutError {
  /// The deadline elapsed before a value arrived.
  #[error("timed out before a value arrived")]
  Timeout,
  /// The channel is closed.
  #[error("channel closed while receiving: {0}")]
  Closed(ChannelClosed),
}

/// Error returned by [`select_within`](crate::select_within).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectTimeoutError {
  /// The deadline elapsed before any clause completed.
  #[error("select timed out before any clause completed")]
  Timeout,
  /// One of the channels is closed.
  #[error("channel closed during select: {0}")]
  Closed(ChannelClosed),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Debug, Error)]
  #[error("disk is on fire")]
  struct DiskOnFire;

  #[test]
  fn closed_reason_display() {
    assert_eq!(ChannelClosed::Done.to_string(), "channel is done");
    let reason = ChannelClosed::Error(Arc::new(DiskOnFire));
    assert_eq!(reason.to_string(), "channel is in error: disk is on fire");
    assert!(reason.cause().is_some());
    assert!(!reason.is_done());
  }

  #[test]
  fn closed_reasons_compare_by_identity() {
    assert_eq!(ChannelClosed::Done, ChannelClosed::Done);
    let cause: ErrorCause = Arc::new(DiskOnFire);
    let a = ChannelClosed::Error(Arc::clone(&cause));
    let b = ChannelClosed::Error(cause);
    assert_eq!(a, b);
    assert_ne!(a, ChannelClosed::Error(Arc::new(DiskOnFire)));
    assert_ne!(a, ChannelClosed::Done);
  }

  #[test]
  fn send_errors_return_the_value() {
    let err = TrySendError::Full(7);
    assert_eq!(err.into_value(), 7);
    let err = SendTimeoutError::Closed {
      value: "v",
      reason: ChannelClosed::Done,
    };
    assert_eq!(err.into_value(), "v");
  }
}
