//! Multi-way select over channel clauses.
//!
//! [`select`] commits to exactly one of several pending send/receive
//! operations across independent channels. Each clause registers a
//! provisional claim on a cell in its channel; the first peer to complete
//! any claim wins, every other registration is cleaned up, and the winning
//! clause's transform produces the result.
//!
//! Among clauses that can complete immediately, the one listed first wins.
//! Clauses that only become completable later are won by whichever peer
//! arrives first, with no ordering guarantee.
//!
//! ### Example
//!
//! ```
//! use weft::{select, Channel};
//!
//! let a = Channel::buffered(1);
//! let b = Channel::buffered(1);
//! a.send("from a").unwrap();
//! b.send("from b").unwrap();
//!
//! // both are ready: the first clause is selected
//! let value = select(vec![a.receive_clause(), b.receive_clause()]).unwrap();
//! assert_eq!(value, "from a");
//! ```

pub(crate) mod instance;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::trace;

use self::instance::{SelectCore, SelectState, StoredSelect, MAX_CLAUSES};
use crate::channel::Channel;
use crate::error::{ChannelClosed, SelectTimeoutError};
use crate::internal::backoff;

/// The outcome of registering one clause.
enum Registered {
  /// The clause is stored in a cell, pending a peer.
  Stored,
  /// The clause completed during registration.
  Immediate,
  /// The clause's channel is closed.
  Closed(ChannelClosed),
  /// The always-ready default clause.
  Default,
}

/// The type-erased face of one clause. `U` is the select's result type; the
/// channel's element type is hidden inside the implementation.
trait ClauseDyn<U>: Send {
  /// Identity of the clause's channel, for the uniqueness check. `None` for
  /// the default clause.
  fn channel_token(&self) -> Option<usize>;
  fn is_rendezvous(&self) -> bool;
  fn is_default(&self) -> bool {
    false
  }
  /// The channel's close reason when it is in the error state.
  fn channel_error(&self) -> Option<ChannelClosed>;
  fn register(&mut self, engine: &Arc<SelectCore>, clause_index: usize) -> Registered;
  /// Releases this clause's stored registration, if it still has one.
  fn cleanup(&mut self);
  /// Produces the clause's result. Only called on the winning clause, once.
  fn finish(&mut self) -> U;
}

/// One potential send or receive operation, for use with [`select`].
///
/// Clauses are built from a channel handle
/// ([`receive_clause`](Channel::receive_clause),
/// [`send_clause`](Channel::send_clause) and their transforming variants) or
/// by [`default_clause`]. A clause owns its channel handle and, for send
/// clauses, the value to transfer, and is consumed by the `select` call.
pub struct SelectClause<U> {
  inner: Box<dyn ClauseDyn<U>>,
}

struct ReceiveClauseState<T: Send, U> {
  channel: Channel<T>,
  transform: Option<Box<dyn FnOnce(T) -> U + Send>>,
  stored: Option<Arc<StoredSelect<T>>>,
  immediate: Option<T>,
}

impl<T: Send + 'static, U> ClauseDyn<U> for ReceiveClauseState<T, U> {
  fn channel_token(&self) -> Option<usize> {
    Some(Arc::as_ptr(&self.channel.core) as *const () as usize)
  }

  fn is_rendezvous(&self) -> bool {
    self.channel.core.is_rendezvous()
  }

  fn channel_error(&self) -> Option<ChannelClosed> {
    match self.channel.core.closed_for_send() {
      Some(reason @ ChannelClosed::Error(_)) => Some(reason),
      _ => None,
    }
  }

  fn register(&mut self, engine: &Arc<SelectCore>, clause_index: usize) -> Registered {
    use crate::channel::core::ReceiveOutcome;
    match self.channel.core.do_receive(Some((engine, clause_index)), None) {
      ReceiveOutcome::Received(value) => {
        self.immediate = Some(value);
        Registered::Immediate
      }
      ReceiveOutcome::Stored(stored) => {
        self.stored = Some(stored);
        Registered::Stored
      }
      ReceiveOutcome::Closed(reason) => Registered::Closed(reason),
      ReceiveOutcome::TimedOut => unreachable!("registration does not block"),
    }
  }

  fn cleanup(&mut self) {
    if let Some(stored) = self.stored.take() {
      self.channel.core.cleanup_stored(&stored);
    }
  }

  fn finish(&mut self) -> U {
    let value = self
      .immediate
      .take()
      .or_else(|| self.stored.take().and_then(|stored| stored.take_payload()))
      .expect("winning receive clause without a value");
    (self.transform.take().expect("clause finished twice"))(value)
  }
}

struct SendClauseState<T: Send, U> {
  channel: Channel<T>,
  value: Option<T>,
  callback: Option<Box<dyn FnOnce() -> U + Send>>,
  stored: Option<Arc<StoredSelect<T>>>,
}

impl<T: Send + 'static, U> ClauseDyn<U> for SendClauseState<T, U> {
  fn channel_token(&self) -> Option<usize> {
    Some(Arc::as_ptr(&self.channel.core) as *const () as usize)
  }

  fn is_rendezvous(&self) -> bool {
    self.channel.core.is_rendezvous()
  }

  fn channel_error(&self) -> Option<ChannelClosed> {
    match self.channel.core.closed_for_send() {
      Some(reason @ ChannelClosed::Error(_)) => Some(reason),
      _ => None,
    }
  }

  fn register(&mut self, engine: &Arc<SelectCore>, clause_index: usize) -> Registered {
    use crate::channel::core::SendOutcome;
    let value = self.value.take().expect("send clause registered without a value");
    match self.channel.core.do_send(value, Some((engine, clause_index)), None) {
      SendOutcome::Sent => Registered::Immediate,
      SendOutcome::Stored(stored) => {
        self.stored = Some(stored);
        Registered::Stored
      }
      SendOutcome::Closed { value, reason } => {
        self.value = Some(value);
        Registered::Closed(reason)
      }
      SendOutcome::TimedOut { .. } => unreachable!("registration does not block"),
    }
  }

  fn cleanup(&mut self) {
    if let Some(stored) = self.stored.take() {
      self.channel.core.cleanup_stored(&stored);
      // recover the unsent value so a re-registration can carry it again
      self.value = stored.take_payload();
    }
  }

  fn finish(&mut self) -> U {
    (self.callback.take().expect("clause finished twice"))()
  }
}

struct DefaultClauseState<U> {
  callback: Option<Box<dyn FnOnce() -> U + Send>>,
}

impl<U> ClauseDyn<U> for DefaultClauseState<U> {
  fn channel_token(&self) -> Option<usize> {
    None
  }

  fn is_rendezvous(&self) -> bool {
    true
  }

  fn is_default(&self) -> bool {
    true
  }

  fn channel_error(&self) -> Option<ChannelClosed> {
    None
  }

  fn register(&mut self, _engine: &Arc<SelectCore>, _clause_index: usize) -> Registered {
    Registered::Default
  }

  fn cleanup(&mut self) {}

  fn finish(&mut self) -> U {
    (self.callback.take().expect("clause finished twice"))()
  }
}

impl<U: 'static> SelectClause<U> {
  pub(crate) fn receive<T, F>(channel: Channel<T>, transform: F) -> Self
  where
    T: Send + 'static,
    F: FnOnce(T) -> U + Send + 'static,
  {
    SelectClause {
      inner: Box::new(ReceiveClauseState {
        channel,
        transform: Some(Box::new(transform)),
        stored: None,
        immediate: None,
      }),
    }
  }

  pub(crate) fn send<T, F>(channel: Channel<T>, value: T, callback: F) -> Self
  where
    T: Send + 'static,
    F: FnOnce() -> U + Send + 'static,
  {
    SelectClause {
      inner: Box::new(SendClauseState {
        channel,
        value: Some(value),
        callback: Some(Box::new(callback)),
        stored: None,
      }),
    }
  }

  /// Wraps the clause so its result arrives as `Some(..)`, leaving `None`
  /// free for the timeout clause of [`select_within`].
  fn map_some(self) -> SelectClause<Option<U>>
  where
    U: 'static,
  {
    SelectClause {
      inner: Box::new(MapSome { inner: self.inner }),
    }
  }
}

struct MapSome<U> {
  inner: Box<dyn ClauseDyn<U>>,
}

impl<U> ClauseDyn<Option<U>> for MapSome<U> {
  fn channel_token(&self) -> Option<usize> {
    self.inner.channel_token()
  }

  fn is_rendezvous(&self) -> bool {
    self.inner.is_rendezvous()
  }

  fn is_default(&self) -> bool {
    self.inner.is_default()
  }

  fn channel_error(&self) -> Option<ChannelClosed> {
    self.inner.channel_error()
  }

  fn register(&mut self, engine: &Arc<SelectCore>, clause_index: usize) -> Registered {
    self.inner.register(engine, clause_index)
  }

  fn cleanup(&mut self) {
    self.inner.cleanup()
  }

  fn finish(&mut self) -> Option<U> {
    Some(self.inner.finish())
  }
}

/// A clause that is always ready, yielding `value`. Selected only when no
/// earlier clause is immediately satisfiable; must be listed last.
///
/// This is the primitive behind `try_send` and `try_receive`.
pub fn default_clause<U: Send + 'static>(value: U) -> SelectClause<U> {
  default_clause_with(move || value)
}

/// A clause that is always ready, yielding the callback's result.
pub fn default_clause_with<U: 'static, F>(callback: F) -> SelectClause<U>
where
  F: FnOnce() -> U + Send + 'static,
{
  SelectClause {
    inner: Box::new(DefaultClauseState {
      callback: Some(Box::new(callback)),
    }),
  }
}

/// Selects exactly one clause to complete and returns its result.
///
/// Registers the clauses in order; among clauses immediately satisfiable,
/// the first listed wins. Otherwise the calling thread blocks until a peer
/// completes one of the registrations. When any clause's channel is closed,
/// the close reason is returned instead - a channel already in the error
/// state short-circuits the whole select, even when an earlier clause could
/// complete immediately.
///
/// # Panics
///
/// When `clauses` is empty or longer than 61 entries, when two clauses
/// refer to the same channel, or when a [`default_clause`] is not listed
/// last.
pub fn select<U>(clauses: Vec<SelectClause<U>>) -> Result<U, ChannelClosed> {
  assert!(!clauses.is_empty(), "select requires at least one clause");
  assert!(
    clauses.len() <= MAX_CLAUSES,
    "select supports at most {MAX_CLAUSES} clauses"
  );
  let mut clauses = clauses;

  // a channel already in error short-circuits: an immediately satisfiable
  // earlier clause must never mask a broken channel
  for clause in &clauses {
    if let Some(reason) = clause.inner.channel_error() {
      return Err(reason);
    }
  }

  // each clause must target a distinct channel; with a handful of clauses
  // the n^2 scan beats allocating a set
  let mut all_rendezvous = true;
  for i in 0..clauses.len() {
    if clauses[i].inner.is_default() && i != clauses.len() - 1 {
      panic!("the default clause must be listed last");
    }
    if let Some(a) = clauses[i].inner.channel_token() {
      for clause in &clauses[i + 1..] {
        if clause.inner.channel_token() == Some(a) {
          panic!("a channel may be used by at most one clause per select");
        }
      }
    }
    all_rendezvous &= clauses[i].inner.is_rendezvous();
  }

  let engine = Arc::new(SelectCore::new());
  let initial: Vec<usize> = (0..clauses.len()).collect();
  register_in_order(&engine, &mut clauses, initial);

  // rendezvous operations tend to resolve quickly, so when every clause is
  // one, spin briefly before parking
  let spin_budget = if all_rendezvous { backoff::spin_budget() } else { 0 };

  loop {
    match engine.load_state() {
      SelectState::Registering { reregister: 0 } => {
        // nothing pending: park this thread as the state so peers know
        // whom to wake
        if engine.try_park() {
          let mut spins = spin_budget;
          while engine.is_parked() {
            if spins > 0 {
              spins -= 1;
              backoff::spin_hint();
            } else {
              thread::park();
            }
          }
        }
      }
      SelectState::Registering { reregister } => {
        // peers tried to complete clauses mid-registration; redo those
        // registrations against fresh cells
        if engine.take_reregister(reregister) {
          trace!("select: re-registering clauses {reregister:#b}");
          let indices = (0..clauses.len()).filter(|i| reregister & (1u64 << *i) != 0).collect();
          register_in_order(&engine, &mut clauses, indices);
        }
      }
      SelectState::Parked => unreachable!("select owner observed itself parked"),
      SelectState::Won(winner) => {
        for (index, clause) in clauses.iter_mut().enumerate() {
          if index != winner {
            clause.inner.cleanup();
          }
        }
        // the transform runs last, after cleanup, in case it panics
        return Ok(clauses[winner].inner.finish());
      }
      SelectState::Closed => {
        for clause in clauses.iter_mut() {
          clause.inner.cleanup();
        }
        return Err(engine.closed_reason());
      }
    }
  }
}

/// Registers (or re-registers) the given clauses in listed order, stopping
/// at the first immediate winner or closed channel. Re-registered clauses
/// release their stale cell first.
fn register_in_order<U>(engine: &Arc<SelectCore>, clauses: &mut [SelectClause<U>], indices: Vec<usize>) {
  for index in indices {
    clauses[index].inner.cleanup();
    match clauses[index].inner.register(engine, index) {
      Registered::Stored => {}
      Registered::Closed(reason) => {
        engine.close_during_registration(reason);
        return;
      }
      // first-listed bias: stop registering the moment a clause completes
      Registered::Immediate | Registered::Default => {
        engine.select_immediately(index);
        return;
      }
    }
  }
}

/// Marker sent through the internal timer channel of [`select_within`].
struct TimerToken;

/// Like [`select`], but gives up once `timeout` elapses.
///
/// The timeout is a synthetic extra clause backed by a one-shot timer
/// channel, so it races the real clauses through the same atomic-winner
/// machinery - there is no polling loop.
///
/// # Panics
///
/// As [`select`], and when `timeout` is zero.
pub fn select_within<U>(timeout: Duration, clauses: Vec<SelectClause<U>>) -> Result<U, SelectTimeoutError>
where
  U: Send + 'static,
{
  assert!(!timeout.is_zero(), "select_within requires a positive timeout");

  let timer: Channel<TimerToken> = Channel::buffered(1);
  let cancelled = Arc::new(AtomicBool::new(false));
  let deadline = Instant::now() + timeout;

  let timer_thread = {
    let timer = timer.clone();
    let cancelled = Arc::clone(&cancelled);
    thread::spawn(move || {
      loop {
        if cancelled.load(Ordering::Acquire) {
          return;
        }
        let now = Instant::now();
        if now >= deadline {
          break;
        }
        thread::park_timeout(deadline - now);
      }
      let _ = timer.try_send(TimerToken);
    })
  };

  let mut wrapped: Vec<SelectClause<Option<U>>> = clauses.into_iter().map(SelectClause::map_some).collect();
  wrapped.push(timer.receive_clause_map(|_token| None));
  let result = select(wrapped);

  // wake the timer thread early and wait it out, so no helper outlives the
  // call
  cancelled.store(true, Ordering::Release);
  timer_thread.thread().unpark();
  let _ = timer_thread.join();

  match result {
    Ok(Some(value)) => Ok(value),
    Ok(None) => Err(SelectTimeoutError::Timeout),
    Err(reason) => Err(SelectTimeoutError::Closed(reason)),
  }
}
