//! Cell state words: the per-slot state machine.
//!
//! Every cell is a single `AtomicUsize`. Payload-free states are small
//! sentinel constants; payload-carrying states are heap pointers with the
//! kind encoded in the low three bits, so a cell's state can be inspected
//! without dereferencing anything. All transitions are compare-and-swaps over
//! the whole word, which is what makes "at most one winner per transition"
//! hold: two threads can never both succeed in moving a cell out of the same
//! prior state.
//!
//! Ownership discipline: a payload pointer is dereferenced only by the thread
//! that removed it from the cell, either by claiming it (CAS to `RESUMING`)
//! or by swapping in a terminal sentinel. Everyone else sees tags.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::internal::waiter::Waiter;
use crate::select::instance::StoredSelect;

// Payload-free cell states. All have zero tag bits and values far below any
// heap address. `EMPTY` doubles as the all-zeroes initial word, so fresh
// segments need no initialization pass.
pub(crate) const EMPTY: usize = 0;
/// The cell was claimed as buffer space before a sender arrived.
pub(crate) const IN_BUFFER: usize = 1 << 3;
/// A value was handed off and consumed here.
pub(crate) const DONE: usize = 2 << 3;
/// A receiver poisoned the cell after finding its sender not yet arrived.
pub(crate) const BROKEN: usize = 3 << 3;
/// A peer claimed the cell's payload and is resolving it.
pub(crate) const RESUMING: usize = 4 << 3;
/// The sender that reserved this cell gave up; the cell is permanently dead.
pub(crate) const INTERRUPTED_SEND: usize = 5 << 3;
/// The receiver that reserved this cell gave up; the cell is permanently dead.
pub(crate) const INTERRUPTED_RECEIVE: usize = 6 << 3;
/// The channel closed before this cell could be used.
pub(crate) const CLOSED: usize = 7 << 3;

const TAG_MASK: usize = 0b111;
const TAG_WAITING_SENDER: usize = 1;
const TAG_WAITING_RECEIVER: usize = 2;
const TAG_BUFFERED: usize = 3;
const TAG_SELECT_SENDER: usize = 4;
const TAG_SELECT_RECEIVER: usize = 5;

/// A decoded, payload-free view of a cell word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum CellTag {
  Empty,
  InBuffer,
  Done,
  Broken,
  Resuming,
  InterruptedSend,
  InterruptedReceive,
  Closed,
  WaitingSender,
  WaitingReceiver,
  Buffered,
  SelectSender,
  SelectReceiver,
}

pub(crate) fn tag_of(word: usize) -> CellTag {
  match word & TAG_MASK {
    TAG_WAITING_SENDER => CellTag::WaitingSender,
    TAG_WAITING_RECEIVER => CellTag::WaitingReceiver,
    TAG_BUFFERED => CellTag::Buffered,
    TAG_SELECT_SENDER => CellTag::SelectSender,
    TAG_SELECT_RECEIVER => CellTag::SelectReceiver,
    _ => match word {
      EMPTY => CellTag::Empty,
      IN_BUFFER => CellTag::InBuffer,
      DONE => CellTag::Done,
      BROKEN => CellTag::Broken,
      RESUMING => CellTag::Resuming,
      INTERRUPTED_SEND => CellTag::InterruptedSend,
      INTERRUPTED_RECEIVE => CellTag::InterruptedReceive,
      CLOSED => CellTag::Closed,
      other => unreachable!("corrupt cell word: {other:#x}"),
    },
  }
}

/// A payload taken out of a cell. Whoever holds one of these owns it.
pub(crate) enum CellPayload<T> {
  WaitingSender(Arc<Waiter<T>>),
  WaitingReceiver(Arc<Waiter<T>>),
  Buffered(T),
  SelectSender(Arc<StoredSelect<T>>),
  SelectReceiver(Arc<StoredSelect<T>>),
}

/// Box payload for `Buffered` cells. The explicit alignment keeps the low
/// pointer bits free for the tag even when `T` is a small type.
#[repr(align(8))]
struct BufferedBox<T>(T);

fn encode_waiter<T>(waiter: Arc<Waiter<T>>, is_sender: bool) -> usize {
  let ptr = Arc::into_raw(waiter) as usize;
  debug_assert_eq!(ptr & TAG_MASK, 0, "waiter allocation not 8-aligned");
  ptr
    | if is_sender {
      TAG_WAITING_SENDER
    } else {
      TAG_WAITING_RECEIVER
    }
}

fn encode_select<T>(stored: Arc<StoredSelect<T>>, is_sender: bool) -> usize {
  let ptr = Arc::into_raw(stored) as usize;
  debug_assert_eq!(ptr & TAG_MASK, 0, "stored clause allocation not 8-aligned");
  ptr
    | if is_sender {
      TAG_SELECT_SENDER
    } else {
      TAG_SELECT_RECEIVER
    }
}

fn encode_buffered<T>(value: T) -> usize {
  let ptr = Box::into_raw(Box::new(BufferedBox(value))) as usize;
  debug_assert_eq!(ptr & TAG_MASK, 0, "buffered allocation not 8-aligned");
  ptr | TAG_BUFFERED
}

/// Reconstructs ownership of the payload a word points to.
///
/// # Safety
///
/// The caller must be the thread that removed `word` from its cell (or hold
/// the cell exclusively, as in `Drop`); each removed word is decoded at most
/// once.
unsafe fn decode_owned<T>(word: usize) -> Option<CellPayload<T>> {
  let ptr = word & !TAG_MASK;
  match word & TAG_MASK {
    TAG_WAITING_SENDER => Some(CellPayload::WaitingSender(Arc::from_raw(ptr as *const Waiter<T>))),
    TAG_WAITING_RECEIVER => Some(CellPayload::WaitingReceiver(Arc::from_raw(ptr as *const Waiter<T>))),
    TAG_BUFFERED => Some(CellPayload::Buffered(Box::from_raw(ptr as *mut BufferedBox<T>).0)),
    TAG_SELECT_SENDER => Some(CellPayload::SelectSender(Arc::from_raw(ptr as *const StoredSelect<T>))),
    TAG_SELECT_RECEIVER => Some(CellPayload::SelectReceiver(Arc::from_raw(
      ptr as *const StoredSelect<T>,
    ))),
    _ => None,
  }
}

/// One slot of the logical infinite array backing a channel.
pub(crate) struct CellSlot<T> {
  word: AtomicUsize,
  _marker: PhantomData<T>,
}

impl<T> CellSlot<T> {
  pub(crate) fn new() -> Self {
    CellSlot {
      word: AtomicUsize::new(EMPTY),
      _marker: PhantomData,
    }
  }

  pub(crate) fn load(&self) -> usize {
    self.word.load(Ordering::SeqCst)
  }

  /// Installs a parked waiter over `expected` (`EMPTY` or `IN_BUFFER`).
  /// The caller keeps its own `Arc` to the waiter; the cell takes a clone.
  pub(crate) fn install_waiter(&self, expected: usize, waiter: Arc<Waiter<T>>, is_sender: bool) -> bool {
    debug_assert_eq!(expected & TAG_MASK, 0);
    let word = encode_waiter(waiter, is_sender);
    if self
      .word
      .compare_exchange(expected, word, Ordering::SeqCst, Ordering::SeqCst)
      .is_ok()
    {
      true
    } else {
      // Safety: the encoded clone never became visible to anyone else.
      unsafe { drop(decode_owned::<T>(word)) };
      false
    }
  }

  /// Installs a stored select clause over `expected` (`EMPTY` or `IN_BUFFER`).
  pub(crate) fn install_select(&self, expected: usize, stored: Arc<StoredSelect<T>>, is_sender: bool) -> bool {
    debug_assert_eq!(expected & TAG_MASK, 0);
    let word = encode_select(stored, is_sender);
    if self
      .word
      .compare_exchange(expected, word, Ordering::SeqCst, Ordering::SeqCst)
      .is_ok()
    {
      true
    } else {
      // Safety: the encoded clone never became visible to anyone else.
      unsafe { drop(decode_owned::<T>(word)) };
      false
    }
  }

  /// Installs a buffered value over `expected` (`EMPTY` or `IN_BUFFER`).
  /// Hands the value back on a lost race.
  pub(crate) fn install_buffered(&self, expected: usize, value: T) -> Result<(), T> {
    debug_assert_eq!(expected & TAG_MASK, 0);
    let word = encode_buffered(value);
    if self
      .word
      .compare_exchange(expected, word, Ordering::SeqCst, Ordering::SeqCst)
      .is_ok()
    {
      Ok(())
    } else {
      // Safety: the freshly boxed value never became visible to anyone else.
      match unsafe { decode_owned::<T>(word) } {
        Some(CellPayload::Buffered(value)) => Err(value),
        _ => unreachable!("buffered word decoded to a different payload"),
      }
    }
  }

  /// CAS between two payload-free states, e.g. `EMPTY -> BROKEN`.
  pub(crate) fn cas_sentinel(&self, expected: usize, to: usize) -> bool {
    debug_assert_eq!(expected & TAG_MASK, 0);
    debug_assert_eq!(to & TAG_MASK, 0);
    self
      .word
      .compare_exchange(expected, to, Ordering::SeqCst, Ordering::SeqCst)
      .is_ok()
  }

  /// Claims the payload behind the observed `expected` word by moving the
  /// cell to `RESUMING`. On success the caller owns the payload and is
  /// responsible for writing the cell's final state (or leaving that to the
  /// loser-side protocol it runs next).
  pub(crate) fn claim(&self, expected: usize) -> Option<CellPayload<T>> {
    debug_assert_ne!(expected & TAG_MASK, 0, "claim of a payload-free state");
    if self
      .word
      .compare_exchange(expected, RESUMING, Ordering::SeqCst, Ordering::SeqCst)
      .is_ok()
    {
      // Safety: the CAS transferred the payload out of the cell; this
      // thread is its sole owner now.
      unsafe { decode_owned(expected) }
    } else {
      None
    }
  }

  /// Moves a `Buffered` cell directly to a terminal sentinel, returning the
  /// value. `None` when a concurrent transition (e.g. an error close
  /// discarding the buffer) won the race.
  pub(crate) fn take_buffered(&self, expected: usize, to: usize) -> Option<T> {
    debug_assert_eq!(expected & TAG_MASK, TAG_BUFFERED);
    debug_assert_eq!(to & TAG_MASK, 0);
    if self
      .word
      .compare_exchange(expected, to, Ordering::SeqCst, Ordering::SeqCst)
      .is_ok()
    {
      // Safety: the CAS transferred the box out of the cell.
      match unsafe { decode_owned(expected) } {
        Some(CellPayload::Buffered(value)) => Some(value),
        _ => unreachable!("buffered word decoded to a different payload"),
      }
    } else {
      None
    }
  }

  /// Writes a final sentinel over a cell this thread has claimed.
  pub(crate) fn finalize(&self, sentinel: usize) {
    debug_assert_eq!(sentinel & TAG_MASK, 0);
    debug_assert_eq!(self.word.load(Ordering::Relaxed), RESUMING);
    self.word.store(sentinel, Ordering::SeqCst);
  }

  /// Buffers a value into a cell this thread has claimed (buffer expansion
  /// resuming a parked sender).
  pub(crate) fn finalize_buffered(&self, value: T) {
    debug_assert_eq!(self.word.load(Ordering::Relaxed), RESUMING);
    self.word.store(encode_buffered(value), Ordering::SeqCst);
  }

  /// Swaps in a terminal sentinel, reclaiming whatever payload the cell
  /// still held. Used by the interruption and cleanup paths, which own the
  /// cell's resolution but may race a claimer that already emptied it.
  pub(crate) fn swap_terminal(&self, sentinel: usize) {
    debug_assert_eq!(sentinel & TAG_MASK, 0);
    let old = self.word.swap(sentinel, Ordering::SeqCst);
    // Safety: the swap removed the payload, if any was still installed.
    unsafe { drop(decode_owned::<T>(old)) };
  }
}

impl<T> Drop for CellSlot<T> {
  fn drop(&mut self) {
    let word = *self.word.get_mut();
    // Safety: exclusive access during drop; the final payload is reclaimed
    // exactly once here.
    unsafe { drop(decode_owned::<T>(word)) };
  }
}
