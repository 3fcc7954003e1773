//! Select engine internals: the per-select state machine and the records a
//! registration leaves inside channel cells.
//!
//! A select instance moves through its life under one atomic state word.
//! During registration the word stays `Registering`; peers that would like
//! to complete a clause in that window cannot be granted the win (the
//! instance does not yet know all of its own registrations), so they flag
//! the clause for re-registration in a bitmask packed into the same word and
//! walk away as if the cell had been interrupted. After registration the
//! owner parks itself as the state; the first peer to CAS in a winning
//! clause (or a closed reason) owns the resolution and wakes the owner.
//! Terminal states never change again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::channel::segment::Segment;
use crate::error::ChannelClosed;

// State word layout: low 3 bits are the tag; the remaining bits carry the
// winning clause index (`WON`) or the bitmask of clauses awaiting
// re-registration (`REGISTERING`).
const TAG_MASK: u64 = 0b111;
const TAG_REGISTERING: u64 = 0;
const TAG_PARKED: u64 = 1;
const TAG_WON: u64 = 2;
const TAG_CLOSED: u64 = 3;
const PAYLOAD_SHIFT: u32 = 3;

/// Upper bound on the clauses of one `select`, imposed by the
/// re-registration bitmask sharing the state word.
pub(crate) const MAX_CLAUSES: usize = 61;

const REGISTERING_WORD: u64 = TAG_REGISTERING;
const PARKED_WORD: u64 = TAG_PARKED;
const CLOSED_WORD: u64 = TAG_CLOSED;

fn won_word(clause_index: usize) -> u64 {
  TAG_WON | ((clause_index as u64) << PAYLOAD_SHIFT)
}

/// A decoded view of the select state word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SelectState {
  /// Registration in progress; `reregister` flags clauses whose stored
  /// registration went stale and must be redone.
  Registering { reregister: u64 },
  /// The owner is parked, waiting for any state change.
  Parked,
  /// This clause won; never changes again.
  Won(usize),
  /// A clause's channel closed; never changes again.
  Closed,
}

pub(crate) struct SelectCore {
  state: AtomicU64,
  owner: Thread,
  closed_reason: OnceCell<ChannelClosed>,
}

impl SelectCore {
  pub(crate) fn new() -> Self {
    SelectCore {
      state: AtomicU64::new(REGISTERING_WORD),
      owner: thread::current(),
      closed_reason: OnceCell::new(),
    }
  }

  pub(crate) fn load_state(&self) -> SelectState {
    let word = self.state.load(Ordering::SeqCst);
    match word & TAG_MASK {
      TAG_REGISTERING => SelectState::Registering {
        reregister: word >> PAYLOAD_SHIFT,
      },
      TAG_PARKED => SelectState::Parked,
      TAG_WON => SelectState::Won((word >> PAYLOAD_SHIFT) as usize),
      _ => SelectState::Closed,
    }
  }

  /// Commits an immediate winner during registration. A plain store: while
  /// the word is `Registering` no peer can have won, so overwriting a
  /// concurrently set re-registration mask or closed reason is sound (and
  /// matches the bias rules - immediate selections take priority over a
  /// close that raced registration).
  pub(crate) fn select_immediately(&self, clause_index: usize) {
    self.state.store(won_word(clause_index), Ordering::SeqCst);
  }

  /// Records a closed channel discovered during registration.
  pub(crate) fn close_during_registration(&self, reason: ChannelClosed) {
    let _ = self.closed_reason.set(reason);
    self.state.store(CLOSED_WORD, Ordering::SeqCst);
  }

  /// Parks the owner as the state. Fails when a peer changed the state
  /// between the owner's last load and this call.
  pub(crate) fn try_park(&self) -> bool {
    self
      .state
      .compare_exchange(REGISTERING_WORD, PARKED_WORD, Ordering::SeqCst, Ordering::SeqCst)
      .is_ok()
  }

  pub(crate) fn is_parked(&self) -> bool {
    self.state.load(Ordering::SeqCst) == PARKED_WORD
  }

  /// Claims the pending re-registration mask, resetting the word to plain
  /// `Registering`. Fails when the state moved on concurrently.
  pub(crate) fn take_reregister(&self, observed_mask: u64) -> bool {
    let observed = TAG_REGISTERING | (observed_mask << PAYLOAD_SHIFT);
    self
      .state
      .compare_exchange(observed, REGISTERING_WORD, Ordering::SeqCst, Ordering::SeqCst)
      .is_ok()
  }

  /// Peer callback: try to commit `clause_index` as the winner.
  ///
  /// Succeeds only from the parked state. During registration the clause is
  /// flagged for re-registration instead and the peer fails, exactly as if
  /// the cell had been interrupted. After a winner or a close the peer
  /// fails too and retries against a fresh cell.
  pub(crate) fn try_select(&self, clause_index: usize) -> bool {
    loop {
      let word = self.state.load(Ordering::SeqCst);
      match word & TAG_MASK {
        TAG_REGISTERING => {
          let flagged = word | (1 << (clause_index as u64 + PAYLOAD_SHIFT as u64));
          if self
            .state
            .compare_exchange(word, flagged, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
          {
            return false;
          }
        }
        TAG_PARKED => {
          if self
            .state
            .compare_exchange(word, won_word(clause_index), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
          {
            self.owner.unpark();
            return true;
          }
        }
        // already won or closed; the cleanup pass owns the leftovers
        _ => return false,
      }
    }
  }

  /// Peer callback: a clause's channel closed while this select was
  /// pending. The first close reason wins; a select that already has a
  /// winner is left alone.
  pub(crate) fn channel_closed(&self, reason: &ChannelClosed) {
    loop {
      let word = self.state.load(Ordering::SeqCst);
      match word & TAG_MASK {
        TAG_REGISTERING | TAG_PARKED => {
          let _ = self.closed_reason.set(reason.clone());
          if self
            .state
            .compare_exchange(word, CLOSED_WORD, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
          {
            if word & TAG_MASK == TAG_PARKED {
              self.owner.unpark();
            }
            return;
          }
        }
        _ => return,
      }
    }
  }

  pub(crate) fn closed_reason(&self) -> ChannelClosed {
    self
      .closed_reason
      .get()
      .cloned()
      .expect("select resolved as closed without a reason")
  }
}

/// The record a select registration leaves inside a channel cell while it
/// awaits a peer (the `Registered` cell states).
///
/// The explicit alignment keeps the low bits of the `Arc` data pointer free
/// for the cell tag.
#[repr(align(8))]
pub(crate) struct StoredSelect<T> {
  select: Arc<SelectCore>,
  clause_index: usize,
  segment: Arc<Segment<T>>,
  cell_index: usize,
  is_sender: bool,
  /// Value transport, like a waiter's slot: a registered send clause parks
  /// its outgoing value here; a peer completing a registered receive clause
  /// deposits the value here before calling `try_select`, and takes it back
  /// if the select refuses the win.
  payload: Mutex<Option<T>>,
}

impl<T: Send> StoredSelect<T> {
  pub(crate) fn new(
    select: Arc<SelectCore>,
    clause_index: usize,
    segment: Arc<Segment<T>>,
    cell_index: usize,
    is_sender: bool,
    payload: Option<T>,
  ) -> Self {
    StoredSelect {
      select,
      clause_index,
      segment,
      cell_index,
      is_sender,
      payload: Mutex::new(payload),
    }
  }

  pub(crate) fn select(&self) -> &SelectCore {
    &self.select
  }

  pub(crate) fn clause_index(&self) -> usize {
    self.clause_index
  }

  pub(crate) fn segment(&self) -> &Arc<Segment<T>> {
    &self.segment
  }

  pub(crate) fn cell_index(&self) -> usize {
    self.cell_index
  }

  pub(crate) fn is_sender(&self) -> bool {
    self.is_sender
  }

  pub(crate) fn put_payload(&self, value: T) {
    *self.payload.lock() = Some(value);
  }

  pub(crate) fn take_payload(&self) -> Option<T> {
    self.payload.lock().take()
  }
}
