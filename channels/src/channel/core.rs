//! The core shared state and cell-level state machines of a channel.
//!
//! Based on the "fast and scalable channels" design: every `send` and
//! `receive` reserves a globally unique cell index from its monotonic
//! counter, locates the owning segment through the shared segment
//! references, and then drives that one cell's state machine to completion.
//! There is no lock anywhere on these paths; cross-thread agreement is
//! reached exclusively through whole-word CAS on cells, counters and
//! segment links.
//!
//! Buffered channels run a third counter, the buffer end: every completed
//! receive probes one cell ahead and pre-claims it as buffer space
//! (`IN_BUFFER`) or resumes a parked sender into a buffered value, which is
//! what lets the next `send` skip suspension entirely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_utils::CachePadded;
use log::debug;
use once_cell::sync::OnceCell;

use crate::channel::cell::{self, CellPayload, CellTag};
use crate::channel::segment::{self, Segment, SegmentArena, SEGMENT_SIZE};
use crate::error::ChannelClosed;
use crate::internal::backoff;
use crate::internal::waiter::{Awaited, Waiter};
use crate::select::instance::{SelectCore, StoredSelect};

/// The closed flag packed into the top bit of the senders counter, so that
/// raising it and reserving send indices are one atomic domain.
const SENDERS_CLOSED_FLAG: u64 = 1 << 63;
const SENDERS_COUNTER_MASK: u64 = SENDERS_CLOSED_FLAG - 1;

fn senders_counter(word: u64) -> u64 {
  word & SENDERS_COUNTER_MASK
}

fn senders_closed(word: u64) -> bool {
  word & SENDERS_CLOSED_FLAG != 0
}

/// Channel capacity mode.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Mode {
  /// Capacity zero: senders and receivers must meet.
  Rendezvous,
  /// Fixed positive capacity.
  Buffered(usize),
  /// Never blocks a sender.
  Unbounded,
}

/// Identifies the select this operation registers for, instead of parking.
pub(crate) type SelectContext<'a> = (&'a Arc<SelectCore>, usize);

/// Outcome of [`ChannelCore::do_send`].
pub(crate) enum SendOutcome<T> {
  /// The value was handed off, buffered, or eliminated.
  Sent,
  /// The channel is closed; the value comes back to the caller.
  Closed { value: T, reason: ChannelClosed },
  /// The deadline elapsed while parked; the value comes back.
  TimedOut { value: T },
  /// Select mode: the clause was stored, pending a peer.
  Stored(Arc<StoredSelect<T>>),
}

/// Outcome of [`ChannelCore::do_receive`].
pub(crate) enum ReceiveOutcome<T> {
  Received(T),
  Closed(ChannelClosed),
  TimedOut,
  /// Select mode: the clause was stored, pending a peer.
  Stored(Arc<StoredSelect<T>>),
}

enum UpdateSend<T> {
  /// Parked and later resumed by a receiver or by buffer expansion.
  Awaited,
  /// Placed into the cell without suspension.
  Buffered,
  /// Resumed a waiting receiver directly.
  Resumed,
  /// The cell is dead (broken or interrupted receiver); retry fresh.
  Failed(T),
  Closed(T),
  TimedOut(T),
  Stored(Arc<StoredSelect<T>>),
}

enum UpdateReceive<T> {
  Received(T),
  /// The cell is dead; retry with a fresh index.
  Failed,
  Closed,
  TimedOut,
  Stored(Arc<StoredSelect<T>>),
}

enum UpdateExpand {
  /// The cell is covered: pre-claimed, already buffered, or already paired.
  Done,
  /// An interrupted sender; account for it and probe the next cell.
  Failed,
  Closed,
}

pub(crate) struct ChannelCore<T> {
  pub(crate) mode: Mode,
  /// Total `send` reservations ever made, plus the closed flag.
  senders: CachePadded<AtomicU64>,
  /// Total `receive` reservations ever made.
  receivers: CachePadded<AtomicU64>,
  /// Buffered mode only: the end of the window of cells a sender may fill
  /// without suspending.
  buffer_end: CachePadded<AtomicU64>,
  /// Shared segment references (segment ids), advanced through the
  /// reference-counted protocol in `segment::move_forward`.
  send_segment: AtomicU64,
  receive_segment: AtomicU64,
  buffer_end_segment: AtomicU64,
  pub(crate) arena: SegmentArena<T>,
  /// Write-once close reason; always set before the closed flag is raised.
  closed: OnceCell<ChannelClosed>,
  /// The senders counter frozen at the moment the closed flag was raised.
  /// `u64::MAX` while open.
  senders_at_close: AtomicU64,
}

impl<T: Send> ChannelCore<T> {
  pub(crate) fn new(mode: Mode) -> Self {
    let buffered = matches!(mode, Mode::Buffered(_));
    // rendezvous/unbounded channels never expand a buffer, so only the send
    // and receive references count against the first segment
    let initial_pointers = if buffered { 3 } else { 2 };
    let (arena, _first) = SegmentArena::new(buffered, initial_pointers);
    ChannelCore {
      mode,
      senders: CachePadded::new(AtomicU64::new(0)),
      receivers: CachePadded::new(AtomicU64::new(0)),
      buffer_end: CachePadded::new(AtomicU64::new(match mode {
        Mode::Buffered(capacity) => capacity as u64,
        _ => 0,
      })),
      send_segment: AtomicU64::new(0),
      receive_segment: AtomicU64::new(0),
      buffer_end_segment: AtomicU64::new(0),
      arena,
      closed: OnceCell::new(),
      senders_at_close: AtomicU64::new(u64::MAX),
    }
  }

  pub(crate) fn is_rendezvous(&self) -> bool {
    self.mode == Mode::Rendezvous
  }

  fn reason(&self) -> ChannelClosed {
    self
      .closed
      .get()
      .cloned()
      .expect("closed flag observed without a reason")
  }

  /// Resolves a shared segment reference to an owned handle. The reference
  /// can advance (and the old segment leave the arena) between the two
  /// reads, in which case the fresh id is retried.
  fn current_segment(&self, reference: &AtomicU64) -> Arc<Segment<T>> {
    loop {
      let id = reference.load(Ordering::SeqCst);
      if let Some(segment) = self.arena.get(id) {
        return segment;
      }
      backoff::spin_hint();
    }
  }

  // *******
  // Sending
  // *******

  /// Reserves a send index and drives its cell to completion. In select
  /// mode (`select` is `Some`) the operation never parks: it stores the
  /// clause in the cell instead.
  pub(crate) fn do_send(
    &self,
    value: T,
    select: Option<SelectContext<'_>>,
    deadline: Option<Instant>,
  ) -> SendOutcome<T> {
    let mut value = value;
    loop {
      // reading the segment before the counter increment - needed to locate
      // the reserved cell's segment afterwards
      let mut segment = self.current_segment(&self.send_segment);
      let word = self.senders.fetch_add(1, Ordering::SeqCst);
      if senders_closed(word) {
        return SendOutcome::Closed {
          value,
          reason: self.reason(),
        };
      }
      let s = senders_counter(word);

      let id = s / SEGMENT_SIZE as u64;
      let index = (s % SEGMENT_SIZE as u64) as usize;

      if segment.id() != id {
        segment = match segment::find_and_move_forward(&self.arena, &self.send_segment, segment, id) {
          Some(segment) => segment,
          // the chain is closed and `s` falls beyond its end
          None => {
            return SendOutcome::Closed {
              value,
              reason: self.reason(),
            }
          }
        };
        if segment.id() != id {
          // the reserved cell's segment was removed wholesale; skip all of
          // its interrupted cells and reserve a fresh index
          let _ = self.senders.compare_exchange(
            s + 1,
            segment.id() * SEGMENT_SIZE as u64,
            Ordering::SeqCst,
            Ordering::SeqCst,
          );
          continue;
        }
      }

      match self.update_cell_send(&segment, index, s, value, select, deadline) {
        // not clearing the previous link: the cell might still take part in
        // buffering
        UpdateSend::Awaited | UpdateSend::Buffered => return SendOutcome::Sent,
        UpdateSend::Resumed => {
          // we resumed a receiver, so every earlier cell has been passed
          segment.clean_prev();
          return SendOutcome::Sent;
        }
        UpdateSend::Failed(v) => {
          // broken or interrupted-receiver cell; a receiver has been there,
          // so earlier segments are no longer needed
          segment.clean_prev();
          value = v;
        }
        UpdateSend::Closed(v) => {
          return SendOutcome::Closed {
            value: v,
            reason: self.reason(),
          }
        }
        UpdateSend::TimedOut(v) => return SendOutcome::TimedOut { value: v },
        UpdateSend::Stored(stored) => return SendOutcome::Stored(stored),
      }
    }
  }

  fn update_cell_send(
    &self,
    segment: &Arc<Segment<T>>,
    index: usize,
    s: u64,
    mut value: T,
    select: Option<SelectContext<'_>>,
    deadline: Option<Instant>,
  ) -> UpdateSend<T> {
    let cell = segment.cell(index);
    loop {
      let word = cell.load();
      match cell::tag_of(word) {
        CellTag::Empty | CellTag::InBuffer => {
          let must_suspend = word == cell::EMPTY
            && match self.mode {
              Mode::Unbounded => false,
              Mode::Rendezvous => s >= self.receivers.load(Ordering::SeqCst),
              Mode::Buffered(_) => {
                s >= self.buffer_end.load(Ordering::SeqCst) && s >= self.receivers.load(Ordering::SeqCst)
              }
            };
          if must_suspend {
            // no receiver and no free buffer slot
            if let Some((engine, clause_index)) = select {
              let stored = Arc::new(StoredSelect::new(
                Arc::clone(engine),
                clause_index,
                Arc::clone(segment),
                index,
                true,
                Some(value),
              ));
              if cell.install_select(word, Arc::clone(&stored), true) {
                return UpdateSend::Stored(stored);
              }
              value = stored.take_payload().expect("unpublished clause lost its value");
            } else {
              let waiter = Arc::new(Waiter::new_sender(value));
              if cell.install_waiter(word, Arc::clone(&waiter), true) {
                return match waiter.await_resolution(&self.arena, segment, index, deadline) {
                  Awaited::Resumed(_) => UpdateSend::Awaited,
                  Awaited::Closed => {
                    UpdateSend::Closed(waiter.take_payload().expect("closed sender lost its value"))
                  }
                  Awaited::TimedOut => {
                    UpdateSend::TimedOut(waiter.take_payload().expect("timed-out sender lost its value"))
                  }
                };
              }
              value = waiter.take_payload().expect("unpublished waiter lost its value");
            }
          } else {
            // a receiver is in progress, or the cell is inside the buffer
            // window: store the value without suspending (elimination)
            match cell.install_buffered(word, value) {
              Ok(()) => return UpdateSend::Buffered,
              Err(v) => value = v,
            }
          }
        }
        CellTag::WaitingReceiver => {
          // a receiver is parked here; claim the cell, then hand over
          match cell.claim(word) {
            Some(CellPayload::WaitingReceiver(waiter)) => match waiter.try_resume_receiver(value) {
              Ok(()) => {
                cell.finalize(cell::DONE);
                segment.cell_consumed(&self.arena);
                return UpdateSend::Resumed;
              }
              Err(v) => {
                // the receiver timed out; it writes the final cell state
                return UpdateSend::Failed(v);
              }
            },
            Some(_) => unreachable!("claim returned a payload of a different kind"),
            None => {}
          }
        }
        CellTag::SelectReceiver => {
          // a receive clause is registered here; claim, then ask its select
          match cell.claim(word) {
            Some(CellPayload::SelectReceiver(stored)) => {
              stored.put_payload(value);
              if stored.select().try_select(stored.clause_index()) {
                cell.finalize(cell::DONE);
                segment.cell_consumed(&self.arena);
                return UpdateSend::Resumed;
              }
              let v = stored.take_payload().expect("unselected clause kept the payload");
              // the select's cleanup writes the final cell state
              return UpdateSend::Failed(v);
            }
            Some(_) => unreachable!("claim returned a payload of a different kind"),
            None => {}
          }
        }
        CellTag::InterruptedReceive | CellTag::Broken => {
          // the cell is dead; retry with a fresh index
          return UpdateSend::Failed(value);
        }
        CellTag::Resuming => backoff::spin_hint(), // close is resolving this cell
        CellTag::Closed => return UpdateSend::Closed(value),
        state => unreachable!("send observed {state:?} in its own cell"),
      }
    }
  }

  // *********
  // Receiving
  // *********

  /// Reserves a receive index and drives its cell to completion. In select
  /// mode the operation never parks.
  pub(crate) fn do_receive(
    &self,
    select: Option<SelectContext<'_>>,
    deadline: Option<Instant>,
  ) -> ReceiveOutcome<T> {
    loop {
      let mut segment = self.current_segment(&self.receive_segment);
      let r = self.receivers.fetch_add(1, Ordering::SeqCst);

      let id = r / SEGMENT_SIZE as u64;
      let index = (r % SEGMENT_SIZE as u64) as usize;

      if segment.id() != id {
        segment = match segment::find_and_move_forward(&self.arena, &self.receive_segment, segment, id) {
          Some(segment) => segment,
          None => return ReceiveOutcome::Closed(self.reason()),
        };
        if segment.id() != id {
          // skip all the interrupted cells of the removed segment
          let _ = self.receivers.compare_exchange(
            r + 1,
            segment.id() * SEGMENT_SIZE as u64,
            Ordering::SeqCst,
            Ordering::SeqCst,
          );
          continue;
        }
      }

      match self.update_cell_receive(&segment, index, r, select, deadline) {
        UpdateReceive::Received(value) => {
          // a sender has certainly been at this cell, so earlier segments
          // are no longer needed
          segment.clean_prev();
          return ReceiveOutcome::Received(value);
        }
        UpdateReceive::Failed => {
          segment.clean_prev();
          // retry with a fresh index
        }
        UpdateReceive::Closed => return ReceiveOutcome::Closed(self.reason()),
        UpdateReceive::TimedOut => return ReceiveOutcome::TimedOut,
        UpdateReceive::Stored(stored) => return ReceiveOutcome::Stored(stored),
      }
    }
  }

  fn update_cell_receive(
    &self,
    segment: &Arc<Segment<T>>,
    index: usize,
    r: u64,
    select: Option<SelectContext<'_>>,
    deadline: Option<Instant>,
  ) -> UpdateReceive<T> {
    let cell = segment.cell(index);
    loop {
      let word = cell.load();
      match cell::tag_of(word) {
        CellTag::Empty | CellTag::InBuffer => {
          if r >= senders_counter(self.senders.load(Ordering::SeqCst)) {
            // no sender has reached this cell yet
            if let Some((engine, clause_index)) = select {
              let stored = Arc::new(StoredSelect::new(
                Arc::clone(engine),
                clause_index,
                Arc::clone(segment),
                index,
                false,
                None,
              ));
              if cell.install_select(word, Arc::clone(&stored), false) {
                self.expand_buffer();
                return UpdateReceive::Stored(stored);
              }
            } else {
              let waiter = Arc::new(Waiter::new_receiver());
              if cell.install_waiter(word, Arc::clone(&waiter), false) {
                self.expand_buffer();
                return match waiter.await_resolution(&self.arena, segment, index, deadline) {
                  Awaited::Resumed(value) => {
                    UpdateReceive::Received(value.expect("receiver resumed without a value"))
                  }
                  Awaited::Closed => UpdateReceive::Closed,
                  Awaited::TimedOut => UpdateReceive::TimedOut,
                };
              }
            }
          } else {
            // a sender is in progress but has not reached this cell;
            // poison it to force both sides onto fresh indices
            if cell.cas_sentinel(word, cell::BROKEN) {
              segment.cell_consumed(&self.arena);
              self.expand_buffer();
              return UpdateReceive::Failed;
            }
          }
        }
        CellTag::WaitingSender => {
          // a sender is parked here; claim the cell, then take its value
          match cell.claim(word) {
            Some(CellPayload::WaitingSender(waiter)) => match waiter.try_resume_sender() {
              Some(value) => {
                cell.finalize(cell::DONE);
                segment.cell_consumed(&self.arena);
                self.expand_buffer();
                return UpdateReceive::Received(value);
              }
              // the sender timed out; it writes the final cell state
              None => return UpdateReceive::Failed,
            },
            Some(_) => unreachable!("claim returned a payload of a different kind"),
            None => {}
          }
        }
        CellTag::SelectSender => {
          match cell.claim(word) {
            Some(CellPayload::SelectSender(stored)) => {
              if stored.select().try_select(stored.clause_index()) {
                let value = stored.take_payload().expect("selected send clause without a value");
                cell.finalize(cell::DONE);
                segment.cell_consumed(&self.arena);
                self.expand_buffer();
                return UpdateReceive::Received(value);
              }
              // the select's cleanup writes the final cell state
              return UpdateReceive::Failed;
            }
            Some(_) => unreachable!("claim returned a payload of a different kind"),
            None => {}
          }
        }
        CellTag::Buffered => match cell.take_buffered(word, cell::DONE) {
          Some(value) => {
            segment.cell_consumed(&self.arena);
            self.expand_buffer();
            return UpdateReceive::Received(value);
          }
          // lost to an error close discarding the buffer; reread
          None => {}
        },
        CellTag::InterruptedSend => return UpdateReceive::Failed,
        CellTag::Resuming => backoff::spin_hint(), // buffer expansion or close is resolving the cell
        CellTag::Closed => return UpdateReceive::Closed,
        state => unreachable!("receive observed {state:?} in its own cell"),
      }
    }
  }

  // ****************
  // Buffer expansion
  // ****************

  /// Invariant maintained together with `receive`: between the receive
  /// counter and the buffer end, the number of cells that can accept a
  /// sender without suspension equals the capacity.
  fn expand_buffer(&self) {
    if !matches!(self.mode, Mode::Buffered(_)) {
      return;
    }
    loop {
      let mut segment = self.current_segment(&self.buffer_end_segment);
      let b = self.buffer_end.fetch_add(1, Ordering::SeqCst);

      let id = b / SEGMENT_SIZE as u64;
      let index = (b % SEGMENT_SIZE as u64) as usize;

      if segment.id() != id {
        segment = match segment::find_and_move_forward(&self.arena, &self.buffer_end_segment, segment, id) {
          Some(segment) => segment,
          // the chain is closed; nowhere to expand
          None => return,
        };
        if segment.id() != id {
          let _ = self.buffer_end.compare_exchange(
            b + 1,
            segment.id() * SEGMENT_SIZE as u64,
            Ordering::SeqCst,
            Ordering::SeqCst,
          );
          // the removed segment's cells were already expanded over
          return;
        }
      }

      match self.update_cell_expand(&segment, index) {
        UpdateExpand::Done | UpdateExpand::Closed => return,
        UpdateExpand::Failed => {
          // an interrupted sender: the cell is now fully processed; probe
          // the next one
          segment.cell_processed(&self.arena);
        }
      }
    }
  }

  fn update_cell_expand(&self, segment: &Arc<Segment<T>>, index: usize) -> UpdateExpand {
    let cell = segment.cell(index);
    loop {
      let word = cell.load();
      match cell::tag_of(word) {
        CellTag::WaitingSender => {
          // resume the parked sender and turn its value into buffer content
          match cell.claim(word) {
            Some(CellPayload::WaitingSender(waiter)) => match waiter.try_resume_sender() {
              Some(value) => {
                cell.finalize_buffered(value);
                return UpdateExpand::Done;
              }
              None => return UpdateExpand::Failed,
            },
            Some(_) => unreachable!("claim returned a payload of a different kind"),
            None => {}
          }
        }
        CellTag::SelectSender => {
          match cell.claim(word) {
            Some(CellPayload::SelectSender(stored)) => {
              if stored.select().try_select(stored.clause_index()) {
                let value = stored.take_payload().expect("selected send clause without a value");
                cell.finalize_buffered(value);
                return UpdateExpand::Done;
              }
              return UpdateExpand::Failed;
            }
            Some(_) => unreachable!("claim returned a payload of a different kind"),
            None => {}
          }
        }
        CellTag::Empty => {
          // pre-claim the cell so an in-progress sender knows it is now
          // inside the buffer
          if cell.cas_sentinel(word, cell::IN_BUFFER) {
            return UpdateExpand::Done;
          }
        }
        // a parked receiver, a registered receive clause, a buffered value,
        // a finished pair, a poisoned cell or an interrupted receiver: this
        // cell needs no expansion work
        CellTag::WaitingReceiver
        | CellTag::SelectReceiver
        | CellTag::Buffered
        | CellTag::Done
        | CellTag::Broken
        | CellTag::InterruptedReceive => return UpdateExpand::Done,
        CellTag::InterruptedSend => return UpdateExpand::Failed,
        CellTag::Resuming => backoff::spin_hint(), // receive is resolving the cell
        CellTag::Closed => return UpdateExpand::Closed,
        state => unreachable!("buffer expansion observed {state:?}"),
      }
    }
  }

  // *******
  // Closing
  // *******

  /// Installs `reason` as the terminal close state. The first close wins;
  /// later calls get the original reason back as the error.
  pub(crate) fn close_channel(&self, reason: ChannelClosed) -> Result<(), ChannelClosed> {
    if self.closed.set(reason.clone()).is_err() {
      return Err(self.reason());
    }

    // after this, every new send observes the closed flag immediately
    let word = self.senders.fetch_or(SENDERS_CLOSED_FLAG, Ordering::SeqCst);
    let last_sender = senders_counter(word);
    self.senders_at_close.store(last_sender, Ordering::SeqCst);

    // sealing the chain guarantees no segment beyond the tail will ever be
    // created, which bounds the cells the sweep below has to visit
    let tail = self.current_segment(&self.send_segment).close_chain(&self.arena);
    debug!(
      "channel closing ({reason}): {last_sender} sends reserved, chain sealed at segment {}",
      tail.id()
    );

    // an error discards buffered values, so every cell is swept; a graceful
    // close only seals cells no sender has reached
    let first_cell = match reason {
      ChannelClosed::Error(_) => 0,
      ChannelClosed::Done => last_sender,
    };
    self.close_cells_from(first_cell, &tail);
    Ok(())
  }

  /// Seals all cells with indices in `[first_cell, ..]` up to the sealed
  /// tail, in descending order so that a later receiver is never paired up
  /// while an earlier one observes the close.
  fn close_cells_from(&self, first_cell: u64, tail: &Arc<Segment<T>>) {
    let boundary_id = first_cell / SEGMENT_SIZE as u64;
    for segment in self.arena.snapshot_descending() {
      if segment.id() > tail.id() || segment.id() < boundary_id {
        continue;
      }
      let first_index = if segment.id() == boundary_id {
        (first_cell % SEGMENT_SIZE as u64) as usize
      } else {
        0
      };
      for index in (first_index..SEGMENT_SIZE).rev() {
        self.close_cell(&segment, index);
      }
    }
  }

  fn close_cell(&self, segment: &Arc<Segment<T>>, index: usize) {
    let cell = segment.cell(index);
    loop {
      let word = cell.load();
      match cell::tag_of(word) {
        CellTag::Empty | CellTag::InBuffer => {
          if cell.cas_sentinel(word, cell::CLOSED) {
            // same bookkeeping as an interrupted receiver: nothing is left
            // for buffer expansion, and all-closed segments can be removed
            segment.cell_interrupted_receiver(&self.arena);
            return;
          }
        }
        CellTag::Buffered => {
          // discard the buffered value
          if cell.take_buffered(word, cell::CLOSED).is_some() {
            segment.cell_interrupted_receiver(&self.arena);
            return;
          }
        }
        CellTag::WaitingSender | CellTag::WaitingReceiver => {
          match cell.claim(word) {
            Some(CellPayload::WaitingSender(waiter)) | Some(CellPayload::WaitingReceiver(waiter)) => {
              if waiter.try_close() {
                cell.finalize(cell::CLOSED);
                segment.cell_interrupted_receiver(&self.arena);
              }
              // a waiter that lost the race timed out concurrently and owns
              // the remaining bookkeeping itself
              return;
            }
            Some(_) => unreachable!("claim returned a payload of a different kind"),
            None => {}
          }
        }
        CellTag::SelectSender | CellTag::SelectReceiver => {
          match cell.claim(word) {
            Some(CellPayload::SelectSender(stored)) | Some(CellPayload::SelectReceiver(stored)) => {
              stored.select().channel_closed(&self.reason());
              // the select's cleanup rewrites the cell and fixes the
              // counters for every non-winning clause
              return;
            }
            Some(_) => unreachable!("claim returned a payload of a different kind"),
            None => {}
          }
        }
        // nothing to do: the pair already completed, or the counters were
        // already settled when the cell died
        CellTag::Done
        | CellTag::Broken
        | CellTag::InterruptedSend
        | CellTag::InterruptedReceive
        | CellTag::Closed => return,
        CellTag::Resuming => backoff::spin_hint(), // another thread is resolving the cell
      }
    }
  }

  /// Releases the cell a no-longer-wanted select registration occupies,
  /// exactly as if the registered operation had been interrupted. Races
  /// with `try_select` are resolved by the select's state word, so a plain
  /// swap suffices here.
  pub(crate) fn cleanup_stored(&self, stored: &StoredSelect<T>) {
    let segment = stored.segment();
    let sentinel = if stored.is_sender() {
      cell::INTERRUPTED_SEND
    } else {
      cell::INTERRUPTED_RECEIVE
    };
    segment.cell(stored.cell_index()).swap_terminal(sentinel);
    if stored.is_sender() {
      segment.cell_interrupted_sender(&self.arena);
    } else {
      segment.cell_interrupted_receiver(&self.arena);
    }
  }

  // *******
  // Queries
  // *******

  /// The close reason as far as senders are concerned: any close stops
  /// sends.
  pub(crate) fn closed_for_send(&self) -> Option<ChannelClosed> {
    self.closed.get().cloned()
  }

  /// The close reason as far as receivers are concerned: an error closes
  /// immediately, a graceful close only once every value sent before the
  /// close has been received.
  pub(crate) fn closed_for_receive(&self) -> Option<ChannelClosed> {
    let reason = self.closed.get()?;
    match reason {
      ChannelClosed::Error(_) => Some(reason.clone()),
      ChannelClosed::Done => {
        let last_sender = self.senders_at_close.load(Ordering::SeqCst);
        if self.receivers.load(Ordering::SeqCst) >= last_sender {
          Some(ChannelClosed::Done)
        } else {
          None
        }
      }
    }
  }

  /// Number of live segments; the reclamation bound tests rely on this.
  pub(crate) fn segment_count(&self) -> usize {
    self.arena.len()
  }

  pub(crate) fn debug_counters(&self) -> (u64, u64, u64, bool) {
    let word = self.senders.load(Ordering::SeqCst);
    (
      senders_counter(word),
      self.receivers.load(Ordering::SeqCst),
      self.buffer_end.load(Ordering::SeqCst),
      senders_closed(word),
    )
  }
}
