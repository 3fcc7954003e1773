//! The segment chain: fixed-size blocks of cells linked into a lock-free
//! list, owned by an id-addressed arena.
//!
//! Segments are identified by monotonically increasing ids; segment `n`
//! covers the cell index range `[n * SEGMENT_SIZE, (n + 1) * SEGMENT_SIZE)`.
//! The `next`/`prev` links are atomic ids rather than pointers, and every id
//! resolves through the arena - a concurrent map from id to `Arc<Segment>` -
//! so a traversing thread always works with an owned handle and physical
//! unlinking can never race anyone into a freed segment.
//!
//! Each segment packs two counts into one atomic word: the number of
//! incoming references from the channel's shared segment pointers, and the
//! number of cells that have not reached a terminal state. When the word
//! hits zero the segment is logically removed: it is spliced out of the
//! chain (unless it is the tail, which is never unlinked) and evicted from
//! the arena, after which the last `Arc` going out of scope frees it.
//! Counting *every* terminal cell state - not just interrupted ones - is
//! what lets fully consumed segments leave the arena without a garbage
//! collector.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use log::trace;

use crate::channel::cell::{self, CellSlot};

/// Cells per segment.
pub(crate) const SEGMENT_SIZE: usize = 32;
/// Bit position of the incoming-pointer count within the packed counter
/// word; the low bits hold the unresolved-cell count (0..=32).
const POINTERS_SHIFT: u32 = 6;

/// Link sentinel: no segment.
pub(crate) const LINK_NONE: u64 = u64::MAX;
/// `next` sentinel: the chain is closed, no segment will ever follow.
pub(crate) const LINK_CLOSED: u64 = u64::MAX - 1;

pub(crate) struct Segment<T> {
  id: u64,
  /// `Segment` id, `LINK_NONE`, or `LINK_CLOSED`.
  next: AtomicU64,
  /// `Segment` id or `LINK_NONE`.
  prev: AtomicU64,
  /// Incoming-pointer count (shifted by `POINTERS_SHIFT`) plus the number
  /// of cells that are not yet terminally resolved. Zero means logically
  /// removed.
  counters: AtomicU32,
  cells: [CellSlot<T>; SEGMENT_SIZE],
}

// Safety: all cross-thread access goes through the atomic word of each cell
// and the atomic links/counters; cell payloads are moved only by the single
// thread that won the corresponding CAS.
unsafe impl<T: Send> Send for Segment<T> {}
unsafe impl<T: Send> Sync for Segment<T> {}

/// The id-addressed owner of all live segments of one channel.
pub(crate) struct SegmentArena<T> {
  map: papaya::HashMap<u64, Arc<Segment<T>>>,
  /// Buffered channels defer interrupted-sender accounting to buffer
  /// expansion; rendezvous and unbounded channels resolve it immediately.
  buffered: bool,
}

impl<T: Send> SegmentArena<T> {
  /// Creates the arena together with the first segment. `initial_pointers`
  /// is the number of channel references that start out on segment 0.
  pub(crate) fn new(buffered: bool, initial_pointers: u32) -> (Self, Arc<Segment<T>>) {
    let first = Arc::new(Segment::new(0, LINK_NONE, initial_pointers));
    let arena = SegmentArena {
      map: papaya::HashMap::new(),
      buffered,
    };
    arena.map.pin().insert(0, Arc::clone(&first));
    (arena, first)
  }

  pub(crate) fn get(&self, id: u64) -> Option<Arc<Segment<T>>> {
    self.map.pin().get(&id).cloned()
  }

  fn get_or_insert_with(&self, id: u64, make: impl FnOnce() -> Arc<Segment<T>>) -> Arc<Segment<T>> {
    self.map.pin().get_or_insert_with(id, make).clone()
  }

  fn evict(&self, id: u64) {
    self.map.pin().remove(&id);
  }

  /// Number of live segments. This is the bound the reclamation tests check.
  pub(crate) fn len(&self) -> usize {
    self.map.pin().len()
  }

  /// All live segments in descending id order. Used by the close sweep,
  /// which must seal later cells before earlier ones.
  pub(crate) fn snapshot_descending(&self) -> Vec<Arc<Segment<T>>> {
    let guard = self.map.pin();
    let mut segments: Vec<_> = guard.iter().map(|(_, s)| Arc::clone(s)).collect();
    segments.sort_by(|a, b| b.id.cmp(&a.id));
    segments
  }

  /// The closest live segment strictly left of `id`, by arena scan. The
  /// fallback for walks whose link chain passed through an evicted segment.
  fn scan_left_alive(&self, id: u64) -> Option<Arc<Segment<T>>> {
    let guard = self.map.pin();
    guard
      .iter()
      .filter(|(k, s)| **k < id && !s.is_removed())
      .max_by_key(|(k, _)| **k)
      .map(|(_, s)| Arc::clone(s))
  }

  /// The closest segment strictly right of `id` that is alive or the tail.
  fn scan_right_alive(&self, id: u64) -> Option<Arc<Segment<T>>> {
    let guard = self.map.pin();
    guard
      .iter()
      .filter(|(k, s)| **k > id && (!s.is_removed() || s.is_tail()))
      .min_by_key(|(k, _)| **k)
      .map(|(_, s)| Arc::clone(s))
  }
}

impl<T: Send> Segment<T> {
  fn new(id: u64, prev: u64, pointers: u32) -> Self {
    Segment {
      id,
      next: AtomicU64::new(LINK_NONE),
      prev: AtomicU64::new(prev),
      counters: AtomicU32::new(SEGMENT_SIZE as u32 + (pointers << POINTERS_SHIFT)),
      cells: std::array::from_fn(|_| CellSlot::new()),
    }
  }

  pub(crate) fn id(&self) -> u64 {
    self.id
  }

  pub(crate) fn cell(&self, index: usize) -> &CellSlot<T> {
    &self.cells[index]
  }

  /// Severs the backward link once the caller knows every earlier cell has
  /// been passed by both counters, letting earlier segments be reclaimed.
  pub(crate) fn clean_prev(&self) {
    self.prev.store(LINK_NONE, Ordering::SeqCst);
  }

  fn set_next_if_none(&self, to: u64) -> bool {
    self
      .next
      .compare_exchange(LINK_NONE, to, Ordering::SeqCst, Ordering::SeqCst)
      .is_ok()
  }

  fn is_tail(&self) -> bool {
    matches!(self.next.load(Ordering::SeqCst), LINK_NONE | LINK_CLOSED)
  }

  /// A segment is logically removed when it has no incoming pointers and
  /// every cell is terminally resolved.
  pub(crate) fn is_removed(&self) -> bool {
    self.counters.load(Ordering::SeqCst) == 0
  }

  /// Increments the incoming-pointer count, unless the segment is already
  /// logically removed.
  fn try_inc_pointers(&self) -> bool {
    let mut current = self.counters.load(Ordering::SeqCst);
    loop {
      if current == 0 {
        return false;
      }
      match self.counters.compare_exchange(
        current,
        current + (1 << POINTERS_SHIFT),
        Ordering::SeqCst,
        Ordering::SeqCst,
      ) {
        Ok(_) => return true,
        Err(observed) => current = observed,
      }
    }
  }

  /// Decrements the incoming-pointer count; `true` when the segment became
  /// logically removed.
  fn dec_pointers(&self) -> bool {
    self.counters.fetch_sub(1 << POINTERS_SHIFT, Ordering::SeqCst) == 1 << POINTERS_SHIFT
  }

  fn dec_unresolved(&self) -> bool {
    self.counters.fetch_sub(1, Ordering::SeqCst) == 1
  }

  /// A `receive` reserved in this cell was permanently abandoned (timed out,
  /// cleaned-up select registration, or sealed by close). At most once per
  /// cell.
  pub(crate) fn cell_interrupted_receiver(&self, arena: &SegmentArena<T>) {
    if self.dec_unresolved() {
      self.remove(arena);
    }
  }

  /// A `send` reserved in this cell was permanently abandoned. In buffered
  /// channels the accounting waits for buffer expansion to pass the cell
  /// (`cell_processed`); elsewhere it resolves immediately. At most once per
  /// cell.
  pub(crate) fn cell_interrupted_sender(&self, arena: &SegmentArena<T>) {
    if !arena.buffered && self.dec_unresolved() {
      self.remove(arena);
    }
  }

  /// Buffer expansion passed an interrupted sender cell. At most once per
  /// cell.
  pub(crate) fn cell_processed(&self, arena: &SegmentArena<T>) {
    if self.dec_unresolved() {
      self.remove(arena);
    }
  }

  /// A cell reached `Done` or `Broken`: consumed by normal operation, never
  /// to be touched again. At most once per cell. This is what keeps the
  /// arena from pinning fully consumed segments.
  pub(crate) fn cell_consumed(&self, arena: &SegmentArena<T>) {
    if self.dec_unresolved() {
      self.remove(arena);
    }
  }

  /// Marks a cell interrupted on behalf of its abandoned operation and
  /// updates the matching counter.
  pub(crate) fn mark_interrupted(&self, arena: &SegmentArena<T>, index: usize, is_sender: bool) {
    let sentinel = if is_sender {
      cell::INTERRUPTED_SEND
    } else {
      cell::INTERRUPTED_RECEIVE
    };
    self.cells[index].swap_terminal(sentinel);
    if is_sender {
      self.cell_interrupted_sender(arena);
    } else {
      self.cell_interrupted_receiver(arena);
    }
  }

  /// Physically unlinks a logically removed segment, unless it is the tail.
  ///
  /// Finds the nearest non-removed neighbors, links them to each other, then
  /// re-validates that neither was removed in the meantime, retrying the
  /// whole splice if so. Only after a stable splice is the segment evicted
  /// from the arena.
  pub(crate) fn remove(&self, arena: &SegmentArena<T>) {
    loop {
      // the tail segment cannot be removed
      if self.is_tail() {
        return;
      }

      let left = self.alive_segment_left(arena);
      let Some(right) = self.alive_segment_right(arena) else {
        // raced into becoming the effective tail; re-check
        continue;
      };

      // link right and left, keeping an already-cleaned prev cleaned
      loop {
        let current = right.prev.load(Ordering::SeqCst);
        if current == LINK_NONE {
          break;
        }
        let to = left.as_ref().map(|l| l.id).unwrap_or(LINK_NONE);
        if right
          .prev
          .compare_exchange(current, to, Ordering::SeqCst, Ordering::SeqCst)
          .is_ok()
        {
          break;
        }
      }
      if let Some(left) = &left {
        left.next.store(right.id, Ordering::SeqCst);
      }

      // double-check that the new neighbors are still alive
      if right.is_removed() && !right.is_tail() {
        continue;
      }
      if let Some(left) = &left {
        if left.is_removed() {
          continue;
        }
      }

      trace!("segment {} unlinked and evicted", self.id);
      arena.evict(self.id);
      return;
    }
  }

  fn alive_segment_left(&self, arena: &SegmentArena<T>) -> Option<Arc<Segment<T>>> {
    let mut id = self.prev.load(Ordering::SeqCst);
    loop {
      if id == LINK_NONE {
        return None;
      }
      match arena.get(id) {
        Some(segment) if !segment.is_removed() => return Some(segment),
        Some(segment) => id = segment.prev.load(Ordering::SeqCst),
        // the link chain passed through an evicted segment; the arena scan
        // sees the live truth
        None => return arena.scan_left_alive(self.id),
      }
    }
  }

  /// Only meaningful while this segment is not the tail.
  fn alive_segment_right(&self, arena: &SegmentArena<T>) -> Option<Arc<Segment<T>>> {
    let mut id = self.next.load(Ordering::SeqCst);
    loop {
      if matches!(id, LINK_NONE | LINK_CLOSED) {
        return None;
      }
      match arena.get(id) {
        Some(segment) if !segment.is_removed() || segment.is_tail() => return Some(segment),
        Some(segment) => id = segment.next.load(Ordering::SeqCst),
        None => return arena.scan_right_alive(self.id),
      }
    }
  }

  /// Seals the chain: walks to the tail and installs the permanent closed
  /// marker in its `next` link, so no segment is ever created past it.
  /// Returns the tail.
  pub(crate) fn close_chain(self: &Arc<Self>, arena: &SegmentArena<T>) -> Arc<Segment<T>> {
    let mut current = Arc::clone(self);
    loop {
      match current.next.load(Ordering::SeqCst) {
        LINK_NONE => {
          if current.set_next_if_none(LINK_CLOSED) {
            return current;
          }
        }
        LINK_CLOSED => return current,
        id => match arena.get(id) {
          Some(next) => current = next,
          None => match arena.scan_right_alive(current.id) {
            Some(next) => current = next,
            // the forward link moved underneath us; re-read it
            None => continue,
          },
        },
      }
    }
  }
}

/// Finds a non-removed segment with an id of at least `id`, starting from
/// `start` and creating segments as needed. Returns `None` when the chain is
/// closed before reaching `id`.
pub(crate) fn find_segment<T: Send>(
  arena: &SegmentArena<T>,
  start: Arc<Segment<T>>,
  id: u64,
) -> Option<Arc<Segment<T>>> {
  let mut current = start;
  while current.id < id || current.is_removed() {
    match current.next.load(Ordering::SeqCst) {
      LINK_CLOSED => return None,
      LINK_NONE => {
        let next_id = current.id + 1;
        let prev_id = current.id;
        // publish the candidate first so the id resolves the instant the
        // link appears; whoever loses the insert race reuses the winner's
        let _ = arena.get_or_insert_with(next_id, || Arc::new(Segment::new(next_id, prev_id, 0)));
        if current.set_next_if_none(next_id) {
          // an ex-tail that was already logically removed can now be
          // physically unlinked
          if current.is_removed() {
            current.remove(arena);
          }
        } else if current.next.load(Ordering::SeqCst) == LINK_CLOSED {
          // lost to a concurrent close: the candidate is unreachable
          arena.evict(next_id);
        }
      }
      next_id => match arena.get(next_id) {
        Some(next) => current = next,
        None => match arena.scan_right_alive(current.id) {
          Some(next) => current = next,
          // the forward link is being relinked; re-read it
          None => continue,
        },
      },
    }
  }
  Some(current)
}

/// Attempts to advance the shared reference `reference` to `to`, keeping the
/// incoming-pointer counts exact on every path: the target is incremented
/// before the CAS, and exactly one matching decrement runs afterwards - on
/// the old segment when the CAS succeeds, on the target when it fails.
pub(crate) fn move_forward<T: Send>(arena: &SegmentArena<T>, reference: &AtomicU64, to: &Arc<Segment<T>>) -> bool {
  loop {
    let current_id = reference.load(Ordering::SeqCst);
    // the reference might already be ahead
    if current_id >= to.id {
      return true;
    }
    if !to.try_inc_pointers() {
      return false;
    }
    if reference
      .compare_exchange(current_id, to.id, Ordering::SeqCst, Ordering::SeqCst)
      .is_ok()
    {
      // the old segment is no longer referenced here
      if let Some(current) = arena.get(current_id) {
        if current.dec_pointers() {
          current.remove(arena);
        }
      }
      return true;
    }
    // the reference moved underneath us; undo the increment and retry
    if to.dec_pointers() {
      to.remove(arena);
    }
  }
}

/// Finds (or creates) the non-removed segment covering `id` and advances the
/// shared `reference` to it. Returns `None` when the chain is closed with no
/// segment at or after `id`.
pub(crate) fn find_and_move_forward<T: Send>(
  arena: &SegmentArena<T>,
  reference: &AtomicU64,
  start: Arc<Segment<T>>,
  id: u64,
) -> Option<Arc<Segment<T>>> {
  loop {
    let segment = find_segment(arena, Arc::clone(&start), id)?;
    if move_forward(arena, reference, &segment) {
      return Some(segment);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn resolve_all_cells(segment: &Arc<Segment<u32>>, arena: &SegmentArena<u32>) {
    for index in 0..SEGMENT_SIZE {
      segment.cell(index).cas_sentinel(cell::EMPTY, cell::INTERRUPTED_RECEIVE);
      segment.cell_interrupted_receiver(arena);
    }
  }

  #[test]
  fn find_segment_creates_successors() {
    let (arena, first) = SegmentArena::<u32>::new(false, 2);
    let found = find_segment(&arena, Arc::clone(&first), 3).unwrap();
    assert_eq!(found.id(), 3);
    // all four segments are now live
    assert_eq!(arena.len(), 4);
    assert_eq!(first.next.load(Ordering::SeqCst), 1);
    assert_eq!(found.prev.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn move_forward_transfers_pointer_counts() {
    let (arena, first) = SegmentArena::<u32>::new(false, 2);
    let reference = AtomicU64::new(0);
    // give the reference its count on segment 0
    assert!(first.try_inc_pointers());

    let target = find_segment(&arena, Arc::clone(&first), 2).unwrap();
    assert!(move_forward(&arena, &reference, &target));
    assert_eq!(reference.load(Ordering::SeqCst), 2);

    // moving to an older segment is a no-op success
    assert!(move_forward(&arena, &reference, &first));
    assert_eq!(reference.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn consumed_middle_segment_is_unlinked_and_evicted() {
    let (arena, first) = SegmentArena::<u32>::new(false, 2);
    let tail = find_segment(&arena, Arc::clone(&first), 2).unwrap();
    let middle = arena.get(1).unwrap();
    assert_eq!(arena.len(), 3);

    // resolve every cell of the middle segment; it has no pointers, so the
    // last resolution unlinks and evicts it
    resolve_all_cells(&middle, &arena);
    assert!(middle.is_removed());
    assert!(arena.get(1).is_none());
    assert_eq!(arena.len(), 2);
    assert_eq!(first.next.load(Ordering::SeqCst), 2);
    assert_eq!(tail.prev.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn tail_is_never_unlinked() {
    let (arena, first) = SegmentArena::<u32>::new(false, 2);
    let tail = find_segment(&arena, Arc::clone(&first), 1).unwrap();
    resolve_all_cells(&tail, &arena);
    assert!(tail.is_removed());
    // still the tail, so still in the arena and still linked
    assert!(arena.get(1).is_some());
    assert_eq!(first.next.load(Ordering::SeqCst), 1);

    // once a successor exists, traversal removes the dead ex-tail
    let found = find_segment(&arena, Arc::clone(&first), 2).unwrap();
    assert_eq!(found.id(), 2);
    assert!(arena.get(1).is_none());
  }

  #[test]
  fn closed_chain_stops_creation() {
    let (arena, first) = SegmentArena::<u32>::new(false, 2);
    let tail = first.close_chain(&arena);
    assert_eq!(tail.id(), 0);
    assert!(find_segment(&arena, Arc::clone(&first), 1).is_none());
    // closing is idempotent
    let tail = first.close_chain(&arena);
    assert_eq!(tail.id(), 0);
  }

  #[test]
  fn buffered_mode_defers_interrupted_senders() {
    let (arena, first) = SegmentArena::<u32>::new(true, 3);
    // drop the three reference counts so cell accounting alone controls
    // removal
    for _ in 0..3 {
      first.dec_pointers();
    }
    for index in 0..SEGMENT_SIZE {
      first.cell(index).cas_sentinel(cell::EMPTY, cell::INTERRUPTED_SEND);
      first.cell_interrupted_sender(&arena);
    }
    // interrupted senders alone do not resolve a buffered segment
    assert!(!first.is_removed());
    for _ in 0..SEGMENT_SIZE {
      first.cell_processed(&arena);
    }
    assert!(first.is_removed());
  }
}
