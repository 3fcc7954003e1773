//! The spin budget for the two-phase (spin, then park) wait strategy.

use once_cell::sync::Lazy;

/// Busy-loop iterations before a waiter parks.
///
/// Zero on single-core hosts, where spinning can only steal cycles from the
/// peer we are waiting for. The multi-core default of `2^10` iterations is a
/// tunable constant: high enough to catch the common fast rendezvous, low
/// enough that a miss costs less than a park/unpark round trip.
static SPIN_BUDGET: Lazy<u32> = Lazy::new(|| if num_cpus::get() == 1 { 0 } else { 1 << 10 });

#[inline]
pub(crate) fn spin_budget() -> u32 {
  *SPIN_BUDGET
}

/// Emits a CPU instruction that signals the processor that it is in a spin loop.
#[inline(always)]
pub(crate) fn spin_hint() {
  std::hint::spin_loop();
}
