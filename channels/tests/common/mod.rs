#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Spawns `f` and returns the handle plus a flag that flips once `f`
/// returns, so tests can assert that an operation is still blocked.
pub fn spawn_tracked<F>(f: F) -> (JoinHandle<()>, Arc<AtomicBool>)
where
  F: FnOnce() + Send + 'static,
{
  let finished = Arc::new(AtomicBool::new(false));
  let flag = Arc::clone(&finished);
  let handle = thread::spawn(move || {
    f();
    flag.store(true, Ordering::SeqCst);
  });
  (handle, finished)
}

/// Asserts that the tracked operation has not completed after sleeping for
/// `grace`.
pub fn assert_still_blocked(flag: &AtomicBool, grace: Duration) {
  thread::sleep(grace);
  assert!(
    !flag.load(Ordering::SeqCst),
    "operation completed although it should still be blocked"
  );
}

pub fn short_pause() {
  thread::sleep(Duration::from_millis(100));
}
