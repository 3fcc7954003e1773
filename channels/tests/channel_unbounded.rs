mod common;

use std::thread;
use std::time::Duration;

use weft::{Channel, ChannelClosed};

#[test]
fn sends_never_block() {
  let channel = Channel::unbounded();
  for i in 0..10_000 {
    channel
      .send_timeout(i, Duration::from_secs(5))
      .expect("unbounded send must not block");
  }
  for expected in 0..10_000 {
    assert_eq!(channel.receive(), Ok(expected));
  }
}

#[test]
fn capacity_reports_unbounded() {
  assert_eq!(Channel::<u8>::unbounded().capacity(), None);
}

#[test]
fn drains_after_done() {
  let channel = Channel::unbounded();
  for i in 0..100 {
    channel.send(i).unwrap();
  }
  channel.done().unwrap();

  for expected in 0..100 {
    assert_eq!(channel.receive(), Ok(expected));
  }
  assert!(matches!(channel.receive(), Err(ChannelClosed::Done)));
}

#[test]
fn parked_receiver_is_resumed_by_a_late_sender() {
  let channel = Channel::unbounded();
  let (handle, finished) = {
    let channel = channel.clone();
    common::spawn_tracked(move || assert_eq!(channel.receive(), Ok(5)))
  };
  common::assert_still_blocked(&finished, Duration::from_millis(150));
  channel.send(5).unwrap();
  handle.join().unwrap();
}

#[test]
fn segments_are_reclaimed_as_values_flow() {
  let channel = Channel::unbounded();
  for round in 0..1_000 {
    for i in 0..10 {
      channel.send(round * 10 + i).unwrap();
    }
    for i in 0..10 {
      assert_eq!(channel.receive(), Ok(round * 10 + i));
    }
  }
  // 10k cells crossed ~300 segments; only the handful pinned by the shared
  // references may remain live
  assert!(
    channel.segment_count() <= 4,
    "unbounded channel retained {} segments",
    channel.segment_count()
  );
}

#[test]
fn concurrent_producers_all_get_through() {
  let channel = Channel::unbounded();
  let producers: Vec<_> = (0..4)
    .map(|p| {
      let channel = channel.clone();
      thread::spawn(move || {
        for i in 0..1000u64 {
          channel.send(p * 1_000_000 + i).unwrap();
        }
      })
    })
    .collect();
  for handle in producers {
    handle.join().unwrap();
  }
  channel.done().unwrap();

  let mut count = 0;
  while channel.receive().is_ok() {
    count += 1;
  }
  assert_eq!(count, 4000);
}
