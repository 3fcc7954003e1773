mod common;

use std::thread;
use std::time::{Duration, Instant};

use weft::{Channel, ReceiveTimeoutError};

#[test]
fn receive_timeout_on_an_empty_channel() {
  let channel = Channel::<u32>::rendezvous();
  let start = Instant::now();
  let result = channel.receive_timeout(Duration::from_millis(100));
  assert!(matches!(result, Err(ReceiveTimeoutError::Timeout)));
  assert!(start.elapsed() >= Duration::from_millis(100));
}

#[test]
fn receive_timeout_returns_a_value_that_arrives_in_time() {
  let channel = Channel::rendezvous();
  let sender = {
    let channel = channel.clone();
    thread::spawn(move || {
      thread::sleep(Duration::from_millis(50));
      channel.send(11).unwrap();
    })
  };
  assert_eq!(channel.receive_timeout(Duration::from_secs(5)), Ok(11));
  sender.join().unwrap();
}

#[test]
fn operations_pair_up_across_abandoned_cells() {
  // a timed-out receive leaves a dead cell behind; later senders must skip
  // it and meet the next receiver
  let channel = Channel::rendezvous();
  for _ in 0..3 {
    let _ = channel.receive_timeout(Duration::from_millis(20));
  }

  let sender = {
    let channel = channel.clone();
    thread::spawn(move || channel.send(77).unwrap())
  };
  assert_eq!(channel.receive_timeout(Duration::from_secs(5)), Ok(77));
  sender.join().unwrap();
}

#[test]
fn timed_out_senders_do_not_corrupt_the_buffer() {
  let channel = Channel::buffered(1);
  channel.send("a").unwrap();

  // two senders time out while the buffer is full
  for value in ["b", "c"] {
    let err = channel.send_timeout(value, Duration::from_millis(30)).unwrap_err();
    assert_eq!(err.into_value(), value);
  }

  // the buffered value and the capacity window both survive
  assert_eq!(channel.receive(), Ok("a"));
  channel.send("d").unwrap();
  assert_eq!(channel.receive(), Ok("d"));
}

#[test]
fn abandoned_cells_do_not_leak_segments() {
  let channel = Channel::<u8>::rendezvous();
  for _ in 0..200 {
    let _ = channel.receive_timeout(Duration::from_millis(1));
  }
  // 200 dead cells span ~7 segments; everything but the cells pinned by the
  // shared references must have been reclaimed
  assert!(
    channel.segment_count() <= 3,
    "abandoned cells retained {} segments",
    channel.segment_count()
  );

  // and the channel still works
  let sender = {
    let channel = channel.clone();
    thread::spawn(move || channel.send(1).unwrap())
  };
  assert_eq!(channel.receive(), Ok(1));
  sender.join().unwrap();
}
