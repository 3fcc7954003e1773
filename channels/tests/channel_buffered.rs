mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use weft::{Channel, SendTimeoutError};

#[test]
fn capacity_sends_complete_without_a_receiver() {
  let channel = Channel::buffered(3);
  for i in 0..3 {
    // a blocking send here would hang the test; the timeout makes a
    // violation fail loudly instead
    channel
      .send_timeout(i, Duration::from_secs(5))
      .expect("in-capacity send must not block");
  }
}

#[test]
fn send_past_capacity_blocks_until_a_receive() {
  let channel = Channel::buffered(2);
  channel.send(1).unwrap();
  channel.send(2).unwrap();

  let (handle, finished) = {
    let channel = channel.clone();
    common::spawn_tracked(move || channel.send(3).unwrap())
  };
  common::assert_still_blocked(&finished, Duration::from_millis(150));

  // one receive frees one slot
  assert_eq!(channel.receive(), Ok(1));
  handle.join().unwrap();

  assert_eq!(channel.receive(), Ok(2));
  assert_eq!(channel.receive(), Ok(3));
}

#[test]
fn receives_keep_the_window_sliding() {
  let channel = Channel::buffered(4);
  for round in 0..64 {
    for i in 0..4 {
      channel
        .send_timeout(round * 4 + i, Duration::from_secs(5))
        .expect("in-capacity send must not block");
    }
    for i in 0..4 {
      assert_eq!(channel.receive(), Ok(round * 4 + i));
    }
  }
}

#[test]
fn values_arrive_in_send_order() {
  let channel = Channel::buffered(8);
  let producer = {
    let channel = channel.clone();
    thread::spawn(move || {
      for i in 0..1000 {
        channel.send(i).unwrap();
      }
    })
  };
  for expected in 0..1000 {
    assert_eq!(channel.receive(), Ok(expected));
  }
  producer.join().unwrap();
}

#[test]
fn mpmc_no_value_is_lost_or_duplicated() {
  const PRODUCERS: u64 = 4;
  const CONSUMERS: usize = 4;
  const PER_PRODUCER: u64 = 1000;

  let channel = Channel::buffered(8);
  let received = Arc::new(Mutex::new(Vec::new()));

  let producers: Vec<_> = (0..PRODUCERS)
    .map(|p| {
      let channel = channel.clone();
      thread::spawn(move || {
        for i in 0..PER_PRODUCER {
          channel.send(p * 1_000_000 + i).unwrap();
        }
      })
    })
    .collect();

  let consumers: Vec<_> = (0..CONSUMERS)
    .map(|_| {
      let channel = channel.clone();
      let received = Arc::clone(&received);
      thread::spawn(move || {
        while let Ok(value) = channel.receive() {
          received.lock().unwrap().push(value);
        }
      })
    })
    .collect();

  for handle in producers {
    handle.join().unwrap();
  }
  channel.done().unwrap();
  for handle in consumers {
    handle.join().unwrap();
  }

  let received = received.lock().unwrap();
  assert_eq!(received.len() as u64, PRODUCERS * PER_PRODUCER);
  let unique: HashSet<_> = received.iter().copied().collect();
  assert_eq!(unique.len() as u64, PRODUCERS * PER_PRODUCER, "duplicated value received");
}

#[test]
fn per_producer_order_is_preserved() {
  let channel = Channel::buffered(4);
  let producer = {
    let channel = channel.clone();
    thread::spawn(move || {
      for i in 0..500 {
        channel.send(i).unwrap();
      }
    })
  };

  let mut last = None;
  for _ in 0..500 {
    let value = channel.receive().unwrap();
    if let Some(last) = last {
      assert!(value > last, "value {value} arrived after {last}");
    }
    last = Some(value);
  }
  producer.join().unwrap();
}

#[test]
fn send_timeout_returns_the_value_when_full() {
  let channel = Channel::buffered(1);
  channel.send("kept").unwrap();
  match channel.send_timeout("bounced", Duration::from_millis(100)) {
    Err(SendTimeoutError::Timeout(value)) => assert_eq!(value, "bounced"),
    other => panic!("expected a timeout, got {other:?}"),
  }
  // the buffered value is unaffected, and the channel keeps working
  assert_eq!(channel.receive(), Ok("kept"));
  channel.send("next").unwrap();
  assert_eq!(channel.receive(), Ok("next"));
}

#[test]
fn try_send_fills_exactly_the_buffer() {
  let channel = Channel::buffered(2);
  assert!(channel.try_send(1).is_ok());
  assert!(channel.try_send(2).is_ok());
  assert!(channel.try_send(3).is_err());
  assert_eq!(channel.receive(), Ok(1));
  assert!(channel.try_send(3).is_ok());
}
