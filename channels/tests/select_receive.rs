mod common;

use std::thread;
use std::time::Duration;

use weft::{default_clause, select, Channel, ChannelClosed};

#[test]
fn bias_toward_the_first_ready_clause() {
  let a = Channel::buffered(1);
  let b = Channel::buffered(1);
  a.send("a").unwrap();
  b.send("b").unwrap();

  // both are immediately satisfiable: the first listed clause wins,
  // deterministically
  assert_eq!(select(vec![a.receive_clause(), b.receive_clause()]), Ok("a"));
  assert_eq!(select(vec![b.receive_clause(), a.receive_clause()]), Ok("b"));
}

#[test]
fn later_clauses_win_when_earlier_ones_are_empty() {
  let a = Channel::<&str>::buffered(1);
  let b = Channel::buffered(1);
  b.send("b").unwrap();
  assert_eq!(select(vec![a.receive_clause(), b.receive_clause()]), Ok("b"));
}

#[test]
fn select_parks_until_a_peer_sends() {
  let a = Channel::<u32>::rendezvous();
  let b = Channel::<u32>::rendezvous();

  let sender = {
    let b = b.clone();
    thread::spawn(move || {
      thread::sleep(Duration::from_millis(100));
      b.send(42).unwrap();
    })
  };

  assert_eq!(select(vec![a.receive_clause(), b.receive_clause()]), Ok(42));
  sender.join().unwrap();
}

#[test]
fn transforms_run_on_the_selected_value() {
  let numbers = Channel::buffered(1);
  let words = Channel::<&str>::buffered(1);
  numbers.send(21).unwrap();

  let result = select(vec![
    numbers.receive_clause_map(|n| n * 2),
    words.receive_clause_map(|w| w.len() as i32),
  ]);
  assert_eq!(result, Ok(42));
}

#[test]
fn an_errored_channel_short_circuits_the_select() {
  let ready = Channel::buffered(1);
  ready.send(1).unwrap();
  let broken = Channel::<i32>::buffered(1);
  broken.error("wires crossed").unwrap();

  // the error wins even though an earlier clause is immediately ready
  match select(vec![ready.receive_clause(), broken.receive_clause()]) {
    Err(ChannelClosed::Error(cause)) => assert_eq!(cause.to_string(), "wires crossed"),
    other => panic!("expected the error close, got {other:?}"),
  }
  // the ready value was not consumed
  assert_eq!(ready.receive(), Ok(1));
}

#[test]
fn a_done_channel_resolves_the_select_as_closed() {
  let open = Channel::<u8>::rendezvous();
  let done = Channel::<u8>::rendezvous();
  done.done().unwrap();

  assert!(matches!(
    select(vec![open.receive_clause(), done.receive_clause()]),
    Err(ChannelClosed::Done)
  ));
}

#[test]
fn default_clause_fires_only_when_nothing_is_ready() {
  let channel = Channel::<u32>::buffered(1);

  let result = select(vec![channel.receive_clause_map(Some), default_clause(None)]);
  assert_eq!(result, Ok(None));

  channel.send(5).unwrap();
  let result = select(vec![channel.receive_clause_map(Some), default_clause(None)]);
  assert_eq!(result, Ok(Some(5)));
}

#[test]
fn selects_can_be_repeated_over_the_same_channels() {
  let a = Channel::unbounded();
  let b = Channel::unbounded();
  a.send(1).unwrap();
  b.send(2).unwrap();
  a.send(3).unwrap();

  let mut seen = Vec::new();
  for _ in 0..3 {
    seen.push(select(vec![a.receive_clause(), b.receive_clause()]).unwrap());
  }
  seen.sort_unstable();
  assert_eq!(seen, [1, 2, 3]);
}

#[test]
fn select_leaves_no_stale_registrations() {
  // the losing clause's registration must be fully cleaned up: afterwards
  // the channel still pairs plain sends and receives correctly
  let winner = Channel::buffered(1);
  let loser = Channel::<u32>::rendezvous();
  winner.send(10).unwrap();

  assert_eq!(select(vec![loser.receive_clause(), winner.receive_clause()]), Ok(10));

  let sender = {
    let loser = loser.clone();
    thread::spawn(move || loser.send(20).unwrap())
  };
  assert_eq!(loser.receive(), Ok(20));
  sender.join().unwrap();
}

#[test]
#[should_panic(expected = "at most one clause")]
fn duplicate_channels_are_rejected() {
  let channel = Channel::<u8>::rendezvous();
  let _ = select(vec![channel.receive_clause(), channel.receive_clause()]);
}

#[test]
#[should_panic(expected = "must be listed last")]
fn default_clause_must_be_last() {
  let channel = Channel::<u8>::rendezvous();
  let _ = select(vec![default_clause(0), channel.receive_clause()]);
}
