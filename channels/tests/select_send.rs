mod common;

use std::thread;
use std::time::Duration;

use weft::{select, Channel};

#[test]
fn send_clause_completes_immediately_with_buffer_space() {
  let channel = Channel::buffered(2);
  let result = select(vec![channel.send_clause_with(7, || "stored")]);
  assert_eq!(result, Ok("stored"));
  assert_eq!(channel.receive(), Ok(7));
}

#[test]
fn send_clause_yields_unit_by_default() {
  let channel = Channel::buffered(1);
  assert_eq!(select(vec![channel.send_clause(1)]), Ok(()));
  assert_eq!(channel.receive(), Ok(1));
}

#[test]
fn full_channel_defers_to_a_ready_clause() {
  let full = Channel::buffered(1);
  full.send(1).unwrap();
  let free = Channel::buffered(1);

  // the first clause can only register; the second completes immediately
  let result = select(vec![
    full.send_clause_with(2, || "into full"),
    free.send_clause_with(3, || "into free"),
  ]);
  assert_eq!(result, Ok("into free"));
  assert_eq!(free.receive(), Ok(3));

  // the losing registration was cleaned up: the full channel still holds
  // exactly its original value
  assert_eq!(full.receive(), Ok(1));
  assert!(full.try_receive().is_err());
}

#[test]
fn send_clause_parks_until_a_receiver_frees_space() {
  let channel = Channel::buffered(1);
  channel.send("first").unwrap();

  let receiver = {
    let channel = channel.clone();
    thread::spawn(move || {
      thread::sleep(Duration::from_millis(100));
      assert_eq!(channel.receive(), Ok("first"));
    })
  };

  let result = select(vec![channel.send_clause_with("second", || "went through")]);
  assert_eq!(result, Ok("went through"));
  receiver.join().unwrap();
  assert_eq!(channel.receive(), Ok("second"));
}

#[test]
fn send_clause_meets_a_parked_receiver() {
  let channel = Channel::rendezvous();
  let (receiver, _) = {
    let channel = channel.clone();
    common::spawn_tracked(move || assert_eq!(channel.receive(), Ok(5)))
  };
  common::short_pause();

  // the parked receiver makes the clause immediately satisfiable
  assert_eq!(select(vec![channel.send_clause_with(5, || true)]), Ok(true));
  receiver.join().unwrap();
}

#[test]
fn plain_receive_claims_a_registered_send_clause() {
  let channel = Channel::<u32>::rendezvous();

  let selector = {
    let channel = channel.clone();
    thread::spawn(move || select(vec![channel.send_clause_with(31, || "handed off")]))
  };
  thread::sleep(Duration::from_millis(100));

  // the select has parked with a registered send; a direct receive claims it
  assert_eq!(channel.receive(), Ok(31));
  assert_eq!(selector.join().unwrap(), Ok("handed off"));
}

#[test]
fn mixed_send_and_receive_clauses() {
  let inbox = Channel::buffered(1);
  let outbox = Channel::buffered(1);
  inbox.send(10).unwrap();

  // first-listed bias picks the receive even though the send is also ready
  let result = select(vec![
    inbox.receive_clause_map(|v| v + 1),
    outbox.send_clause_with(99, || 0),
  ]);
  assert_eq!(result, Ok(11));
  // the send clause was cleaned up, nothing landed in the outbox
  assert!(outbox.try_receive().is_err());
}
