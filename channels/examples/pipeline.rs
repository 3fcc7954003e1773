//! A small two-stage pipeline with a control channel: workers pull jobs,
//! square them, and push results, while `select` lets the collector react to
//! either results or the control signal, whichever is ready first.

use std::thread;

use weft::{select, Channel};

fn main() {
  let jobs = Channel::buffered(8);
  let results = Channel::buffered(8);
  let control = Channel::rendezvous();

  let workers: Vec<_> = (0..4)
    .map(|_| {
      let jobs = jobs.clone();
      let results = results.clone();
      thread::spawn(move || {
        while let Ok(n) = jobs.receive() {
          results.send((n, n * n)).unwrap();
        }
      })
    })
    .collect();

  let producer = {
    let jobs = jobs.clone();
    let control = control.clone();
    thread::spawn(move || {
      for n in 1..=20u64 {
        jobs.send(n).unwrap();
      }
      jobs.done().unwrap();
      control.send("producer finished").unwrap();
    })
  };

  let mut collected = 0;
  loop {
    let event = select(vec![
      results.receive_clause_map(|(n, squared)| format!("{n}^2 = {squared}")),
      control.receive_clause_map(|msg| format!("[control] {msg}")),
    ])
    .unwrap();
    println!("{event}");
    collected += 1;
    if collected == 21 {
      break;
    }
  }

  producer.join().unwrap();
  for worker in workers {
    worker.join().unwrap();
  }
}
