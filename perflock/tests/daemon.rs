// SPDX-License-Identifier: GPL-2.0

// End-to-end exercises of the daemon over a real Unix socket: the
// accept loop runs in-process against a fabricated core pool, clients
// talk through the public protocol crate. Core reservations are kept at
// zero here so nothing depends on the machine we run on; reservation
// arithmetic is covered by the lock queue's unit tests.

use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use perflock::daemon;
use perflock_proto::{send_msg, Client, Request};
use perflock_utils::Cpumask;

struct TestDaemon {
    // Held for the lifetime of the test so the socket directory
    // survives; the daemon thread itself is detached and dies with the
    // process.
    _dir: tempfile::TempDir,
    path: String,
}

impl TestDaemon {
    fn start() -> TestDaemon {
        let dir = tempfile::tempdir().unwrap();
        let path = dir
            .path()
            .join("perflock.socket")
            .to_string_lossy()
            .into_owned();

        let all_cores = Cpumask::from_cpulist("0-7").unwrap();
        let daemon_path = path.clone();
        thread::spawn(move || daemon::serve(&daemon_path, all_cores).unwrap());

        for _ in 0..200 {
            if Client::connect(&path).is_ok() {
                return TestDaemon { _dir: dir, path };
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("daemon did not come up on {}", path);
    }

    fn client(&self) -> Client {
        Client::connect(&self.path).unwrap()
    }

    fn wait_for_queue_len(&self, want: usize) -> Vec<String> {
        let mut client = self.client();
        let mut last = Vec::new();
        for _ in 0..200 {
            last = client.list().unwrap();
            if last.len() == want {
                return last;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("queue never reached {} entries, last {:?}", want, last);
    }
}

#[test]
fn exclusive_lifecycle() {
    let daemon = TestDaemon::start();

    let mut holder = daemon.client();
    let resp = holder.acquire(false, false, 0, "sleep 60").unwrap();
    assert!(resp.acquired);
    assert!(resp.err.is_empty());

    let list = daemon.wait_for_queue_len(1);
    assert!(list[0].contains("sleep 60"), "{:?}", list);
    assert!(list[0].contains("cores=0"), "{:?}", list);
    assert!(!list[0].contains("[shared]"), "{:?}", list);

    drop(holder);
    daemon.wait_for_queue_len(0);
}

#[test]
fn shared_holders_coexist() {
    let daemon = TestDaemon::start();

    let mut a = daemon.client();
    let mut b = daemon.client();
    assert!(a.acquire(true, false, 0, "job a").unwrap().acquired);
    assert!(b.acquire(true, false, 0, "job b").unwrap().acquired);

    let list = daemon.wait_for_queue_len(2);
    assert!(list.iter().all(|line| line.contains("[shared]")), "{:?}", list);

    drop(a);
    daemon.wait_for_queue_len(1);
    drop(b);
    daemon.wait_for_queue_len(0);
}

#[test]
fn exclusive_blocks_shared_until_disconnect() {
    let daemon = TestDaemon::start();

    let mut holder = daemon.client();
    assert!(holder.acquire(false, false, 0, "holder").unwrap().acquired);

    let (tx, rx) = std::sync::mpsc::channel();
    let path = daemon.path.clone();
    let waiter = thread::spawn(move || {
        let mut client = Client::connect(&path).unwrap();
        let resp = client.acquire(true, false, 0, "waiter").unwrap();
        tx.send(()).unwrap();
        resp
    });

    // The waiter parks behind the exclusive holder.
    daemon.wait_for_queue_len(2);
    assert!(rx.try_recv().is_err());

    drop(holder);
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let resp = waiter.join().unwrap();
    assert!(resp.acquired);
}

#[test]
fn non_blocking_acquire_loses_race_cleanly() {
    let daemon = TestDaemon::start();

    let mut holder = daemon.client();
    assert!(holder.acquire(false, false, 0, "holder").unwrap().acquired);

    let mut contender = daemon.client();
    let resp = contender.acquire(true, true, 0, "contender").unwrap();
    assert!(!resp.acquired);
    assert!(resp.err.is_empty());

    // The failed attempt left no queue entry, and the connection is
    // still usable.
    assert_eq!(contender.list().unwrap().len(), 1);
}

#[test]
fn over_request_is_rejected_and_terminal() {
    let daemon = TestDaemon::start();

    let avail = perflock_utils::cpuset_of_pid(std::process::id()).unwrap();
    let mut client = daemon.client();
    let resp = client
        .acquire(false, false, avail.weight() + 1, "too big")
        .unwrap();
    assert!(!resp.acquired);
    assert!(resp.err.contains("requested"), "{:?}", resp.err);
    assert!(resp.err.contains("available"), "{:?}", resp.err);

    // The rejection closes the connection.
    assert!(client.list().is_err());
    daemon.wait_for_queue_len(0);
}

#[test]
fn governor_without_lock_closes_connection() {
    let daemon = TestDaemon::start();

    let mut client = daemon.client();
    assert!(client.set_governor(90).is_err());
    assert!(client.list().is_err());
}

#[test]
fn message_while_acquiring_drops_entry() {
    let daemon = TestDaemon::start();

    let mut holder = daemon.client();
    assert!(holder.acquire(false, false, 0, "holder").unwrap().acquired);

    // Enqueue a waiter, then violate the protocol by talking while the
    // grant is outstanding. Raw frames, since the client API always
    // waits for the reply.
    let mut stream = UnixStream::connect(&daemon.path).unwrap();
    send_msg(
        &mut stream,
        &Request::Acquire {
            pid: std::process::id(),
            cores: 0,
            shared: false,
            non_blocking: false,
            msg: "rude waiter".to_string(),
        },
    )
    .unwrap();
    daemon.wait_for_queue_len(2);
    send_msg(&mut stream, &Request::List).unwrap();

    // The daemon closes the connection and removes the queue entry, so
    // the next waiter is not stuck behind a ghost.
    daemon.wait_for_queue_len(1);

    drop(holder);
    let mut next = daemon.client();
    assert!(next.acquire(false, false, 0, "next").unwrap().acquired);
}
