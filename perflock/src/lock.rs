// SPDX-License-Identifier: GPL-2.0

//! # Lock queue and core scheduler
//!
//! A single FIFO queue of waiters plus the pool of unreserved cores,
//! guarded by one mutex: the wake pass reads and mutates both, so they
//! form one consistency unit. Sessions interact with the queue only
//! through [`LockQueue::enqueue`], [`LockQueue::dequeue`] and
//! [`LockQueue::queue`]; the mutex is never held across I/O.
//!
//! Admission rules: an exclusive entry at the head excludes everything
//! behind it. A shared head admits the following shared entries in
//! order until one needs more cores than the pool can supply; that
//! entry is not skipped, so it also holds back everything behind it.
//! Granted entries receive their reserved core set on a one-shot
//! channel.

use std::sync::Mutex;

use crossbeam::channel::bounded;
use crossbeam::channel::Receiver;
use crossbeam::channel::Sender;
use log::debug;

use perflock_utils::Cpumask;

struct Locker {
    id: u64,
    want_cores: usize,
    avail_cores: Cpumask,
    assigned_cores: Cpumask,
    shared: bool,
    woken: bool,
    msg: String,
    grant: Sender<Cpumask>,
}

/// A session's handle on its queue entry: the queue id and the
/// receiving half of the grant channel. The channel delivers the
/// reserved core set exactly once, when the scheduler admits the entry.
pub struct LockHandle {
    pub id: u64,
    pub grant: Receiver<Cpumask>,
}

struct Inner {
    next_id: u64,
    q: Vec<Locker>,
    free_cores: Cpumask,
}

/// The process-wide lock state.
pub struct LockQueue {
    inner: Mutex<Inner>,
}

impl LockQueue {
    /// Create a queue whose core pool is `all_cores`.
    pub fn new(all_cores: Cpumask) -> LockQueue {
        LockQueue {
            inner: Mutex::new(Inner {
                next_id: 0,
                q: Vec::new(),
                free_cores: all_cores,
            }),
        }
    }

    /// Append a waiter and run the wake pass. Returns `None` if
    /// `non_blocking` is set and the waiter could not be admitted
    /// immediately; the queue is left unchanged in that case. The
    /// returned handle may already have a grant pending.
    pub fn enqueue(
        &self,
        shared: bool,
        non_blocking: bool,
        want_cores: usize,
        avail_cores: Cpumask,
        msg: String,
    ) -> Option<LockHandle> {
        let (tx, rx) = bounded(1);
        let mut inner = self.inner.lock().unwrap();

        let id = inner.next_id;
        inner.next_id += 1;
        inner.q.push(Locker {
            id,
            want_cores,
            avail_cores,
            assigned_cores: Cpumask::new(),
            shared,
            woken: false,
            msg,
            grant: tx,
        });
        inner.wake_pass();

        if non_blocking && !inner.q.last().is_some_and(|l| l.woken) {
            inner.q.pop();
            return None;
        }

        Some(LockHandle { id, grant: rx })
    }

    /// Remove a waiter, return its reserved cores to the pool and
    /// re-run the wake pass. Dequeuing an id that is not queued is a
    /// bug in the caller.
    pub fn dequeue(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();

        let Some(i) = inner.q.iter().position(|l| l.id == id) else {
            panic!("dequeue of a locker that is not queued (id {})", id);
        };
        let freed = inner.q[i].assigned_cores.clone();
        inner.free_cores = inner.free_cores.or(&freed);
        debug!(
            "released {:?}: pool now {}",
            inner.q[i].msg, inner.free_cores
        );
        inner.q.remove(i);
        inner.wake_pass();
    }

    /// Snapshot the queue, one descriptive line per entry, in order.
    pub fn queue(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.q.iter().map(|l| l.msg.clone()).collect()
    }

    #[cfg(test)]
    fn free_cores(&self) -> Cpumask {
        self.inner.lock().unwrap().free_cores.clone()
    }
}

impl Inner {
    /// Admit as many head-of-queue waiters as the rules and the pool
    /// allow. Caller holds the queue mutex.
    fn wake_pass(&mut self) {
        if self.q.is_empty() {
            return;
        }

        if self.q[0].shared {
            for i in 0..self.q.len() {
                if !self.q[i].shared {
                    // Exclusive entry behind the shared cohort; it must
                    // wait for all of them to leave.
                    break;
                }
                if !self.q[i].woken
                    && self.q[i].want_cores != 0
                    && self.free_cores.weight() < self.q[i].want_cores
                {
                    // Not enough cores. The entry keeps its place, so
                    // nothing behind it may jump ahead either.
                    break;
                }
                self.wake(i);
            }
        } else {
            self.wake(0);
        }
    }

    fn wake(&mut self, i: usize) {
        if self.q[i].woken {
            return;
        }
        self.take_cores(i);
        let locker = &mut self.q[i];
        locker.woken = true;
        // The channel is buffered to one and sees a single send per
        // entry lifetime, so this never blocks; a receiver that already
        // hung up is the session's problem, not ours.
        let _ = locker.grant.try_send(locker.assigned_cores.clone());
    }

    /// Reserve cores for entry `i`, lowest eligible indices first. The
    /// client applies the mask itself via sched_setaffinity(2); the
    /// pool only tracks who owns what.
    fn take_cores(&mut self, i: usize) {
        let want = self.q[i].want_cores;
        assert!(
            self.free_cores.weight() >= want,
            "core pool underflow: {} free < {} requested",
            self.free_cores.weight(),
            want
        );
        if want == 0 {
            // No reservation: the client runs on every CPU it is
            // allowed on. Reserved cores of other entries are not
            // shielded from it.
            return;
        }

        let candidate = self.free_cores.and(&self.q[i].avail_cores);
        let mut assigned = Cpumask::new();
        for cpu in candidate.iter().take(want) {
            let _ = assigned.set_cpu(cpu);
            let _ = self.free_cores.clear_cpu(cpu);
        }
        assert!(
            assigned.weight() == want,
            "reserved {} cores, requested {}",
            assigned.weight(),
            want
        );
        self.q[i].assigned_cores = assigned;
    }
}
