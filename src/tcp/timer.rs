//! Timer service: a monotonic scheduler delivering callbacks at or after an
//! absolute deadline, on a thread distinct from input/output.
//!
//! Each TCB holds at most three `Option<TimerId>` slots (retransmit, delayed
//! ACK, linger/TIME-WAIT). Arming a slot replaces any deadline already
//! pending for it; cancelling an unarmed slot is a no-op. The scheduler
//! thread never touches TCB fields directly: it looks up the owning
//! connection by `Quad` through the shared manager lock and fails
//! gracefully if the connection is gone, per the "weak connection
//! identifier" resolution design note (the TimerId is that weak key).

use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::Quad;

pub type TimerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Retransmit,
    DelAck,
    Linger,
    /// Slot exists per spec.md's four-timer-per-TCB data model; no path in
    /// this core arms it (see spec.md S9's open question on keepalive).
    Keepalive,
}

#[derive(Debug, Clone, Copy)]
pub struct Fired {
    pub id: TimerId,
    pub quad: Quad,
    pub kind: TimerKind,
}

struct Entry {
    id: TimerId,
    deadline: Instant,
    quad: Quad,
    kind: TimerKind,
    cancelled: bool,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; we want the earliest deadline on top.
        other.deadline.cmp(&self.deadline).then(other.id.cmp(&self.id))
    }
}

struct Inner {
    heap: BinaryHeap<Entry>,
    next_id: TimerId,
    shutdown: bool,
}

/// Shared handle to the timer thread. Dropping every clone stops the thread.
pub struct TimerService {
    inner: Mutex<Inner>,
    cvar: Condvar,
}

impl TimerService {
    /// Spawn the scheduler thread. `on_fire` is invoked once per expired,
    /// non-cancelled entry, on the scheduler thread, with the TCB lock NOT
    /// held by the caller (the callback acquires it itself). It receives a
    /// handle back to this service so it can re-arm timers (e.g. after a
    /// retransmission) without the service needing to hold a reference to
    /// itself at construction time.
    pub fn spawn<F>(on_fire: F) -> (Arc<Self>, thread::JoinHandle<()>)
    where
        F: Fn(Arc<TimerService>, Fired) + Send + Sync + 'static,
    {
        let svc = Arc::new(TimerService {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_id: 1,
                shutdown: false,
            }),
            cvar: Condvar::new(),
        });

        let handle = {
            let svc = svc.clone();
            thread::spawn(move || svc.run(on_fire))
        };

        (svc, handle)
    }

    fn run<F>(self: Arc<Self>, on_fire: F)
    where
        F: Fn(Arc<TimerService>, Fired),
    {
        loop {
            let due = {
                let mut inner = self.inner.lock().unwrap();

                loop {
                    if inner.shutdown {
                        return;
                    }

                    match inner.heap.peek() {
                        None => {
                            inner = self.cvar.wait(inner).unwrap();
                        }
                        Some(top) => {
                            let now = Instant::now();
                            if top.deadline <= now {
                                let entry = inner.heap.pop().unwrap();
                                if entry.cancelled {
                                    continue;
                                }
                                break Some(entry);
                            } else {
                                let wait = top.deadline - now;
                                let (guard, _timeout) =
                                    self.cvar.wait_timeout(inner, wait).unwrap();
                                inner = guard;
                            }
                        }
                    }
                }
            };

            if let Some(entry) = due {
                on_fire(
                    self.clone(),
                    Fired {
                        id: entry.id,
                        quad: entry.quad,
                        kind: entry.kind,
                    },
                );
            }
        }
    }

    /// Arm (or re-arm) `slot`: cancels whatever timer it currently holds and
    /// schedules a new one `delay` from now, storing the new id in `slot`.
    pub fn arm(&self, slot: &mut Option<TimerId>, quad: Quad, kind: TimerKind, delay: Duration) {
        self.cancel(slot);

        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;

        inner.heap.push(Entry {
            id,
            deadline: Instant::now() + delay,
            quad,
            kind,
            cancelled: false,
        });

        *slot = Some(id);
        drop(inner);
        self.cvar.notify_one();
    }

    /// Cancel whatever timer `slot` holds, if any. No-op if `slot` is `None`.
    pub fn cancel(&self, slot: &mut Option<TimerId>) {
        let Some(id) = slot.take() else { return };

        let mut inner = self.inner.lock().unwrap();
        // The heap doesn't support in-place removal by key cheaply; mark via
        // a linear rebuild. Timer counts per connection are tiny (4 slots),
        // so this stays O(pending timers) per cancel, which is acceptable.
        let mut rebuilt: BinaryHeap<Entry> = BinaryHeap::new();
        for mut entry in inner.heap.drain() {
            if entry.id == id {
                entry.cancelled = true;
            }
            if !entry.cancelled {
                rebuilt.push(entry);
            }
        }
        inner.heap = rebuilt;
    }

    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shutdown = true;
        drop(inner);
        self.cvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::mpsc;

    fn quad(port: u16) -> Quad {
        use super::super::Dual;
        Quad {
            src: Dual { ipv4: Ipv4Addr::new(10, 0, 0, 1), port },
            dst: Dual { ipv4: Ipv4Addr::new(10, 0, 0, 2), port: 9 },
        }
    }

    #[test]
    fn fires_after_delay() {
        let (tx, rx) = mpsc::channel();
        let (svc, _jh) = TimerService::spawn(move |_svc, fired| {
            tx.send(fired).unwrap();
        });

        let mut slot = None;
        svc.arm(&mut slot, quad(1), TimerKind::DelAck, Duration::from_millis(20));

        let fired = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(fired.kind, TimerKind::DelAck);
        svc.shutdown();
    }

    #[test]
    fn cancel_suppresses_fire() {
        let (tx, rx) = mpsc::channel::<Fired>();
        let (svc, _jh) = TimerService::spawn(move |_svc, fired| {
            tx.send(fired).unwrap();
        });

        let mut slot = None;
        svc.arm(&mut slot, quad(2), TimerKind::Retransmit, Duration::from_millis(50));
        svc.cancel(&mut slot);
        assert!(slot.is_none());

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        svc.shutdown();
    }

    #[test]
    fn rearm_replaces_deadline() {
        let (tx, rx) = mpsc::channel();
        let (svc, _jh) = TimerService::spawn(move |_svc, fired| {
            tx.send(fired).unwrap();
        });

        let mut slot = None;
        svc.arm(&mut slot, quad(3), TimerKind::Linger, Duration::from_millis(500));
        svc.arm(&mut slot, quad(3), TimerKind::Linger, Duration::from_millis(10));

        let fired = rx.recv_timeout(Duration::from_millis(200)).unwrap();
        assert_eq!(fired.quad, quad(3));
        svc.shutdown();
    }
}
