//! Userspace TCP core: a `NetStack` drives a TUN device, dispatching inbound
//! segments to per-connection `TCB`s and exposing blocking `bind`/`accept`/
//! `connect` facades that hand out `std::io::Read`/`Write` `TcpStream`s.
//!
//! Locking follows the teacher's original grain: one `Mutex<Manager>` guards
//! every connection's TCB plus the listener/connect bookkeeping around it.
//! `tun`/`timers` live outside that mutex, each behind their own handle, so
//! the timer thread and the segment-reading thread never have to take the
//! manager lock just to reach the device.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use etherparse::{Ipv4HeaderSlice, TcpHeaderSlice};
use nix::poll::{poll, PollFd, PollFlags};
use tidy_tuntap::Tun;

mod err;
pub use err::*;

mod tcp;
use tcp::{write_reset, Action, Dual, Fired, Kind, Quad, TcpListener, TcpStream, TimerKind, TimerService, TCB};

#[derive(Debug)]
pub struct EstabElement {
    quad: Quad,
    rvar: Arc<Condvar>,
    wvar: Arc<Condvar>,
    svar: Arc<Condvar>,
}

#[derive(Debug)]
pub struct EstabEntry {
    cvar: Arc<Condvar>,
    elts: Vec<EstabElement>,
}

#[derive(Debug)]
pub struct StreamEntry {
    tcb: TCB,
    rvar: Arc<Condvar>,
    wvar: Arc<Condvar>,
    svar: Arc<Condvar>,
}

/// A `connect()` in flight: parked on `cvar` until the SYN_SENT automaton
/// resolves one way or the other (spec.md S5: "connect blocks until the
/// automaton leaves SYN_SENT").
#[derive(Debug)]
struct ConnectEntry {
    cvar: Arc<Condvar>,
    result: Option<Result<(), TcpError>>,
}

const EPHEMERAL_LO: u16 = 49152;

#[derive(Debug)]
pub struct Manager {
    iss: Arc<AtomicU32>,
    bounded: HashSet<u16>,
    next_ephemeral: u16,
    pending: HashMap<Quad, TCB>,
    connecting: HashMap<Quad, ConnectEntry>,
    established: HashMap<u16, EstabEntry>,
    streams: HashMap<Quad, StreamEntry>,
}

impl Default for Manager {
    fn default() -> Self {
        Manager {
            iss: Arc::new(AtomicU32::new(0)),
            bounded: HashSet::new(),
            next_ephemeral: EPHEMERAL_LO,
            pending: HashMap::new(),
            connecting: HashMap::new(),
            established: HashMap::new(),
            streams: HashMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct NetStack {
    addr: Ipv4Addr,
    manager: Arc<Mutex<Manager>>,
    tun: Arc<Mutex<Tun>>,
    timers: Arc<TimerService>,
    jh: thread::JoinHandle<()>,
    ih: thread::JoinHandle<()>,
}

impl NetStack {
    pub fn new(name: &str, addr: Ipv4Addr, mask: Ipv4Addr) -> Result<Self, TcpError> {
        let tun = Tun::new(name, false)?;
        tun.set_addr(addr)?;
        tun.set_netmask(mask)?;
        tun.bring_up()?;
        let tun = Arc::new(Mutex::new(tun));

        let iss = Arc::new(AtomicU32::new(rand::random()));

        let ih = {
            let iss = iss.clone();

            thread::spawn(move || loop {
                thread::sleep(Duration::from_millis(4));
                iss.fetch_add(1, Ordering::Release);
            })
        };

        let manager = Arc::new(Mutex::new(Manager {
            iss,
            ..Manager::default()
        }));

        let (timers, _timer_jh) = {
            let manager = manager.clone();
            let tun = tun.clone();

            TimerService::spawn(move |svc, fired| {
                on_timer_fire(&manager, &tun, &svc, fired);
            })
        };

        let jh = {
            let manager = manager.clone();
            let tun = tun.clone();
            let timers = timers.clone();

            thread::spawn(move || segment_loop(tun, manager, timers))
        };

        Ok(NetStack {
            addr,
            manager,
            tun,
            timers,
            jh,
            ih,
        })
    }

    pub fn bind(&mut self, port: u16) -> Result<TcpListener, TcpError> {
        let mut manager = self.manager.lock().unwrap();

        match manager.established.entry(port) {
            Entry::Occupied(_) => Err(TcpError::PortInUse(port)),
            Entry::Vacant(v) => {
                let cvar = Arc::new(Condvar::new());

                v.insert(EstabEntry {
                    cvar: cvar.clone(),
                    elts: Vec::new(),
                });

                assert!(manager.bounded.insert(port));

                Ok(TcpListener {
                    port,
                    manager: self.manager.clone(),
                    tun: self.tun.clone(),
                    timers: self.timers.clone(),
                    cvar,
                })
            }
        }
    }

    /// Actively open a connection to `daddr:dport`. Blocks until the
    /// handshake completes, is refused, or the SYN retransmit limit is
    /// exceeded.
    pub fn connect(&mut self, daddr: Ipv4Addr, dport: u16) -> Result<TcpStream, TcpError> {
        let mut manager = self.manager.lock().unwrap();

        let start = manager.next_ephemeral;
        let local_port = loop {
            let port = manager.next_ephemeral;
            manager.next_ephemeral = if port == u16::MAX { EPHEMERAL_LO } else { port + 1 };

            if !manager.bounded.contains(&port) {
                break port;
            }
            if manager.next_ephemeral == start {
                return Err(TcpError::InProgress);
            }
        };

        let quad = Quad {
            src: Dual { ipv4: self.addr, port: local_port },
            dst: Dual { ipv4: daddr, port: dport },
        };

        let iss = manager.iss.load(Ordering::Acquire);
        let mut tcb = TCB::syn_sent(quad, iss);

        {
            let mut tun = self.tun.lock().unwrap();
            tcb.send_initial_syn(&mut *tun, &self.timers);
        }

        manager.pending.insert(quad, tcb);
        let cvar = Arc::new(Condvar::new());
        manager.connecting.insert(
            quad,
            ConnectEntry {
                cvar: cvar.clone(),
                result: None,
            },
        );

        let mut manager = cvar
            .wait_while(manager, |manager| {
                manager.connecting.get(&quad).is_some_and(|entry| entry.result.is_none())
            })
            .unwrap();

        let entry = manager.connecting.remove(&quad).unwrap();
        match entry.result.unwrap() {
            Ok(()) => {
                let stream = manager.streams.get(&quad).expect("IsEstablished always inserts the stream first");
                Ok(TcpStream {
                    manager: self.manager.clone(),
                    tun: self.tun.clone(),
                    timers: self.timers.clone(),
                    quad,
                    rvar: stream.rvar.clone(),
                    wvar: stream.wvar.clone(),
                    svar: stream.svar.clone(),
                    closed: false,
                })
            }
            Err(err) => Err(err),
        }
    }

    pub fn join(self) {
        self.jh.join().unwrap();
        self.ih.join().unwrap();
    }
}

fn segment_loop(tun: Arc<Mutex<Tun>>, manager: Arc<Mutex<Manager>>, timers: Arc<TimerService>) -> ! {
    let fd = tun.lock().unwrap().as_raw_fd();

    loop {
        let mut pfd = [PollFd::new(fd, PollFlags::POLLIN)];
        if poll(&mut pfd[..], 100).unwrap() == 0 {
            continue;
        }

        let mut buf = [0u8; 1500];
        let n = {
            let mut tun = tun.lock().unwrap();
            match tun.read(&mut buf) {
                Ok(n) => n,
                Err(err) => {
                    log::warn!("failed to read from device: {err}");
                    continue;
                }
            }
        };

        let Ok(ip4h) = Ipv4HeaderSlice::from_slice(&buf[..n]) else { continue };
        let ihl = (ip4h.ihl() * 4) as usize;
        let Ok(tcph) = TcpHeaderSlice::from_slice(&buf[ihl..n]) else { continue };
        let data_off = ihl + (tcph.data_offset() * 4) as usize;
        let data = &buf[data_off..n];

        // Quad.src is always *us*, Quad.dst is always the peer - the
        // opposite of the packet's own src/dst fields, which describe
        // where this particular segment came from.
        let local = Dual {
            ipv4: ip4h.destination_addr(),
            port: tcph.destination_port(),
        };
        let remote = Dual {
            ipv4: ip4h.source_addr(),
            port: tcph.source_port(),
        };
        let quad = Quad { src: local, dst: remote };

        let mut manager = manager.lock().unwrap();
        let mut tun_guard = tun.lock().unwrap();

        let action = if let Some(StreamEntry { tcb, .. }) = manager.streams.get_mut(&quad) {
            tcb.on_segment(ip4h, tcph, data, &mut *tun_guard, &timers)
        } else if let Some(tcb) = manager.pending.get_mut(&quad) {
            tcb.on_segment(ip4h, tcph, data, &mut *tun_guard, &timers)
        } else if manager.bounded.contains(&local.port) {
            let iss = manager.iss.load(Ordering::Acquire);
            let mut tcb = TCB::listen(quad, iss);
            tcb.on_segment(ip4h, tcph, data, &mut *tun_guard, &timers)
        } else {
            // RFC 9293 S3.10.7.1: CLOSED. Any segment except another RST
            // draws a reset; a SYN not matching a listener is rejected
            // this way too.
            if tcph.rst() {
                continue;
            }

            write_reset(&ip4h, &tcph, data, &mut *tun_guard);
            Action::Noop
        };

        drop(tun_guard);

        match action {
            Action::Noop => {}
            Action::AddToPending(tcb) => {
                manager.pending.insert(quad, tcb);
            }
            Action::RemoveFromPending => {
                manager.pending.remove(&quad);
            }
            Action::IsEstablished => {
                let tcb = manager.pending.remove(&quad).unwrap();
                let kind = tcb.kind;

                let rvar = Arc::new(Condvar::new());
                let wvar = Arc::new(Condvar::new());
                let svar = Arc::new(Condvar::new());

                manager.streams.insert(
                    quad,
                    StreamEntry {
                        tcb,
                        rvar: rvar.clone(),
                        wvar: wvar.clone(),
                        svar: svar.clone(),
                    },
                );

                match kind {
                    Kind::Active => {
                        if let Some(connecting) = manager.connecting.get_mut(&quad) {
                            connecting.result = Some(Ok(()));
                            connecting.cvar.notify_all();
                        }
                    }
                    Kind::Passive => {
                        if let Some(EstabEntry { cvar, elts }) = manager.established.get_mut(&local.port) {
                            elts.push(EstabElement { quad, rvar, wvar, svar });
                            cvar.notify_one();
                        }
                    }
                }
            }
            Action::Reset => {
                // Left in `streams` so blocked readers/writers can still
                // observe `tcb.err` and report it precisely, rather than a
                // bare NotConnected once the entry disappears.
                if let Some(stream) = manager.streams.get(&quad) {
                    stream.rvar.notify_all();
                    stream.wvar.notify_all();
                    stream.svar.notify_all();
                }
            }
            Action::DeleteTCB => {
                if let Some(stream) = manager.streams.remove(&quad) {
                    stream.rvar.notify_all();
                    stream.wvar.notify_all();
                    stream.svar.notify_all();
                }
            }
            Action::ConnectionRefused => {
                if manager.pending.remove(&quad).is_some() {
                    if let Some(connecting) = manager.connecting.get_mut(&quad) {
                        connecting.result = Some(Err(TcpError::ConnectionRefused));
                        connecting.cvar.notify_all();
                    }
                }
            }
            Action::Wakeup {
                wake_up_reader,
                wake_up_writer,
                wake_up_closer,
            } => {
                if let Some(StreamEntry { rvar, wvar, svar, .. }) = manager.streams.get(&quad) {
                    if wake_up_reader {
                        rvar.notify_one();
                    }
                    if wake_up_writer {
                        wvar.notify_one();
                    }
                    if wake_up_closer {
                        svar.notify_one();
                    }
                }
            }
        }
    }
}

/// Dispatches a fired timer back into whichever table currently owns the
/// connection it was armed for, guarding against a stale fire (the slot
/// was already re-armed or cancelled, or the connection is gone).
fn on_timer_fire(manager: &Arc<Mutex<Manager>>, tun: &Arc<Mutex<Tun>>, svc: &Arc<TimerService>, fired: Fired) {
    let mut manager = manager.lock().unwrap();
    let quad = fired.quad;

    match fired.kind {
        TimerKind::Retransmit => {
            let give_up = if let Some(entry) = manager.streams.get_mut(&quad) {
                if entry.tcb.retransmit_timer != Some(fired.id) {
                    return;
                }
                let mut tun = tun.lock().unwrap();
                entry.tcb.on_retransmit_fire(&mut *tun, svc)
            } else if let Some(tcb) = manager.pending.get_mut(&quad) {
                if tcb.retransmit_timer != Some(fired.id) {
                    return;
                }
                let mut tun = tun.lock().unwrap();
                tcb.on_retransmit_fire(&mut *tun, svc)
            } else {
                return;
            };

            if !give_up {
                return;
            }

            if let Some(stream) = manager.streams.remove(&quad) {
                stream.rvar.notify_all();
                stream.wvar.notify_all();
                stream.svar.notify_all();
            } else if manager.pending.remove(&quad).is_some() {
                if let Some(connecting) = manager.connecting.get_mut(&quad) {
                    connecting.result = Some(Err(TcpError::TimedOut));
                    connecting.cvar.notify_all();
                }
            }
        }
        TimerKind::DelAck => {
            if let Some(entry) = manager.streams.get_mut(&quad) {
                if entry.tcb.delack_timer != Some(fired.id) {
                    return;
                }
                let mut tun = tun.lock().unwrap();
                entry.tcb.on_delack_fire(&mut *tun);
            }
        }
        TimerKind::Linger => {
            if let Some(entry) = manager.streams.get_mut(&quad) {
                if entry.tcb.linger_timer != Some(fired.id) {
                    return;
                }
                if entry.tcb.on_linger_fire() {
                    manager.streams.remove(&quad);
                }
            }
        }
        TimerKind::Keepalive => {}
    }
}
