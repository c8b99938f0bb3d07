//! The Transmission Control Block: per-connection state, RFC 9293 S3.10.7
//! segment arrival processing, and the retransmission/delayed-ACK/TIME-WAIT
//! timer callbacks. One `TCB` exists per `Quad` for the lifetime of a
//! connection, guarded by the same lock as the rest of the manager's tables.

use std::cmp;
use std::collections::VecDeque;
use std::io::Write;
use std::time::{Duration, Instant};

use etherparse::{Ipv4HeaderSlice, TcpHeaderSlice};

use crate::err::ErrorKind;

use super::seq;
use super::timer::{TimerId, TimerKind, TimerService};
use super::*;

/// Cap on data-segment retransmissions before the connection is abandoned.
/// Not named by any RFC MUST; level-ip leaves this unbounded. Chosen here,
/// in the >= 7 range the state machine calls for, see DESIGN.md.
const MAX_RTX: u8 = 7;
/// RFC 9293 S3.8.3: R2 for the initial SYN must allow at least 3 minutes of
/// retries; level-ip's TCP_CONN_RETRIES=3 gives the same ballpark via a
/// retry count rather than a duration, which is what we track here.
const MAX_SYN_RETRIES: u8 = 3;
const RTO_FLOOR_MS: u128 = 1000;
const RTO_CEIL_MS: u128 = 64_000;
const DELACK_MS: u64 = 200;
const MSL_SECS: u64 = 30;
const DEFAULT_MSS: u16 = 536;
const DEFAULT_RECV_BUF: usize = 64240;

/*
                    RFC 9293 - S3.3.2 - Fig 5

                            +---------+ ---------\      active OPEN
                            |  CLOSED |            \    -----------
                            +---------+<---------\   \   create TCB
                              |     ^              \   \  snd SYN
                 passive OPEN |     |   CLOSE        \   \
                 ------------ |     | ----------       \   \
                  create TCB  |     | delete TCB         \   \
                              V     |                      \   \
          rcv RST (note 1)  +---------+            CLOSE    |    \
       -------------------->|  LISTEN |          ---------- |     |
      /                     +---------+          delete TCB |     |
     /           rcv SYN      |     |     SEND              |     |
    /           -----------   |     |    -------            |     V
+--------+      snd SYN,ACK  /       \   snd SYN          +--------+
|        |<-----------------           ------------------>|        |
|  SYN   |                    rcv SYN                     |  SYN   |
|  RCVD  |<-----------------------------------------------|  SENT  |
|        |                  snd SYN,ACK                   |        |
|        |------------------           -------------------|        |
+--------+   rcv ACK of SYN  \       /  rcv SYN,ACK       +--------+
   |         --------------   |     |   -----------
   |                x         |     |     snd ACK
   |                          V     V
   |  CLOSE                 +---------+
   | -------                |  ESTAB  |
   | snd FIN                +---------+
   |                 CLOSE    |     |    rcv FIN
   V                -------   |     |    -------
+---------+         snd FIN  /       \   snd ACK         +---------+
|  FIN    |<----------------          ------------------>|  CLOSE  |
| WAIT-1  |------------------                            |   WAIT  |
+---------+          rcv FIN  \                          +---------+
  | rcv ACK of FIN   -------   |                          CLOSE  |
  | --------------   snd ACK   |                         ------- |
  V        x                   V                         snd FIN V
+---------+               +---------+                    +---------+
|FINWAIT-2|               | CLOSING |                    | LAST-ACK|
+---------+               +---------+                    +---------+
  |              rcv ACK of FIN |                 rcv ACK of FIN |
  |  rcv FIN     -------------- |    Timeout=2MSL -------------- |
  |  -------            x       V    ------------        x       V
   \ snd ACK              +---------+delete TCB          +---------+
     -------------------->|TIME-WAIT|------------------->| CLOSED  |
                          +---------+                    +---------+
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Listen,
    SynRcvd,
    SynSent,
    Estab,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendSpace {
    pub(crate) una: u32,
    pub(crate) nxt: u32,
    pub(crate) wnd: u16,
    pub(crate) wl1: u32,
    pub(crate) wl2: u32,
    pub(crate) iss: u32,
    pub(crate) mss: u16,
    pub(crate) max_wnd: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvSpace {
    pub(crate) nxt: u32,
    pub(crate) wnd: u16,
    pub(crate) irs: u32,
    pub(crate) mss: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Active,
    Passive,
}

#[derive(Debug, Clone)]
pub enum Action {
    Noop,
    AddToPending(TCB),
    RemoveFromPending,
    IsEstablished,
    Reset,
    DeleteTCB,
    Wakeup {
        wake_up_reader: bool,
        wake_up_writer: bool,
        wake_up_closer: bool,
    },
    ConnectionRefused,
}

/// An entry on the retransmission queue: a byte range we've sent but not
/// yet had fully acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    sno: u32,
    una: u32,
    len: u32,
    fin: bool,
    syn: bool,
    ack: bool,
    mss: Option<u16>,
    rtx_count: u8,
    sent: Option<Instant>,
}

impl Segment {
    fn end(&self) -> u32 {
        self.sno.wrapping_add(self.len).wrapping_sub(1)
    }

    fn unacked_data_len(&self) -> usize {
        (self.end().wrapping_sub(self.una) + 1) as usize - if self.fin { 1 } else { 0 }
    }
}

/// A held-out-of-order byte range, queued until the gap before it closes.
/// Grounded in level-ip's `struct sk_buff_head ofo_queue` on `tcp_sock`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OfoSegment {
    seq: u32,
    data: Vec<u8>,
    fin: bool,
}

#[derive(Debug, Clone)]
pub struct TCB {
    pub(crate) quad: Quad,
    pub(crate) kind: Kind,
    pub(crate) state: State,
    pub(crate) err: Option<ErrorKind>,
    pub(crate) read_closed: bool,
    pub(crate) write_closed: bool,

    pub(crate) snd: SendSpace,
    pub(crate) rcv: RecvSpace,

    srtt: u128,
    rttvar: u128,
    rto: u128,
    rtt_measured: bool,
    backoff: u8,

    pending_acks: u8,

    pub(crate) retransmit_timer: Option<TimerId>,
    pub(crate) delack_timer: Option<TimerId>,
    pub(crate) linger_timer: Option<TimerId>,
    /// Spec.md's fourth timer slot. Never armed by this core (S9 open
    /// question: keepalive is optional and unexercised), kept so the TCB's
    /// shape matches the data model's four timer slots exactly.
    #[allow(dead_code)]
    pub(crate) keepalive_timer: Option<TimerId>,

    pub(crate) incoming: VecDeque<u8>,
    pub(crate) outgoing: VecDeque<u8>,
    segments: VecDeque<Segment>,
    ofo_queue: VecDeque<OfoSegment>,
}

impl TCB {
    pub fn listen(quad: Quad, iss: u32) -> Self {
        TCB {
            quad,
            kind: Kind::Passive,
            state: State::Listen,
            err: None,
            read_closed: false,
            write_closed: false,
            snd: SendSpace {
                una: iss,
                nxt: iss,
                wnd: 0,
                wl1: 0,
                wl2: 0,
                iss,
                mss: DEFAULT_MSS,
                max_wnd: 0,
            },
            rcv: RecvSpace {
                nxt: 0,
                wnd: DEFAULT_RECV_BUF as u16,
                irs: 0,
                mss: DEFAULT_MSS,
            },
            srtt: 0,
            rttvar: 0,
            // Until an RTT sample exists, RFC 9293 S3.8.1 has the sender use
            // RTO <- 1s, backoff still applying on top of that.
            rto: RTO_FLOOR_MS,
            rtt_measured: false,
            backoff: 0,
            pending_acks: 0,
            retransmit_timer: None,
            delack_timer: None,
            linger_timer: None,
            keepalive_timer: None,
            incoming: VecDeque::with_capacity(DEFAULT_RECV_BUF),
            outgoing: VecDeque::new(),
            segments: VecDeque::new(),
            ofo_queue: VecDeque::new(),
        }
    }

    pub fn syn_sent(quad: Quad, iss: u32) -> Self {
        let mut tcb = TCB::listen(quad, iss);
        tcb.kind = Kind::Active;
        tcb.state = State::SynSent;

        tcb.segments.push_front(Segment {
            sno: tcb.snd.nxt,
            una: tcb.snd.nxt,
            len: 1,
            fin: false,
            syn: true,
            ack: false,
            mss: Some(tcb.rcv.mss),
            rtx_count: 0,
            sent: None,
        });
        tcb.snd.nxt = tcb.snd.iss.wrapping_add(1);

        tcb
    }

    /// Emit the initial SYN `syn_sent()` queued and arm its retransmit
    /// timer. Called once by the connection-initiating side.
    pub fn send_initial_syn<W: Write>(&mut self, w: &mut W, timers: &TimerService) {
        write_synack(&self.quad, self.snd.iss, None, self.rcv.wnd, self.rcv.mss, w);
        if let Some(seg) = self.segments.front_mut() {
            seg.sent = Some(Instant::now());
        }
        self.arm_retransmit(timers);
    }

    pub fn is_outgoing_full(&self) -> bool {
        self.outgoing.len() >= self.outgoing.capacity().max(self.snd.max_wnd as usize)
    }

    fn is_fin_acked(&self) -> bool {
        self.outgoing.is_empty() && self.segments.is_empty() && self.snd.una == self.snd.nxt && self.write_closed
    }

    /// Mark the connection for a FIN and move to the half-closed state
    /// appropriate for where we came from. Never blocks: per spec.md S5,
    /// `close` returns immediately, it does not wait for the peer's
    /// FIN/ACK.
    ///
    /// This does not itself place a FIN segment on the write queue: any
    /// bytes still buffered, unsent, in `outgoing` have not consumed
    /// sequence numbers yet (spec.md S4.3 - "seq consumed at send time"),
    /// so the FIN cannot be assigned a sequence number until they have
    /// been. `try_send` appends and transmits the FIN segment itself, in
    /// its rightful place after every such byte, once `outgoing` has
    /// fully drained.
    pub fn close<W: Write>(&mut self, w: &mut W, timers: &TimerService) {
        self.write_closed = true;

        self.state = match self.state {
            State::Estab => State::FinWait1,
            State::CloseWait => State::LastAck,
            other => other,
        };

        self.try_send(w, timers);
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> usize {
        let len = cmp::min(buf.len(), self.incoming.len());
        let data: Vec<u8> = self.incoming.drain(..len).collect();
        buf[..data.len()].copy_from_slice(&data);

        // RFC 9293 S3.8.6.2.2 SWS avoidance: only widen the advertised
        // window once the freed space clears half the buffer or one MSS,
        // whichever is smaller, instead of dribbling it open a byte at a
        // time.
        let free = self.incoming.capacity() - self.incoming.len() - self.rcv.wnd as usize;
        if free >= cmp::min(self.incoming.capacity() / 2, self.rcv.mss as usize) {
            self.rcv.wnd = (self.incoming.capacity() - self.incoming.len()) as u16;
        }

        len
    }

    /// Push as much queued `outgoing` data as the peer's window and our MSS
    /// allow, then — once `outgoing` has fully drained and `close()` has
    /// been called — append and send the FIN, and (re)arm the retransmit
    /// timer over whatever is now in flight. Called after a write, after
    /// an ACK frees window, and after close().
    pub fn try_send<W: Write>(&mut self, w: &mut W, timers: &TimerService) {
        if self.snd.wnd == 0 && !self.segments.is_empty() {
            // Zero window: nothing new to push. on_retransmit_fire takes
            // over and sends a one-byte probe on the existing retransmit
            // timer instead.
        } else {
            let sent_len = self.snd.nxt.wrapping_sub(self.snd.una) as usize;
            let in_flight_cap = self.snd.wnd as usize;

            if self.outgoing.len() > sent_len && in_flight_cap > sent_len {
                let available = self.outgoing.len() - sent_len;
                let to_send = cmp::min(available, in_flight_cap - sent_len);
                let data_len = cmp::min(to_send, self.snd.mss as usize);

                if data_len > 0 {
                    let data: Vec<u8> = self
                        .outgoing
                        .iter()
                        .copied()
                        .skip(sent_len)
                        .take(data_len)
                        .collect();

                    write_data(
                        self.quad,
                        self.snd.nxt,
                        self.rcv.nxt,
                        self.rcv.wnd,
                        w,
                        &data,
                        false,
                        false,
                        true,
                        None,
                    );

                    self.segments.push_back(Segment {
                        sno: self.snd.nxt,
                        una: self.snd.nxt,
                        len: data_len as u32,
                        fin: false,
                        syn: false,
                        ack: true,
                        mss: None,
                        rtx_count: 0,
                        sent: Some(Instant::now()),
                    });

                    self.snd.nxt = self.snd.nxt.wrapping_add(data_len as u32);
                }
            }

            // Once every byte close() saw in `outgoing` is on the wire, the
            // FIN itself can finally be assigned a sequence number and
            // sent. Queuing it here, rather than in close(), guarantees it
            // lands at the tail of `segments` after any data segment still
            // ahead of it, keeping the retransmit queue in ascending
            // sequence order. `segments.back()` already being a FIN means
            // it went out on an earlier call; never queue a second one.
            let sent_len = self.snd.nxt.wrapping_sub(self.snd.una) as usize;
            let fin_pending = !self.segments.back().is_some_and(|seg| seg.fin);
            if self.write_closed && self.outgoing.len() <= sent_len && fin_pending {
                let fin_sno = self.snd.nxt;
                write_data(
                    self.quad,
                    fin_sno,
                    self.rcv.nxt,
                    self.rcv.wnd,
                    w,
                    &[],
                    true,
                    false,
                    true,
                    None,
                );

                self.segments.push_back(Segment {
                    sno: fin_sno,
                    una: fin_sno,
                    len: 1,
                    fin: true,
                    syn: false,
                    ack: true,
                    mss: None,
                    rtx_count: 0,
                    sent: Some(Instant::now()),
                });

                self.snd.nxt = self.snd.nxt.wrapping_add(1);
            }
        }

        if !self.segments.is_empty() {
            self.arm_retransmit(timers);
        }
    }

    fn arm_retransmit(&mut self, timers: &TimerService) {
        if self.retransmit_timer.is_some() {
            return;
        }
        timers.arm(
            &mut self.retransmit_timer,
            self.quad,
            TimerKind::Retransmit,
            Duration::from_millis(self.rto as u64),
        );
    }

    fn schedule_ack<W: Write>(&mut self, w: &mut W, timers: &TimerService, urgent: bool) {
        if urgent {
            timers.cancel(&mut self.delack_timer);
            self.pending_acks = 0;
            write_ack(&self.quad, self.snd.nxt, self.rcv.nxt, self.rcv.wnd, w);
            return;
        }

        self.pending_acks += 1;
        if self.pending_acks >= 2 {
            timers.cancel(&mut self.delack_timer);
            self.pending_acks = 0;
            write_ack(&self.quad, self.snd.nxt, self.rcv.nxt, self.rcv.wnd, w);
        } else if self.delack_timer.is_none() {
            timers.arm(
                &mut self.delack_timer,
                self.quad,
                TimerKind::DelAck,
                Duration::from_millis(DELACK_MS),
            );
        }
    }

    /// Clip `data` against whatever's already queued (earlier-queued bytes
    /// win over an incoming duplicate covering the same range) and enqueue
    /// whatever disjoint pieces remain.
    fn insert_ofo(&mut self, seq: u32, data: &[u8], fin: bool) {
        if data.is_empty() && !fin {
            return;
        }

        let rel = |s: u32| s.wrapping_sub(self.rcv.nxt);
        let mut occupied: Vec<(u32, u32)> = self
            .ofo_queue
            .iter()
            .map(|o| (rel(o.seq), rel(o.seq) + o.data.len() as u32))
            .collect();
        occupied.sort_unstable();

        let base = rel(seq);
        let end = base + data.len() as u32;
        let mut cursor = base;
        let mut pieces = Vec::new();

        for (s, e) in occupied {
            if e <= cursor {
                continue;
            }
            if s >= end {
                break;
            }
            if s > cursor {
                pieces.push((cursor, s));
            }
            cursor = cmp::max(cursor, e);
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            pieces.push((cursor, end));
        }

        for (s, e) in pieces {
            self.ofo_queue.push_back(OfoSegment {
                seq: self.rcv.nxt.wrapping_add(s),
                data: data[(s - base) as usize..(e - base) as usize].to_vec(),
                fin: fin && e == end,
            });
        }

        self.ofo_queue
            .make_contiguous()
            .sort_unstable_by_key(|o| rel(o.seq));
    }

    /// After accepting an in-order segment, pull any now-contiguous
    /// reassembled ranges out of the ofo queue. Returns true if a FIN was
    /// thereby exposed.
    fn drain_ofo(&mut self) -> bool {
        let mut fin_seen = false;
        while let Some(front) = self.ofo_queue.front() {
            if front.seq != self.rcv.nxt {
                break;
            }
            let seg = self.ofo_queue.pop_front().unwrap();
            let len = seg.data.len();
            self.incoming.extend(seg.data);
            self.rcv.nxt = self.rcv.nxt.wrapping_add(len as u32);
            self.rcv.wnd = self.rcv.wnd.saturating_sub(len as u16);
            if seg.fin {
                self.rcv.nxt = self.rcv.nxt.wrapping_add(1);
                fin_seen = true;
                break;
            }
        }
        fin_seen
    }

    /// Advance SND.UNA, retiring fully-acked segments from the
    /// retransmission queue. Returns whether outgoing buffer space freed up
    /// (so a blocked writer can be woken) and, if the oldest segment was
    /// acked on its first transmission, the RTT sample for Karn/Jacobson.
    fn process_ack(&mut self, ackno: u32) -> (bool, Option<u128>) {
        self.snd.una = ackno;

        let before_len = self.outgoing.len();
        let mut sample_ms = None;

        while let Some(seg) = self.segments.front_mut() {
            let end = seg.end();

            if seq::between_wrap(seg.una.wrapping_sub(1), ackno, end.wrapping_add(1)) {
                // Partial acknowledgment.
                let acked = ackno.wrapping_sub(seg.una);
                self.outgoing.drain(..acked as usize);
                seg.una = ackno;
                break;
            } else if seq::lt(end, ackno) {
                // Full acknowledgment of this segment.
                if seg.rtx_count == 0 {
                    if let Some(sent) = seg.sent {
                        sample_ms = Some(sent.elapsed().as_millis());
                    }
                }
                let seg = self.segments.pop_front().unwrap();
                self.outgoing.drain(..seg.unacked_data_len());
            } else {
                break;
            }
        }

        self.backoff = 0;
        if self.segments.is_empty() {
            self.rto = cmp::max(self.rto, RTO_FLOOR_MS);
        }

        (before_len > self.outgoing.len() || self.outgoing.is_empty(), sample_ms)
    }

    fn compute_rto(&mut self, sample_ms: u128) {
        if !self.rtt_measured {
            self.srtt = sample_ms;
            self.rttvar = sample_ms / 2;
            self.rtt_measured = true;
        } else {
            self.rttvar = ((1.0 - 0.25) * self.rttvar as f64 + 0.25 * self.srtt.abs_diff(sample_ms) as f64) as u128;
            self.srtt = ((1.0 - 0.125) * self.srtt as f64 + 0.125 * sample_ms as f64) as u128;
        }
        self.rto = cmp::max(self.srtt + cmp::max(100, 4 * self.rttvar), RTO_FLOOR_MS);
        self.rto = cmp::min(self.rto, RTO_CEIL_MS);
    }

    /// Fired by the timer service: retransmit the oldest unacked segment
    /// (or probe a zero window), doubling the backoff. Returns true if the
    /// connection should be torn down (R2/MAX_RTX exceeded).
    pub fn on_retransmit_fire<W: Write>(&mut self, w: &mut W, timers: &TimerService) -> bool {
        self.retransmit_timer = None;

        if self.snd.wnd == 0 && !self.segments.is_empty() {
            write_data(
                self.quad,
                self.snd.una.wrapping_sub(1),
                self.rcv.nxt,
                self.rcv.wnd,
                w,
                &[0u8],
                false,
                false,
                true,
                None,
            );
            self.rto = cmp::min(self.rto * 2, RTO_CEIL_MS);
            self.arm_retransmit(timers);
            return false;
        }

        let Some(seg) = self.segments.front_mut() else {
            return false;
        };

        let limit = if seg.syn { MAX_SYN_RETRIES } else { MAX_RTX };
        if self.backoff >= limit {
            log::warn!("{:?}: giving up after {} retransmissions", self.quad, self.backoff);
            return true;
        }

        let data: Vec<u8> = self.outgoing.iter().copied().take(seg.unacked_data_len()).collect();

        write_data(
            self.quad,
            seg.sno,
            self.rcv.nxt,
            self.rcv.wnd,
            w,
            &data,
            seg.fin,
            seg.syn,
            seg.ack,
            seg.mss,
        );

        seg.rtx_count += 1;
        self.backoff += 1;
        self.rto = cmp::min(self.rto * 2, RTO_CEIL_MS);

        self.arm_retransmit(timers);
        false
    }

    pub fn on_delack_fire<W: Write>(&mut self, w: &mut W) {
        self.delack_timer = None;
        self.pending_acks = 0;
        write_ack(&self.quad, self.snd.nxt, self.rcv.nxt, self.rcv.wnd, w);
    }

    /// Fired 2*MSL after entering TIME-WAIT with no further traffic seen.
    /// Always terminal: the caller deletes the TCB.
    pub fn on_linger_fire(&mut self) -> bool {
        self.linger_timer = None;
        true
    }

    fn restart_linger(&mut self, timers: &TimerService) {
        timers.arm(
            &mut self.linger_timer,
            self.quad,
            TimerKind::Linger,
            Duration::from_secs(2 * MSL_SECS),
        );
    }

    pub fn on_segment<W: Write>(
        &mut self,
        ip4h: Ipv4HeaderSlice,
        tcph: TcpHeaderSlice,
        data: &[u8],
        w: &mut W,
        timers: &TimerService,
    ) -> Action {
        log::trace!("{:?}: on_segment in state {:?}", self.quad, self.state);

        if self.state == State::Listen {
            return self.on_segment_listen(ip4h, tcph, data, w, timers);
        }

        if self.state == State::SynSent {
            return self.on_segment_syn_sent(ip4h, tcph, w, timers);
        }

        self.on_segment_synchronized(ip4h, tcph, data, w, timers)
    }

    fn on_segment_listen<W: Write>(
        &mut self,
        ip4h: Ipv4HeaderSlice,
        tcph: TcpHeaderSlice,
        data: &[u8],
        w: &mut W,
        timers: &TimerService,
    ) -> Action {
        // RFC 9293 S3.10.7.2: in LISTEN, an RST is ignored, any ACK draws a
        // reset, and a SYN spawns SYN-RECEIVED.
        if tcph.rst() {
            return Action::Noop;
        }

        if tcph.ack() {
            write_reset(&ip4h, &tcph, data, w);
            return Action::Noop;
        }

        if tcph.syn() {
            let mss = negotiate_mss(&tcph, DEFAULT_MSS);

            self.rcv.nxt = tcph.sequence_number().wrapping_add(1);
            self.rcv.irs = tcph.sequence_number();
            self.snd.wnd = tcph.window_size();
            self.snd.max_wnd = tcph.window_size();
            self.snd.mss = mss;

            self.segments.push_front(Segment {
                sno: self.snd.nxt,
                una: self.snd.nxt,
                len: 1,
                fin: false,
                syn: true,
                ack: true,
                mss: Some(self.rcv.mss),
                rtx_count: 0,
                sent: Some(Instant::now()),
            });
            self.snd.nxt = self.snd.iss.wrapping_add(1);

            self.state = State::SynRcvd;

            write_synack(&self.quad, self.snd.iss, Some(self.rcv.nxt), self.rcv.wnd, self.rcv.mss, w);
            self.arm_retransmit(timers);

            return Action::AddToPending(self.clone());
        }

        Action::Noop
    }

    fn on_segment_syn_sent<W: Write>(
        &mut self,
        ip4h: Ipv4HeaderSlice,
        tcph: TcpHeaderSlice,
        w: &mut W,
        timers: &TimerService,
    ) -> Action {
        if tcph.ack() {
            let acceptable = seq::between_wrap(self.snd.una.wrapping_sub(1), tcph.acknowledgment_number(), self.snd.nxt.wrapping_add(1));
            if !acceptable {
                if !tcph.rst() {
                    write_reset(&ip4h, &tcph, &[], w);
                }
                return Action::Noop;
            }
            if tcph.rst() {
                return Action::ConnectionRefused;
            }
        } else if tcph.rst() {
            return Action::Noop;
        }

        if tcph.syn() {
            let mss = negotiate_mss(&tcph, DEFAULT_MSS);
            self.rcv.nxt = tcph.sequence_number().wrapping_add(1);
            self.rcv.irs = tcph.sequence_number();
            self.rcv.mss = mss;

            if tcph.ack() {
                self.snd.una = tcph.acknowledgment_number();

                self.snd.wnd = tcph.window_size();
                self.snd.wl1 = tcph.sequence_number();
                self.snd.wl2 = tcph.acknowledgment_number();
                self.snd.max_wnd = self.snd.wnd;

                self.outgoing.reserve(self.snd.wnd as usize);

                timers.cancel(&mut self.retransmit_timer);
                self.segments.pop_front();

                self.state = State::Estab;
                write_ack(&self.quad, self.snd.nxt, self.rcv.nxt, self.rcv.wnd, w);

                return Action::IsEstablished;
            }

            // Simultaneous open: a bare SYN with no ACK.
            self.state = State::SynRcvd;
            write_synack(&self.quad, self.snd.iss, Some(self.rcv.nxt), self.rcv.wnd, self.rcv.mss, w);
            return Action::Noop;
        }

        Action::Noop
    }

    fn on_segment_synchronized<W: Write>(
        &mut self,
        ip4h: Ipv4HeaderSlice,
        tcph: TcpHeaderSlice,
        data: &[u8],
        w: &mut W,
        timers: &TimerService,
    ) -> Action {
        let seg_len = data.len() + if tcph.syn() { 1 } else { 0 } + if tcph.fin() { 1 } else { 0 };

        if !seq::is_segment_acceptable(self.rcv.nxt, self.rcv.wnd as u32, tcph.sequence_number(), seg_len as u32) {
            if tcph.rst() {
                return Action::Noop;
            }
            write_ack(&self.quad, self.snd.nxt, self.rcv.nxt, self.rcv.wnd, w);
            return Action::Noop;
        }

        if tcph.rst() {
            return match self.state {
                State::SynRcvd if self.kind == Kind::Passive => Action::RemoveFromPending,
                State::SynRcvd => Action::ConnectionRefused,
                State::Estab | State::FinWait1 | State::FinWait2 | State::CloseWait => {
                    self.err = Some(ErrorKind::ConnectionReset);
                    Action::Reset
                }
                _ => Action::Noop,
            };
        }

        if tcph.syn() {
            match self.state {
                State::SynRcvd if self.kind == Kind::Passive => return Action::RemoveFromPending,
                State::SynRcvd
                | State::Estab
                | State::FinWait1
                | State::FinWait2
                | State::CloseWait
                | State::Closing
                | State::LastAck
                | State::TimeWait => {
                    // RFC 5961 S4: challenge ACK rather than an RFC 793 reset.
                    write_ack(&self.quad, self.snd.nxt, self.rcv.nxt, self.rcv.wnd, w);
                    return Action::Noop;
                }
                _ => {}
            }
        }

        if !tcph.ack() {
            return Action::Noop;
        }

        let mut wake_up_reader = false;
        let mut wake_up_writer = false;
        let mut wake_up_closer = false;

        if self.state == State::SynRcvd {
            if seq::between_wrap(self.snd.una.wrapping_sub(1), tcph.acknowledgment_number(), self.snd.nxt.wrapping_add(1)) {
                self.state = State::Estab;
                self.snd.wnd = tcph.window_size();
                self.snd.wl1 = tcph.sequence_number();
                self.snd.wl2 = tcph.acknowledgment_number();
                self.snd.max_wnd = self.snd.wnd;

                self.outgoing.reserve(self.snd.wnd as usize);
                timers.cancel(&mut self.retransmit_timer);
                self.segments.pop_front();

                return Action::IsEstablished;
            }
            write_reset(&ip4h, &tcph, data, w);
            return Action::Noop;
        } else if matches!(
            self.state,
            State::Estab | State::FinWait1 | State::FinWait2 | State::CloseWait | State::Closing
        ) {
            let ack_in_window =
                seq::between_wrap(self.snd.una.wrapping_sub(1), tcph.acknowledgment_number(), self.snd.nxt.wrapping_add(1));

            // Window update (RFC 9293 S3.10.7.4) is applied before any
            // retransmission-queue draining below so `try_send` sees the
            // peer's freshest advertised window rather than the one in
            // effect when this segment arrived.
            if ack_in_window
                && (seq::lt(self.snd.wl1, tcph.sequence_number())
                    || (self.snd.wl1 == tcph.sequence_number() && seq::le(self.snd.wl2, tcph.acknowledgment_number())))
            {
                self.snd.wnd = tcph.window_size();
                self.snd.wl1 = tcph.sequence_number();
                self.snd.wl2 = tcph.acknowledgment_number();
                self.snd.max_wnd = cmp::max(self.snd.max_wnd, self.snd.wnd);

                if self.snd.wnd == 0 {
                    self.arm_retransmit(timers);
                }
            }

            if ack_in_window {
                let (can_write, rto_sample) = self.process_ack(tcph.acknowledgment_number());
                if let Some(sample_ms) = rto_sample {
                    self.compute_rto(sample_ms);
                }
                wake_up_writer = can_write;

                if self.segments.is_empty() {
                    timers.cancel(&mut self.retransmit_timer);
                } else {
                    timers.cancel(&mut self.retransmit_timer);
                    self.arm_retransmit(timers);
                }

                self.try_send(w, timers);
            } else if seq::lt(self.snd.nxt, tcph.acknowledgment_number()) {
                write_ack(&self.quad, self.snd.nxt, self.rcv.nxt, self.rcv.wnd, w);
                return Action::Noop;
            }
        } else if self.state == State::LastAck {
            self.process_ack(tcph.acknowledgment_number());
            if self.is_fin_acked() {
                return Action::DeleteTCB;
            }
        } else if self.state == State::TimeWait {
            self.restart_linger(timers);
            write_ack(&self.quad, self.snd.nxt, self.rcv.nxt, self.rcv.wnd, w);
        }

        if self.state == State::FinWait1 && self.is_fin_acked() {
            self.state = State::FinWait2;
        }
        if self.state == State::Closing && self.is_fin_acked() {
            self.state = State::TimeWait;
            timers.cancel(&mut self.retransmit_timer);
            self.restart_linger(timers);
            wake_up_closer = true;
        }
        if self.state == State::FinWait2 {
            wake_up_closer = true;
        }

        let mut process_fin = tcph.fin();

        if matches!(self.state, State::Estab | State::FinWait1 | State::FinWait2) {
            if seq::lt(self.rcv.nxt, tcph.sequence_number()) {
                // Gap before this segment: hold it for reassembly, ack
                // immediately (dup ack) to nudge a fast retransmit, and
                // don't advance rcv.nxt.
                self.insert_ofo(tcph.sequence_number(), data, tcph.fin());
                write_ack(&self.quad, self.snd.nxt, self.rcv.nxt, self.rcv.wnd, w);
                return Action::Wakeup { wake_up_reader, wake_up_writer, wake_up_closer };
            }

            let new = self.rcv.nxt.wrapping_sub(tcph.sequence_number()) as usize;
            let new_len = data.len().saturating_sub(new);
            let acc_len = cmp::min(new_len, self.rcv.wnd as usize);
            let accepted = &data[new..new + acc_len];

            process_fin &= new_len == acc_len;

            self.incoming.extend(accepted.iter());
            let pre_wnd = self.rcv.wnd;
            self.rcv.nxt = self.rcv.nxt.wrapping_add(acc_len as u32);
            self.rcv.wnd = self.rcv.wnd.saturating_sub(acc_len as u16);

            if !accepted.is_empty() {
                process_fin |= self.drain_ofo();
            }

            wake_up_reader = !accepted.is_empty() || process_fin;

            let urgent = pre_wnd == 0 || process_fin || !self.ofo_queue.is_empty();
            if !accepted.is_empty() || process_fin {
                self.schedule_ack(w, timers, urgent);
            }
        }

        if process_fin {
            match self.state {
                State::Listen | State::SynSent => return Action::Noop,
                State::SynRcvd | State::Estab => {
                    self.state = State::CloseWait;
                    self.read_closed = true;
                    wake_up_reader = true;
                }
                State::FinWait1 => {
                    if self.is_fin_acked() {
                        self.state = State::TimeWait;
                        timers.cancel(&mut self.retransmit_timer);
                        self.restart_linger(timers);
                    } else {
                        self.state = State::Closing;
                    }
                }
                State::FinWait2 => {
                    self.state = State::TimeWait;
                    timers.cancel(&mut self.retransmit_timer);
                    self.restart_linger(timers);
                }
                State::CloseWait | State::Closing | State::LastAck => return Action::Noop,
                State::TimeWait => self.restart_linger(timers),
            }
        }

        Action::Wakeup { wake_up_reader, wake_up_writer, wake_up_closer }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::ioutil::build_segment;
    use std::net::Ipv4Addr;

    fn quad() -> Quad {
        Quad {
            src: Dual { ipv4: Ipv4Addr::new(10, 0, 0, 1), port: 9001 },
            dst: Dual { ipv4: Ipv4Addr::new(10, 0, 0, 2), port: 80 },
        }
    }

    /// Builds an inbound segment from the *peer's* point of view: `quad` is
    /// the local TCB's identity, so the wire packet's src/dst are swapped
    /// relative to it.
    fn peer_segment(q: &Quad, seq: u32, ack: u32, win: u16, syn: bool, ack_flag: bool, fin: bool, rst: bool, data: &[u8]) -> Vec<u8> {
        let reply_quad = Quad { src: q.dst, dst: q.src };
        build_segment(&reply_quad, seq, ack, win, syn, ack_flag, fin, rst, data)
    }

    fn parse(bytes: &[u8]) -> (Ipv4HeaderSlice, TcpHeaderSlice, Vec<u8>) {
        let ip4h = Ipv4HeaderSlice::from_slice(bytes).unwrap();
        let ihl = (ip4h.ihl() * 4) as usize;
        let tcph = TcpHeaderSlice::from_slice(&bytes[ihl..]).unwrap();
        let data_off = ihl + (tcph.data_offset() * 4) as usize;
        (ip4h, tcph, bytes[data_off..].to_vec())
    }

    #[test]
    fn listen_spawns_syn_rcvd_on_syn() {
        let mut tcb = TCB::listen(quad(), 1000);
        assert_eq!(tcb.state, State::Listen);
        assert_eq!(tcb.snd.iss, 1000);
    }

    #[test]
    fn syn_sent_queues_initial_syn_segment() {
        let tcb = TCB::syn_sent(quad(), 2000);
        assert_eq!(tcb.state, State::SynSent);
        assert_eq!(tcb.snd.nxt, 2001);
        assert_eq!(tcb.segments.len(), 1);
        assert!(tcb.segments[0].syn);
    }

    // S1: handshake. Peer replies SYN|ACK to our SYN; we send the final ACK
    // and land in ESTABLISHED with rcv.nxt advanced past the peer's ISS.
    #[test]
    fn s1_handshake_completes_from_syn_sent() {
        let q = quad();
        let (timers, _jh) = TimerService::spawn(|_, _| {});
        let mut tcb = TCB::syn_sent(q, 1000);
        let mut sink = Vec::new();
        tcb.send_initial_syn(&mut sink, &timers);

        let segment = peer_segment(&q, 5000, 1001, 4096, true, true, false, false, &[]);
        let (ip4h, tcph, data) = parse(&segment);
        let action = tcb.on_segment(ip4h, tcph, &data, &mut sink, &timers);

        assert!(matches!(action, Action::IsEstablished));
        assert_eq!(tcb.state, State::Estab);
        assert_eq!(tcb.rcv.nxt, 5001);
        assert_eq!(tcb.snd.una, 1001);
        timers.shutdown();
    }

    // S2: echo. A write enqueues and transmits a 5-byte data segment at the
    // next send sequence number; an inbound data segment is delivered via
    // recv() unchanged.
    #[test]
    fn s2_write_then_read_round_trips_bytes() {
        let q = quad();
        let (timers, _jh) = TimerService::spawn(|_, _| {});
        let mut tcb = TCB::listen(q, 1000);
        tcb.state = State::Estab;
        tcb.snd.una = 1001;
        tcb.snd.nxt = 1001;
        tcb.snd.wnd = 4096;
        tcb.snd.max_wnd = 4096;
        tcb.rcv.nxt = 5001;
        tcb.rcv.wnd = 4096;

        tcb.outgoing.extend(b"hello".iter());
        let mut sink = Vec::new();
        tcb.try_send(&mut sink, &timers);
        assert_eq!(tcb.snd.nxt, 1006);
        let (_, tcph, data) = parse(&sink);
        assert_eq!(tcph.sequence_number(), 1001);
        assert_eq!(&data, b"hello");

        let segment = peer_segment(&q, 5001, 1006, 4096, false, true, false, false, b"WORLD");
        let (ip4h, tcph, data) = parse(&segment);
        let mut sink2 = Vec::new();
        tcb.on_segment(ip4h, tcph, &data, &mut sink2, &timers);

        let mut buf = [0u8; 16];
        let n = tcb.recv(&mut buf);
        assert_eq!(&buf[..n], b"WORLD");
        timers.shutdown();
    }

    // S3: out-of-order. Three peer segments arrive out of sequence; after
    // all three land, a single contiguous read returns the reassembled
    // bytes and rcv.nxt has advanced past every byte.
    #[test]
    fn s3_out_of_order_segments_reassemble_in_order() {
        let q = quad();
        let (timers, _jh) = TimerService::spawn(|_, _| {});
        let mut tcb = TCB::listen(q, 1000);
        tcb.state = State::Estab;
        tcb.snd.una = 1001;
        tcb.snd.nxt = 1001;
        tcb.snd.wnd = 4096;
        tcb.rcv.nxt = 5002;
        tcb.rcv.wnd = 4096;

        let mut sink = Vec::new();
        for (seq, chunk) in [(5002u32, &b"abc"[..]), (5008, &b"ghi"[..]), (5005, &b"def"[..])] {
            let segment = peer_segment(&q, seq, 1001, 4096, false, true, false, false, chunk);
            let (ip4h, tcph, data) = parse(&segment);
            tcb.on_segment(ip4h, tcph, &data, &mut sink, &timers);
        }

        let mut buf = [0u8; 16];
        let n = tcb.recv(&mut buf);
        assert_eq!(&buf[..n], b"abcdefghi");
        assert_eq!(tcb.rcv.nxt, 5011);
        timers.shutdown();
    }

    // S4: SYN retry. With no reply at all, MAX_SYN_RETRIES retransmissions
    // exhaust the backoff and on_retransmit_fire signals teardown.
    #[test]
    fn s4_syn_retransmit_gives_up_after_retry_limit() {
        let q = quad();
        let (timers, _jh) = TimerService::spawn(|_, _| {});
        let mut tcb = TCB::syn_sent(q, 1000);
        let mut sink = Vec::new();
        tcb.send_initial_syn(&mut sink, &timers);

        let mut gave_up = false;
        for _ in 0..(MAX_SYN_RETRIES + 1) {
            gave_up = tcb.on_retransmit_fire(&mut sink, &timers);
            if gave_up {
                break;
            }
        }
        assert!(gave_up);
        timers.shutdown();
    }

    // S5: RST during SYN_SENT yields ConnectionRefused and no established
    // connection.
    #[test]
    fn s5_rst_during_syn_sent_refuses_connection() {
        let q = quad();
        let (timers, _jh) = TimerService::spawn(|_, _| {});
        let mut tcb = TCB::syn_sent(q, 1000);
        let mut sink = Vec::new();
        tcb.send_initial_syn(&mut sink, &timers);

        let segment = peer_segment(&q, 0, 1001, 0, false, true, false, true, &[]);
        let (ip4h, tcph, _) = parse(&segment);
        let action = tcb.on_segment_syn_sent(ip4h, tcph, &mut sink, &timers);
        assert!(matches!(action, Action::ConnectionRefused));
        timers.shutdown();
    }

    // S6: graceful close. close() from ESTABLISHED on an otherwise idle
    // connection enqueues a FIN at the current snd.nxt (outgoing is empty,
    // so nothing sits ahead of it) and moves to FIN_WAIT_1 without blocking.
    #[test]
    fn s6_close_from_estab_queues_fin_and_moves_to_finwait1() {
        let (timers, _jh) = TimerService::spawn(|_, _| {});
        let mut tcb = TCB::listen(quad(), 3000);
        tcb.state = State::Estab;
        tcb.snd.una = 3001;
        tcb.snd.nxt = 3001;
        tcb.snd.wnd = 4096;

        let mut sink = Vec::new();
        tcb.close(&mut sink, &timers);

        assert_eq!(tcb.state, State::FinWait1);
        assert_eq!(tcb.snd.nxt, 3002);
        assert!(tcb.segments.back().unwrap().fin);
        let (_, tcph, _) = parse(&sink);
        assert!(tcph.fin());
        timers.shutdown();
    }

    // close() on a connection with window-throttled, not-yet-fully-sent
    // outgoing data must not stamp the FIN into the sequence space any
    // unsent byte still occupies. The FIN goes out (and only then consumes
    // its sequence number) once the rest of `outgoing` has actually been
    // transmitted, never before.
    #[test]
    fn close_places_fin_after_buffered_unsent_data() {
        let q = quad();
        let (timers, _jh) = TimerService::spawn(|_, _| {});
        let mut tcb = TCB::listen(q, 1000);
        tcb.state = State::Estab;
        tcb.snd.una = 1001;
        tcb.snd.nxt = 1001;
        tcb.snd.wnd = 3;
        tcb.snd.max_wnd = 3;
        tcb.rcv.nxt = 5001;
        tcb.rcv.wnd = 4096;

        tcb.outgoing.extend(b"hello".iter());
        let mut sink = Vec::new();
        tcb.try_send(&mut sink, &timers);
        assert_eq!(tcb.snd.nxt, 1004);
        let (_, tcph, data) = parse(&sink);
        assert_eq!(&data, b"hel");

        // "lo" is still buffered, unsent, behind the closed window.
        let mut sink2 = Vec::new();
        tcb.close(&mut sink2, &timers);
        assert_eq!(tcb.state, State::FinWait1);
        // Nothing new went out: the window is still full of "hel", so no
        // FIN segment can be assigned a sequence number yet.
        assert!(sink2.is_empty());
        assert_eq!(tcb.snd.nxt, 1004);
        let last_seg = tcb.segments.back().unwrap();
        assert!(!last_seg.fin);
        assert_eq!(last_seg.sno, 1001);
        assert!(!tcph.fin());

        // Peer ACKs "hel" and reopens the window: "lo" and then the FIN
        // both go out, in order, with nothing dropped or overwritten.
        let segment = peer_segment(&q, 5001, 1004, 4096, false, true, false, false, &[]);
        let (ip4h, tcph, data) = parse(&segment);
        let mut sink3 = Vec::new();
        tcb.on_segment(ip4h, tcph, &data, &mut sink3, &timers);

        assert_eq!(tcb.snd.nxt, 1007);
        assert!(tcb.segments.back().unwrap().sent.is_some());
        timers.shutdown();
    }

    // Testable property 4: a duplicate ACK (ack_seq == snd_una already)
    // changes no field except the window triple.
    #[test]
    fn duplicate_ack_is_idempotent_outside_window_fields() {
        let q = quad();
        let (timers, _jh) = TimerService::spawn(|_, _| {});
        let mut tcb = TCB::listen(q, 1000);
        tcb.state = State::Estab;
        tcb.snd.una = 1001;
        tcb.snd.nxt = 1001;
        tcb.snd.wnd = 4096;
        tcb.snd.wl1 = 5000;
        tcb.snd.wl2 = 1001;
        tcb.rcv.nxt = 5001;
        tcb.rcv.wnd = 4096;

        let before = tcb.clone();
        let mut sink = Vec::new();
        let segment = peer_segment(&q, 5000, 1001, 4096, false, true, false, false, &[]);
        let (ip4h, tcph, data) = parse(&segment);
        tcb.on_segment(ip4h, tcph, &data, &mut sink, &timers);

        assert_eq!(tcb.snd.una, before.snd.una);
        assert_eq!(tcb.snd.nxt, before.snd.nxt);
        assert_eq!(tcb.rcv.nxt, before.rcv.nxt);
        assert_eq!(tcb.incoming, before.incoming);
        timers.shutdown();
    }

    // Testable property 5: a segment fully outside the receive window draws
    // an ACK and leaves the TCB otherwise unchanged.
    #[test]
    fn out_of_window_segment_draws_ack_and_is_dropped() {
        let q = quad();
        let (timers, _jh) = TimerService::spawn(|_, _| {});
        let mut tcb = TCB::listen(q, 1000);
        tcb.state = State::Estab;
        tcb.snd.una = 1001;
        tcb.snd.nxt = 1001;
        tcb.snd.wnd = 4096;
        tcb.rcv.nxt = 5001;
        tcb.rcv.wnd = 100;

        let before_nxt = tcb.rcv.nxt;
        let mut sink = Vec::new();
        // seq is far beyond [rcv.nxt, rcv.nxt + rcv.wnd).
        let segment = peer_segment(&q, 6000, 1001, 4096, false, true, false, false, b"x");
        let (ip4h, tcph, data) = parse(&segment);
        tcb.on_segment(ip4h, tcph, &data, &mut sink, &timers);

        assert_eq!(tcb.rcv.nxt, before_nxt);
        assert!(!sink.is_empty());
        let (_, tcph, _) = parse(&sink);
        assert!(tcph.ack());
        assert!(!tcph.rst());
        timers.shutdown();
    }

    #[test]
    fn insert_ofo_clips_overlap_with_existing_entry() {
        let mut tcb = TCB::listen(quad(), 0);
        tcb.rcv.nxt = 100;

        tcb.insert_ofo(110, b"0123456789", false); // [110, 120)
        tcb.insert_ofo(105, b"0123456789ABCDEF", false); // [105, 121) overlaps

        // The first entry [110,120) should be preserved untouched; the
        // second insert should only contribute [105,110) and [120,121).
        let ranges: Vec<(u32, usize)> = tcb.ofo_queue.iter().map(|o| (o.seq, o.data.len())).collect();
        assert_eq!(ranges, vec![(105, 5), (110, 10), (120, 1)]);
    }

    #[test]
    fn drain_ofo_merges_contiguous_prefix() {
        let mut tcb = TCB::listen(quad(), 0);
        tcb.rcv.nxt = 100;
        tcb.rcv.wnd = 1000;
        tcb.insert_ofo(100, b"hello", false);
        tcb.insert_ofo(105, b"world", false);

        let fin = tcb.drain_ofo();
        assert!(!fin);
        assert_eq!(tcb.rcv.nxt, 110);
        assert_eq!(tcb.incoming.iter().copied().collect::<Vec<u8>>(), b"helloworld");
        assert!(tcb.ofo_queue.is_empty());
    }

    #[test]
    fn drain_ofo_stops_at_gap() {
        let mut tcb = TCB::listen(quad(), 0);
        tcb.rcv.nxt = 100;
        tcb.rcv.wnd = 1000;
        tcb.insert_ofo(105, b"world", false);

        let fin = tcb.drain_ofo();
        assert!(!fin);
        assert_eq!(tcb.rcv.nxt, 100);
        assert_eq!(tcb.ofo_queue.len(), 1);
    }
}
