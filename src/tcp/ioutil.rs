//! Segment construction and transmission: fills TCP/IPv4 headers from TCB
//! state, computes the one's-complement checksum over the pseudo-header, and
//! hands the resulting packet to the device.
//!
//! The device here is a point-to-point TUN interface (via `tidy_tuntap`),
//! which already strips the Ethernet layer before frames reach userspace;
//! there is no L2 header to build. See DESIGN.md for why this departs from
//! the "Ethernet + IPv4 + TCP" framing spec.md describes in the abstract.
//!
//! Every function here is generic over `std::io::Write` rather than tied to
//! `tidy_tuntap::Tun` directly: the real device and an in-memory `Vec<u8>`
//! (used by the `tcb` module's own tests to script a peer) both work as the
//! sink without this module knowing which one it has.

use std::io::Write;

use etherparse::{Ipv4Header, Ipv4HeaderSlice, TcpHeader, TcpHeaderSlice, TcpOptionElement};

use super::Quad;

const DEFAULT_TTL: u8 = 64;

#[allow(clippy::too_many_arguments)]
fn build_packet(
    quad: &Quad,
    seq: u32,
    ack: u32,
    win: u16,
    syn: bool,
    ack_flag: bool,
    fin: bool,
    rst: bool,
    mss: Option<u16>,
    data: &[u8],
) -> Vec<u8> {
    let mut tcph = TcpHeader::new(quad.src.port, quad.dst.port, seq, win);
    tcph.acknowledgment_number = ack;
    tcph.syn = syn;
    tcph.ack = ack_flag;
    tcph.fin = fin;
    tcph.rst = rst;

    if let Some(mss) = mss {
        tcph.set_options(&[TcpOptionElement::MaximumSegmentSize(mss)])
            .expect("MSS option always fits in a fresh header");
    }

    let ip4h = Ipv4Header::new(
        tcph.header_len() + data.len() as u16,
        DEFAULT_TTL,
        etherparse::IpNumber::TCP,
        quad.src.ipv4.octets(),
        quad.dst.ipv4.octets(),
    )
    .expect("payload length always fits in a u16 for segments this small");

    tcph.checksum = tcph
        .calc_checksum_ipv4(&ip4h, data)
        .expect("checksum computation cannot fail for a well-formed header");

    let mut out = Vec::with_capacity(ip4h.header_len() + tcph.header_len() as usize + data.len());
    ip4h.write(&mut out).unwrap();
    tcph.write(&mut out).unwrap();
    out.extend_from_slice(data);
    out
}

fn send<W: Write>(w: &mut W, packet: &[u8]) {
    if let Err(err) = w.write_all(packet) {
        log::warn!("failed to write segment to device: {err}");
    }
}

/// Emit a bare ACK carrying `seq`/`ack`/`win`, consuming no sequence space.
pub fn write_ack<W: Write>(quad: &Quad, seq: u32, ack: u32, win: u16, w: &mut W) {
    let packet = build_packet(quad, seq, ack, win, false, true, false, false, None, &[]);
    send(w, &packet);
}

/// Emit SYN (`ack = None`, active open) or SYN+ACK (`ack = Some(..)`,
/// replying from LISTEN/SYN-SENT), announcing our own MSS to the peer.
pub fn write_synack<W: Write>(quad: &Quad, seq: u32, ack: Option<u32>, win: u16, mss: u16, w: &mut W) {
    let packet = build_packet(
        quad,
        seq,
        ack.unwrap_or(0),
        win,
        true,
        ack.is_some(),
        false,
        false,
        Some(mss),
        &[],
    );
    send(w, &packet);
}

/// Emit a data/FIN segment, or retransmit one already queued. `fin` and the
/// payload jointly consume the sequence numbers the caller already accounted
/// for in `seq`; `mss` is only `Some` when this segment also carries the SYN.
#[allow(clippy::too_many_arguments)]
pub fn write_data<W: Write>(
    quad: Quad,
    seq: u32,
    ack: u32,
    win: u16,
    w: &mut W,
    data: &[u8],
    fin: bool,
    syn: bool,
    ack_flag: bool,
    mss: Option<u16>,
) {
    let packet = build_packet(&quad, seq, ack, win, syn, ack_flag, fin, false, mss, data);
    send(w, &packet);
}

/// Generate a RST in reply to `tcph`, per RFC 793 S3.4: the reset takes its
/// sequence number from the ACK field if present, otherwise zero with the
/// ACK field set to `seq + len`.
pub fn write_reset<W: Write>(ip4h: &Ipv4HeaderSlice, tcph: &TcpHeaderSlice, data: &[u8], w: &mut W) {
    let quad = Quad {
        src: super::Dual {
            ipv4: ip4h.destination_addr(),
            port: tcph.destination_port(),
        },
        dst: super::Dual {
            ipv4: ip4h.source_addr(),
            port: tcph.source_port(),
        },
    };

    let (seq, ack, ack_flag) = if tcph.ack() {
        (tcph.acknowledgment_number(), 0, false)
    } else {
        let ack = tcph
            .sequence_number()
            .wrapping_add(data.len() as u32)
            .wrapping_add(if tcph.syn() { 1 } else { 0 })
            .wrapping_add(if tcph.fin() { 1 } else { 0 });
        (0, ack, true)
    };

    let packet = build_packet(&quad, seq, ack, 0, false, ack_flag, false, true, None, &[]);
    send(w, &packet);
}

/// Generate an unsolicited RST for `quad`, carrying the connection's current
/// send/receive sequence state. Used only by `TcpStream::abort` (spec.md S7:
/// "RST is generated ... on abort").
pub fn write_abort<W: Write>(quad: &Quad, seq: u32, ack: u32, w: &mut W) {
    let packet = build_packet(quad, seq, ack, 0, false, true, false, true, None, &[]);
    send(w, &packet);
}

/// Negotiate the effective MSS from the SYN's options, clamped to `local_mss`.
pub fn negotiate_mss(tcph: &TcpHeaderSlice, local_mss: u16) -> u16 {
    let peer_mss = tcph
        .options_iterator()
        .filter_map(|opt| match opt.ok()? {
            TcpOptionElement::MaximumSegmentSize(mss) => Some(mss),
            _ => None,
        })
        .next()
        .unwrap_or(536);

    std::cmp::min(peer_mss, local_mss)
}

#[cfg(test)]
pub(crate) fn build_segment(
    quad: &Quad,
    seq: u32,
    ack: u32,
    win: u16,
    syn: bool,
    ack_flag: bool,
    fin: bool,
    rst: bool,
    data: &[u8],
) -> Vec<u8> {
    build_packet(quad, seq, ack, win, syn, ack_flag, fin, rst, None, data)
}
