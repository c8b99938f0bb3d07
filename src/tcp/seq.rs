//! Modulo-2^32 sequence number arithmetic (RFC 793 S3.3).
//!
//! Every other module compares sequence numbers exclusively through these
//! helpers. A bare `a < b` on two `u32` sequence numbers is meaningless once
//! the space has wrapped, so it must never appear outside this file.

/// `(i32)(a - b) < 0`, i.e. "a precedes b" in the modular sense.
pub fn lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub fn le(a: u32, b: u32) -> bool {
    a == b || lt(a, b)
}

pub fn gt(a: u32, b: u32) -> bool {
    lt(b, a)
}

pub fn ge(a: u32, b: u32) -> bool {
    a == b || gt(a, b)
}

/// True iff `b` lies strictly between `a` and `c` going forward from `a`.
pub fn between_wrap(a: u32, b: u32, c: u32) -> bool {
    lt(a, b) && lt(b, c)
}

/// The four-case segment-acceptability test (RFC 793 S3.3, RFC 9293 S3.4).
///
/// | seg len | rcv wnd | test                                            |
/// |---------|---------|--------------------------------------------------|
/// | 0       | 0       | SEG.SEQ = RCV.NXT                                |
/// | 0       | >0      | RCV.NXT <= SEG.SEQ < RCV.NXT+RCV.WND              |
/// | >0      | 0       | not acceptable                                    |
/// | >0      | >0      | above, or RCV.NXT <= SEG.SEQ+SEG.LEN-1 < RCV.NXT+WND |
pub fn is_segment_acceptable(rcv_nxt: u32, rcv_wnd: u32, seg_seq: u32, seg_len: u32) -> bool {
    let wnd_end = rcv_nxt.wrapping_add(rcv_wnd);

    if seg_len == 0 && rcv_wnd == 0 {
        seg_seq == rcv_nxt
    } else if seg_len == 0 {
        between_wrap(rcv_nxt.wrapping_sub(1), seg_seq, wnd_end)
    } else if rcv_wnd == 0 {
        false
    } else {
        between_wrap(rcv_nxt.wrapping_sub(1), seg_seq, wnd_end)
            || between_wrap(
                rcv_nxt.wrapping_sub(1),
                seg_seq.wrapping_add(seg_len).wrapping_sub(1),
                wnd_end,
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lt_handles_wraparound() {
        assert!(lt(u32::MAX, 0));
        assert!(!lt(0, u32::MAX));
        assert!(lt(100, 200));
        assert!(!lt(200, 100));
    }

    #[test]
    fn between_wrap_is_exclusive() {
        assert!(between_wrap(10, 11, 20));
        assert!(!between_wrap(10, 10, 20));
        assert!(!between_wrap(10, 20, 20));
        assert!(between_wrap(u32::MAX - 1, u32::MAX, 1));
    }

    #[test]
    fn zero_length_zero_window_requires_exact_match() {
        assert!(is_segment_acceptable(100, 0, 100, 0));
        assert!(!is_segment_acceptable(100, 0, 101, 0));
    }

    #[test]
    fn zero_length_nonzero_window() {
        assert!(is_segment_acceptable(100, 10, 105, 0));
        assert!(is_segment_acceptable(100, 10, 100, 0));
        assert!(!is_segment_acceptable(100, 10, 110, 0));
    }

    #[test]
    fn positive_length_zero_window_never_acceptable() {
        assert!(!is_segment_acceptable(100, 0, 100, 5));
    }

    #[test]
    fn positive_length_nonzero_window() {
        assert!(is_segment_acceptable(100, 10, 100, 5));
        assert!(is_segment_acceptable(100, 10, 105, 10));
        assert!(!is_segment_acceptable(100, 10, 200, 5));
    }
}
