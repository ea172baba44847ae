//! Segmentation and reassembly of L2CAP frames over ACL fragments
//!
//! An outgoing frame is cut into pieces no larger than the adapter's ACL
//! MTU. Only the first piece carries the basic header; the rest are raw
//! continuations. Inbound, the header of the start fragment declares the
//! total length and continuations are accumulated until it is reached.
//!
//! A link carries one ordered byte stream, so a connection holds at most
//! one partial frame at a time.

use super::constants::*;
use super::packet::{L2capHeader, L2capPacket};
use super::types::ChannelId;

/// Split a frame for `destination_cid` into ACL fragments of at most
/// `acl_mtu` bytes.
///
/// The first fragment holds the basic header followed by up to
/// `acl_mtu - 4` payload bytes, so a payload that fits the interface MTU
/// yields exactly one fragment.
pub fn segment(destination_cid: ChannelId, payload: &[u8], acl_mtu: usize) -> Vec<Vec<u8>> {
    let acl_mtu = acl_mtu.max(L2CAP_BASIC_HEADER_SIZE + 1);
    let header = L2capHeader::new(payload.len() as u16, destination_cid);

    let first_len = payload.len().min(acl_mtu - L2CAP_BASIC_HEADER_SIZE);
    let mut first = Vec::with_capacity(L2CAP_BASIC_HEADER_SIZE + first_len);
    first.extend_from_slice(&header.to_bytes());
    first.extend_from_slice(&payload[..first_len]);

    let mut fragments = vec![first];
    fragments.extend(payload[first_len..].chunks(acl_mtu).map(|chunk| chunk.to_vec()));
    fragments
}

/// Per-connection reassembly state
#[derive(Debug, Default)]
pub struct Reassembler {
    /// Bytes accumulated so far, header included
    buffer: Vec<u8>,
    /// Bytes still expected before the frame is complete
    remaining: usize,
    /// Count of protocol violations seen on this link
    violations: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a partial frame is being accumulated
    pub fn in_progress(&self) -> bool {
        self.remaining > 0
    }

    pub fn violations(&self) -> u64 {
        self.violations
    }

    /// Drop any partial frame
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.remaining = 0;
    }

    fn violation(&mut self, what: &str) {
        self.violations += 1;
        log::warn!("L2CAP reassembly: {}", what);
    }

    /// Feed one ACL fragment. Returns a frame once its declared length has
    /// been reached.
    pub fn push(&mut self, fragment: &[u8], is_start: bool) -> Option<L2capPacket> {
        if is_start {
            if self.in_progress() {
                self.violation("start fragment while a frame was incomplete; dropping partial frame");
                self.reset();
            }

            let Some(header) = L2capHeader::parse(fragment) else {
                self.violation("start fragment shorter than the basic header");
                return None;
            };

            let total = L2CAP_BASIC_HEADER_SIZE + header.length as usize;
            if fragment.len() == total {
                return L2capPacket::parse(fragment);
            }
            if fragment.len() > total {
                self.violation("start fragment longer than its declared frame length");
                return None;
            }

            self.buffer.extend_from_slice(fragment);
            self.remaining = total - fragment.len();
            return None;
        }

        if !self.in_progress() {
            self.violation("continuation fragment without a frame in progress");
            return None;
        }

        if fragment.len() > self.remaining {
            self.violation("continuation fragment overruns the declared frame length");
            self.reset();
            return None;
        }

        self.buffer.extend_from_slice(fragment);
        self.remaining -= fragment.len();

        if self.remaining > 0 {
            return None;
        }

        let frame = std::mem::take(&mut self.buffer);
        L2capPacket::parse(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn reassemble_all(fragments: &[Vec<u8>]) -> Option<L2capPacket> {
        let mut reassembler = Reassembler::new();
        let mut result = None;
        for (i, fragment) in fragments.iter().enumerate() {
            let out = reassembler.push(fragment, i == 0);
            if i + 1 < fragments.len() {
                assert!(out.is_none(), "frame completed early at fragment {}", i);
            }
            result = out;
        }
        result
    }

    #[test]
    fn test_single_fragment_when_payload_fits() {
        let payload = vec![0xAB; 668];
        let fragments = segment(0x0040, &payload, 672);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].len(), 672);
        assert_eq!(&fragments[0][..4], &[0x9C, 0x02, 0x40, 0x00]);
    }

    #[test]
    fn test_empty_payload() {
        let fragments = segment(0x0041, &[], 672);
        assert_eq!(fragments, vec![vec![0x00, 0x00, 0x41, 0x00]]);
        let packet = reassemble_all(&fragments).unwrap();
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_two_thousand_byte_frame() {
        // 2000 bytes on the wire including the basic header
        let payload: Vec<u8> = (0..1996u32).map(|i| (i % 251) as u8).collect();
        let fragments = segment(0x0040, &payload, 672);

        let sizes: Vec<usize> = fragments.iter().map(|f| f.len()).collect();
        assert_eq!(sizes, vec![672, 672, 656]);
        assert_eq!(sizes.iter().sum::<usize>(), 2000);

        let packet = reassemble_all(&fragments).unwrap();
        assert_eq!(packet.header.channel_id, 0x0040);
        assert_eq!(packet.payload, payload);
    }

    #[test]
    fn test_random_round_trip() {
        let mut rng = rand::thread_rng();
        let acl_mtu = 64;
        for _ in 0..50 {
            let len = rng.gen_range(0..=10 * (acl_mtu - L2CAP_BASIC_HEADER_SIZE));
            let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let fragments = segment(0x0055, &payload, acl_mtu);
            assert!(fragments.iter().all(|f| f.len() <= acl_mtu));

            let packet = reassemble_all(&fragments).unwrap();
            assert_eq!(packet.payload, payload);
        }
    }

    #[test]
    fn test_start_while_incomplete_drops_partial() {
        let old = segment(0x0040, &[1u8; 100], 32);
        let new = segment(0x0041, &[2u8; 10], 32);

        let mut reassembler = Reassembler::new();
        assert!(reassembler.push(&old[0], true).is_none());
        assert!(reassembler.in_progress());

        let packet = reassembler.push(&new[0], true).unwrap();
        assert_eq!(packet.header.channel_id, 0x0041);
        assert_eq!(packet.payload, vec![2u8; 10]);
        assert_eq!(reassembler.violations(), 1);

        // the rest of the old frame is now orphaned
        assert!(reassembler.push(&old[1], false).is_none());
        assert_eq!(reassembler.violations(), 2);
    }

    #[test]
    fn test_oversized_continuation_discards_partial() {
        let mut reassembler = Reassembler::new();
        let mut start = L2capHeader::new(10, 0x0040).to_bytes().to_vec();
        start.extend_from_slice(&[0u8; 4]);

        assert!(reassembler.push(&start, true).is_none());
        assert!(reassembler.push(&[0u8; 7], false).is_none());
        assert!(!reassembler.in_progress());
        assert_eq!(reassembler.violations(), 1);
    }

    #[test]
    fn test_start_longer_than_declared() {
        let mut reassembler = Reassembler::new();
        let mut start = L2capHeader::new(2, 0x0040).to_bytes().to_vec();
        start.extend_from_slice(&[0u8; 5]);
        assert!(reassembler.push(&start, true).is_none());
        assert_eq!(reassembler.violations(), 1);
        assert!(reassembler.push(&[0x01, 0x00], true).is_none());
        assert_eq!(reassembler.violations(), 2);
    }
}
