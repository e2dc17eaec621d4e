// Copyright (C) 2024 the hevc-rtp authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP packet handling as described in
//! [RFC 3550 section 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! |            contributing source (CSRC) identifiers             |
//! |                             ....                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::time::Instant;

use bytes::Bytes;
use rand::Rng;

use crate::error::ErrorInt;
use crate::{ConnectionContext, Error};

/// Length of the fixed RTP header (no CSRCs or extensions).
pub(crate) const RTP_HEADER_LEN: usize = 12;

/// Send-side RTP state for one connection: SSRC, sequence counter, and the
/// media clock driving the timestamp field.
///
/// SSRC, initial sequence number, and timestamp offset are randomized per
/// RFC 3550 section 5.1.
pub(crate) struct RtpState {
    ssrc: u32,
    sequence: u16,
    timestamp_base: u32,
    clock_rate: u32,
    start: Instant,
    payload_type: u8,
    sent_packets: u64,
}

impl RtpState {
    pub(crate) fn new(payload_type: u8, clock_rate: u32) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            ssrc: rng.gen(),
            sequence: rng.gen(),
            timestamp_base: rng.gen(),
            clock_rate,
            start: Instant::now(),
            payload_type,
            sent_packets: 0,
        }
    }

    /// Fills `buf` with a fixed header carrying the current media-clock
    /// timestamp. The sequence field holds the *next* sequence number; the
    /// queue overwrites it per packet as numbers are reserved.
    pub(crate) fn fill_header(&self, buf: &mut [u8; RTP_HEADER_LEN]) {
        buf[0] = 2 << 6; // version=2, no padding, no extensions, no CSRCs.
        buf[1] = self.payload_type & 0x7f;
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp().to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
    }

    fn timestamp(&self) -> u32 {
        let ticks = self.start.elapsed().as_nanos() * u128::from(self.clock_rate) / 1_000_000_000;
        self.timestamp_base.wrapping_add(ticks as u32)
    }

    /// Reserves the next sequence number. Numbers reserved by consecutive
    /// calls are consecutive.
    pub(crate) fn next_sequence(&mut self) -> u16 {
        let s = self.sequence;
        self.sequence = s.wrapping_add(1);
        self.sent_packets += 1;
        s
    }

    /// Packets sent over the lifetime of the connection.
    pub(crate) fn sent_packets(&self) -> u64 {
        self.sent_packets
    }
}

/// Fixed-header fields of a received packet.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

/// An RTP header extension (RFC 3550 section 5.3.1), retained but not
/// interpreted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionHeader {
    /// The 16-bit "defined by profile" field.
    pub kind: u16,

    /// The extension body; always a multiple of four bytes.
    pub data: Bytes,
}

/// A validated, received RTP packet with an owned payload.
///
/// Produced by [`validate_rtp_frame`]; the receive buffer it was parsed from
/// may be reused immediately.
#[derive(Clone, PartialEq, Eq)]
pub struct RtpFrame {
    pub header: RtpHeader,
    pub csrc: Vec<u32>,
    pub extension: Option<ExtensionHeader>,
    pub payload: Bytes,
    pub padding_len: u8,
}

impl std::fmt::Debug for RtpFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpFrame")
            .field("header", &self.header)
            .field("csrc", &self.csrc)
            .field("extension", &self.extension)
            .field("padding_len", &self.padding_len)
            .field("payload", &crate::dump::PacketDump(&self.payload))
            .finish()
    }
}

/// Validates a datagram as an RTP packet and parses it into an owned
/// [`RtpFrame`].
///
/// Returns `Ok(None)` — dropped with no error — for a version-0 packet when
/// `zrtp_key_management` is set: such packets belong to the key-management
/// handshake and are demultiplexed outside this crate.
pub fn validate_rtp_frame(
    conn_ctx: &ConnectionContext,
    data: &[u8],
    zrtp_key_management: bool,
) -> Result<Option<RtpFrame>, Error> {
    let packet_error = |description: &str| {
        wrap!(ErrorInt::PacketError {
            conn_ctx: *conn_ctx,
            description: description.to_owned(),
            data: Bytes::copy_from_slice(data),
        })
    };

    if data.len() < RTP_HEADER_LEN {
        return Err(packet_error("too short"));
    }
    let version = data[0] >> 6;
    if version != 2 {
        if version == 0 && zrtp_key_management {
            return Ok(None);
        }
        return Err(packet_error("must be version 2"));
    }

    let header = RtpHeader {
        version,
        padding: (data[0] & 0b0010_0000) != 0,
        extension: (data[0] & 0b0001_0000) != 0,
        csrc_count: data[0] & 0b0000_1111,
        marker: (data[1] & 0b1000_0000) != 0,
        payload_type: data[1] & 0b0111_1111,
        sequence: u16::from_be_bytes([data[2], data[3]]),
        timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
    };

    let mut pos = RTP_HEADER_LEN;
    let mut payload_len = data.len() - RTP_HEADER_LEN;

    let mut csrc = Vec::new();
    if header.csrc_count > 0 {
        let csrc_len = 4 * usize::from(header.csrc_count);
        if payload_len < csrc_len {
            return Err(packet_error("CSRC list is after end of packet"));
        }
        csrc.reserve_exact(usize::from(header.csrc_count));
        for entry in data[pos..pos + csrc_len].chunks_exact(4) {
            csrc.push(u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]));
        }
        pos += csrc_len;
        payload_len -= csrc_len;
    }

    let mut extension = None;
    if header.extension {
        if payload_len < 4 {
            return Err(packet_error("extension is after end of packet"));
        }
        let kind = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let words = usize::from(u16::from_be_bytes([data[pos + 2], data[pos + 3]]));
        let ext_len = 4 + 4 * words;
        if payload_len < ext_len {
            return Err(packet_error("extension extends beyond end of packet"));
        }
        extension = Some(ExtensionHeader {
            kind,
            data: Bytes::copy_from_slice(&data[pos + 4..pos + ext_len]),
        });
        pos += ext_len;
        payload_len -= ext_len;
    }

    // With the padding bit set, the final byte counts the padding bytes
    // (itself included); they are carved off the payload.
    let mut padding_len = 0;
    if header.padding {
        if payload_len == 0 {
            return Err(packet_error("missing padding"));
        }
        padding_len = data[data.len() - 1];
        if padding_len == 0 || usize::from(padding_len) >= payload_len {
            return Err(packet_error("bad padding length"));
        }
        payload_len -= usize::from(padding_len);
    }

    Ok(Some(RtpFrame {
        header,
        csrc,
        extension,
        payload: Bytes::copy_from_slice(&data[pos..pos + payload_len]),
        padding_len,
    }))
}

/// Serializes RTP packets; the counterpart of [`validate_rtp_frame`].
/// Testing API, also used to build packets for loopback exercises.
#[doc(hidden)]
pub struct RtpPacketBuilder {
    pub sequence: u16,
    pub timestamp: u32,
    pub payload_type: u8,
    pub ssrc: u32,
    pub marker: bool,
    pub csrc: Vec<u32>,
    pub extension: Option<(u16, Vec<u8>)>,
    pub padding: Option<u8>,
}

impl Default for RtpPacketBuilder {
    fn default() -> Self {
        Self {
            sequence: 0,
            timestamp: 0,
            payload_type: 0,
            ssrc: 0,
            marker: false,
            csrc: Vec::new(),
            extension: None,
            padding: None,
        }
    }
}

impl RtpPacketBuilder {
    pub fn build(self, payload: &[u8]) -> Result<Vec<u8>, &'static str> {
        if self.payload_type >= 0x80 {
            return Err("payload type too large");
        }
        if self.csrc.len() > 15 {
            return Err("too many CSRC entries");
        }
        if let Some((_, data)) = &self.extension {
            if data.len() % 4 != 0 || data.len() / 4 > usize::from(u16::MAX) {
                return Err("bad extension data length");
            }
        }
        let mut out = Vec::with_capacity(RTP_HEADER_LEN + payload.len());
        out.push(
            (2 << 6)
                | if self.padding.is_some() { 0b0010_0000 } else { 0 }
                | if self.extension.is_some() {
                    0b0001_0000
                } else {
                    0
                }
                | self.csrc.len() as u8,
        );
        out.push(if self.marker { 0b1000_0000 } else { 0 } | self.payload_type);
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        for entry in &self.csrc {
            out.extend_from_slice(&entry.to_be_bytes());
        }
        if let Some((kind, data)) = &self.extension {
            out.extend_from_slice(&kind.to_be_bytes());
            out.extend_from_slice(&((data.len() / 4) as u16).to_be_bytes());
            out.extend_from_slice(data);
        }
        out.extend_from_slice(payload);
        if let Some(padding) = self.padding {
            if padding == 0 {
                return Err("padding length must be non-zero");
            }
            out.extend(std::iter::repeat(0).take(usize::from(padding) - 1));
            out.push(padding);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ConnectionContext {
        ConnectionContext::dummy()
    }

    #[test]
    fn parses_plain_packet() {
        let data = b"\x80\x60\x00\x2a\x00\x00\x00\x64\x11\x22\x33\x44\xde\xad\xbe\xef";
        let frame = validate_rtp_frame(&ctx(), data, false).unwrap().unwrap();
        assert_eq!(frame.header.version, 2);
        assert!(!frame.header.padding);
        assert!(!frame.header.extension);
        assert_eq!(frame.header.csrc_count, 0);
        assert!(!frame.header.marker);
        assert_eq!(frame.header.payload_type, 0x60);
        assert_eq!(frame.header.sequence, 42);
        assert_eq!(frame.header.timestamp, 100);
        assert_eq!(frame.header.ssrc, 0x1122_3344);
        assert_eq!(&frame.payload[..], b"\xde\xad\xbe\xef");
    }

    #[test]
    fn rejects_short_packet() {
        assert!(validate_rtp_frame(&ctx(), b"\x80\x60\x00", false).is_err());
        assert!(validate_rtp_frame(&ctx(), &[], false).is_err());
    }

    #[test]
    fn rejects_bad_version() {
        let mut data = *b"\x80\x60\x00\x2a\x00\x00\x00\x64\x11\x22\x33\x44\xde\xad";
        data[0] = 1 << 6;
        assert!(validate_rtp_frame(&ctx(), &data, false).is_err());
        data[0] = 0;
        assert!(validate_rtp_frame(&ctx(), &data, false).is_err());
    }

    #[test]
    fn version_zero_with_zrtp_is_silently_dropped() {
        let mut data = *b"\x80\x60\x00\x2a\x00\x00\x00\x64\x11\x22\x33\x44\xde\xad";
        data[0] = 0;
        assert!(validate_rtp_frame(&ctx(), &data, true).unwrap().is_none());
    }

    #[test]
    fn parses_csrc_entries() {
        let pkt = RtpPacketBuilder {
            sequence: 7,
            csrc: vec![0xdead_beef, 0x0102_0304],
            ..Default::default()
        }
        .build(b"hi")
        .unwrap();
        let frame = validate_rtp_frame(&ctx(), &pkt, false).unwrap().unwrap();
        assert_eq!(frame.header.csrc_count, 2);
        assert_eq!(frame.csrc, vec![0xdead_beef, 0x0102_0304]);
        assert_eq!(&frame.payload[..], b"hi");
    }

    #[test]
    fn rejects_truncated_csrc_list() {
        let mut pkt = RtpPacketBuilder::default().build(b"x").unwrap();
        pkt[0] |= 0x0f; // claim 15 CSRC entries that aren't there
        assert!(validate_rtp_frame(&ctx(), &pkt, false).is_err());
    }

    #[test]
    fn parses_extension() {
        let pkt = RtpPacketBuilder {
            extension: Some((0xbede, b"\x01\x02\x03\x04\x05\x06\x07\x08".to_vec())),
            ..Default::default()
        }
        .build(b"payload")
        .unwrap();
        let frame = validate_rtp_frame(&ctx(), &pkt, false).unwrap().unwrap();
        let ext = frame.extension.unwrap();
        assert_eq!(ext.kind, 0xbede);
        assert_eq!(&ext.data[..], b"\x01\x02\x03\x04\x05\x06\x07\x08");
        assert_eq!(&frame.payload[..], b"payload");
    }

    #[test]
    fn rejects_truncated_extension() {
        let mut pkt = RtpPacketBuilder {
            extension: Some((1, b"\x01\x02\x03\x04".to_vec())),
            ..Default::default()
        }
        .build(b"")
        .unwrap();
        // Claim more extension words than the packet holds.
        pkt[15] = 200;
        assert!(validate_rtp_frame(&ctx(), &pkt, false).is_err());
    }

    #[test]
    fn strips_padding() {
        let pkt = RtpPacketBuilder {
            padding: Some(3),
            ..Default::default()
        }
        .build(b"\xde\xad\xbe\xef")
        .unwrap();
        let frame = validate_rtp_frame(&ctx(), &pkt, false).unwrap().unwrap();
        assert_eq!(frame.padding_len, 3);
        assert_eq!(&frame.payload[..], b"\xde\xad\xbe\xef");
    }

    #[test]
    fn rejects_bad_padding() {
        // Padding length of zero.
        let mut pkt = RtpPacketBuilder::default().build(b"\xaa\x00").unwrap();
        pkt[0] |= 0b0010_0000;
        *pkt.last_mut().unwrap() = 0;
        assert!(validate_rtp_frame(&ctx(), &pkt, false).is_err());

        // Padding consuming the whole payload.
        let mut pkt = RtpPacketBuilder::default().build(b"\xaa\x02").unwrap();
        pkt[0] |= 0b0010_0000;
        assert!(validate_rtp_frame(&ctx(), &pkt, false).is_err());

        // Padding bit with no payload at all.
        let mut pkt = RtpPacketBuilder::default().build(b"").unwrap();
        pkt[0] |= 0b0010_0000;
        assert!(validate_rtp_frame(&ctx(), &pkt, false).is_err());
    }

    #[test]
    fn round_trips_through_builder() {
        let pkt = RtpPacketBuilder {
            sequence: 0xfffe,
            timestamp: 0x8765_4321,
            payload_type: 96,
            ssrc: 0xc001_cafe,
            marker: true,
            csrc: vec![1, 2, 3],
            extension: Some((42, b"\xaa\xbb\xcc\xdd".to_vec())),
            padding: Some(2),
        }
        .build(b"some payload")
        .unwrap();
        let frame = validate_rtp_frame(&ctx(), &pkt, false).unwrap().unwrap();
        assert_eq!(frame.header.sequence, 0xfffe);
        assert_eq!(frame.header.timestamp, 0x8765_4321);
        assert_eq!(frame.header.payload_type, 96);
        assert_eq!(frame.header.ssrc, 0xc001_cafe);
        assert!(frame.header.marker);
        assert_eq!(frame.csrc, vec![1, 2, 3]);
        assert_eq!(frame.extension.as_ref().unwrap().kind, 42);
        assert_eq!(frame.padding_len, 2);
        assert_eq!(&frame.payload[..], b"some payload");
    }

    #[test]
    fn sequence_reservation_is_consecutive() {
        let mut rtp = RtpState::new(96, 90_000);
        let first = rtp.next_sequence();
        assert_eq!(rtp.next_sequence(), first.wrapping_add(1));
        assert_eq!(rtp.next_sequence(), first.wrapping_add(2));
        assert_eq!(rtp.sent_packets(), 3);
    }

    #[test]
    fn fill_header_layout() {
        let rtp = RtpState::new(96, 90_000);
        let mut buf = [0u8; RTP_HEADER_LEN];
        rtp.fill_header(&mut buf);
        assert_eq!(buf[0], 0x80);
        assert_eq!(buf[1], 96);
        let frame = validate_rtp_frame(&ctx(), &[&buf[..], &b"x"[..]].concat(), false)
            .unwrap()
            .unwrap();
        assert_eq!(frame.header.payload_type, 96);
        assert_eq!(&frame.payload[..], b"x");
    }
}
