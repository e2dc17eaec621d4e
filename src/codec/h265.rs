// Copyright (C) 2024 the hevc-rtp authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HEVC (H.265) RTP payload handling per
//! [RFC 7798](https://tools.ietf.org/html/rfc7798).
//!
//! Send side: [`push_frame`] walks the NAL units of an Annex-B buffer and
//! packs each into the connection's send batch, fragmenting any unit that
//! exceeds the payload budget. Receive side: [`FrameAssembler`] collects
//! fragmentation units — possibly out of order, possibly across a sequence
//! number wrap — back into complete units and splits aggregation packets.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::annexb;
use crate::codec::{generic, BatchStatus, Reassembled, SendContext};
use crate::error::ErrorInt;
use crate::rtp::RtpFrame;
use crate::{ConnectionContext, Error};

/// Length of the `nal_unit_header` beginning every unit.
pub(crate) const NAL_HEADER_LEN: usize = 2;

/// FU indicator (2 bytes) plus FU header (1 byte) at the front of every
/// fragment.
pub(crate) const FRAG_HEADER_LEN: usize = 3;

/// Aggregation packet, RFC 7798 section 4.4.2.
const AGGREGATION_TYPE: u8 = 48;

/// Fragmentation unit, RFC 7798 section 4.4.3.
const FRAGMENT_TYPE: u8 = 49;

/// Splits an Annex-B buffer into NAL units and hands each to the send
/// batch. The buffer is unchanged on return; mutable access covers the
/// scanner's transient sentinel write.
pub(crate) fn push_frame(ctx: &mut SendContext<'_>, data: &mut [u8]) -> Result<(), Error> {
    if data.is_empty() {
        bail!(ErrorInt::InvalidArgument(
            "cannot send an empty frame".to_owned()
        ));
    }

    if data.len() < ctx.max_payload {
        // Small buffers nearly always hold a single unit; hand it to the
        // passthrough sender with the leading start code stripped, unless a
        // second code proves the buffer needs the full walk.
        let begin = annexb::find_start_code(data, 0).map(|sc| sc.end).unwrap_or(0);
        if annexb::find_start_code(data, begin).is_none() {
            return generic::push_frame(ctx, &data[begin..]);
        }
    }

    let units: Vec<Range<usize>> = annexb::NalUnits::new(data)
        .filter(|unit| !unit.is_empty())
        .collect();
    let Some(last) = units.len().checked_sub(1) else {
        debug!("no NAL units in a {}-byte buffer", data.len());
        return Ok(());
    };

    ctx.queue.start_batch(ctx.rtp);
    for (i, unit) in units.iter().enumerate() {
        if let Err(e) = push_nal(ctx, &data[unit.clone()], i < last) {
            ctx.queue.clear();
            return Err(e);
        }
    }
    Ok(())
}

/// Packs one NAL unit.
///
/// A unit within the payload budget is enqueued verbatim; with
/// `more_follows` it is merely held in the batch ([`BatchStatus::Queued`])
/// so the caller can coalesce several short units into one flush, otherwise
/// the batch is flushed. An oversized unit is split into fragments that
/// carry the FU indicator in place of the unit's own header, and the batch
/// is flushed before returning — fragments of one unit are never split
/// across flushes.
fn push_nal(
    ctx: &mut SendContext<'_>,
    unit: &[u8],
    more_follows: bool,
) -> Result<BatchStatus, Error> {
    if unit.len() <= ctx.max_payload {
        ctx.queue.enqueue(ctx.rtp, unit)?;
        if more_follows {
            return Ok(BatchStatus::Queued);
        }
        ctx.queue.flush(ctx.socket, ctx.conn_ctx)?;
        return Ok(BatchStatus::Flushed);
    }

    let nal_type = (unit[0] >> 1) & 0x3f;
    // All fragments share one FU indicator: type 49, the unit's own layer
    // id, TID 1.
    let fu_indicator = [
        (FRAGMENT_TYPE << 1) | (unit[0] & 0x01),
        (unit[1] & 0xf8) | 0x01,
    ];
    let fu_start = (1 << 7) | nal_type;
    let fu_middle = nal_type;
    let fu_end = (1 << 6) | nal_type;

    // Fragments carry the FU indicator instead of the unit's header.
    let payload = &unit[NAL_HEADER_LEN..];

    // The first fragment leaves at least one byte behind so the unit always
    // closes with a dedicated end fragment.
    let first_chunk = ctx.max_payload.min(payload.len() - 1);
    ctx.queue.enqueue_scatter(
        ctx.rtp,
        &[&fu_indicator[..], &[fu_start], &payload[..first_chunk]],
    )?;
    let mut pos = first_chunk;
    while payload.len() - pos > ctx.max_payload {
        ctx.queue.enqueue_scatter(
            ctx.rtp,
            &[&fu_indicator[..], &[fu_middle], &payload[pos..pos + ctx.max_payload]],
        )?;
        pos += ctx.max_payload;
    }
    ctx.queue
        .enqueue_scatter(ctx.rtp, &[&fu_indicator[..], &[fu_end], &payload[pos..]])?;
    ctx.queue.flush(ctx.socket, ctx.conn_ctx)?;
    Ok(BatchStatus::Flushed)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FragKind {
    /// A whole NAL unit in one packet.
    NotFragment,

    /// An aggregation packet holding several units.
    Aggregation,

    Fragment(FragPos),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FragPos {
    Start,
    Middle,
    End,
}

/// Coarse classification of a unit type, used to prioritize intra frames
/// during reassembly.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum NalClass {
    Intra,
    Inter,
    Other,
}

fn nal_class(unit_type: u8) -> NalClass {
    match unit_type {
        19 | 20 => NalClass::Intra, // IDR_W_RADL, IDR_N_LP
        1 => NalClass::Inter,       // TRAIL_R
        _ => NalClass::Other,
    }
}

/// A frame being collected from fragments, keyed by its RTP timestamp.
struct PartialFrame {
    start_seq: Option<u16>,
    end_seq: Option<u16>,

    /// Fragments keyed by sequence number, extended past a 16-bit wrap
    /// relative to the start fragment so map order is arrival order on the
    /// wire.
    fragments: BTreeMap<u32, RtpFrame>,

    /// Fragments that arrived before the start fragment; their position
    /// cannot be computed yet.
    parked: Vec<RtpFrame>,

    first_arrival: Instant,
    received: usize,
}

/// Reassembles received HEVC packets into complete NAL units.
///
/// Single-unit packets pass straight through; aggregation packets are split;
/// fragmentation units are collected per RTP timestamp until every sequence
/// number between the start and end fragment has arrived. Partial frames
/// that outlive the configured deadline are discarded, and while an intra
/// frame is incomplete, completed inter frames are dropped rather than
/// delivered ahead of it.
pub(crate) struct FrameAssembler {
    conn_ctx: ConnectionContext,
    frames: HashMap<u32, PartialFrame>,

    /// Timestamps of discarded frames, so stragglers are not mistaken for
    /// the first fragment of a new frame.
    dropped: HashSet<u32>,

    /// Timestamp of the intra frame currently being collected, if any.
    intra: Option<u32>,

    prepend_start_codes: bool,
    intra_delay: bool,
    max_delay: Duration,
}

impl FrameAssembler {
    pub(crate) fn new(
        conn_ctx: ConnectionContext,
        prepend_start_codes: bool,
        intra_delay: bool,
        max_delay: Duration,
    ) -> Self {
        Self {
            conn_ctx,
            frames: HashMap::new(),
            dropped: HashSet::new(),
            intra: None,
            prepend_start_codes,
            intra_delay,
            max_delay,
        }
    }

    pub(crate) fn push(&mut self, frame: RtpFrame) -> Result<Reassembled, Error> {
        let pos = match self.frag_kind(&frame)? {
            FragKind::Aggregation => {
                return self.split_aggregation(frame).map(Reassembled::Several)
            }
            FragKind::NotFragment => {
                let frame = if self.prepend_start_codes {
                    prepend_start_code(frame)
                } else {
                    frame
                };
                return Ok(Reassembled::Ready(frame));
            }
            FragKind::Fragment(pos) => pos,
        };

        let ts = frame.header.timestamp;
        let seq = frame.header.sequence;
        let class = nal_class(frame.payload[2] & 0x3f);

        if self.dropped.contains(&ts) {
            return Err(self.packet_error(&frame, "fragment of an already discarded frame"));
        }

        if !self.frames.contains_key(&ts) && class == NalClass::Intra {
            // A new intra supersedes an unfinished one.
            if self.intra_delay {
                if let Some(old_ts) = self.intra {
                    if old_ts != ts {
                        self.drop_frame(old_ts, "superseded by a newer intra frame");
                    }
                }
            }
            self.intra = Some(ts);
        }

        let partial = self.frames.entry(ts).or_insert_with(|| PartialFrame {
            start_seq: None,
            end_seq: None,
            fragments: BTreeMap::new(),
            parked: Vec::new(),
            first_arrival: Instant::now(),
            received: 0,
        });
        partial.received += 1;

        match pos {
            FragPos::Start => {
                partial.start_seq = Some(seq);
                // Parked fragments can be placed now that the wrap reference
                // is known.
                for parked in std::mem::take(&mut partial.parked) {
                    let key = extended_seq(seq, parked.header.sequence);
                    partial.fragments.insert(key, parked);
                }
                partial.fragments.insert(u32::from(seq), frame);
            }
            FragPos::Middle | FragPos::End => {
                if pos == FragPos::End {
                    partial.end_seq = Some(seq);
                }
                match partial.start_seq {
                    Some(start) => {
                        partial.fragments.insert(extended_seq(start, seq), frame);
                    }
                    None => partial.parked.push(frame),
                }
            }
        }

        let complete = match (partial.start_seq, partial.end_seq) {
            (Some(start), Some(end)) => {
                let expected = if start > end {
                    0x10000 - u32::from(start) + u32::from(end) + 1
                } else {
                    u32::from(end - start) + 1
                };
                expected as usize == partial.received
            }
            _ => false,
        };
        let late = !complete && partial.first_arrival.elapsed() >= self.max_delay;

        if complete {
            if class == NalClass::Inter && self.intra_delay && self.intra.is_some() {
                // An intra frame is still in progress; don't run ahead of it.
                self.drop_frame(ts, "inter frame completed while an intra frame is in progress");
                return Ok(Reassembled::Pending);
            }
            if let Some(partial) = self.frames.remove(&ts) {
                if self.intra == Some(ts) {
                    self.intra = None;
                }
                return Ok(Reassembled::Ready(self.reconstruct(partial)?));
            }
        } else if late {
            // Waiting any longer would just hold back newer frames. An
            // incomplete intra frame is kept when intra delay is on.
            if class != NalClass::Intra || !self.intra_delay {
                self.drop_frame(ts, "exceeded the reassembly deadline");
            }
        }
        Ok(Reassembled::Pending)
    }

    fn frag_kind(&self, frame: &RtpFrame) -> Result<FragKind, Error> {
        let payload = &frame.payload;
        if payload.len() < NAL_HEADER_LEN {
            return Err(self.packet_error(frame, "payload shorter than a NAL header"));
        }
        let unit_type = (payload[0] >> 1) & 0x3f;
        if unit_type == AGGREGATION_TYPE {
            return Ok(FragKind::Aggregation);
        }
        if unit_type != FRAGMENT_TYPE {
            return Ok(FragKind::NotFragment);
        }
        if payload.len() < FRAG_HEADER_LEN {
            return Err(self.packet_error(frame, "fragmentation unit without a FU header"));
        }
        let start = payload[2] & 0b1000_0000 != 0;
        let end = payload[2] & 0b0100_0000 != 0;
        match (start, end) {
            (true, true) => Err(self.packet_error(frame, "fragment with both start and end set")),
            (true, false) => Ok(FragKind::Fragment(FragPos::Start)),
            (false, true) => Ok(FragKind::Fragment(FragPos::End)),
            (false, false) => Ok(FragKind::Fragment(FragPos::Middle)),
        }
    }

    /// Splits an aggregation packet into its units, each surfaced as its own
    /// frame under the packet's RTP header.
    fn split_aggregation(&self, frame: RtpFrame) -> Result<Vec<RtpFrame>, Error> {
        let payload = &frame.payload;
        let mut units = Vec::new();
        let mut pos = NAL_HEADER_LEN;
        while pos < payload.len() {
            if payload.len() - pos < 2 {
                return Err(self.packet_error(&frame, "truncated aggregation unit length"));
            }
            let len = usize::from(u16::from_be_bytes([payload[pos], payload[pos + 1]]));
            pos += 2;
            if len < NAL_HEADER_LEN || payload.len() - pos < len {
                return Err(self.packet_error(&frame, "aggregation unit extends beyond packet"));
            }
            units.push(RtpFrame {
                header: frame.header,
                csrc: Vec::new(),
                extension: None,
                payload: payload.slice(pos..pos + len),
                padding_len: 0,
            });
            pos += len;
        }
        if units.is_empty() {
            return Err(self.packet_error(&frame, "aggregation packet with no units"));
        }
        Ok(units)
    }

    /// Concatenates a complete frame's fragments, restoring the unit's own
    /// header from the FU indicator (forbidden bit, layer id) and FU header
    /// (unit type).
    fn reconstruct(&self, partial: PartialFrame) -> Result<RtpFrame, Error> {
        let first = partial.fragments.values().next().ok_or_else(|| {
            wrap!(ErrorInt::Internal(
                "complete frame with no fragments".into()
            ))
        })?;
        let total: usize = partial
            .fragments
            .values()
            .map(|f| f.payload.len() - FRAG_HEADER_LEN)
            .sum();
        let prefix = if self.prepend_start_codes { 4 } else { 0 };
        let mut data = Vec::with_capacity(prefix + NAL_HEADER_LEN + total);
        if self.prepend_start_codes {
            data.extend_from_slice(&[0, 0, 0, 1]);
        }
        data.push((first.payload[0] & 0x81) | ((first.payload[2] & 0x3f) << 1));
        data.push(first.payload[1]);
        let header = first.header;
        for fragment in partial.fragments.values() {
            data.extend_from_slice(&fragment.payload[FRAG_HEADER_LEN..]);
        }
        Ok(RtpFrame {
            header,
            csrc: Vec::new(),
            extension: None,
            payload: data.into(),
            padding_len: 0,
        })
    }

    fn drop_frame(&mut self, ts: u32, reason: &str) {
        if let Some(partial) = self.frames.remove(&ts) {
            info!(
                "dropping frame ts={} after {} fragment(s): {}",
                ts, partial.received, reason
            );
            self.dropped.insert(ts);
            if self.intra == Some(ts) {
                self.intra = None;
            }
        }
    }

    fn packet_error(&self, frame: &RtpFrame, description: &str) -> Error {
        wrap!(ErrorInt::PacketError {
            conn_ctx: self.conn_ctx,
            description: description.to_owned(),
            data: frame.payload.clone(),
        })
    }
}

/// Sequence number extended past a 16-bit wrap relative to the start
/// fragment's sequence number.
fn extended_seq(start: u16, seq: u16) -> u32 {
    if start > seq {
        0x10000 + u32::from(seq)
    } else {
        u32::from(seq)
    }
}

fn prepend_start_code(mut frame: RtpFrame) -> RtpFrame {
    let mut data = Vec::with_capacity(4 + frame.payload.len());
    data.extend_from_slice(&[0, 0, 0, 1]);
    data.extend_from_slice(&frame.payload);
    frame.payload = data.into();
    frame
}
