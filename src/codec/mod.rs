// Copyright (C) 2024 the hevc-rtp authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Payload-format-specific logic.
//!
//! The HEVC format carries the interesting machinery: Annex-B splitting and
//! RFC 7798 fragmentation on send, access-unit reassembly on receive. The
//! generic format is a pure passthrough and also serves Opus, whose frames
//! always fit one datagram.

use std::net::UdpSocket;

use crate::queue::FrameQueue;
use crate::rtp::{RtpFrame, RtpState};
use crate::ConnectionContext;

pub(crate) mod generic;

#[doc(hidden)]
pub mod h265;

/// The media format carried by a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PayloadFormat {
    /// HEVC (H.265) video, packetized per RFC 7798.
    Hevc,

    /// Opus audio, one frame per packet.
    Opus,

    /// Uninterpreted payload, one buffer per packet.
    Generic,
}

impl PayloadFormat {
    pub(crate) fn payload_type(self) -> u8 {
        match self {
            PayloadFormat::Hevc => 96,
            PayloadFormat::Opus => 97,
            PayloadFormat::Generic => 98,
        }
    }

    pub(crate) fn clock_rate(self) -> u32 {
        match self {
            PayloadFormat::Hevc => 90_000,
            PayloadFormat::Opus => 48_000,
            PayloadFormat::Generic => 8_000,
        }
    }
}

/// Everything a packetizer needs to enqueue and flush packets for one
/// connection.
pub(crate) struct SendContext<'a> {
    pub(crate) rtp: &'a mut RtpState,
    pub(crate) queue: &'a mut FrameQueue,
    pub(crate) socket: &'a UdpSocket,
    pub(crate) conn_ctx: &'a ConnectionContext,
    pub(crate) max_payload: usize,
}

/// Outcome of handing one NAL unit to the packetizer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum BatchStatus {
    /// Held in the batch; the caller keeps building it.
    Queued,

    /// Written to the socket (directly or by draining the batch).
    Flushed,
}

/// What a receive-side handler made of one validated packet.
pub(crate) enum Reassembled {
    /// Consumed; more packets are needed before a frame is complete.
    Pending,

    /// One complete frame.
    Ready(RtpFrame),

    /// Several complete frames (e.g. from an aggregation packet).
    Several(Vec<RtpFrame>),
}
