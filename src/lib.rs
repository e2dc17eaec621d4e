// Copyright (C) 2024 the hevc-rtp authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! UDP media-payload core for HEVC (H.265) RTP.
//!
//! The send path takes an application-supplied Annex-B byte stream, splits it
//! at start-code boundaries, packs each NAL unit into RTP packets —
//! fragmenting oversized units per [RFC 7798](https://tools.ietf.org/html/rfc7798)
//! — and flushes them through a batching send queue. The receive path
//! validates RTP headers per
//! [RFC 3550 section 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1),
//! reassembles fragmented HEVC access units, and surfaces complete frames
//! through a callback or a pull queue.
//!
//! [`RtpSession`] is the entry point for both directions.

#![forbid(clippy::print_stderr, clippy::print_stdout)]

use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};

mod dump;
mod error;

pub use error::Error;

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

pub mod annexb;
pub mod codec;
mod queue;
mod receiver;
pub mod rtp;
mod session;

pub use codec::PayloadFormat;
pub use rtp::{ExtensionHeader, RtpFrame, RtpHeader};
pub use session::{RtpSession, SessionConfig};

/// Default UDP payload budget after the RTP header, in bytes.
///
/// Sized for a 1500-byte Ethernet MTU with headroom for IP/UDP headers and
/// the per-packet HEVC payload headers.
pub const MAX_PAYLOAD: usize = 1400;

/// A wall time taken from the local machine's realtime clock, used in error
/// reporting.
///
/// Currently this just allows formatting via `Debug` and `Display`.
#[derive(Copy, Clone, Debug)]
pub struct WallTime(chrono::DateTime<chrono::Utc>);

impl WallTime {
    pub(crate) fn now() -> Self {
        Self(chrono::Utc::now())
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%FT%T"))
    }
}

/// RTP connection context.
///
/// This gives enough information to pick out the flow in a packet capture.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionContext {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    established_wall: WallTime,
}

impl ConnectionContext {
    pub(crate) fn new(local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            peer_addr,
            established_wall: WallTime::now(),
        }
    }

    #[doc(hidden)]
    pub fn dummy() -> Self {
        let addr = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);
        Self::new(addr, addr)
    }
}

impl Display for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(me)->{}@{}",
            &self.local_addr, &self.peer_addr, &self.established_wall,
        )
    }
}
