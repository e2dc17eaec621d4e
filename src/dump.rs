// Copyright (C) 2024 the hevc-rtp authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Compact packet dumps for error messages and `Debug` output.
//!
//! A datagram can be 64 KiB; error text and logs only ever need enough of
//! it to identify the packet in a capture, so every dump is capped at
//! [`DUMP_LIMIT`] bytes and rendered on a single line.

use pretty_hex::PrettyHex;

/// At most this many bytes of a packet appear in any dump. Enough to cover
/// the RTP header, the payload headers, and the start of the payload.
const DUMP_LIMIT: usize = 64;

/// Wraps packet bytes so `Debug` prints a one-line hex dump capped at
/// [`DUMP_LIMIT`] bytes.
pub(crate) struct PacketDump<'a>(pub(crate) &'a [u8]);

impl std::fmt::Debug for PacketDump<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = &self.0[..self.0.len().min(DUMP_LIMIT)];
        write!(f, "{} byte(s) [{}]", self.0.len(), shown.hex_dump())?;
        if self.0.len() > DUMP_LIMIT {
            write!(f, " +{} more", self.0.len() - DUMP_LIMIT)?;
        }
        Ok(())
    }
}
