// Copyright (C) 2024 the hevc-rtp authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Passthrough payload format: one application buffer becomes one RTP
//! packet, unmodified. Used directly for Opus and generic sessions and by
//! the HEVC path for sub-MTU buffers.

use crate::error::ErrorInt;
use crate::Error;

use super::SendContext;

pub(crate) fn push_frame(ctx: &mut SendContext<'_>, payload: &[u8]) -> Result<(), Error> {
    if payload.is_empty() {
        bail!(ErrorInt::InvalidArgument(
            "cannot send an empty frame".to_owned()
        ));
    }
    ctx.queue.start_batch(ctx.rtp);
    ctx.queue.enqueue(ctx.rtp, payload)?;
    ctx.queue.flush(ctx.socket, ctx.conn_ctx)
}
