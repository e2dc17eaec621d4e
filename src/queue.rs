// Copyright (C) 2024 the hevc-rtp authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Batching send queue.
//!
//! The packetizers enqueue one or more packets per frame; each enqueue
//! reserves the next RTP sequence number and serializes the packet (header
//! plus scatter parts) into queue-owned storage, so nothing borrowed from
//! the caller survives the call. A flush writes the whole batch FIFO — on
//! Linux as a single `sendmmsg(2)` call, elsewhere as a per-packet loop.

use std::net::UdpSocket;

use log::trace;

use crate::error::ErrorInt;
use crate::rtp::{RtpState, RTP_HEADER_LEN};
use crate::{ConnectionContext, Error};

pub(crate) struct FrameQueue {
    /// Header shared by all packets of the current batch; the timestamp is
    /// sampled once per batch so every packet of a frame carries the same
    /// one. The sequence field is overwritten per packet.
    template: [u8; RTP_HEADER_LEN],

    /// Serialized packets awaiting flush, in enqueue order.
    pending: Vec<Vec<u8>>,
}

impl FrameQueue {
    pub(crate) fn new() -> Self {
        Self {
            template: [0; RTP_HEADER_LEN],
            pending: Vec::new(),
        }
    }

    /// Starts a new batch, discarding any leftover packets and capturing the
    /// per-batch header template.
    pub(crate) fn start_batch(&mut self, rtp: &RtpState) {
        self.pending.clear();
        rtp.fill_header(&mut self.template);
    }

    pub(crate) fn enqueue(&mut self, rtp: &mut RtpState, payload: &[u8]) -> Result<(), Error> {
        self.enqueue_scatter(rtp, &[payload])
    }

    /// Serializes `parts` into one packet behind a fresh header and appends
    /// it to the batch.
    pub(crate) fn enqueue_scatter(
        &mut self,
        rtp: &mut RtpState,
        parts: &[&[u8]],
    ) -> Result<(), Error> {
        let payload_len: usize = parts.iter().map(|p| p.len()).sum();
        if payload_len == 0 {
            bail!(ErrorInt::InvalidArgument(
                "cannot enqueue an empty packet".to_owned()
            ));
        }
        let mut pkt = Vec::with_capacity(RTP_HEADER_LEN + payload_len);
        pkt.extend_from_slice(&self.template);
        pkt[2..4].copy_from_slice(&rtp.next_sequence().to_be_bytes());
        for part in parts {
            pkt.extend_from_slice(part);
        }
        self.pending.push(pkt);
        Ok(())
    }

    /// Writes all pending packets to the socket in enqueue order and empties
    /// the queue — also on error; RTP is loss-tolerant and the caller should
    /// not retry individual packets.
    pub(crate) fn flush(
        &mut self,
        socket: &UdpSocket,
        conn_ctx: &ConnectionContext,
    ) -> Result<(), Error> {
        if self.pending.is_empty() {
            bail!(ErrorInt::FailedPrecondition(
                "cannot flush an empty queue".to_owned()
            ));
        }
        // The last packet of a multi-packet batch closes the frame.
        if self.pending.len() > 1 {
            if let Some(last) = self.pending.last_mut() {
                last[1] |= 1 << 7;
            }
        }
        let count = self.pending.len();
        let result = send_batch(socket, &self.pending);
        self.pending.clear();
        match result {
            Ok(()) => {
                trace!("flushed {} packet(s) on {}", count, conn_ctx);
                Ok(())
            }
            Err(source) => Err(wrap!(ErrorInt::UdpSendError {
                conn_ctx: *conn_ctx,
                source,
            })),
        }
    }

    /// Discards all pending packets without sending.
    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> &[Vec<u8>] {
        &self.pending
    }
}

/// Sends `packets` to the connected peer as one `sendmmsg(2)` syscall group.
#[cfg(target_os = "linux")]
fn send_batch(socket: &UdpSocket, packets: &[Vec<u8>]) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let mut iovecs: Vec<libc::iovec> = packets
        .iter()
        .map(|pkt| libc::iovec {
            iov_base: pkt.as_ptr() as *mut libc::c_void,
            iov_len: pkt.len(),
        })
        .collect();
    let mut headers: Vec<libc::mmsghdr> = iovecs
        .iter_mut()
        .map(|iov| {
            // Zero-initialized rather than a struct literal: msghdr has
            // private padding fields on some libc targets.
            let mut hdr: libc::mmsghdr = unsafe { std::mem::zeroed() };
            hdr.msg_hdr.msg_iov = iov as *mut libc::iovec;
            hdr.msg_hdr.msg_iovlen = 1;
            hdr
        })
        .collect();

    let fd = socket.as_raw_fd();
    let mut sent = 0;
    while sent < headers.len() {
        let n = unsafe {
            libc::sendmmsg(
                fd,
                headers[sent..].as_mut_ptr(),
                (headers.len() - sent) as libc::c_uint,
                0,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        sent += n as usize;
    }
    Ok(())
}

/// Per-packet fallback where no batched-send primitive exists.
#[cfg(not(target_os = "linux"))]
fn send_batch(socket: &UdpSocket, packets: &[Vec<u8>]) -> std::io::Result<()> {
    for pkt in packets {
        socket.send(pkt)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::validate_rtp_frame;

    fn rtp() -> RtpState {
        RtpState::new(96, 90_000)
    }

    #[test]
    fn reserves_consecutive_sequence_numbers() {
        let mut rtp = rtp();
        let mut queue = FrameQueue::new();
        queue.start_batch(&rtp);
        queue.enqueue(&mut rtp, b"a").unwrap();
        queue.enqueue(&mut rtp, b"bb").unwrap();
        queue.enqueue(&mut rtp, b"ccc").unwrap();

        let ctx = ConnectionContext::dummy();
        let seqs: Vec<u16> = queue
            .pending()
            .iter()
            .map(|pkt| {
                validate_rtp_frame(&ctx, pkt, false)
                    .unwrap()
                    .unwrap()
                    .header
                    .sequence
            })
            .collect();
        assert_eq!(seqs[1], seqs[0].wrapping_add(1));
        assert_eq!(seqs[2], seqs[0].wrapping_add(2));
    }

    #[test]
    fn scatter_parts_are_concatenated() {
        let mut rtp = rtp();
        let mut queue = FrameQueue::new();
        queue.start_batch(&rtp);
        queue
            .enqueue_scatter(&mut rtp, &[&b"\x62\x01"[..], b"\x93", b"rest"])
            .unwrap();
        let pkt = &queue.pending()[0];
        assert_eq!(&pkt[RTP_HEADER_LEN..], b"\x62\x01\x93rest");
    }

    #[test]
    fn rejects_empty_packet() {
        let mut rtp = rtp();
        let mut queue = FrameQueue::new();
        queue.start_batch(&rtp);
        assert!(queue.enqueue(&mut rtp, b"").is_err());
        assert!(queue.enqueue_scatter(&mut rtp, &[b"", b""]).is_err());
    }

    #[test]
    fn flush_rejects_empty_queue() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut queue = FrameQueue::new();
        assert!(queue
            .flush(&socket, &ConnectionContext::dummy())
            .is_err());
    }

    #[test]
    fn flush_sends_fifo_and_marks_last() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.connect(receiver.local_addr().unwrap()).unwrap();

        let mut rtp = rtp();
        let mut queue = FrameQueue::new();
        queue.start_batch(&rtp);
        queue.enqueue(&mut rtp, b"first").unwrap();
        queue.enqueue(&mut rtp, b"second").unwrap();
        queue.enqueue(&mut rtp, b"third").unwrap();
        queue
            .flush(&sender, &ConnectionContext::dummy())
            .unwrap();
        assert!(queue.pending().is_empty());

        let ctx = ConnectionContext::dummy();
        let mut buf = [0u8; 2048];
        let mut frames = Vec::new();
        for _ in 0..3 {
            let n = receiver.recv(&mut buf).unwrap();
            frames.push(validate_rtp_frame(&ctx, &buf[..n], false).unwrap().unwrap());
        }
        assert_eq!(&frames[0].payload[..], b"first");
        assert_eq!(&frames[1].payload[..], b"second");
        assert_eq!(&frames[2].payload[..], b"third");
        assert!(!frames[0].header.marker);
        assert!(!frames[1].header.marker);
        assert!(frames[2].header.marker);
        assert_eq!(
            frames[1].header.sequence,
            frames[0].header.sequence.wrapping_add(1)
        );
        assert_eq!(frames[0].header.timestamp, frames[1].header.timestamp);
    }

    #[test]
    fn clear_discards_pending() {
        let mut rtp = rtp();
        let mut queue = FrameQueue::new();
        queue.start_batch(&rtp);
        queue.enqueue(&mut rtp, b"doomed").unwrap();
        queue.clear();
        assert!(queue.pending().is_empty());
    }
}
