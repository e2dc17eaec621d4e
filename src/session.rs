// Copyright (C) 2024 the hevc-rtp authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-connection session: socket setup, the send entry point, and the
//! receive worker's lifecycle.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::codec::{generic, h265, PayloadFormat, SendContext};
use crate::error::ErrorInt;
use crate::queue::FrameQueue;
use crate::receiver::Receiver;
use crate::rtp::{RtpFrame, RtpState};
use crate::{ConnectionContext, Error, MAX_PAYLOAD};

/// Smallest payload budget that leaves room for the per-packet HEVC headers
/// plus a useful amount of data.
const MIN_MAX_PAYLOAD: usize = 64;

/// Tunables for one [`RtpSession`]. `Default` matches common deployments.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// UDP payload budget after the RTP header; NAL units beyond this are
    /// fragmented.
    pub max_payload: usize,

    /// `SO_RCVBUF` size. The OS default is far too small for a video burst.
    pub recv_buffer_size: usize,

    /// `SO_SNDBUF` size.
    pub send_buffer_size: usize,

    /// Silently hand off version-0 packets to ZRTP key-management demuxing
    /// instead of rejecting them.
    pub zrtp_key_management: bool,

    /// Restore a 4-byte Annex-B start code on delivered HEVC frames.
    pub prepend_start_codes: bool,

    /// Hold back completed inter frames while an intra frame is still being
    /// reassembled.
    pub intra_frame_delay: bool,

    /// How long a partially reassembled frame may wait for its missing
    /// fragments.
    pub max_fragment_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_payload: MAX_PAYLOAD,
            recv_buffer_size: 4 << 20,
            send_buffer_size: 4 << 20,
            zrtp_key_management: false,
            prepend_start_codes: false,
            intra_frame_delay: true,
            max_fragment_delay: Duration::from_millis(100),
        }
    }
}

/// One RTP media stream over UDP.
///
/// The send path ([`RtpSession::push_frame`]) runs on the caller's thread;
/// it is the caller's job not to push concurrently on one session. The
/// receive path owns a dedicated worker started by
/// [`RtpSession::start_receiver`]; frames come back through an installed
/// hook or [`RtpSession::pull_frame`].
pub struct RtpSession {
    socket: UdpSocket,
    conn_ctx: ConnectionContext,
    config: SessionConfig,
    format: PayloadFormat,
    rtp: RtpState,
    queue: FrameQueue,
    receiver: Option<Receiver>,
}

impl RtpSession {
    /// Binds `local_addr`, connects to `peer_addr`, and sizes the socket
    /// buffers. A zero `peer_addr` port leaves the socket unconnected,
    /// giving a receive-only session.
    pub fn new(
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        format: PayloadFormat,
        config: SessionConfig,
    ) -> Result<Self, Error> {
        if config.max_payload < MIN_MAX_PAYLOAD {
            bail!(ErrorInt::InvalidArgument(format!(
                "max_payload {} is below the minimum of {}",
                config.max_payload, MIN_MAX_PAYLOAD
            )));
        }
        let bind = |e| wrap!(ErrorInt::BindError(e));
        let socket =
            Socket::new(Domain::for_address(local_addr), Type::DGRAM, Some(Protocol::UDP))
                .map_err(bind)?;
        socket
            .set_recv_buffer_size(config.recv_buffer_size)
            .map_err(bind)?;
        socket
            .set_send_buffer_size(config.send_buffer_size)
            .map_err(bind)?;
        socket.bind(&local_addr.into()).map_err(bind)?;
        if peer_addr.port() != 0 {
            socket.connect(&peer_addr.into()).map_err(bind)?;
        }
        let socket: UdpSocket = socket.into();
        let local_addr = socket.local_addr().map_err(bind)?;
        Ok(Self {
            socket,
            conn_ctx: ConnectionContext::new(local_addr, peer_addr),
            rtp: RtpState::new(format.payload_type(), format.clock_rate()),
            queue: FrameQueue::new(),
            config,
            format,
            receiver: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.conn_ctx.local_addr
    }

    /// Number of RTP packets sent on this session.
    pub fn packets_sent(&self) -> u64 {
        self.rtp.sent_packets()
    }

    /// Sends one media frame.
    ///
    /// For HEVC this is an Annex-B buffer possibly holding several NAL
    /// units; for the other formats the buffer goes out verbatim as one
    /// packet. The buffer is unchanged on return; mutable access covers the
    /// start-code scanner's transient sentinel write, so the buffer must
    /// not be shared with another thread during the call. The only blocking
    /// operation is the socket write.
    pub fn push_frame(&mut self, data: &mut [u8]) -> Result<(), Error> {
        let mut ctx = SendContext {
            rtp: &mut self.rtp,
            queue: &mut self.queue,
            socket: &self.socket,
            conn_ctx: &self.conn_ctx,
            max_payload: self.config.max_payload,
        };
        match self.format {
            PayloadFormat::Hevc => h265::push_frame(&mut ctx, data),
            PayloadFormat::Opus | PayloadFormat::Generic => generic::push_frame(&mut ctx, data),
        }
    }

    /// Starts the receive worker for this session.
    pub fn start_receiver(&mut self) -> Result<(), Error> {
        if self.receiver.is_some() {
            bail!(ErrorInt::FailedPrecondition(
                "receiver is already running".to_owned()
            ));
        }
        let socket = self
            .socket
            .try_clone()
            .map_err(|e| wrap!(ErrorInt::BindError(e)))?;
        self.receiver = Some(Receiver::start(
            socket,
            self.format,
            self.config.clone(),
            self.conn_ctx,
        )?);
        Ok(())
    }

    /// Installs the frame-delivery callback, disabling the pull queue.
    /// Requires a running receiver.
    pub fn install_receive_hook(
        &self,
        hook: impl FnMut(RtpFrame) + Send + 'static,
    ) -> Result<(), Error> {
        let Some(receiver) = &self.receiver else {
            bail!(ErrorInt::FailedPrecondition(
                "receiver is not running".to_owned()
            ));
        };
        receiver.install_hook(Box::new(hook));
        Ok(())
    }

    /// Blocks until a received frame is available, polling every 20 ms.
    /// Returns `None` when no receiver is running or it has been stopped.
    pub fn pull_frame(&self) -> Option<RtpFrame> {
        self.receiver.as_ref()?.pull_frame()
    }

    /// Like [`RtpSession::pull_frame`] but gives up after `timeout`.
    pub fn pull_frame_timeout(&self, timeout: Duration) -> Option<RtpFrame> {
        self.receiver.as_ref()?.pull_frame_timeout(timeout)
    }

    /// Stops the receive worker. In-flight sends are unaffected.
    pub fn stop_receiver(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.stop();
        }
    }
}

impl Drop for RtpSession {
    fn drop(&mut self) {
        self.stop_receiver();
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use super::*;
    use crate::rtp::RtpPacketBuilder;

    const PULL_TIMEOUT: Duration = Duration::from_secs(5);

    fn any_local() -> SocketAddr {
        (Ipv4Addr::LOCALHOST, 0).into()
    }

    fn small_mtu() -> SessionConfig {
        SessionConfig {
            max_payload: 64,
            ..Default::default()
        }
    }

    /// Receive-only session (zero peer port) with a running worker.
    fn listening(format: PayloadFormat, config: SessionConfig) -> RtpSession {
        let mut session = RtpSession::new(any_local(), any_local(), format, config).unwrap();
        session.start_receiver().unwrap();
        session
    }

    #[test]
    fn rejects_tiny_max_payload() {
        let config = SessionConfig {
            max_payload: 8,
            ..Default::default()
        };
        assert!(RtpSession::new(any_local(), any_local(), PayloadFormat::Hevc, config).is_err());
    }

    #[test]
    fn hevc_end_to_end() {
        let receiver = listening(PayloadFormat::Hevc, small_mtu());
        let mut sender = RtpSession::new(
            any_local(),
            receiver.local_addr(),
            PayloadFormat::Hevc,
            small_mtu(),
        )
        .unwrap();

        // Two units: a short VPS-ish one and an IDR large enough to
        // fragment at the 64-byte budget.
        let unit1 = b"\x40\x01\xaa\xbb\xcc\xdd".to_vec();
        let mut unit2 = b"\x26\x01".to_vec();
        unit2.extend((0..150u8).map(|i| i.wrapping_mul(7)));

        let mut data = Vec::new();
        data.extend_from_slice(b"\x00\x00\x00\x01");
        data.extend_from_slice(&unit1);
        data.extend_from_slice(b"\x00\x00\x01");
        data.extend_from_slice(&unit2);
        sender.push_frame(&mut data).unwrap();

        let f1 = receiver.pull_frame_timeout(PULL_TIMEOUT).unwrap();
        assert_eq!(&f1.payload[..], &unit1[..]);
        let f2 = receiver.pull_frame_timeout(PULL_TIMEOUT).unwrap();
        assert_eq!(&f2.payload[..], &unit2[..]);
    }

    #[test]
    fn hevc_small_buffer_fast_path() {
        let receiver = listening(PayloadFormat::Hevc, SessionConfig::default());
        let mut sender = RtpSession::new(
            any_local(),
            receiver.local_addr(),
            PayloadFormat::Hevc,
            SessionConfig::default(),
        )
        .unwrap();

        let mut data = b"\x00\x00\x00\x01\x40\x01\xaa\xbb".to_vec();
        sender.push_frame(&mut data).unwrap();
        let frame = receiver.pull_frame_timeout(PULL_TIMEOUT).unwrap();
        assert_eq!(&frame.payload[..], b"\x40\x01\xaa\xbb");
    }

    #[test]
    fn generic_delivery_via_hook() {
        let receiver = listening(PayloadFormat::Generic, SessionConfig::default());
        let (tx, rx) = std::sync::mpsc::channel();
        receiver
            .install_receive_hook(move |frame| {
                let _ = tx.send(frame);
            })
            .unwrap();
        let mut sender = RtpSession::new(
            any_local(),
            receiver.local_addr(),
            PayloadFormat::Generic,
            SessionConfig::default(),
        )
        .unwrap();

        let mut data = b"opaque payload".to_vec();
        sender.push_frame(&mut data).unwrap();
        let frame = rx.recv_timeout(PULL_TIMEOUT).unwrap();
        assert_eq!(&frame.payload[..], b"opaque payload");
    }

    #[test]
    fn malformed_and_zrtp_packets_are_dropped() {
        let receiver = listening(
            PayloadFormat::Generic,
            SessionConfig {
                zrtp_key_management: true,
                ..Default::default()
            },
        );
        let probe = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();

        // Version 0: silent ZRTP handoff. Version 1: malformed. Neither
        // reaches the consumer; the valid packet after them does.
        let mut zrtp_pkt = RtpPacketBuilder::default().build(b"zrtp").unwrap();
        zrtp_pkt[0] = 0;
        probe.send_to(&zrtp_pkt, receiver.local_addr()).unwrap();
        let mut bad_pkt = RtpPacketBuilder::default().build(b"bad").unwrap();
        bad_pkt[0] = 1 << 6;
        probe.send_to(&bad_pkt, receiver.local_addr()).unwrap();
        probe.send_to(b"\x80", receiver.local_addr()).unwrap();
        let good_pkt = RtpPacketBuilder {
            sequence: 7,
            ..Default::default()
        }
        .build(b"good")
        .unwrap();
        probe.send_to(&good_pkt, receiver.local_addr()).unwrap();

        let frame = receiver.pull_frame_timeout(PULL_TIMEOUT).unwrap();
        assert_eq!(&frame.payload[..], b"good");
        assert_eq!(frame.header.sequence, 7);
    }

    #[test]
    fn pull_after_stop_returns_none() {
        let mut session = listening(PayloadFormat::Generic, SessionConfig::default());
        session.stop_receiver();
        assert!(session.pull_frame().is_none());
        assert!(session.pull_frame_timeout(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn receiver_lifecycle_preconditions() {
        let mut session = RtpSession::new(
            any_local(),
            any_local(),
            PayloadFormat::Generic,
            SessionConfig::default(),
        )
        .unwrap();
        // Hook installation requires a running receiver.
        assert!(session.install_receive_hook(|_| {}).is_err());
        session.start_receiver().unwrap();
        assert!(session.start_receiver().is_err());
        session.stop_receiver();
        // Restartable after stop.
        session.start_receiver().unwrap();
    }
}
