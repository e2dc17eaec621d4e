// Copyright (C) 2024 the hevc-rtp authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The receive worker: one thread per session that reads datagrams,
//! validates them, routes them through the format-specific handler, and
//! delivers complete frames either to an installed hook or to a pull queue.
//!
//! The pull queue is guarded by a mutex held only for single push/pop
//! operations; the consumer polls with a 20 ms sleep when the queue is
//! empty. That bounds consumer wakeup latency at 20 ms, which is fine under
//! an RTP jitter buffer, and keeps the design condition-variable-free.

use std::collections::VecDeque;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use crate::codec::{h265::FrameAssembler, PayloadFormat, Reassembled};
use crate::error::ErrorInt;
use crate::rtp::{validate_rtp_frame, RtpFrame};
use crate::session::SessionConfig;
use crate::{ConnectionContext, Error, WallTime};

/// Largest possible UDP payload: 64 KiB minus IPv4 and UDP headers.
const RECV_BUFFER_LEN: usize = 0xffff - 20 - 8;

/// How long one blocking read waits before re-checking the active flag.
const READ_POLL: Duration = Duration::from_micros(1500);

/// Sleep between polls of an empty pull queue.
const PULL_POLL: Duration = Duration::from_millis(20);

pub(crate) type ReceiveHook = Box<dyn FnMut(RtpFrame) + Send>;

struct Shared {
    active: AtomicBool,
    frames: Mutex<VecDeque<RtpFrame>>,
    hook: Mutex<Option<ReceiveHook>>,
}

/// Handle to a running receive worker.
pub(crate) struct Receiver {
    shared: Arc<Shared>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl Receiver {
    pub(crate) fn start(
        socket: UdpSocket,
        format: PayloadFormat,
        config: SessionConfig,
        conn_ctx: ConnectionContext,
    ) -> Result<Self, Error> {
        socket
            .set_read_timeout(Some(READ_POLL))
            .map_err(|e| wrap!(ErrorInt::BindError(e)))?;
        let shared = Arc::new(Shared {
            active: AtomicBool::new(true),
            frames: Mutex::new(VecDeque::new()),
            hook: Mutex::new(None),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("hevc-rtp-recv".to_owned())
            .spawn(move || run(socket, format, config, conn_ctx, worker_shared))
            .map_err(|e| wrap!(ErrorInt::Internal(e.into())))?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub(crate) fn active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Signals the worker to exit and waits for it. In-flight work
    /// completes; the worker observes the flag at its next read timeout.
    pub(crate) fn stop(&mut self) {
        self.shared.active.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    /// Installs the delivery callback. Replacing an already-installed hook
    /// is allowed but called out, since the previous consumer silently
    /// stops receiving frames.
    pub(crate) fn install_hook(&self, hook: ReceiveHook) {
        let mut slot = self.shared.hook.lock().unwrap();
        if slot.is_some() {
            warn!("replacing an already-installed receive hook");
        }
        *slot = Some(hook);
    }

    /// Blocks until a frame is available or the receiver is stopped.
    pub(crate) fn pull_frame(&self) -> Option<RtpFrame> {
        loop {
            if !self.active() {
                return None;
            }
            if let Some(frame) = self.shared.frames.lock().unwrap().pop_front() {
                return Some(frame);
            }
            std::thread::sleep(PULL_POLL);
        }
    }

    /// Like [`Receiver::pull_frame`] but gives up after `timeout`.
    pub(crate) fn pull_frame_timeout(&self, timeout: Duration) -> Option<RtpFrame> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.active() {
                return None;
            }
            if let Some(frame) = self.shared.frames.lock().unwrap().pop_front() {
                return Some(frame);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    socket: UdpSocket,
    format: PayloadFormat,
    config: SessionConfig,
    conn_ctx: ConnectionContext,
    shared: Arc<Shared>,
) {
    // Too big for comfort on the stack.
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    let mut assembler = FrameAssembler::new(
        conn_ctx,
        config.prepend_start_codes,
        config.intra_frame_delay,
        config.max_fragment_delay,
    );

    while shared.active.load(Ordering::Acquire) {
        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(source) => {
                error!(
                    "{}",
                    wrap!(ErrorInt::UdpRecvError {
                        conn_ctx,
                        when: WallTime::now(),
                        source,
                    })
                );
                continue;
            }
        };

        let frame = match validate_rtp_frame(&conn_ctx, &buf[..n], config.zrtp_key_management) {
            Ok(Some(frame)) => frame,
            // Version-0 traffic belongs to the key-management handshake and
            // is demultiplexed elsewhere.
            Ok(None) => continue,
            Err(e) => {
                debug!("discarding malformed packet: {}", e);
                continue;
            }
        };

        match format {
            PayloadFormat::Hevc => match assembler.push(frame) {
                Ok(Reassembled::Pending) => {}
                Ok(Reassembled::Ready(frame)) => deliver(&shared, frame),
                Ok(Reassembled::Several(frames)) => {
                    for frame in frames {
                        deliver(&shared, frame);
                    }
                }
                Err(e) => debug!("discarding HEVC packet: {}", e),
            },
            PayloadFormat::Opus | PayloadFormat::Generic => deliver(&shared, frame),
        }
    }
}

fn deliver(shared: &Shared, frame: RtpFrame) {
    let mut hook = shared.hook.lock().unwrap();
    match hook.as_mut() {
        Some(hook) => hook(frame),
        None => {
            drop(hook);
            shared.frames.lock().unwrap().push_back(frame);
        }
    }
}
