// Copyright (C) 2024 the hevc-rtp authors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use crate::{ConnectionContext, WallTime};
use bytes::Bytes;
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable error messages. In most cases they
/// have enough information to find the offending packet in Wireshark.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// Malformed datagram: short header, bad version, inconsistent lengths.
    #[error(
        "{description}\n\nconn: {conn_ctx}\ndata: {:?}",
        crate::dump::PacketDump(data)
    )]
    PacketError {
        conn_ctx: ConnectionContext,
        description: String,
        data: Bytes,
    },

    #[error("Unable to set up UDP socket: {0}")]
    BindError(#[source] std::io::Error),

    #[error("Error sending UDP packets: {source}\n\nconn: {conn_ctx}")]
    UdpSendError {
        conn_ctx: ConnectionContext,
        source: std::io::Error,
    },

    #[error(
        "Error receiving UDP packet: {source}\n\n\
         conn: {conn_ctx}\nat: {when}"
    )]
    UdpRecvError {
        conn_ctx: ConnectionContext,
        when: WallTime,
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}
