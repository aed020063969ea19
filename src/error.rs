// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc, time::Duration};

use crate::{client::Phase, ConnectionContext, RtspMessageContext};
use bytes::Bytes;
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable messages: most carry enough context
/// (addresses, connection establishment time, stream position) to find the
/// offending exchange in a packet capture. [`Error::kind`] gives a coarse
/// classification for callers deciding whether to re-establish the session.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns the broad category of this error.
    pub fn kind(&self) -> ErrorKind {
        match *self.0 {
            ErrorInt::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ErrorInt::InvalidState { .. } => ErrorKind::InvalidState,
            ErrorInt::BadStatus { .. } => ErrorKind::BadStatus,
            ErrorInt::RtspFramingError { .. }
            | ErrorInt::RtspResponseError { .. }
            | ErrorInt::RtspUnassignedChannelError { .. } => ErrorKind::Protocol,
            ErrorInt::ConnectError(_)
            | ErrorInt::UdpBindError(_)
            | ErrorInt::RtspReadError { .. }
            | ErrorInt::WriteError { .. } => ErrorKind::Transport,
            ErrorInt::Stall { .. } => ErrorKind::Stall,
            ErrorInt::Terminated => ErrorKind::Terminated,
            ErrorInt::Internal(_) => ErrorKind::Internal,
        }
    }
}

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

/// Coarse classification of an [`Error`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The caller supplied an invalid argument.
    InvalidArgument,

    /// The operation isn't legal in the session's current [`Phase`].
    InvalidState,

    /// The RTSP server answered with an unexpected status.
    BadStatus,

    /// The RTSP server sent something unparseable or unexpected.
    Protocol,

    /// A socket or connection read/write failed or timed out.
    Transport,

    /// No packets arrived on some track within the read timeout.
    Stall,

    /// Streaming was stopped on request.
    Terminated,

    /// A bug in this crate.
    Internal,
}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{operation} is not allowed in phase {phase}")]
    InvalidState {
        operation: &'static str,
        phase: Phase,
    },

    #[error("[{conn_ctx}, {msg_ctx}] bad status {status} ({description}) in response to {} CSeq={cseq}",
            Into::<&str>::into(.method))]
    BadStatus {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        method: rtsp_types::Method,
        cseq: u32,
        status: rtsp_types::StatusCode,
        description: String,
    },

    /// Unparseable or unexpected RTSP message.
    #[error("[{conn_ctx}, {msg_ctx}] RTSP framing error: {description}")]
    RtspFramingError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    /// A response with a successful status but unusable content.
    #[error("[{conn_ctx}, {msg_ctx}] {} response CSeq={cseq}: {description}",
            Into::<&str>::into(.method))]
    RtspResponseError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        method: rtsp_types::Method,
        cseq: u32,
        description: String,
    },

    #[error(
        "[{conn_ctx}, {msg_ctx}] Received interleaved data on unassigned channel {channel_id}: \n\
         {:?}",
        crate::hex::LimitedHex::new(data, 64)
    )]
    RtspUnassignedChannelError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        channel_id: u8,
        data: Bytes,
    },

    #[error("Unable to connect to RTSP server: {0}")]
    ConnectError(#[source] std::io::Error),

    #[error("Unable to bind local UDP ports: {0}")]
    UdpBindError(#[source] std::io::Error),

    #[error("[{conn_ctx}, {msg_ctx}] Error reading from RTSP peer: {source}")]
    RtspReadError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        source: std::io::Error,
    },

    #[error("[{conn_ctx}] Error writing to RTSP peer: {source}")]
    WriteError {
        conn_ctx: ConnectionContext,
        source: std::io::Error,
    },

    #[error(
        "[{conn_ctx}] no packets received on track {track_id} for {idle:?} \
         (maybe there's a firewall/NAT in between)"
    )]
    Stall {
        conn_ctx: ConnectionContext,
        track_id: usize,
        idle: Duration,
    },

    #[error("terminated")]
    Terminated,

    #[error("Internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}
