// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Playback over a pair of UDP sockets per track.
//!
//! The RTSP connection only carries keepalives here, so the stream-check
//! timer is what notices a dead stream.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, trace, warn};
use rtsp_types::{Message, Method, Request};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::driver::{self, Playback};
use super::{Frame, FrameCallback, RtspConnection, UdpTrack};
use crate::error::ErrorInt;
use crate::rtcp::RtcpReceiver;
use crate::tokio::RtspReader;
use crate::{Error, PacketContext, PacketContextInner, StreamType, WallTime};

/// Sent to the server's RTP port before listening, to open a return path through NAT.
pub(crate) const PRIMING_RTP: [u8; 12] = [0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];

/// Sent to the server's RTCP port before listening: an empty receiver report.
pub(crate) const PRIMING_RTCP: [u8; 8] = [0x80, 0xc9, 0x00, 0x01, 0, 0, 0, 0];

/// Largest possible UDP payload.
const MAX_DATAGRAM: usize = 65_535;

/// One UDP socket of a track: sends to the server's matching port and,
/// once started, delivers datagrams from the server's address to the callback.
pub(super) struct UdpListener {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    track_id: usize,
    stream_type: StreamType,
    receiver: Arc<RtcpReceiver>,
    callback: FrameCallback,
    task: Option<JoinHandle<()>>,
}

impl UdpListener {
    fn new(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        track_id: usize,
        stream_type: StreamType,
        receiver: Arc<RtcpReceiver>,
        callback: FrameCallback,
    ) -> Self {
        Self {
            socket,
            peer,
            track_id,
            stream_type,
            receiver,
            callback,
            task: None,
        }
    }

    pub(super) async fn write(&self, buf: &[u8]) -> Result<(), std::io::Error> {
        self.socket.send_to(buf, self.peer).await.map(|_| ())
    }

    pub(super) fn start(&mut self) {
        debug_assert!(self.task.is_none());
        let socket = self.socket.clone();
        let peer_ip = self.peer.ip();
        let track_id = self.track_id;
        let stream_type = self.stream_type;
        let receiver = self.receiver.clone();
        let callback = self.callback.clone();
        self.task = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("track {track_id} {stream_type} socket failed: {e}");
                        return;
                    }
                };
                if from.ip() != peer_ip {
                    trace!("track {track_id} {stream_type}: dropping datagram from {from}");
                    continue;
                }
                let payload = &buf[..len];
                receiver.process_frame(Instant::now(), stream_type, payload);
                callback(Frame {
                    track_id,
                    stream_type,
                    ctx: PacketContext(PacketContextInner::Udp {
                        received_wall: WallTime::now(),
                    }),
                    payload,
                });
            }
        }));
    }

    /// Stops delivery; no callback runs after this returns.
    pub(super) async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

/// Runs UDP playback until termination or failure. Returns the connection for
/// `TEARDOWN` unless the reader was lost.
pub(super) async fn run(
    mut p: Playback,
    conn: RtspConnection,
    tracks: Vec<(UdpTrack, Arc<RtcpReceiver>)>,
) -> Option<RtspConnection> {
    let RtspConnection {
        reader,
        mut writer,
        deadline,
    } = conn;
    let mut listeners = Vec::with_capacity(2 * tracks.len());
    for (track_id, (t, receiver)) in tracks.iter().enumerate() {
        listeners.push(UdpListener::new(
            t.rtp_socket.clone(),
            t.peer_rtp,
            track_id,
            StreamType::Rtp,
            receiver.clone(),
            p.callback.clone(),
        ));
        listeners.push(UdpListener::new(
            t.rtcp_socket.clone(),
            t.peer_rtcp,
            track_id,
            StreamType::Rtcp,
            receiver.clone(),
            p.callback.clone(),
        ));
    }

    // Every priming packet goes out before any listener starts.
    prime(&listeners).await;
    let start = Instant::now();
    for (_, receiver) in &tracks {
        receiver.touch(start);
    }
    for l in &mut listeners {
        l.start();
    }

    deadline.set(None);
    let mut reader_task = tokio::spawn(read_control(reader));

    let read_timeout = p.options.read_timeout;
    let mut report = driver::ticker(p.options.receiver_report_period);
    let mut keepalive = driver::ticker(p.options.udp_keepalive_period);
    let mut check = driver::ticker(p.options.udp_stream_check_period);
    let keepalive_method = if p.get_parameter_supported {
        Method::GetParameter
    } else {
        Method::Options
    };
    debug!(
        "UDP playback of {} tracks; keepalive with {}",
        tracks.len(),
        Into::<&str>::into(&keepalive_method)
    );
    let (reader, outcome) = loop {
        tokio::select! {
            _ = &mut p.terminate => {
                deadline.expire_now();
                let reader = driver::join_reader(&mut reader_task).await;
                break (reader, wrap!(ErrorInt::Terminated));
            },
            _ = report.tick() => {
                let now = Instant::now();
                for l in listeners.iter().filter(|l| l.stream_type == StreamType::Rtcp) {
                    let rr = l.receiver.report(now);
                    if let Err(e) = l.write(&rr).await {
                        warn!("unable to send receiver report for track {}: {e}", l.track_id);
                    }
                }
            },
            _ = keepalive.tick() => {
                let req = Request::builder(keepalive_method.clone(), rtsp_types::Version::V1_0)
                    .request_uri(p.url.clone())
                    .build(bytes::Bytes::new());
                if let Err(e) = writer.send_request(req).await {
                    deadline.expire_now();
                    let reader = driver::join_reader(&mut reader_task).await;
                    break (reader, e);
                }
            },
            _ = check.tick() => {
                let now = Instant::now();
                let stalled = tracks
                    .iter()
                    .enumerate()
                    .map(|(i, (_, receiver))| (i, now.saturating_duration_since(receiver.last_frame())))
                    .find(|&(_, idle)| idle >= read_timeout);
                if let Some((track_id, idle)) = stalled {
                    warn!("no packets on track {track_id} for {idle:?}");
                    deadline.expire_now();
                    let reader = driver::join_reader(&mut reader_task).await;
                    break (reader, wrap!(ErrorInt::Stall {
                        conn_ctx: *writer.ctx(),
                        track_id,
                        idle,
                    }));
                }
            },
            r = &mut reader_task => break driver::reader_finished(r),
        }
    };

    for l in &mut listeners {
        l.stop().await;
    }
    p.finish(outcome, reader, writer, deadline)
}

/// Writes each listener's priming packet to its peer, opening a return path
/// through NAT. Failures are only logged.
async fn prime(listeners: &[UdpListener]) {
    for l in listeners {
        debug_assert!(l.task.is_none());
        let priming: &[u8] = match l.stream_type {
            StreamType::Rtp => &PRIMING_RTP,
            StreamType::Rtcp => &PRIMING_RTCP,
        };
        if let Err(e) = l.write(priming).await {
            debug!(
                "unable to prime track {} {} path to {}: {e}",
                l.track_id, l.stream_type, l.peer
            );
        }
    }
}

/// Reads the control connection until a read fails. Keepalive responses are
/// discarded unexamined.
async fn read_control(mut reader: RtspReader) -> (RtspReader, Error) {
    loop {
        let msg = match reader.next().await {
            Ok(m) => m,
            Err(e) => return (reader, e),
        };
        match msg.msg {
            Message::Response(r) => trace!(
                "discarding {} keepalive response CSeq={:?}",
                r.status(),
                super::parse::get_cseq(&r),
            ),
            Message::Data(d) => debug!(
                "ignoring interleaved data on channel {} during UDP playback",
                d.channel_id()
            ),
            Message::Request(r) => warn!(
                "ignoring {} request from server during playback",
                Into::<&str>::into(r.method()),
            ),
        }
    }
}
