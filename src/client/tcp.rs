// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Playback with RTP and RTCP interleaved on the RTSP connection.
//!
//! Every read must complete within the read timeout of the one before, so a
//! silent stream ends at most `read_timeout` after its last message.

use std::sync::Arc;

use log::{debug, trace, warn};
use rtsp_types::Message;
use tokio::time::Instant;

use super::channel_mapping::ChannelMappings;
use super::driver::{self, Playback};
use super::{Frame, FrameCallback, RequestWriter, RtspConnection};
use crate::error::ErrorInt;
use crate::rtcp::RtcpReceiver;
use crate::tokio::RtspReader;
use crate::{Error, PacketContext, PacketContextInner};

pub(super) struct TcpTrack {
    pub(super) rtcp_channel_id: u8,
    pub(super) receiver: Arc<RtcpReceiver>,
}

/// Runs TCP playback until termination or failure. Returns the connection for
/// `TEARDOWN` unless the reader was lost.
pub(super) async fn run(
    mut p: Playback,
    conn: RtspConnection,
    channels: ChannelMappings,
    tracks: Vec<TcpTrack>,
) -> Option<RtspConnection> {
    let RtspConnection {
        mut reader,
        mut writer,
        deadline,
    } = conn;
    deadline.set(None);
    reader.set_idle_timeout(Some(p.options.read_timeout));
    let receivers = tracks.iter().map(|t| t.receiver.clone()).collect();
    let mut reader_task = tokio::spawn(read_interleaved(
        reader,
        channels,
        receivers,
        p.callback.clone(),
    ));
    let mut report = driver::ticker(p.options.receiver_report_period);
    let (reader, outcome) = loop {
        tokio::select! {
            _ = &mut p.terminate => {
                deadline.expire_now();
                let reader = driver::join_reader(&mut reader_task).await;
                break (reader, wrap!(ErrorInt::Terminated));
            },
            _ = report.tick() => {
                if let Err(e) = send_reports(&mut writer, &tracks).await {
                    deadline.expire_now();
                    let reader = driver::join_reader(&mut reader_task).await;
                    break (reader, e);
                }
            },
            r = &mut reader_task => break driver::reader_finished(r),
        }
    };
    p.finish(outcome, reader, writer, deadline)
}

async fn send_reports(writer: &mut RequestWriter, tracks: &[TcpTrack]) -> Result<(), Error> {
    let now = Instant::now();
    for t in tracks {
        let rr = t.receiver.report(now);
        trace!("sending {}-byte receiver report on channel {}", rr.len(), t.rtcp_channel_id);
        writer.send_data(t.rtcp_channel_id, rr).await?;
    }
    Ok(())
}

/// Reads interleaved frames until a read fails, feeding each to its track's
/// receiver and then to the callback.
async fn read_interleaved(
    mut reader: RtspReader,
    channels: ChannelMappings,
    receivers: Vec<Arc<RtcpReceiver>>,
    callback: FrameCallback,
) -> (RtspReader, Error) {
    loop {
        let msg = match reader.next().await {
            Ok(m) => m,
            Err(e) => return (reader, e),
        };
        match msg.msg {
            Message::Data(data) => {
                let channel_id = data.channel_id();
                let m = match channels.lookup(channel_id) {
                    Some(m) => m,
                    None => {
                        let e = wrap!(ErrorInt::RtspUnassignedChannelError {
                            conn_ctx: *reader.ctx(),
                            msg_ctx: msg.ctx,
                            channel_id,
                            data: data.into_body(),
                        });
                        return (reader, e);
                    }
                };
                let payload = data.into_body();
                receivers[m.track_id].process_frame(Instant::now(), m.stream_type, &payload);
                callback(Frame {
                    track_id: m.track_id,
                    stream_type: m.stream_type,
                    ctx: PacketContext(PacketContextInner::Tcp { msg_ctx: msg.ctx }),
                    payload: &payload,
                });
            }
            Message::Response(r) => debug!(
                "discarding {} response CSeq={:?} during playback",
                r.status(),
                super::parse::get_cseq(&r),
            ),
            Message::Request(r) => warn!(
                "ignoring {} request from server during playback",
                Into::<&str>::into(r.method()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rtsp_types::{Data, Method, Request, Response};
    use std::sync::Mutex;
    use std::time::Duration;
    use test_case::test_case;

    use super::*;
    use crate::client::{Phase, Session, SessionOptions, SetupOptions, Transport};
    use crate::testutil::{init_logging, response, FakeServer};
    use crate::{ErrorKind, StreamType};

    fn handler(req: &Request<Bytes>) -> Option<Response<Bytes>> {
        Some(match req.method() {
            Method::Setup => response(
                b"RTSP/1.0 200 OK\r\n\
                  Session: 1234;timeout=60\r\n\
                  Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
            ),
            _ => response(b"RTSP/1.0 200 OK\r\n\r\n"),
        })
    }

    async fn playing(server: &FakeServer, options: SessionOptions) -> Session {
        let mut session = Session::connect(server.url(), options.transport(Transport::Tcp))
            .await
            .unwrap();
        session.setup("*", SetupOptions::default()).await.unwrap();
        session.play().await.unwrap();
        session
    }

    fn rtp(seq: u16) -> Bytes {
        crate::rtp::PacketBuilder {
            sequence_number: seq,
            timestamp: u32::from(seq) * 3000,
            payload_type: 96,
            ssrc: 0x4cacc3d1,
            mark: true,
        }
        .build(*b"frame")
        .unwrap()
    }

    /// Frames reach the callback tagged by channel; explicit termination
    /// yields `Terminated` and the connection survives for `TEARDOWN`.
    #[tokio::test]
    async fn frames_then_terminate() {
        init_logging();
        let mut server = FakeServer::start(handler).await;
        let mut session = playing(&server, SessionOptions::default()).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let completion = session.on_frame(move |f| {
            tx.send((f.track_id, f.stream_type, Bytes::copy_from_slice(f.payload)))
                .unwrap();
        });
        assert_eq!(session.phase(), Phase::Playing);
        server.send(Message::Data(Data::new(0, rtp(1))));
        server.send(Message::Data(Data::new(
            1,
            Bytes::from_static(b"\x80\xc8\x00\x06\x4c\xac\xc3\xd1\xe4\x36\x2f\x99\xcc\xcc\xcc\xcc\x85\x2e\xf8\x07\x00\x00\x00\x01\x00\x00\x00\x05"),
        )));
        let (track_id, stream_type, payload) = rx.recv().await.unwrap();
        assert_eq!((track_id, stream_type), (0, StreamType::Rtp));
        assert_eq!(payload, rtp(1));
        let (_, stream_type, _) = rx.recv().await.unwrap();
        assert_eq!(stream_type, StreamType::Rtcp);
        let stats = session.track_stats(0).unwrap();
        assert_eq!(stats.rtp_packets, 1);
        assert_eq!(stats.rtcp_packets, 1);
        assert_eq!(stats.sender_ssrc, Some(0x4cacc3d1));

        assert_eq!(server.next_request().await.method(), &Method::Setup);
        assert_eq!(server.next_request().await.method(), &Method::Play);
        session.close().await;
        assert_eq!(completion.await.unwrap_err().kind(), ErrorKind::Terminated);
        assert_eq!(server.next_request().await.method(), &Method::Teardown);
    }

    /// Receiver reports go out as interleaved data on the RTCP channel.
    #[tokio::test]
    async fn receiver_reports() {
        init_logging();
        let mut server = FakeServer::start(handler).await;
        let mut session = playing(
            &server,
            SessionOptions::default().receiver_report_period(Duration::from_millis(50)),
        )
        .await;
        let _completion = session.on_frame(|_| {});
        server.send(Message::Data(Data::new(0, rtp(1))));
        for _ in 0..2 {
            let (channel_id, body) = server.next_data().await;
            assert_eq!(channel_id, 1);
            assert_eq!(body[1], 201);
        }
        session.close().await;
    }

    /// A silent stream ends one read timeout after playback starts.
    #[test_case(Duration::from_millis(300) ; "short")]
    #[test_case(Duration::from_millis(1500) ; "over a second")]
    #[tokio::test]
    async fn silent_stream_times_out(read_timeout: Duration) {
        init_logging();
        let server = FakeServer::start(handler).await;
        let mut session =
            playing(&server, SessionOptions::default().read_timeout(read_timeout)).await;
        let start = std::time::Instant::now();
        let e = tokio::time::timeout(read_timeout * 3, session.on_frame(|_| {}))
            .await
            .expect("playback ends")
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Transport);
        assert!(e.to_string().contains("read deadline expired"), "{e}");
        assert!(start.elapsed() >= read_timeout);
    }

    /// Frames that stop arriving end playback one read timeout after the last.
    #[tokio::test]
    async fn stream_going_silent_times_out() {
        init_logging();
        let server = FakeServer::start(handler).await;
        let read_timeout = Duration::from_millis(1500);
        let mut session =
            playing(&server, SessionOptions::default().read_timeout(read_timeout)).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let completion = session.on_frame(move |_| {
            let _ = tx.send(std::time::Instant::now());
        });
        for seq in 0..10 {
            server.send(Message::Data(Data::new(0, rtp(seq))));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let e = tokio::time::timeout(Duration::from_secs(5), completion)
            .await
            .expect("playback ends")
            .unwrap_err();
        let mut last = None;
        while let Ok(t) = rx.try_recv() {
            last = Some(t);
        }
        let last = last.unwrap();
        assert_eq!(e.kind(), ErrorKind::Transport);
        assert!(last.elapsed() >= read_timeout);
        assert!(last.elapsed() < read_timeout + Duration::from_secs(1));
    }

    /// Steady traffic keeps playback alive, even with a sub-second read timeout.
    #[test_case(Duration::from_millis(500) ; "short")]
    #[test_case(Duration::from_millis(1500) ; "over a second")]
    #[tokio::test]
    async fn flowing_stream_stays_alive(read_timeout: Duration) {
        init_logging();
        let server = FakeServer::start(handler).await;
        let mut session =
            playing(&server, SessionOptions::default().read_timeout(read_timeout)).await;
        let count = Arc::new(Mutex::new(0));
        let count_clone = count.clone();
        let completion = session.on_frame(move |_| *count_clone.lock().unwrap() += 1);
        for seq in 0..50 {
            server.send(Message::Data(Data::new(0, rtp(seq))));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(*count.lock().unwrap(), 50);
        session.close().await;
        assert_eq!(completion.await.unwrap_err().kind(), ErrorKind::Terminated);
    }

    /// Once termination is reported, the reader task is gone: data sent
    /// afterward stays on the connection for its owner rather than reaching
    /// the callback.
    #[tokio::test]
    async fn reader_exits_before_completion() {
        init_logging();
        let server = FakeServer::start(handler).await;
        let mut session = playing(&server, SessionOptions::default()).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let completion = session.on_frame(move |f| {
            let _ = tx.send(Bytes::copy_from_slice(f.payload));
        });
        server.send(Message::Data(Data::new(0, rtp(1))));
        assert_eq!(rx.recv().await.unwrap(), rtp(1));

        let driver = session.driver.take().unwrap();
        driver.terminate.send(()).unwrap();
        assert_eq!(completion.await.unwrap_err().kind(), ErrorKind::Terminated);
        server.send(Message::Data(Data::new(0, rtp(2))));
        let mut conn = driver.task.await.unwrap().expect("connection reclaimed");
        match conn.reader.next().await.unwrap().msg {
            Message::Data(d) => assert_eq!(d.into_body(), rtp(2)),
            o => panic!("unexpected {o:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unassigned_channel() {
        init_logging();
        let server = FakeServer::start(handler).await;
        let mut session = playing(&server, SessionOptions::default()).await;
        let completion = session.on_frame(|_| {});
        server.send(Message::Data(Data::new(4, rtp(1))));
        let e = completion.await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Protocol);
        assert!(e.to_string().contains("unassigned channel 4"), "{e}");
    }

    #[tokio::test]
    async fn server_hangs_up() {
        init_logging();
        let server = FakeServer::start(handler).await;
        let mut session = playing(&server, SessionOptions::default()).await;
        let completion = session.on_frame(|_| {});
        server.hang_up();
        assert_eq!(completion.await.unwrap_err().kind(), ErrorKind::Transport);
        session.close().await;
    }
}
