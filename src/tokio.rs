// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! tokio-based RTSP [`Connection`], splittable into a reading and a writing half.
//!
//! While streaming, the two halves belong to different tasks: the reader task
//! owns the [`RtspReader`], the driver's event loop owns the [`RtspWriter`] and
//! the [`ReadDeadline`] which bounds the reader's next read.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use rtsp_types::{Data, Message};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use url::Host;

use crate::{Error, ErrorInt, RtspMessageContext};

use super::{ConnectionContext, ReceivedMessage, WallTime};

/// An RTSP connection: both halves plus the read deadline.
pub(crate) struct Connection {
    pub(crate) reader: RtspReader,
    pub(crate) writer: RtspWriter,
    pub(crate) deadline: ReadDeadline,
}

impl Connection {
    pub(crate) async fn connect(
        host: Host<&str>,
        port: u16,
        write_timeout: Duration,
    ) -> Result<Self, std::io::Error> {
        let stream = match host {
            Host::Domain(h) => TcpStream::connect((h, port)).await,
            Host::Ipv4(h) => TcpStream::connect((h, port)).await,
            Host::Ipv6(h) => TcpStream::connect((h, port)).await,
        }?;
        Self::from_stream(stream, write_timeout)
    }

    pub(crate) fn from_stream(
        stream: TcpStream,
        write_timeout: Duration,
    ) -> Result<Self, std::io::Error> {
        let ctx = ConnectionContext {
            local_addr: stream.local_addr()?,
            peer_addr: stream.peer_addr()?,
            established_wall: WallTime::now(),
        };
        let (read_half, write_half) = stream.into_split();
        let (deadline_tx, deadline_rx) = watch::channel(None);
        Ok(Self {
            reader: RtspReader {
                stream: FramedRead::new(read_half, Codec { ctx, read_pos: 0 }),
                deadline: deadline_rx,
                idle_timeout: None,
            },
            writer: RtspWriter {
                sink: FramedWrite::new(write_half, Codec { ctx, read_pos: 0 }),
                write_timeout,
            },
            deadline: ReadDeadline(deadline_tx),
        })
    }

    pub(crate) fn ctx(&self) -> &ConnectionContext {
        self.writer.ctx()
    }
}

/// Settable deadline for the [`RtspReader`]'s reads.
///
/// Changes take effect immediately, even on a read already in progress.
pub(crate) struct ReadDeadline(watch::Sender<Option<Instant>>);

impl ReadDeadline {
    /// Sets the deadline; `None` disables it.
    pub(crate) fn set(&self, deadline: Option<Instant>) {
        self.0.send_replace(deadline);
    }

    /// Fails the reader's current (or next) read.
    pub(crate) fn expire_now(&self) {
        self.set(Some(Instant::now()));
    }
}

/// The reading half of a [`Connection`].
pub(crate) struct RtspReader {
    stream: FramedRead<OwnedReadHalf, Codec>,
    deadline: watch::Receiver<Option<Instant>>,

    /// If set, each read also fails when no message arrives this long after it starts.
    idle_timeout: Option<Duration>,
}

impl RtspReader {
    pub(crate) fn ctx(&self) -> &ConnectionContext {
        &self.stream.decoder().ctx
    }

    pub(crate) fn set_idle_timeout(&mut self, idle_timeout: Option<Duration>) {
        self.idle_timeout = idle_timeout;
    }

    fn eof_ctx(stream: &FramedRead<OwnedReadHalf, Codec>) -> RtspMessageContext {
        RtspMessageContext {
            pos: stream.decoder().read_pos + crate::to_u64(stream.read_buffer().remaining()),
            received_wall: WallTime::now(),
            received: std::time::Instant::now(),
        }
    }

    /// Reads the next message, failing if the read deadline or the idle
    /// timeout passes first.
    ///
    /// End of stream is reported as an `UnexpectedEof` read error.
    pub(crate) async fn next(&mut self) -> Result<ReceivedMessage, Error> {
        let Self {
            stream,
            deadline: deadline_rx,
            idle_timeout,
        } = self;
        let idle_deadline = (*idle_timeout).map(|t| Instant::now() + t);
        let mut watching = true;
        loop {
            let deadline = match (*deadline_rx.borrow_and_update(), idle_deadline) {
                (Some(d), Some(i)) => Some(d.min(i)),
                (d, i) => d.or(i),
            };
            tokio::select! {
                msg = stream.next() => {
                    return match msg {
                        Some(Ok(msg)) => Ok(msg),
                        Some(Err(CodecError::IoError(source))) => Err(wrap!(ErrorInt::RtspReadError {
                            conn_ctx: stream.decoder().ctx,
                            msg_ctx: Self::eof_ctx(stream),
                            source,
                        })),
                        Some(Err(CodecError::ParseError { description, pos })) => {
                            Err(wrap!(ErrorInt::RtspFramingError {
                                conn_ctx: stream.decoder().ctx,
                                msg_ctx: RtspMessageContext {
                                    pos,
                                    received_wall: WallTime::now(),
                                    received: std::time::Instant::now(),
                                },
                                description,
                            }))
                        }
                        None => Err(wrap!(ErrorInt::RtspReadError {
                            conn_ctx: stream.decoder().ctx,
                            msg_ctx: Self::eof_ctx(stream),
                            source: std::io::ErrorKind::UnexpectedEof.into(),
                        })),
                    };
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() =>
                {
                    return Err(wrap!(ErrorInt::RtspReadError {
                        conn_ctx: stream.decoder().ctx,
                        msg_ctx: Self::eof_ctx(stream),
                        source: std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "read deadline expired",
                        ),
                    }));
                },
                r = deadline_rx.changed(), if watching => {
                    // The sender is gone; the last deadline stays in force.
                    if r.is_err() {
                        watching = false;
                    }
                },
            }
        }
    }
}

/// The writing half of a [`Connection`]. Every write is bounded by the write timeout.
pub(crate) struct RtspWriter {
    sink: FramedWrite<OwnedWriteHalf, Codec>,
    write_timeout: Duration,
}

impl RtspWriter {
    pub(crate) fn ctx(&self) -> &ConnectionContext {
        &self.sink.encoder().ctx
    }

    pub(crate) async fn send(&mut self, msg: Message<Bytes>) -> Result<(), Error> {
        let source = match tokio::time::timeout(self.write_timeout, self.sink.send(msg)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(CodecError::IoError(source))) => source,
            Ok(Err(CodecError::ParseError { .. })) => unreachable!(),
            Err(_) => std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout"),
        };
        bail!(ErrorInt::WriteError {
            conn_ctx: *self.ctx(),
            source,
        })
    }

    /// Writes an interleaved data frame.
    pub(crate) async fn send_data(&mut self, channel_id: u8, body: Bytes) -> Result<(), Error> {
        self.send(Message::Data(Data::new(channel_id, body))).await
    }
}

/// Encodes and decodes RTSP messages.
struct Codec {
    ctx: ConnectionContext,

    /// Number of bytes read and processed (drained from the input buffer).
    read_pos: u64,
}

/// An intermediate error type that exists because [`FramedRead`] expects the
/// codec's error type to implement `From<std::io::Error>`, and [`Error`]
/// takes additional context.
#[derive(Debug)]
enum CodecError {
    IoError(std::io::Error),
    ParseError { description: String, pos: u64 },
}

impl std::convert::From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::IoError(e)
    }
}

impl Codec {
    fn parse_msg(&self, src: &mut BytesMut) -> Result<Option<(usize, Message<Bytes>)>, CodecError> {
        if !src.is_empty() && src[0] == b'$' {
            // Fast path for interleaved data; skips rtsp-types' parse and body copy.
            if src.len() < 4 {
                return Ok(None);
            }
            let channel_id = src[1];
            let len = 4 + usize::from(u16::from_be_bytes([src[2], src[3]]));
            if src.len() < len {
                src.reserve(len - src.len());
                return Ok(None);
            }
            let mut msg = src.split_to(len);
            msg.advance(4);
            return Ok(Some((len, Message::Data(Data::new(channel_id, msg.freeze())))));
        }

        let (msg, len): (Message<&[u8]>, _) = match Message::parse(src) {
            Ok((m, l)) => (m, l),
            Err(rtsp_types::ParseError::Error) => {
                return Err(CodecError::ParseError {
                    description: format!(
                        "Invalid RTSP message; buffered:\n{:#?}",
                        crate::hex::LimitedHex::new(&src[..], 128),
                    ),
                    pos: self.read_pos,
                });
            }
            Err(rtsp_types::ParseError::Incomplete(_)) => return Ok(None),
        };

        // Detach the message from `src` before splitting it, then reattach the
        // body as a `Bytes` slice of the split-off buffer.
        let msg = match msg {
            Message::Request(msg) => {
                let body_range = crate::as_range(src, msg.body());
                let msg = msg.replace_body(rtsp_types::Empty);
                let mut raw_msg = src.split_to(len);
                let body = match body_range {
                    Some(r) => {
                        raw_msg.advance(r.start);
                        raw_msg.truncate(r.len());
                        raw_msg.freeze()
                    }
                    None => Bytes::new(),
                };
                Message::Request(msg.replace_body(body))
            }
            Message::Response(msg) => {
                let body_range = crate::as_range(src, msg.body());
                let msg = msg.replace_body(rtsp_types::Empty);
                let mut raw_msg = src.split_to(len);
                let body = match body_range {
                    Some(r) => {
                        raw_msg.advance(r.start);
                        raw_msg.truncate(r.len());
                        raw_msg.freeze()
                    }
                    None => Bytes::new(),
                };
                Message::Response(msg.replace_body(body))
            }
            Message::Data(_) => unreachable!(),
        };
        Ok(Some((len, msg)))
    }
}

impl tokio_util::codec::Decoder for Codec {
    type Item = ReceivedMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Skip whitespace as `rtsp-types` does, so the `$` check sees
        // interleaved data that follows a stray CRLF. Skipped bytes count
        // toward the position even if the message after them is incomplete.
        while src.starts_with(b"\r\n") {
            src.advance(2);
            self.read_pos += 2;
        }
        let (len, msg) = match self.parse_msg(src)? {
            None => return Ok(None),
            Some(p) => p,
        };
        let msg = ReceivedMessage {
            msg,
            ctx: RtspMessageContext {
                pos: self.read_pos,
                received_wall: WallTime::now(),
                received: std::time::Instant::now(),
            },
        };
        self.read_pos += crate::to_u64(len);
        Ok(Some(msg))
    }
}

impl tokio_util::codec::Encoder<Message<Bytes>> for Codec {
    type Error = CodecError;

    fn encode(&mut self, item: Message<Bytes>, mut dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write(&mut (&mut dst).writer())
            .expect("BufMut Writer is infallible");
        Ok(())
    }
}

/// tokio-specific version of [`crate::UdpPair`].
pub(crate) struct UdpPair {
    pub(crate) rtp_port: u16,
    pub(crate) rtp_socket: UdpSocket,
    pub(crate) rtcp_socket: UdpSocket,
}

impl UdpPair {
    pub(crate) fn for_ip(ip_addr: std::net::IpAddr) -> Result<Self, std::io::Error> {
        let inner = crate::UdpPair::for_ip(ip_addr)?;
        inner.rtp_socket.set_nonblocking(true)?;
        inner.rtcp_socket.set_nonblocking(true)?;
        Ok(Self {
            rtp_port: inner.rtp_port,
            rtp_socket: UdpSocket::from_std(inner.rtp_socket)?,
            rtcp_socket: UdpSocket::from_std(inner.rtcp_socket)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::codec::Decoder;

    use super::*;

    fn codec() -> Codec {
        Codec {
            ctx: ConnectionContext::dummy(),
            read_pos: 0,
        }
    }

    #[test]
    fn crlf_data() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&b"\r\n$\x00\x00\x04asdfrest"[..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..], b"rest");
        assert_eq!(msg.ctx.pos, 2);
        assert_eq!(codec.read_pos, 10);
        match msg.msg {
            Message::Data(d) => {
                assert_eq!(d.channel_id(), 0);
                assert_eq!(&d.into_body()[..], b"asdf");
            }
            o => panic!("unexpected {o:?}"),
        }
    }

    #[test]
    fn partial_data() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&b"$\x01\x00\x04as"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"df");
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(buf.is_empty());
    }

    /// A stray CRLF before an incomplete message still counts toward later positions.
    #[test]
    fn crlf_before_partial_data() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&b"\r\n$\x00\x00\x04as"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"df$\x01\x00\x01x");
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.ctx.pos, 2);
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.ctx.pos, 10);
        assert_eq!(codec.read_pos, 15);
    }

    #[test]
    fn response_with_body() {
        let mut codec = codec();
        let mut buf = BytesMut::from(
            &b"RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Length: 3\r\n\r\nabc$\x00\x00\x00"[..],
        );
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        match msg.msg {
            Message::Response(r) => assert_eq!(&r.body()[..], b"abc"),
            o => panic!("unexpected {o:?}"),
        }
        let data = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(data.msg, Message::Data(_)));
    }

    /// The idle timeout restarts with every read, so steady traffic never trips it.
    #[tokio::test]
    async fn idle_timeout_restarts_per_read() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (mut server, _) = server.unwrap();
        let conn = Connection::from_stream(client.unwrap(), Duration::from_secs(1)).unwrap();
        let Connection {
            mut reader,
            deadline: _deadline,
            ..
        } = conn;
        reader.set_idle_timeout(Some(Duration::from_millis(200)));
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for _ in 0..10 {
                server.write_all(b"$\x00\x00\x01x").await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            server
        });
        for _ in 0..10 {
            reader.next().await.unwrap();
        }
        let _server = writer.await.unwrap();
        let start = std::time::Instant::now();
        let e = reader.next().await.unwrap_err();
        assert!(e.to_string().contains("read deadline expired"), "{e}");
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    /// A deadline change wakes a read that's already in progress.
    #[tokio::test]
    async fn deadline_expires_pending_read() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let _server = server.unwrap();
        let conn = Connection::from_stream(client.unwrap(), Duration::from_secs(1)).unwrap();
        let Connection {
            mut reader,
            deadline,
            ..
        } = conn;
        let read = tokio::spawn(async move { reader.next().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!read.is_finished());
        deadline.expire_now();
        let e = read.await.unwrap().unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::Transport);
        assert!(e.to_string().contains("read deadline expired"), "{e}");
    }
}
