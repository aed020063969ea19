// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use rtsp_types::{Message, Request, Response};
use tokio::sync::mpsc;
use url::Url;

use crate::tokio::Connection;

pub(crate) fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(true)
        .try_init();
}

pub(crate) fn response(raw: &'static [u8]) -> Response<Bytes> {
    let (msg, len) = rtsp_types::Message::parse(raw).unwrap();
    assert_eq!(len, raw.len());
    match msg {
        rtsp_types::Message::Response(r) => r.map_body(|b| Bytes::from_static(b)),
        _ => panic!("unexpected message type"),
    }
}

enum Command {
    Send(Message<Bytes>),
    HangUp,
}

/// An RTSP server on localhost which serves a single connection.
///
/// Each request is recorded, then answered with whatever the handler returns
/// (with the request's `CSeq` copied in). Interleaved data from the client is
/// recorded too. Dropping the server closes the connection.
pub(crate) struct FakeServer {
    addr: SocketAddr,
    requests: mpsc::UnboundedReceiver<Request<Bytes>>,
    data: mpsc::UnboundedReceiver<(u8, Bytes)>,
    commands: mpsc::UnboundedSender<Command>,
}

impl FakeServer {
    pub(crate) async fn start<H>(mut handler: H) -> Self
    where
        H: FnMut(&Request<Bytes>) -> Option<Response<Bytes>> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (data_tx, data) = mpsc::unbounded_channel();
        let (commands, mut commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => return,
            };
            let Connection {
                mut reader,
                mut writer,
                ..
            } = Connection::from_stream(stream, Duration::from_secs(5)).unwrap();
            loop {
                tokio::select! {
                    msg = reader.next() => {
                        let msg = match msg {
                            Ok(m) => m.msg,
                            Err(_) => return,
                        };
                        match msg {
                            Message::Request(req) => {
                                let resp = handler(&req);
                                let cseq = req.header(&rtsp_types::headers::CSEQ).cloned();
                                let _ = requests_tx.send(req);
                                if let Some(mut resp) = resp {
                                    if let Some(cseq) = cseq {
                                        resp.insert_header(rtsp_types::headers::CSEQ, cseq);
                                    }
                                    if writer.send(Message::Response(resp)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Message::Data(d) => {
                                let _ = data_tx.send((d.channel_id(), d.into_body()));
                            }
                            Message::Response(_) => {}
                        }
                    },
                    cmd = commands_rx.recv() => match cmd {
                        Some(Command::Send(msg)) => {
                            if writer.send(msg).await.is_err() {
                                return;
                            }
                        }
                        Some(Command::HangUp) | None => return,
                    },
                }
            }
        });
        FakeServer {
            addr,
            requests,
            data,
            commands,
        }
    }

    pub(crate) fn url(&self) -> Url {
        Url::parse(&format!("rtsp://{}/", self.addr)).unwrap()
    }

    /// Returns the next request received, in order.
    pub(crate) async fn next_request(&mut self) -> Request<Bytes> {
        tokio::time::timeout(Duration::from_secs(5), self.requests.recv())
            .await
            .expect("request within 5 seconds")
            .expect("server still running")
    }

    /// Returns the next interleaved data frame received as `(channel_id, body)`.
    pub(crate) async fn next_data(&mut self) -> (u8, Bytes) {
        tokio::time::timeout(Duration::from_secs(5), self.data.recv())
            .await
            .expect("data within 5 seconds")
            .expect("server still running")
    }

    /// Sends `msg` to the client as soon as it's connected.
    pub(crate) fn send(&self, msg: Message<Bytes>) {
        let _ = self.commands.send(Command::Send(msg));
    }

    /// Closes the connection.
    pub(crate) fn hang_up(&self) {
        let _ = self.commands.send(Command::HangUp);
    }
}
