// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsing of the RTSP response headers the session cares about.

use bytes::Bytes;
use std::net::IpAddr;
use url::Url;

/// Joins a control URL to a base URL in a non-RFC-compliant but common way.
/// This matches what live555 and ffmpeg do.
pub(crate) fn join_control(base_url: &Url, control: &str) -> Result<Url, String> {
    if control == "*" || control.is_empty() {
        return Ok(base_url.clone());
    }
    if let Ok(absolute_url) = Url::parse(control) {
        return Ok(absolute_url);
    }

    Url::parse(&format!(
        "{}{}{}",
        base_url.as_str(),
        if base_url.as_str().ends_with('/') {
            ""
        } else {
            "/"
        },
        control
    ))
    .map_err(|e| format!("unable to join base url {base_url} with control url {control:?}: {e}"))
}

/// Returns the `CSeq` from an RTSP response as a `u32`, or `None` if missing/unparseable.
pub(crate) fn get_cseq(response: &rtsp_types::Response<Bytes>) -> Option<u32> {
    response
        .header(&rtsp_types::headers::CSEQ)
        .and_then(|cseq| u32::from_str_radix(cseq.as_str().trim(), 10).ok())
}

/// Returns true iff an `OPTIONS` response's `Public` header lists `GET_PARAMETER`.
pub(crate) fn supports_get_parameter(response: &rtsp_types::Response<Bytes>) -> bool {
    response
        .header(&rtsp_types::headers::PUBLIC)
        .map(|public| {
            public
                .as_str()
                .split(',')
                .any(|m| m.trim().eq_ignore_ascii_case("GET_PARAMETER"))
        })
        .unwrap_or(false)
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SessionHeader {
    pub(crate) id: Box<str>,
    pub(crate) timeout_sec: u32,
}

#[derive(Debug)]
pub(crate) struct SetupResponse {
    pub(crate) session: SessionHeader,
    pub(crate) channel_id: Option<u8>,
    pub(crate) source: Option<IpAddr>,
    pub(crate) server_port: Option<(u16, u16)>,
}

/// Parses a `SETUP` response's `Session` and `Transport` headers.
pub(crate) fn parse_setup(response: &rtsp_types::Response<Bytes>) -> Result<SetupResponse, String> {
    // https://datatracker.ietf.org/doc/html/rfc2326#section-12.37
    let session = response
        .header(&rtsp_types::headers::SESSION)
        .ok_or_else(|| "Missing Session header".to_string())?;
    let session = match session.as_str().split_once(';') {
        None => SessionHeader {
            id: session.as_str().trim().into(),
            timeout_sec: 60, // default
        },
        Some((id, timeout_str)) => {
            if let Some(v) = timeout_str.trim().strip_prefix("timeout=") {
                let timeout_sec =
                    u32::from_str_radix(v, 10).map_err(|_| format!("Unparseable timeout {v}"))?;
                SessionHeader {
                    id: id.trim().into(),
                    timeout_sec,
                }
            } else {
                return Err(format!("Unparseable Session header {:?}", session.as_str()));
            }
        }
    };
    if session.id.is_empty() {
        return Err("Empty session id".to_owned());
    }
    let transport = response
        .header(&rtsp_types::headers::TRANSPORT)
        .ok_or_else(|| "Missing Transport header".to_string())?;
    let mut channel_id = None;
    let mut source = None;
    let mut server_port = None;
    for part in transport.as_str().split(';').map(str::trim) {
        if let Some(interleaved) = part.strip_prefix("interleaved=") {
            let mut channels = interleaved.splitn(2, '-');
            let n = channels.next().expect("splitn returns at least one part");
            let n = u8::from_str_radix(n, 10).map_err(|_| format!("bad channel number {n}"))?;
            if let Some(m) = channels.next() {
                let m = u8::from_str_radix(m, 10)
                    .map_err(|_| format!("bad second channel number {m}"))?;
                if n.checked_add(1) != Some(m) {
                    return Err(format!("Expected adjacent channels; got {n}-{m}"));
                }
            }
            channel_id = Some(n);
        } else if let Some(s) = part.strip_prefix("source=") {
            source = Some(
                s.parse()
                    .map_err(|_| format!("Transport header has unparseable source {s:?}"))?,
            );
        } else if let Some(s) = part.strip_prefix("server_port=") {
            let mut ports = s.splitn(2, '-');
            let n = ports.next().expect("splitn returns at least one part");
            let n = u16::from_str_radix(n, 10)
                .map_err(|_| format!("bad port in Transport: {}", transport.as_str()))?;
            if let Some(m) = ports.next() {
                let m = u16::from_str_radix(m, 10).map_err(|_| format!("bad second port {m}"))?;
                server_port = Some((n, m))
            } else {
                // RFC 2326's grammar allows this, but it's unclear whether
                // RTCP shares the port or uses the next one.
                return Err("Transport header specifies a single server_port".to_owned());
            }
        }
    }
    Ok(SetupResponse {
        session,
        channel_id,
        source,
        server_port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::response;

    #[test]
    fn join() {
        let base = Url::parse("rtsp://192.168.5.206/h264Preview_01_main").unwrap();
        assert_eq!(
            join_control(&base, "trackID=1").unwrap().as_str(),
            "rtsp://192.168.5.206/h264Preview_01_main/trackID=1"
        );
        assert_eq!(join_control(&base, "*").unwrap(), base);
        assert_eq!(
            join_control(&base, "rtsp://192.168.5.206/other/track1")
                .unwrap()
                .as_str(),
            "rtsp://192.168.5.206/other/track1"
        );
    }

    #[test]
    fn public() {
        let with = response(
            b"RTSP/1.0 200 OK\r\n\
              CSeq: 1\r\n\
              Public: OPTIONS, DESCRIBE, SETUP, TEARDOWN, PLAY, GET_PARAMETER\r\n\r\n",
        );
        assert!(supports_get_parameter(&with));
        assert_eq!(get_cseq(&with), Some(1));
        let without = response(
            b"RTSP/1.0 200 OK\r\n\
              CSeq: 2\r\n\
              Public: OPTIONS, DESCRIBE, SETUP, TEARDOWN, PLAY, SET_PARAMETER\r\n\r\n",
        );
        assert!(!supports_get_parameter(&without));
        assert!(!supports_get_parameter(&response(
            b"RTSP/1.0 200 OK\r\nCSeq: 3\r\n\r\n"
        )));
    }

    #[test]
    fn setup_tcp() {
        let r = parse_setup(&response(
            b"RTSP/1.0 200 OK\r\n\
              CSeq: 3\r\n\
              Session: 708345999;timeout=60\r\n\
              Transport: RTP/AVP/TCP;unicast;interleaved=2-3;ssrc=4cacc3d1;mode=\"play\"\r\n\r\n",
        ))
        .unwrap();
        assert_eq!(
            r.session,
            SessionHeader {
                id: "708345999".into(),
                timeout_sec: 60
            }
        );
        assert_eq!(r.channel_id, Some(2));
        assert_eq!(r.server_port, None);
    }

    #[test]
    fn setup_udp() {
        let r = parse_setup(&response(
            b"RTSP/1.0 200 OK\r\n\
              CSeq: 3\r\n\
              Session: 12345678\r\n\
              Transport: RTP/AVP;unicast;client_port=5000-5001;server_port=6970-6971;\
              source=192.168.5.111\r\n\r\n",
        ))
        .unwrap();
        assert_eq!(r.session.timeout_sec, 60);
        assert_eq!(r.server_port, Some((6970, 6971)));
        assert_eq!(r.source, Some("192.168.5.111".parse().unwrap()));
        assert_eq!(r.channel_id, None);
    }

    #[test]
    fn setup_errors() {
        let e = parse_setup(&response(
            b"RTSP/1.0 200 OK\r\n\
              CSeq: 3\r\n\
              Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
        ))
        .unwrap_err();
        assert_eq!(e, "Missing Session header");
        let e = parse_setup(&response(
            b"RTSP/1.0 200 OK\r\n\
              CSeq: 3\r\n\
              Session: 1\r\n\
              Transport: RTP/AVP/TCP;unicast;interleaved=0-3\r\n\r\n",
        ))
        .unwrap_err();
        assert_eq!(e, "Expected adjacent channels; got 0-3");
        let e = parse_setup(&response(
            b"RTSP/1.0 200 OK\r\n\
              CSeq: 3\r\n\
              Session: 1\r\n\
              Transport: RTP/AVP;unicast;server_port=6970\r\n\r\n",
        ))
        .unwrap_err();
        assert_eq!(e, "Transport header specifies a single server_port");
    }
}
