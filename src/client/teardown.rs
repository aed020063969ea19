// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use bytes::Bytes;
use rtsp_types::{Method, Request};
use url::Url;

use super::RtspConnection;

/// Sends a single `TEARDOWN` on the existing connection, then drops it.
///
/// The response isn't awaited: the server frees the session on its own once
/// the connection closes or the session times out, so failure here costs
/// nothing but a log line.
pub(super) async fn teardown(mut conn: RtspConnection, url: &Url) {
    let session_id = conn.writer.session_id.clone().unwrap_or_default();
    let req = Request::builder(Method::Teardown, rtsp_types::Version::V1_0)
        .request_uri(url.clone())
        .build(Bytes::new());
    match conn.writer.send_request(req).await {
        Ok(cseq) => log::debug!("TEARDOWN {} sent with CSeq={}", &*session_id, cseq),
        Err(e) => log::debug!("TEARDOWN {} failed: {}", &*session_id, e),
    }
}
