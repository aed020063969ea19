// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Minimal RTP header access as described in
//! [RFC 3550 section 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1).
//!
//! The playback runtime never depacketizes; it only needs the fields that feed
//! reception statistics.

use bytes::Bytes;

/// The minimum length of an RTP header (no CSRCs or extensions).
pub(crate) const MIN_HEADER_LEN: usize = 12;

/// A validated view of an RTP packet's fixed header.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |            contributing source (CSRC) identifiers             |
/// |                             ....                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Copy, Clone)]
pub(crate) struct HeaderRef<'a>(&'a [u8]);

impl<'a> HeaderRef<'a> {
    /// Validates the fixed header. CSRCs, extensions and padding aren't
    /// interpreted.
    pub(crate) fn parse(data: &'a [u8]) -> Result<Self, &'static str> {
        if data.len() > usize::from(u16::MAX) {
            return Err("too long");
        }
        if data.len() < MIN_HEADER_LEN {
            return Err("too short");
        }
        if (data[0] & 0b1100_0000) != 2 << 6 {
            return Err("must be version 2");
        }
        let csrc_count = usize::from(data[0] & 0b0000_1111);
        if data.len() < MIN_HEADER_LEN + 4 * csrc_count {
            return Err("CSRCs extend past end of packet");
        }
        Ok(Self(data))
    }

    #[inline]
    pub(crate) fn payload_type(&self) -> u8 {
        self.0[1] & 0b0111_1111
    }

    #[inline]
    pub(crate) fn sequence_number(&self) -> u16 {
        u16::from_be_bytes([self.0[2], self.0[3]])
    }

    #[inline]
    pub(crate) fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }

    #[inline]
    pub(crate) fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.0[8], self.0[9], self.0[10], self.0[11]])
    }
}

/// Builds simple RTP packets. Testing API; exposed for benchmarks.
#[doc(hidden)]
pub struct PacketBuilder {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub payload_type: u8,
    pub ssrc: u32,
    pub mark: bool,
}

impl PacketBuilder {
    pub fn build<P: IntoIterator<Item = u8>>(self, payload: P) -> Result<Bytes, &'static str> {
        if self.payload_type >= 0x80 {
            return Err("payload type too large");
        }
        let data: Bytes = [
            2 << 6, // version=2, no padding, no extensions, no CSRCs.
            if self.mark { 0b1000_0000 } else { 0 } | self.payload_type,
        ]
        .into_iter()
        .chain(self.sequence_number.to_be_bytes())
        .chain(self.timestamp.to_be_bytes())
        .chain(self.ssrc.to_be_bytes())
        .chain(payload)
        .collect();
        if data.len() > usize::from(u16::MAX) {
            return Err("payload too long");
        }
        Ok(data)
    }
}
