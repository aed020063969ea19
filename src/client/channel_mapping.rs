// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Track RTSP interleaved channel->track assignments.

use std::num::NonZeroU8;

use crate::StreamType;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ChannelMapping {
    pub(crate) track_id: usize,
    pub(crate) stream_type: StreamType,
}

/// Mapping of the 256 possible RTSP interleaved channels to track ids and
/// RTP/RTCP.
///
/// Even channel ids always carry RTP and their odd successors RTCP for the
/// same track, as `interleaved=n` implies `n+1` per
/// [RFC 2326 section 10.12](https://tools.ietf.org/html/rfc2326#section-10.12).
/// That limits a session to 128 interleaved tracks and 255 track ids, which
/// keeps the whole table small with a cheap lookup on every data frame.
#[derive(Clone, Default)]
pub(crate) struct ChannelMappings(smallvec::SmallVec<[Option<NonZeroU8>; 16]>);

impl ChannelMappings {
    /// Returns the next unassigned even channel id, or `None` if all assigned.
    pub(crate) fn next_unassigned(&self) -> Option<u8> {
        if let Some(i) = self.0.iter().position(Option::is_none) {
            return Some((i as u8) << 1);
        }
        if self.0.len() < 128 {
            return Some((self.0.len() as u8) << 1);
        }
        None
    }

    /// Assigns an even channel id (to RTP) and its odd successor (to RTCP) or errors.
    pub(crate) fn assign(&mut self, channel_id: u8, track_id: usize) -> Result<(), String> {
        if (channel_id & 1) != 0 {
            return Err(format!("Can't assign odd channel id {channel_id}"));
        }
        if track_id >= 255 {
            return Err(format!(
                "Can't assign channel to track id {track_id} because it's >= 255"
            ));
        }
        let i = usize::from(channel_id >> 1);
        if i >= self.0.len() {
            self.0.resize(i + 1, None);
        }
        let c = &mut self.0[i];
        if let Some(c) = c {
            return Err(format!(
                "Channel id {} is already assigned to track {}; won't reassign to track {}",
                channel_id,
                c.get() - 1,
                track_id
            ));
        }
        *c = Some(NonZeroU8::new((track_id + 1) as u8).expect("[0, 255) + 1 is non-zero"));
        Ok(())
    }

    /// Looks up a channel id's mapping.
    pub(crate) fn lookup(&self, channel_id: u8) -> Option<ChannelMapping> {
        let i = usize::from(channel_id >> 1);
        if i >= self.0.len() {
            return None;
        }
        self.0[i].map(|c| ChannelMapping {
            track_id: usize::from(c.get() - 1),
            stream_type: match (channel_id & 1) != 0 {
                false => StreamType::Rtp,
                true => StreamType::Rtcp,
            },
        })
    }
}

impl std::fmt::Debug for ChannelMappings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.0.iter().enumerate().filter_map(|(i, v)| {
                v.map(|v| (format!("{}-{}", i << 1, (i << 1) + 1), v.get() - 1))
            }))
            .finish()
    }
}
