// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-track reception statistics and receiver report generation, following
//! [RFC 3550 appendix A.3](https://datatracker.ietf.org/doc/html/rfc3550#appendix-A.3)
//! and [A.8](https://datatracker.ietf.org/doc/html/rfc3550#appendix-A.8).

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use log::trace;
use tokio::time::Instant;

use super::{ReceptionReport, TypedPacketRef};
use crate::StreamType;

/// Accumulates reception statistics for one track and produces receiver
/// reports from them.
///
/// Frames are fed in by the ingestion path (the TCP reader or a UDP socket's
/// listener task) while reports are pulled by the driver's event loop, so the
/// statistics sit behind a mutex. The last-frame time is a lock-free atomic so
/// the stall check never contends with ingestion.
#[derive(Debug)]
pub struct RtcpReceiver {
    receiver_ssrc: u32,
    clock_rate: Option<NonZeroU32>,
    epoch: Instant,

    /// Milliseconds since `epoch` at which the last frame was processed.
    last_frame_ms: AtomicU64,

    stats: Mutex<Stats>,
}

#[derive(Debug, Default)]
struct Stats {
    rtp_packets: u64,
    rtp_bytes: u64,
    rtcp_packets: u64,
    malformed: u64,

    seq: Option<SequenceState>,

    /// Interarrival jitter in RTP timestamp units, scaled by 16 as in RFC 3550 A.8.
    jitter_q4: u64,
    last_transit: Option<u32>,

    /// Middle 32 bits of the latest sender report's NTP timestamp, and when it arrived.
    last_sr: Option<(u32, Instant)>,
}

#[derive(Copy, Clone, Debug)]
struct SequenceState {
    ssrc: u32,
    base_seq: u16,
    max_seq: u16,

    /// Shifted count of sequence number wraparounds.
    cycles: u32,

    /// Packets received from this SSRC.
    received: u64,
    expected_prior: u64,
    received_prior: u64,
}

impl SequenceState {
    fn new(ssrc: u32, seq: u16) -> Self {
        Self {
            ssrc,
            base_seq: seq,
            max_seq: seq,
            cycles: 0,
            received: 0,
            expected_prior: 0,
            received_prior: 0,
        }
    }

    fn update(&mut self, seq: u16) {
        let delta = seq.wrapping_sub(self.max_seq);
        if delta != 0 && delta < 0x8000 {
            if seq < self.max_seq {
                self.cycles = self.cycles.wrapping_add(1 << 16);
            }
            self.max_seq = seq;
        }
        // Otherwise it's a duplicate or a late packet; it still counts as received.
        self.received += 1;
    }

    fn extended_max(&self) -> u32 {
        self.cycles | u32::from(self.max_seq)
    }

    fn expected(&self) -> u64 {
        u64::from(self.extended_max()) - u64::from(self.base_seq) + 1
    }

    fn cumulative_lost(&self) -> i64 {
        self.expected() as i64 - self.received as i64
    }

    /// Returns the fraction lost since the last call, in 1/256ths.
    fn take_fraction_lost(&mut self) -> u8 {
        let expected = self.expected();
        let expected_interval = expected.saturating_sub(self.expected_prior);
        let received_interval = self.received.saturating_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = self.received;
        let lost_interval = expected_interval as i64 - received_interval as i64;
        if expected_interval == 0 || lost_interval <= 0 {
            return 0;
        }
        ((lost_interval << 8) / expected_interval as i64).min(255) as u8
    }
}

/// A snapshot of a track's reception statistics.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub rtp_packets: u64,
    pub rtp_bytes: u64,
    pub rtcp_packets: u64,

    /// Frames which couldn't be parsed as RTP or RTCP.
    pub malformed: u64,

    /// The sender's SSRC, once an RTP packet has been seen.
    pub sender_ssrc: Option<u32>,
    pub extended_highest_seq: u32,
    pub cumulative_lost: i64,
}

impl RtcpReceiver {
    /// Creates a receiver reporting as `receiver_ssrc`.
    ///
    /// `clock_rate` enables interarrival jitter; without it jitter is reported
    /// as 0. `epoch` is the reference point for frame timestamps and is also
    /// the initial last-frame time.
    pub fn new(receiver_ssrc: u32, clock_rate: Option<NonZeroU32>, epoch: Instant) -> Self {
        Self {
            receiver_ssrc,
            clock_rate,
            epoch,
            last_frame_ms: AtomicU64::new(0),
            stats: Mutex::new(Stats::default()),
        }
    }

    /// Updates statistics from a received frame and records `timestamp` as the
    /// last-received-frame time. Never fails; garbage is counted and ignored.
    pub fn process_frame(&self, timestamp: Instant, stream_type: StreamType, payload: &[u8]) {
        self.touch(timestamp);
        let mut stats = self.stats.lock().unwrap();
        match stream_type {
            StreamType::Rtp => self.process_rtp(&mut stats, timestamp, payload),
            StreamType::Rtcp => process_rtcp(&mut stats, timestamp, payload),
        }
    }

    fn process_rtp(&self, stats: &mut Stats, timestamp: Instant, payload: &[u8]) {
        let header = match crate::rtp::HeaderRef::parse(payload) {
            Ok(h) => h,
            Err(reason) => {
                trace!("ignoring malformed RTP packet: {}", reason);
                stats.malformed += 1;
                return;
            }
        };
        stats.rtp_packets += 1;
        stats.rtp_bytes += payload.len() as u64;
        let seq = header.sequence_number();
        match &mut stats.seq {
            Some(s) if s.ssrc == header.ssrc() => s.update(seq),
            s => {
                if let Some(old) = s {
                    trace!("ssrc changed from {:08x} to {:08x}", old.ssrc, header.ssrc());
                }
                let mut fresh = SequenceState::new(header.ssrc(), seq);
                fresh.update(seq);
                *s = Some(fresh);
                stats.last_transit = None;
            }
        }

        if let Some(clock_rate) = self.clock_rate {
            let elapsed = timestamp.saturating_duration_since(self.epoch);
            let arrival =
                (elapsed.as_nanos() * u128::from(clock_rate.get()) / 1_000_000_000) as u32;
            let transit = arrival.wrapping_sub(header.timestamp());
            if let Some(last) = stats.last_transit {
                let d = u64::from((transit.wrapping_sub(last) as i32).unsigned_abs());

                // J += (|D| - J) / 16, kept scaled by 16.
                stats.jitter_q4 = stats.jitter_q4 + d - ((stats.jitter_q4 + 8) >> 4);
            }
            stats.last_transit = Some(transit);
        }
    }

    /// Serializes a receiver report from the current statistics.
    ///
    /// Includes one report block once an RTP packet has been received, and none
    /// before that. Resets the per-interval loss counters.
    pub fn report(&self, now: Instant) -> Bytes {
        let mut stats = self.stats.lock().unwrap();
        let (last_sr, delay_since_last_sr) = match stats.last_sr {
            Some((lsr, at)) => {
                let delay = now.saturating_duration_since(at);
                (lsr, to_q16(delay))
            }
            None => (0, 0),
        };
        let jitter = (stats.jitter_q4 >> 4).min(u64::from(u32::MAX)) as u32;
        let block = stats.seq.as_mut().map(|s| ReceptionReport {
            ssrc: s.ssrc,
            fraction_lost: s.take_fraction_lost(),
            cumulative_lost: s.cumulative_lost().clamp(-0x80_0000, 0x7f_ffff) as i32,
            extended_highest_seq: s.extended_max(),
            jitter,
            last_sr,
            delay_since_last_sr,
        });
        drop(stats);
        super::serialize_receiver_report(self.receiver_ssrc, block.as_slice())
    }

    /// Returns when the last frame was processed (or the epoch, if none).
    pub fn last_frame(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_frame_ms.load(Ordering::Relaxed))
    }

    /// Advances the last-frame time to at least `timestamp`.
    pub(crate) fn touch(&self, timestamp: Instant) {
        let ms = timestamp.saturating_duration_since(self.epoch).as_millis() as u64;
        self.last_frame_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ReceiverStats {
        let stats = self.stats.lock().unwrap();
        ReceiverStats {
            rtp_packets: stats.rtp_packets,
            rtp_bytes: stats.rtp_bytes,
            rtcp_packets: stats.rtcp_packets,
            malformed: stats.malformed,
            sender_ssrc: stats.seq.map(|s| s.ssrc),
            extended_highest_seq: stats.seq.map(|s| s.extended_max()).unwrap_or(0),
            cumulative_lost: stats.seq.map(|s| s.cumulative_lost()).unwrap_or(0),
        }
    }
}

fn process_rtcp(stats: &mut Stats, timestamp: Instant, payload: &[u8]) {
    let mut any = false;
    for pkt in super::packets(payload) {
        let typed = match pkt.and_then(|p| p.as_typed()) {
            Ok(t) => t,
            Err(e) => {
                trace!("ignoring malformed RTCP packet: {}", e);
                stats.malformed += 1;
                return;
            }
        };
        any = true;
        if let Some(TypedPacketRef::SenderReport(sr)) = typed {
            let ntp = sr.ntp_timestamp();
            trace!("sender report from ssrc={:08x} ntp={}", sr.ssrc(), ntp);
            stats.last_sr = Some(((ntp.0 >> 16) as u32, timestamp));
        }
    }
    if any {
        stats.rtcp_packets += 1;
    }
}

/// Converts to the 16.16 fixed-point seconds used by DLSR.
fn to_q16(d: Duration) -> u32 {
    let q = (d.as_secs() << 16) + ((u64::from(d.subsec_nanos()) << 16) / 1_000_000_000);
    q.min(u64::from(u32::MAX)) as u32
}
