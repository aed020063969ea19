// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Plumbing shared by the UDP and TCP playback drivers.
//!
//! Each driver runs as one task with an event loop over its timers, the
//! termination request, and a separate reader task. Only the event loop
//! writes to the RTSP connection; only the reader task reads from it.

use std::time::Duration;

use log::debug;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use url::Url;

use super::{FrameCallback, RtspConnection, SessionOptions};
use crate::error::ErrorInt;
use crate::tokio::RtspReader;
use crate::Error;

/// Everything a driver needs besides the connection and its tracks.
pub(super) struct Playback {
    pub(super) url: Url,
    pub(super) options: SessionOptions,
    pub(super) callback: FrameCallback,
    pub(super) get_parameter_supported: bool,

    /// Fires (or is dropped) when the session wants playback to stop.
    pub(super) terminate: oneshot::Receiver<()>,

    /// Receives the run's single outcome.
    pub(super) done: oneshot::Sender<Result<(), Error>>,
}

/// The reader task hands its reader back along with the error that stopped it.
pub(super) type ReaderTask = JoinHandle<(RtspReader, Error)>;

/// Returns an interval whose first tick is one `period` from now.
pub(super) fn ticker(period: Duration) -> Interval {
    let mut i = tokio::time::interval_at(Instant::now() + period, period);
    i.set_missed_tick_behavior(MissedTickBehavior::Delay);
    i
}

/// Waits for the reader task to exit, which the caller must already have
/// provoked by expiring the read deadline.
///
/// Returns `None` if the task panicked; the connection is lost then.
pub(super) async fn join_reader(task: &mut ReaderTask) -> Option<RtspReader> {
    match task.await {
        Ok((reader, e)) => {
            debug!("reader stopped: {e}");
            Some(reader)
        }
        Err(e) => {
            debug!("reader task failed: {e}");
            None
        }
    }
}

/// Maps the reader task's own completion to the reader and its error.
pub(super) fn reader_finished(
    r: Result<(RtspReader, Error), tokio::task::JoinError>,
) -> (Option<RtspReader>, Error) {
    match r {
        Ok((reader, e)) => (Some(reader), e),
        Err(e) => (None, wrap!(ErrorInt::Internal(e.into()))),
    }
}

impl Playback {
    /// Delivers the run's outcome and returns the reassembled connection, if any.
    pub(super) fn finish(
        self,
        outcome: Error,
        reader: Option<RtspReader>,
        writer: super::RequestWriter,
        deadline: crate::tokio::ReadDeadline,
    ) -> Option<RtspConnection> {
        debug!("playback of {} stopped: {outcome}", self.url);
        // The session may have been dropped; nobody's listening then.
        let _ = self.done.send(Err(outcome));
        let mut reader = reader?;
        reader.set_idle_timeout(None);
        deadline.set(None);
        Some(RtspConnection {
            reader,
            writer,
            deadline,
        })
    }
}
