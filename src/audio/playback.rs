//! # Playback Scheduling
//!
//! Gapless scheduling of decoded audio onto a [`PlaybackOutput`].
//!
//! ## Invariants:
//! - **Cursor**: every buffer starts at `max(cursor, now)` and the cursor then
//!   advances by the buffer's duration, so buffers play back-to-back without
//!   overlap.
//! - **Active set**: a handle is registered when scheduled and removed when it
//!   finishes. Interruption stops every registered handle exactly once, clears
//!   the set and resets the cursor to zero.
//!
//! The scheduler is owned by a single task; it is not shared across threads.

use crate::audio::device::{DeviceError, PlaybackOutput};
use crate::audio::frame::PlaybackBuffer;
use std::collections::BTreeSet;
use std::fmt;

/// Identifies one scheduled buffer on an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaybackHandle(u64);

impl PlaybackHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PlaybackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a buffer landed on the output timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    pub handle: PlaybackHandle,
    pub start_at: f64,
    pub end_at: f64,
}

/// Point-in-time view of the scheduler state.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct PlaybackSnapshot {
    /// Next free playback slot (seconds on the output clock)
    pub cursor: f64,
    /// Buffers scheduled but not yet finished
    pub active: usize,
    /// Buffers scheduled since the call started
    pub scheduled: u64,
}

pub struct PlaybackScheduler {
    output: Box<dyn PlaybackOutput>,
    cursor: f64,
    active: BTreeSet<PlaybackHandle>,
    next_handle: u64,
    scheduled: u64,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn PlaybackOutput>) -> Self {
        Self {
            output,
            cursor: 0.0,
            active: BTreeSet::new(),
            next_handle: 1,
            scheduled: 0,
        }
    }

    /// Current output clock.
    pub fn now(&self) -> f64 {
        self.output.current_time()
    }

    #[cfg(test)]
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    #[cfg(test)]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            cursor: self.cursor,
            active: self.active.len(),
            scheduled: self.scheduled,
        }
    }

    /// Schedule a buffer right after everything already queued.
    ///
    /// On failure nothing is registered and the cursor does not move.
    pub fn schedule(&mut self, buffer: &PlaybackBuffer) -> Result<ScheduledPlayback, DeviceError> {
        let start_at = self.cursor.max(self.output.current_time());
        let handle = PlaybackHandle(self.next_handle);
        self.next_handle += 1;

        self.output.start(handle, buffer, start_at)?;

        let end_at = start_at + buffer.duration_secs();
        self.cursor = end_at;
        self.active.insert(handle);
        self.scheduled += 1;

        Ok(ScheduledPlayback {
            handle,
            start_at,
            end_at,
        })
    }

    /// Natural completion. Returns false if the handle was already removed.
    pub fn complete(&mut self, handle: PlaybackHandle) -> bool {
        self.active.remove(&handle)
    }

    /// Stop everything still playing and rewind the cursor to the origin.
    ///
    /// Returns the number of handles stopped.
    pub fn interrupt(&mut self) -> usize {
        let stopped = std::mem::take(&mut self.active);
        for handle in &stopped {
            self.output.stop(*handle);
        }
        self.cursor = 0.0;
        stopped.len()
    }

    /// Give the output back for teardown.
    pub fn into_output(self) -> Box<dyn PlaybackOutput> {
        self.output
    }
}
