//! Adaptive presentation timing (jitter buffer delay).
//!
//! Remote RTP timestamps are projected onto the local clock from an epoch
//! pair (first remote timestamp, local arrival time of that packet). The
//! gap between the local clock and that naive projection is low-pass
//! filtered into a buffer delay, which absorbs per-packet jitter and
//! slowly follows drift between the two clocks.

use std::time::{Duration, Instant};

use crate::config::ClockConfig;

/// State of the remote-to-local timestamp mapping.
///
/// Offsets and delays are signed seconds: a sender whose clock runs fast
/// produces packets that look early, which drives the delay below the
/// lookahead and can push it negative.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresentationClockState {
    /// Remote timestamp (media clock ticks) the mapping is anchored to.
    pub remote_epoch: Option<u32>,
    /// Local time at which the anchor was first used.
    pub local_epoch: Option<Instant>,
    /// Filtered buffer delay, seconds.
    pub smoothed_delay: f64,
    /// Remote offset from the epoch at the previous observation, seconds.
    pub previous_offset: Option<f64>,
}

impl PresentationClockState {
    /// Advance the mapping by one remote timestamp.
    ///
    /// Returns the successor state and the local presentation instant for
    /// `ticks`. `self` is left untouched.
    pub fn step(
        &self,
        config: &ClockConfig,
        ticks: u32,
        clock_rate: u32,
        now: Instant,
    ) -> (Self, Instant) {
        let rate = f64::from(clock_rate.max(1));
        let mut next = self.clone();

        let mut offset = match self.remote_epoch {
            Some(epoch) => (f64::from(ticks) - f64::from(epoch)) / rate,
            None => {
                next.anchor(ticks);
                0.0
            }
        };

        if let Some(previous) = self.previous_offset {
            if self.remote_epoch.is_some()
                && (offset - previous).abs() > config.resync_threshold.as_secs_f64()
            {
                tracing::debug!(
                    ticks,
                    jump_secs = offset - previous,
                    "remote timestamp discontinuity, re-anchoring"
                );
                next.anchor(ticks);
                offset = 0.0;
            }
        }

        let local_epoch = *next.local_epoch.get_or_insert(now);
        let local_timestamp = shift(local_epoch, offset);

        let destination_delay = signed_secs(now, local_timestamp) + config.lookahead.as_secs_f64();
        next.smoothed_delay += config.smoothing_factor * (destination_delay - next.smoothed_delay);
        next.previous_offset = Some(offset);

        let presentation = shift(local_timestamp, next.smoothed_delay);
        (next, presentation)
    }

    fn anchor(&mut self, ticks: u32) {
        self.remote_epoch = Some(ticks);
        self.local_epoch = None;
    }
}

/// Maps remote media timestamps to local presentation instants.
#[derive(Debug, Clone)]
pub struct PresentationClock {
    config: ClockConfig,
    state: PresentationClockState,
}

impl PresentationClock {
    /// The delay starts at the configured lookahead so the first frames
    /// already get decoder lead time.
    pub fn new(config: ClockConfig) -> Self {
        let state = PresentationClockState {
            smoothed_delay: config.lookahead.as_secs_f64(),
            ..Default::default()
        };
        Self { config, state }
    }

    pub fn observe(&mut self, ticks: u32, clock_rate: u32, now: Instant) -> Instant {
        let (next, presentation) = self.state.step(&self.config, ticks, clock_rate, now);
        self.state = next;
        presentation
    }

    pub fn state(&self) -> &PresentationClockState {
        &self.state
    }

    /// Drop the anchor; the next observation starts a new mapping.
    /// The smoothed delay is kept.
    pub fn reset(&mut self) {
        self.state.remote_epoch = None;
        self.state.local_epoch = None;
        self.state.previous_offset = None;
    }
}

fn shift(base: Instant, secs: f64) -> Instant {
    let magnitude = Duration::try_from_secs_f64(secs.abs()).unwrap_or(Duration::ZERO);
    let shifted = if secs >= 0.0 {
        base.checked_add(magnitude)
    } else {
        base.checked_sub(magnitude)
    };
    shifted.unwrap_or(base)
}

fn signed_secs(a: Instant, b: Instant) -> f64 {
    if a >= b {
        (a - b).as_secs_f64()
    } else {
        -(b - a).as_secs_f64()
    }
}
