//! Pose update batching.
//!
//! The local player produces a pose sample every simulation tick. Sending all
//! of them would flood the link, so samples are coalesced (only the latest per
//! channel is kept) and only significant changes are sent, as partial updates.
//!
//! Two strategies, chosen by configuration:
//! - [`PoseMode::Interval`]: the owner calls [`PoseBatcher::flush`] on a fixed
//!   interval.
//! - [`PoseMode::Throttled`]: [`PoseBatcher::submit`] tests the sample right
//!   away, at most once per minimum interval.

use std::time::Duration;

use netsync_shared::{
    config::{PoseMode, PoseSettings},
    math::Vec3,
    net::PoseUpdate,
};
use tokio::time::Instant;

/// One simulation tick's worth of local player pose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseSample {
    pub position: Vec3,
    pub rotation: Vec3,
    pub timestamp: Instant,
}

impl PoseSample {
    pub fn new(position: Vec3, rotation: Vec3) -> Self {
        Self {
            position,
            rotation,
            timestamp: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Euclidean distance.
    pub position: f32,
    /// Per-axis absolute difference.
    pub rotation: f32,
}

/// Latest unsent values and the last values sent, per channel.
///
/// The sent baseline starts at the origin, matching the spawn pose a server
/// assumes before the first update.
#[derive(Debug, Clone, Default)]
pub struct BatchedPoseState {
    pub pending_position: Option<Vec3>,
    pub pending_rotation: Option<Vec3>,
    pub last_sent_position: Vec3,
    pub last_sent_rotation: Vec3,
    pub last_flush: Option<Instant>,
}

impl BatchedPoseState {
    /// Overwrites whatever was pending.
    pub fn record(&mut self, sample: &PoseSample) {
        self.pending_position = Some(sample.position);
        self.pending_rotation = Some(sample.rotation);
    }

    /// Builds a partial update from the significant pending channels and
    /// advances the sent baseline for those channels only.
    pub fn take_significant(&mut self, thresholds: Thresholds, now: Instant) -> Option<PoseUpdate> {
        self.last_flush = Some(now);

        let position = self.pending_position.filter(|p| {
            p.distance_sq(self.last_sent_position) > thresholds.position * thresholds.position
        });
        let rotation = self
            .pending_rotation
            .filter(|r| r.max_abs_diff(self.last_sent_rotation) > thresholds.rotation);

        if let Some(p) = position {
            self.last_sent_position = p;
            self.pending_position = None;
        }
        if let Some(r) = rotation {
            self.last_sent_rotation = r;
            self.pending_rotation = None;
        }

        let update = PoseUpdate { position, rotation };
        (!update.is_empty()).then_some(update)
    }
}

#[derive(Debug)]
pub struct PoseBatcher {
    mode: PoseMode,
    interval: Duration,
    min_interval: Duration,
    thresholds: Thresholds,
    state: BatchedPoseState,
}

impl PoseBatcher {
    pub fn new(settings: &PoseSettings) -> Self {
        Self {
            mode: settings.mode,
            interval: settings.interval(),
            min_interval: settings.min_interval(),
            thresholds: Thresholds {
                position: settings.position_threshold,
                rotation: settings.rotation_threshold,
            },
            state: BatchedPoseState::default(),
        }
    }

    /// Flush period, for interval mode only.
    pub fn flush_interval(&self) -> Option<Duration> {
        (self.mode == PoseMode::Interval).then_some(self.interval)
    }

    /// Keeps the sample without testing it, e.g. while not admitted.
    pub fn record(&mut self, sample: PoseSample) {
        self.state.record(&sample);
    }

    /// Accepts a sample. In throttled mode this may produce an update to send now.
    pub fn submit(&mut self, sample: PoseSample, now: Instant) -> Option<PoseUpdate> {
        self.state.record(&sample);
        match self.mode {
            PoseMode::Interval => None,
            PoseMode::Throttled => {
                let due = self
                    .state
                    .last_flush
                    .map_or(true, |at| now.saturating_duration_since(at) >= self.min_interval);
                if due {
                    self.state.take_significant(self.thresholds, now)
                } else {
                    None
                }
            }
        }
    }

    /// Interval tick. Returns the update to send, if anything changed enough.
    pub fn flush(&mut self, now: Instant) -> Option<PoseUpdate> {
        match self.mode {
            PoseMode::Interval => self.state.take_significant(self.thresholds, now),
            PoseMode::Throttled => None,
        }
    }

    pub fn state(&self) -> &BatchedPoseState {
        &self.state
    }

    /// Drops pending samples and the sent baseline.
    pub fn reset(&mut self) {
        self.state = BatchedPoseState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(mode: PoseMode) -> PoseSettings {
        PoseSettings {
            mode,
            interval_ms: 200,
            min_interval_ms: 100,
            position_threshold: 0.5,
            rotation_threshold: 0.1,
        }
    }

    fn at(position: Vec3, t: Instant) -> PoseSample {
        PoseSample {
            position,
            rotation: Vec3::ZERO,
            timestamp: t,
        }
    }

    #[test]
    fn small_drift_within_window_sends_nothing() {
        let mut b = PoseBatcher::new(&settings(PoseMode::Interval));
        let t0 = Instant::now();
        for i in 1..=10 {
            let x = 0.02 * i as f32;
            assert!(b.submit(at(Vec3::new(x, 0.0, 0.0), t0), t0).is_none());
        }
        assert_eq!(b.flush(t0 + Duration::from_millis(200)), None);
    }

    #[test]
    fn below_threshold_across_axes_is_dropped() {
        let mut b = PoseBatcher::new(&settings(PoseMode::Interval));
        let t0 = Instant::now();
        // |(0.2, 0.2, 0.1)| = 0.3
        b.submit(at(Vec3::new(0.2, 0.2, 0.1), t0), t0);
        assert_eq!(b.flush(t0), None);
    }

    #[test]
    fn above_threshold_sends_position_only() {
        let mut b = PoseBatcher::new(&settings(PoseMode::Interval));
        let t0 = Instant::now();
        b.submit(at(Vec3::new(0.6, 0.0, 0.0), t0), t0);
        let update = b.flush(t0).unwrap();
        assert_eq!(update.position, Some(Vec3::new(0.6, 0.0, 0.0)));
        assert_eq!(update.rotation, None);
        assert_eq!(b.flush(t0 + Duration::from_millis(200)), None);
    }

    #[test]
    fn coalesces_to_latest_sample() {
        let mut b = PoseBatcher::new(&settings(PoseMode::Interval));
        let t0 = Instant::now();
        for x in [1.0, 2.0, 3.0] {
            b.submit(at(Vec3::new(x, 0.0, 0.0), t0), t0);
        }
        assert_eq!(
            b.flush(t0).and_then(|u| u.position),
            Some(Vec3::new(3.0, 0.0, 0.0))
        );
    }

    #[test]
    fn rotation_uses_per_axis_threshold() {
        let mut b = PoseBatcher::new(&settings(PoseMode::Interval));
        let t0 = Instant::now();
        b.submit(
            PoseSample {
                position: Vec3::ZERO,
                rotation: Vec3::new(0.0, 0.15, 0.0),
                timestamp: t0,
            },
            t0,
        );
        let update = b.flush(t0).unwrap();
        assert_eq!(update.position, None);
        assert_eq!(update.rotation, Some(Vec3::new(0.0, 0.15, 0.0)));
    }

    #[test]
    fn cumulative_drift_eventually_sends() {
        let mut b = PoseBatcher::new(&settings(PoseMode::Interval));
        let t0 = Instant::now();
        b.submit(at(Vec3::new(0.3, 0.0, 0.0), t0), t0);
        assert_eq!(b.flush(t0), None);
        b.submit(at(Vec3::new(0.6, 0.0, 0.0), t0), t0);
        assert!(b.flush(t0 + Duration::from_millis(200)).is_some());
    }

    #[test]
    fn throttled_sends_at_most_once_per_min_interval() {
        let mut b = PoseBatcher::new(&settings(PoseMode::Throttled));
        let t0 = Instant::now();
        assert!(b.submit(at(Vec3::new(1.0, 0.0, 0.0), t0), t0).is_some());
        let t1 = t0 + Duration::from_millis(50);
        assert!(b.submit(at(Vec3::new(2.0, 0.0, 0.0), t1), t1).is_none());
        let t2 = t0 + Duration::from_millis(100);
        let update = b.submit(at(Vec3::new(3.0, 0.0, 0.0), t2), t2).unwrap();
        assert_eq!(update.position, Some(Vec3::new(3.0, 0.0, 0.0)));
        assert_eq!(b.flush(t2 + Duration::from_secs(1)), None);
    }

    #[test]
    fn throttled_never_sends_empty() {
        let mut b = PoseBatcher::new(&settings(PoseMode::Throttled));
        let t0 = Instant::now();
        assert!(b.submit(at(Vec3::new(0.1, 0.0, 0.0), t0), t0).is_none());
    }

    #[test]
    fn flush_interval_depends_on_mode() {
        assert_eq!(
            PoseBatcher::new(&settings(PoseMode::Interval)).flush_interval(),
            Some(Duration::from_millis(200))
        );
        assert_eq!(
            PoseBatcher::new(&settings(PoseMode::Throttled)).flush_interval(),
            None
        );
    }
}
