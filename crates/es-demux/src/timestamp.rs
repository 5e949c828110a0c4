//! # Timestamp Tracker
//!
//! Follows the PTS and DTS sequence of one track and reports jumps that are
//! too large to be ordinary progression.
//!
//! PES timestamps are 33-bit counters of a 90 kHz clock that wrap roughly
//! every 26.5 hours. Deltas are therefore taken modulo 2^33 and read as a
//! signed value, so a step from `2^33 - 7` to `40` is a forward step of 47
//! ticks rather than a jump back in time.
//!
//! Small backward steps are tolerated because presentation order differs
//! from decode order around B-frames. Sparse tracks such as subpictures may
//! go silent for minutes and skip the forward limit unless one is configured.
//!
//! The tracker is diagnostic only. It never fails and never changes the data
//! written for a track.

use std::fmt;

use serde::Serialize;

use crate::TimestampConfig;

/// Number of distinct values of a 33-bit timestamp
pub const TIMESTAMP_MODULUS: u64 = 1 << 33;

const HALF_MODULUS: u64 = 1 << 32;

/// Which of the two PES timestamps a sample belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimestampKind {
    Pts,
    Dts,
}

impl fmt::Display for TimestampKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimestampKind::Pts => f.write_str("PTS"),
            TimestampKind::Dts => f.write_str("DTS"),
        }
    }
}

/// Signed distance from `previous` to `current`, modulo 2^33.
///
/// The result lies in `[-2^32, 2^32)`.
#[inline]
pub fn wrapped_delta(previous: u64, current: u64) -> i64 {
    let diff = current.wrapping_sub(previous) & (TIMESTAMP_MODULUS - 1);
    if diff >= HALF_MODULUS {
        diff as i64 - TIMESTAMP_MODULUS as i64
    } else {
        diff as i64
    }
}

/// One observed timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimestampSample {
    pub kind: TimestampKind,
    /// 33-bit value as found in the header
    pub raw: u64,
    /// Position on the track's continuous timeline, in ticks
    pub unwrapped: u64,
    /// Byte offset of the PES unit that carried it
    pub offset: u64,
}

/// A jump between two consecutive samples of the same kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiscontinuityEvent {
    pub kind: TimestampKind,
    pub previous: u64,
    pub current: u64,
    pub delta: i64,
    pub offset: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Sequence {
    /// Last raw value and its unwrapped position
    last: Option<(u64, u64)>,
    /// Set after a container discontinuity: the next sample starts a new
    /// segment without being compared
    rebase: bool,
    samples: u64,
}

#[derive(Debug)]
pub struct TimestampTracker {
    config: TimestampConfig,
    sparse: bool,
    pts: Sequence,
    dts: Sequence,
    first_pts: Option<u64>,
    last_pts: Option<u64>,
    /// Lowest and highest unwrapped PTS, for the duration estimate
    pts_span: Option<(u64, u64)>,
    discontinuities: u64,
}

impl TimestampTracker {
    /// Creates a tracker. `sparse` lifts the forward-gap check unless
    /// `sparse_forward_gap` is configured.
    pub fn new(config: TimestampConfig, sparse: bool) -> Self {
        Self {
            config,
            sparse,
            pts: Sequence::default(),
            dts: Sequence::default(),
            first_pts: None,
            last_pts: None,
            pts_span: None,
            discontinuities: 0,
        }
    }

    fn forward_limit(&self) -> Option<u64> {
        if self.sparse {
            self.config.sparse_forward_gap
        } else {
            Some(self.config.max_forward_gap)
        }
    }

    /// Records a sample and returns it together with a discontinuity event
    /// when the step from the previous sample of the same kind is out of
    /// bounds.
    ///
    /// After a discontinuity the tracker continues from the new value, so a
    /// single jump yields a single event.
    pub fn observe(
        &mut self,
        kind: TimestampKind,
        raw: u64,
        offset: u64,
    ) -> (TimestampSample, Option<DiscontinuityEvent>) {
        let raw = raw & (TIMESTAMP_MODULUS - 1);
        let forward_limit = self.forward_limit();
        let backward_tolerance = self.config.backward_tolerance;
        let seq = match kind {
            TimestampKind::Pts => &mut self.pts,
            TimestampKind::Dts => &mut self.dts,
        };

        let mut event = None;
        let unwrapped = match seq.last {
            None => raw,
            // Splice the new segment onto the timeline
            Some((_, last_unwrapped)) if seq.rebase => last_unwrapped,
            Some((previous, last_unwrapped)) => {
                let delta = wrapped_delta(previous, raw);
                let jumped = if delta >= 0 {
                    forward_limit.is_some_and(|limit| delta as u64 > limit)
                } else {
                    delta.unsigned_abs() > backward_tolerance
                };
                if jumped {
                    event = Some(DiscontinuityEvent {
                        kind,
                        previous,
                        current: raw,
                        delta,
                        offset,
                    });
                    last_unwrapped
                } else {
                    last_unwrapped.saturating_add_signed(delta)
                }
            }
        };
        seq.last = Some((raw, unwrapped));
        seq.rebase = false;
        seq.samples += 1;

        if event.is_some() {
            self.discontinuities += 1;
        }
        if kind == TimestampKind::Pts {
            self.first_pts.get_or_insert(raw);
            self.last_pts = Some(raw);
            self.pts_span = Some(match self.pts_span {
                None => (unwrapped, unwrapped),
                Some((lo, hi)) => (lo.min(unwrapped), hi.max(unwrapped)),
            });
        }

        (
            TimestampSample {
                kind,
                raw,
                unwrapped,
                offset,
            },
            event,
        )
    }

    /// Accepts the next sample of each kind without comparing it, as after a
    /// signalled discontinuity in the container.
    pub fn reset_reference(&mut self) {
        self.pts.rebase = self.pts.last.is_some();
        self.dts.rebase = self.dts.last.is_some();
    }

    pub fn first_pts(&self) -> Option<u64> {
        self.first_pts
    }

    pub fn last_pts(&self) -> Option<u64> {
        self.last_pts
    }

    /// Span of the PTS timeline in ticks, excluding flagged jumps
    pub fn duration(&self) -> Option<u64> {
        self.pts_span.map(|(lo, hi)| hi - lo)
    }

    pub fn discontinuities(&self) -> u64 {
        self.discontinuities
    }

    pub fn samples(&self, kind: TimestampKind) -> u64 {
        match kind {
            TimestampKind::Pts => self.pts.samples,
            TimestampKind::Dts => self.dts.samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PES_CLOCK_HZ;

    fn tracker() -> TimestampTracker {
        TimestampTracker::new(TimestampConfig::default(), false)
    }

    #[test]
    fn test_wrapped_delta() {
        assert_eq!(wrapped_delta(100, 3700), 3600);
        assert_eq!(wrapped_delta(3700, 100), -3600);
        assert_eq!(wrapped_delta(8_589_934_585, 40), 47);
        assert_eq!(wrapped_delta(40, 8_589_934_585), -47);
    }

    #[test]
    fn test_rollover_is_forward_progression() {
        let mut tracker = tracker();
        tracker.observe(TimestampKind::Pts, 8_589_934_585, 0);
        let (sample, event) = tracker.observe(TimestampKind::Pts, 40, 188);
        assert!(event.is_none());
        assert_eq!(sample.unwrapped, 8_589_934_585 + 47);
        assert_eq!(tracker.duration(), Some(47));
    }

    #[test]
    fn test_large_decrease_is_flagged() {
        let mut tracker = tracker();
        tracker.observe(TimestampKind::Pts, 50 * PES_CLOCK_HZ, 0);
        let (_, event) = tracker.observe(TimestampKind::Pts, 20 * PES_CLOCK_HZ, 4096);
        let event = event.unwrap();
        assert_eq!(event.previous, 50 * PES_CLOCK_HZ);
        assert_eq!(event.current, 20 * PES_CLOCK_HZ);
        assert_eq!(event.delta, -30 * PES_CLOCK_HZ as i64);
        assert_eq!(event.offset, 4096);
        assert_eq!(tracker.discontinuities(), 1);
    }

    #[test]
    fn test_reordering_within_tolerance() {
        let mut tracker = tracker();
        for pts in [3003u64, 9009, 6006, 15015, 12012] {
            let (_, event) = tracker.observe(TimestampKind::Pts, pts, 0);
            assert!(event.is_none(), "pts {pts}");
        }
        assert_eq!(tracker.first_pts(), Some(3003));
        assert_eq!(tracker.last_pts(), Some(12012));
        assert_eq!(tracker.duration(), Some(12012));
    }

    #[test]
    fn test_forward_gap_on_dense_and_sparse_tracks() {
        let mut dense = tracker();
        dense.observe(TimestampKind::Pts, 0, 0);
        assert!(dense.observe(TimestampKind::Pts, 60 * PES_CLOCK_HZ, 1).1.is_some());

        let mut sparse = TimestampTracker::new(TimestampConfig::default(), true);
        sparse.observe(TimestampKind::Pts, 0, 0);
        assert!(sparse.observe(TimestampKind::Pts, 60 * PES_CLOCK_HZ, 1).1.is_none());

        let config = TimestampConfig {
            sparse_forward_gap: Some(30 * PES_CLOCK_HZ),
            ..TimestampConfig::default()
        };
        let mut bounded = TimestampTracker::new(config, true);
        bounded.observe(TimestampKind::Pts, 0, 0);
        assert!(bounded.observe(TimestampKind::Pts, 60 * PES_CLOCK_HZ, 1).1.is_some());
    }

    #[test]
    fn test_kinds_are_tracked_separately() {
        let mut tracker = tracker();
        tracker.observe(TimestampKind::Pts, 90_000, 0);
        // DTS far below the PTS is not compared against it
        let (_, event) = tracker.observe(TimestampKind::Dts, 10, 0);
        assert!(event.is_none());
        assert_eq!(tracker.samples(TimestampKind::Pts), 1);
        assert_eq!(tracker.samples(TimestampKind::Dts), 1);
    }

    #[test]
    fn test_reset_reference_accepts_jump() {
        let mut tracker = tracker();
        tracker.observe(TimestampKind::Pts, 1_000_000, 0);
        tracker.reset_reference();
        let (sample, event) = tracker.observe(TimestampKind::Pts, 5, 188);
        assert!(event.is_none());
        assert_eq!(sample.unwrapped, 1_000_000);
        // the next step is measured from the new value
        let (_, event) = tracker.observe(TimestampKind::Pts, 3605, 376);
        assert!(event.is_none());
        assert_eq!(tracker.duration(), Some(3600));
    }
}
