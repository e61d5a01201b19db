use std::time::{Duration, Instant};

use crate::simulation::FrameClock;

use super::{DEFAULT_PING_INTERVAL, PING_SAMPLE_COUNT, PingInfo};

/// Pulls the local frame counter in line with a remote authority.
///
/// A correction is only computed from a full sample ring that has taken at
/// least one new sample since the previous correction. After shifting the
/// clock, the stored frame offsets are shifted by the same amount, so the
/// estimate immediately reads as settled and the same offset is never
/// applied twice.
///
/// Each correction also freezes the ping info for `hold`, so pongs already
/// in flight when the counter jumped are dropped instead of measured.
#[derive(Debug, Clone)]
pub struct FrameSynchronizer {
    tolerance: i64,
    hold: Duration,
    held_until: Option<Instant>,
    last_applied: Option<AppliedCorrection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AppliedCorrection {
    delta: i64,
    samples_taken: u64,
}

impl Default for FrameSynchronizer {
    fn default() -> Self {
        Self::new(1, DEFAULT_PING_INTERVAL)
    }
}

impl FrameSynchronizer {
    /// Offsets within `tolerance` frames are left alone. `hold` is how long
    /// measurement stays frozen after a correction.
    pub fn new(tolerance: i64, hold: Duration) -> Self {
        Self {
            tolerance: tolerance.max(0),
            hold,
            held_until: None,
            last_applied: None,
        }
    }

    /// Applies a correction if one is due. Returns the number of frames the
    /// local counter moved.
    pub fn synchronize(
        &mut self,
        ping: &mut PingInfo,
        clock: &mut FrameClock,
        now: Instant,
    ) -> Option<i64> {
        if !self.release_hold(ping, now) {
            return None;
        }
        if ping.sample_count() < PING_SAMPLE_COUNT {
            return None;
        }
        if let Some(last) = self.last_applied {
            if ping.samples_taken() <= last.samples_taken {
                return None;
            }
        }

        let offset = ping.remote_frame_number_offset();
        if offset.saturating_abs() <= self.tolerance {
            return None;
        }

        let delta = offset.saturating_neg();
        clock.shift_frames(delta);
        ping.shift_frame_offsets(delta);
        if !self.hold.is_zero() {
            ping.set_frozen(true);
            self.held_until = Some(now + self.hold);
        }
        self.last_applied = Some(AppliedCorrection {
            delta,
            samples_taken: ping.samples_taken(),
        });

        log::info!(
            "Frame counter corrected by {} to {}",
            delta,
            clock.frame_number()
        );
        Some(delta)
    }

    /// Unfreezes `ping` once the hold after the last correction has run out.
    /// Returns false while still holding.
    pub fn release_hold(&mut self, ping: &mut PingInfo, now: Instant) -> bool {
        match self.held_until {
            Some(until) if now < until => false,
            Some(_) => {
                self.held_until = None;
                ping.set_frozen(false);
                true
            }
            None => true,
        }
    }

    pub fn last_correction(&self) -> Option<i64> {
        self.last_applied.map(|applied| applied.delta)
    }

    pub fn is_holding(&self) -> bool {
        self.held_until.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Pong;

    fn clock_at(frame: i64) -> FrameClock {
        let mut clock = FrameClock::new(60);
        clock.set_frame_number(frame);
        clock
    }

    fn filled(frame_offset: i64) -> PingInfo {
        let mut ping = PingInfo::default();
        for _ in 0..PING_SAMPLE_COUNT {
            ping.push_sample(Duration::from_millis(20), 0, frame_offset);
        }
        ping
    }

    #[test]
    fn waits_for_full_ring() {
        let mut ping = PingInfo::default();
        ping.push_sample(Duration::from_millis(20), 0, 30);
        let mut clock = clock_at(100);
        let mut sync = FrameSynchronizer::default();
        let now = Instant::now();

        assert_eq!(sync.synchronize(&mut ping, &mut clock, now), None);
        assert_eq!(clock.frame_number(), 100);
    }

    #[test]
    fn corrects_once_per_measurement() {
        // Local is 30 frames ahead of the authority.
        let mut ping = filled(30);
        let mut clock = clock_at(100);
        let mut sync = FrameSynchronizer::default();
        let now = Instant::now();

        assert_eq!(sync.synchronize(&mut ping, &mut clock, now), Some(-30));
        assert_eq!(clock.frame_number(), 70);
        assert_eq!(ping.remote_frame_number_offset(), 0);

        // Nothing new measured: no second application.
        assert_eq!(sync.synchronize(&mut ping, &mut clock, now), None);
        assert_eq!(clock.frame_number(), 70);
        assert_eq!(sync.last_correction(), Some(-30));
    }

    #[test]
    fn stale_samples_do_not_reapply_offset() {
        let mut ping = filled(30);
        let mut clock = clock_at(100);
        let mut sync = FrameSynchronizer::default();
        let now = Instant::now();
        sync.synchronize(&mut ping, &mut clock, now);

        // A late pong measured against the corrected counter reports a
        // settled offset; the ring stays near zero.
        ping.push_sample(Duration::from_millis(20), 0, 0);
        assert_eq!(sync.synchronize(&mut ping, &mut clock, now), None);
        assert_eq!(clock.frame_number(), 70);
    }

    #[test]
    fn small_offsets_are_tolerated() {
        let mut ping = filled(1);
        let mut clock = clock_at(100);
        let mut sync = FrameSynchronizer::new(1, Duration::ZERO);
        let now = Instant::now();

        assert_eq!(sync.synchronize(&mut ping, &mut clock, now), None);
        assert_eq!(clock.frame_number(), 100);
    }

    #[test]
    fn behind_counter_moves_forward() {
        let mut ping = filled(-12);
        let mut clock = clock_at(100);
        let mut sync = FrameSynchronizer::default();
        let now = Instant::now();

        assert_eq!(sync.synchronize(&mut ping, &mut clock, now), Some(12));
        assert_eq!(clock.frame_number(), 112);
    }

    #[test]
    fn correction_freezes_measurement_until_hold_expires() {
        let mut ping = filled(30);
        let mut clock = clock_at(100);
        let hold = Duration::from_millis(500);
        let mut sync = FrameSynchronizer::new(1, hold);
        let now = Instant::now();

        assert_eq!(sync.synchronize(&mut ping, &mut clock, now), Some(-30));
        assert!(ping.is_frozen());
        assert!(sync.is_holding());

        // A pong that was in flight across the jump is not measured.
        let pong = Pong {
            ping_sent_at_micros: 0,
            game_time_micros: 0,
            frame_number: 0,
        };
        ping.handle_pong(&pong, now, &clock);
        assert_eq!(ping.samples_taken(), PING_SAMPLE_COUNT as u64);
        assert!(ping.update(now + hold).is_none());

        assert_eq!(sync.synchronize(&mut ping, &mut clock, now + hold / 2), None);
        assert!(ping.is_frozen());

        assert_eq!(sync.synchronize(&mut ping, &mut clock, now + hold), None);
        assert!(!ping.is_frozen());
        assert!(!sync.is_holding());
        assert!(ping.update(now + hold).is_some());
    }
}
