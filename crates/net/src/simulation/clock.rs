use std::time::Duration;

pub const DEFAULT_FRAME_RATE: u32 = 60;

/// Turns variable real-time deltas into a whole number of fixed frames.
pub struct FixedTimestep {
    frame_duration: Duration,
    accumulator: Duration,
    max_catch_up: Duration,
}

impl FixedTimestep {
    pub fn new(frame_rate: u32) -> Self {
        Self {
            frame_duration: Duration::from_secs_f64(1.0 / frame_rate.max(1) as f64),
            accumulator: Duration::ZERO,
            max_catch_up: Duration::from_millis(250),
        }
    }

    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    pub fn accumulate(&mut self, delta: Duration) {
        self.accumulator += delta.min(self.max_catch_up);
    }

    pub fn consume_frame(&mut self) -> bool {
        if self.accumulator >= self.frame_duration {
            self.accumulator -= self.frame_duration;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.accumulator = Duration::ZERO;
    }
}

/// Simulation frame counter and total game time.
///
/// The frame number may be rewritten by frame-offset correction; game time
/// always advances by exactly one frame duration per frame.
#[derive(Debug, Clone)]
pub struct FrameClock {
    frame_duration: Duration,
    frame_number: i64,
    total_game_time: Duration,
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_RATE)
    }
}

impl FrameClock {
    pub fn new(frame_rate: u32) -> Self {
        Self {
            frame_duration: Duration::from_secs_f64(1.0 / frame_rate.max(1) as f64),
            frame_number: 0,
            total_game_time: Duration::ZERO,
        }
    }

    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    pub fn frame_number(&self) -> i64 {
        self.frame_number
    }

    pub fn total_game_time(&self) -> Duration {
        self.total_game_time
    }

    pub fn advance(&mut self) {
        self.frame_number = self.frame_number.saturating_add(1);
        self.total_game_time += self.frame_duration;
    }

    pub fn shift_frames(&mut self, delta: i64) {
        self.frame_number = self.frame_number.saturating_add(delta);
    }

    pub fn set_frame_number(&mut self, frame_number: i64) {
        self.frame_number = frame_number;
    }

    /// Whole frames covered by `duration`, rounded to nearest.
    pub fn frames_in(&self, duration: Duration) -> i64 {
        (duration.as_secs_f64() / self.frame_duration.as_secs_f64()).round() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_timestep_accumulation() {
        let mut ts = FixedTimestep::new(60);

        ts.accumulate(Duration::from_secs_f64(1.0 / 30.0) + Duration::from_micros(1));
        assert!(ts.consume_frame());
        assert!(ts.consume_frame());
        assert!(!ts.consume_frame());
    }

    #[test]
    fn clock_advances_and_shifts() {
        let mut clock = FrameClock::new(50);
        clock.advance();
        clock.advance();
        assert_eq!(clock.frame_number(), 2);
        assert_eq!(clock.total_game_time(), Duration::from_millis(40));

        clock.shift_frames(-5);
        assert_eq!(clock.frame_number(), -3);
        assert_eq!(clock.total_game_time(), Duration::from_millis(40));
    }

    #[test]
    fn frames_in_rounds() {
        let clock = FrameClock::new(50);
        assert_eq!(clock.frames_in(Duration::from_millis(29)), 1);
        assert_eq!(clock.frames_in(Duration::from_millis(31)), 2);
        assert_eq!(clock.frames_in(Duration::ZERO), 0);
    }
}
