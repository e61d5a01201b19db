use std::time::{Duration, Instant};

use crate::protocol::{Message, Ping, Pong};
use crate::simulation::FrameClock;

pub const PING_SAMPLE_COUNT: usize = 4;
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default)]
struct PingSample {
    rtt_micros: i64,
    game_time_offset_micros: i64,
    frame_offset: i64,
}

/// Round-trip time and remote clock offsets for one connection.
///
/// Every reported value is the mean of the sample ring with its single
/// smallest and largest entries left out, so one delayed pong cannot swing
/// the estimate.
#[derive(Debug)]
pub struct PingInfo {
    epoch: Instant,
    interval: Duration,
    last_ping_sent: Option<Instant>,
    samples: [PingSample; PING_SAMPLE_COUNT],
    filled: usize,
    next_slot: usize,
    samples_taken: u64,
    frozen: bool,
}

impl Default for PingInfo {
    fn default() -> Self {
        Self::new(DEFAULT_PING_INTERVAL)
    }
}

impl PingInfo {
    pub fn new(interval: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            interval,
            last_ping_sent: None,
            samples: [PingSample::default(); PING_SAMPLE_COUNT],
            filled: 0,
            next_slot: 0,
            samples_taken: 0,
            frozen: false,
        }
    }

    /// Called once per frame. Returns a ping to send when the interval has
    /// elapsed and the info isn't frozen.
    pub fn update(&mut self, now: Instant) -> Option<Message> {
        if self.frozen {
            return None;
        }
        if let Some(last) = self.last_ping_sent {
            if now.saturating_duration_since(last) < self.interval {
                return None;
            }
        }

        self.last_ping_sent = Some(now);
        Some(Message::Ping(Ping {
            sent_at_micros: self.micros_since_epoch(now),
        }))
    }

    /// Answer to a peer's ping. Works while frozen so the peer keeps
    /// measuring.
    pub fn reply(&self, ping: &Ping, clock: &FrameClock) -> Message {
        Message::Pong(Pong {
            ping_sent_at_micros: ping.sent_at_micros,
            game_time_micros: clock.total_game_time().as_micros() as i64,
            frame_number: clock.frame_number(),
        })
    }

    pub fn handle_pong(&mut self, pong: &Pong, now: Instant, clock: &FrameClock) {
        if self.frozen {
            return;
        }

        let now_micros = self.micros_since_epoch(now);
        if pong.ping_sent_at_micros > now_micros {
            log::debug!("Ignoring pong stamped in the future");
            return;
        }

        let rtt_micros = (now_micros - pong.ping_sent_at_micros) as i64;
        let half_rtt = rtt_micros / 2;
        let local_game_time = clock.total_game_time().as_micros() as i64;
        let half_rtt_frames = clock.frames_in(Duration::from_micros(half_rtt as u64));

        self.samples[self.next_slot] = PingSample {
            rtt_micros,
            game_time_offset_micros: local_game_time
                .saturating_sub(pong.game_time_micros)
                .saturating_sub(half_rtt),
            frame_offset: clock
                .frame_number()
                .saturating_sub(pong.frame_number)
                .saturating_sub(half_rtt_frames),
        };
        self.next_slot = (self.next_slot + 1) % PING_SAMPLE_COUNT;
        self.filled = (self.filled + 1).min(PING_SAMPLE_COUNT);
        self.samples_taken += 1;
    }

    pub fn ping_time(&self) -> Duration {
        let micros = trimmed_mean(self.filled_samples().map(|s| s.rtt_micros));
        Duration::from_micros(micros.max(0) as u64)
    }

    /// Local game time minus remote game time, in microseconds.
    pub fn remote_game_time_offset_micros(&self) -> i64 {
        trimmed_mean(self.filled_samples().map(|s| s.game_time_offset_micros))
    }

    /// Local frame number minus remote frame number.
    pub fn remote_frame_number_offset(&self) -> i64 {
        trimmed_mean(self.filled_samples().map(|s| s.frame_offset))
    }

    /// How many local frames ago the remote side was at `remote_frame`.
    pub fn frames_ago(&self, remote_frame: i64, clock: &FrameClock) -> i64 {
        let local_frame = remote_frame.saturating_add(self.remote_frame_number_offset());
        clock.frame_number().saturating_sub(local_frame).max(0)
    }

    pub fn set_frozen(&mut self, frozen: bool) {
        self.frozen = frozen;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn sample_count(&self) -> usize {
        self.filled
    }

    /// Total samples folded in since creation; never decreases.
    pub fn samples_taken(&self) -> u64 {
        self.samples_taken
    }

    /// Re-expresses stored frame offsets after the local frame counter moved
    /// by `delta` frames.
    pub fn shift_frame_offsets(&mut self, delta: i64) {
        for sample in &mut self.samples[..self.filled] {
            sample.frame_offset = sample.frame_offset.saturating_add(delta);
        }
    }

    pub fn reset(&mut self) {
        self.samples = [PingSample::default(); PING_SAMPLE_COUNT];
        self.filled = 0;
        self.next_slot = 0;
        self.last_ping_sent = None;
    }

    fn filled_samples(&self) -> impl Iterator<Item = &PingSample> {
        self.samples[..self.filled].iter()
    }

    fn micros_since_epoch(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_micros() as u64
    }

    #[cfg(test)]
    pub(crate) fn push_sample(&mut self, rtt: Duration, game_time_offset_micros: i64, frame_offset: i64) {
        self.samples[self.next_slot] = PingSample {
            rtt_micros: rtt.as_micros() as i64,
            game_time_offset_micros,
            frame_offset,
        };
        self.next_slot = (self.next_slot + 1) % PING_SAMPLE_COUNT;
        self.filled = (self.filled + 1).min(PING_SAMPLE_COUNT);
        self.samples_taken += 1;
    }
}

/// Mean without the single smallest and largest value. Fewer than three
/// values are averaged as they are.
fn trimmed_mean(values: impl Iterator<Item = i64>) -> i64 {
    let mut values: Vec<i64> = values.collect();
    if values.is_empty() {
        return 0;
    }
    values.sort_unstable();

    let kept = if values.len() >= 3 {
        &values[1..values.len() - 1]
    } else {
        &values[..]
    };
    let sum: i128 = kept.iter().map(|&value| i128::from(value)).sum();
    (sum as f64 / kept.len() as f64).round() as i64
}
