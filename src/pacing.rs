//! Outbound pacing and retransmission timing.
//!
//! The engine does not keep a congestion window; instead the datagram *rate* is controlled in
//!  AIMD fashion. Every 10 ms frame the rate either decays multiplicatively toward the lowest
//!  rate that was in effect when losses piled up, or creeps additively toward the target
//!  bandwidth. Sends are admitted in slots of `1 / rate` seconds.
//!
//! The retransmission timeout follows RFC 2988: smoothed RTT and RTT variation from ack
//!  samples, a clamped RTO derived from both, and timeout-driven doubling.

use crate::clock::{self, Tick, TICKS_PER_SEC};

/// AIMD frame length: the rate is reconsidered at most once per 10 ms.
const FRAME_TICKS: u64 = TICKS_PER_SEC / 100;

/// A burst of more losses than this within one frame is treated as congestion; fewer are
///  written off as random drops.
const LOSSES_TOLERATED_PER_FRAME: u32 = 5;

const ADDITIVE_INCREASE_AGGRESSIVENESS: f64 = 5e-2;

/// Catch-up bound: after falling behind by more than this many send slots the slot clock
///  jumps to now instead of allowing an unbounded burst.
const MAX_CATCHUP_SLOTS: u64 = 20;

const MAX_FRAMES_PER_UPDATE: u64 = 100;

pub struct DatagramRateController {
    rate: f64,
    target_rate: f64,
    last_send_tick: Tick,
    last_frame_tick: Tick,
    num_losses_this_frame: u32,
    lowest_rate_on_loss: f64,
}

impl DatagramRateController {
    pub fn new(now: Tick, initial_rate: f64, target_rate: f64) -> DatagramRateController {
        DatagramRateController {
            rate: initial_rate,
            target_rate,
            last_send_tick: now,
            last_frame_tick: now,
            num_losses_this_frame: 0,
            lowest_rate_on_loss: initial_rate,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    fn slot_ticks(&self) -> u64 {
        (TICKS_PER_SEC as f64 / self.rate) as u64
    }

    pub fn can_send(&self, now: Tick) -> bool {
        clock::ticks_in_between(now, self.last_send_tick) >= self.slot_ticks()
    }

    /// Ticks until the next send slot opens; zero when sending is already allowed.
    pub fn ticks_until_can_send(&self, now: Tick) -> u64 {
        self.slot_ticks()
            .saturating_sub(clock::ticks_in_between(now, self.last_send_tick))
    }

    /// Advances the slot clock after a successful send. Normally the clock moves by exactly
    ///  one slot so unused time is credited, but once the engine has fallen more than
    ///  [`MAX_CATCHUP_SLOTS`] behind it jumps to now.
    pub fn on_datagram_sent(&mut self, now: Tick) {
        let slot = self.slot_ticks();
        if clock::ticks_in_between(now, self.last_send_tick) / slot.max(1) < MAX_CATCHUP_SLOTS {
            self.last_send_tick = self.last_send_tick.wrapping_add(slot);
        } else {
            self.last_send_tick = now;
        }
    }

    /// Records a reliable datagram timeout together with the send rate that was in effect
    ///  when the lost datagram went out.
    pub fn on_loss(&mut self, rate_at_send_time: f64) {
        self.lowest_rate_on_loss = self.lowest_rate_on_loss.min(rate_at_send_time);
        self.num_losses_this_frame += 1;
    }

    /// The AIMD step, called from the engine's update timer.
    pub fn update_frame(&mut self, now: Tick) {
        let num_frames = clock::ticks_in_between(now, self.last_frame_tick) / FRAME_TICKS;
        if num_frames == 0 {
            return;
        }
        let frames = num_frames.min(MAX_FRAMES_PER_UPDATE);

        if self.num_losses_this_frame > LOSSES_TOLERATED_PER_FRAME {
            self.rate = self.rate.min((0.9 * self.lowest_rate_on_loss).max(1.0));
        } else {
            let increment = (frames as f64
                * ADDITIVE_INCREASE_AGGRESSIVENESS
                * (self.target_rate - self.rate))
                .min(1.0);
            self.rate = (self.rate + increment).min(self.target_rate).max(1.0);
            self.lowest_rate_on_loss = self.rate;
        }
        self.num_losses_this_frame = 0;

        if num_frames < MAX_FRAMES_PER_UPDATE {
            self.last_frame_tick = self.last_frame_tick.wrapping_add(num_frames * FRAME_TICKS);
        } else {
            self.last_frame_tick = now;
        }
    }
}

/// Retransmission timeout estimation per RFC 2988, in milliseconds.
pub struct RttEstimator {
    srtt_ms: f64,
    rttvar_ms: f64,
    rto_ms: f64,
    min_rto_ms: f64,
    max_rto_ms: f64,
    cleared: bool,
}

impl RttEstimator {
    pub fn new(initial_rto_ms: f64, min_rto_ms: f64, max_rto_ms: f64) -> RttEstimator {
        RttEstimator {
            srtt_ms: initial_rto_ms,
            rttvar_ms: 0.0,
            rto_ms: initial_rto_ms,
            min_rto_ms,
            max_rto_ms,
            cleared: true,
        }
    }

    fn clamp_rto(&self, raw_ms: f64) -> f64 {
        raw_ms.max(self.min_rto_ms).min(self.max_rto_ms)
    }

    /// Feeds the round-trip time observed on an acked, never-retransmitted datagram.
    pub fn on_ack_sample(&mut self, rtt_ms: f64) {
        const ALPHA: f64 = 1.0 / 8.0;
        const BETA: f64 = 1.0 / 4.0;

        if self.cleared {
            self.cleared = false;
            self.rttvar_ms = rtt_ms / 2.0;
            self.srtt_ms = rtt_ms;
        } else {
            self.rttvar_ms = (1.0 - BETA) * self.rttvar_ms + BETA * (self.srtt_ms - rtt_ms).abs();
            self.srtt_ms = (1.0 - ALPHA) * self.srtt_ms + ALPHA * rtt_ms;
        }

        // one millisecond of constant headroom keeps the RTO from collapsing on a LAN
        self.rto_ms = self.clamp_rto(1.0 + 2.0 * (self.srtt_ms + self.rttvar_ms));
    }

    /// A reliable datagram timed out: double into the clamp range, drop the variation.
    pub fn on_loss(&mut self) {
        self.srtt_ms = self.clamp_rto(self.srtt_ms * 2.0);
        self.rto_ms = self.srtt_ms;
        self.rttvar_ms = 0.0;
    }

    pub fn rto_ms(&self) -> f64 {
        self.rto_ms
    }

    pub fn rto_ticks(&self) -> u64 {
        clock::millis_to_ticks(self.rto_ms as u64)
    }

    pub fn smoothed_rtt_ms(&self) -> f64 {
        self.srtt_ms
    }
}
