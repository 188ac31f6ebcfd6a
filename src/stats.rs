//! Per-connection traffic statistics and ping history. Samples are appended by the worker and
//!  condensed into per-second rates on the periodic stats refresh; anything older than the
//!  five-second window is pruned there.

use crate::clock::{self, Tick, TICKS_PER_SEC};

const SAMPLE_MAX_AGE_TICKS: u64 = 5 * TICKS_PER_SEC;

#[derive(Debug, Clone, Copy, Default)]
struct TrafficSample {
    tick: Tick,
    bytes_in: u64,
    bytes_out: u64,
    packets_in: u64,
    packets_out: u64,
    messages_in: u64,
    messages_out: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct PingSample {
    pub ping_id: u8,
    pub sent_tick: Tick,
    pub reply_tick: Tick,
    pub reply_received: bool,
}

/// Traffic rates over the sliding stats window, in events per second.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConnectionRates {
    pub bytes_in_per_sec: f64,
    pub bytes_out_per_sec: f64,
    pub packets_in_per_sec: f64,
    pub packets_out_per_sec: f64,
    pub messages_in_per_sec: f64,
    pub messages_out_per_sec: f64,
}

#[derive(Default)]
pub struct ConnectionStatistics {
    traffic: Vec<TrafficSample>,
    ping: Vec<PingSample>,
}

impl ConnectionStatistics {
    pub fn new() -> ConnectionStatistics {
        ConnectionStatistics::default()
    }

    pub fn add_outbound(&mut self, now: Tick, bytes: u64, packets: u64, messages: u64) {
        if bytes == 0 && packets == 0 && messages == 0 {
            return;
        }
        self.traffic.push(TrafficSample {
            tick: now,
            bytes_out: bytes,
            packets_out: packets,
            messages_out: messages,
            ..TrafficSample::default()
        });
    }

    pub fn add_inbound(&mut self, now: Tick, bytes: u64, packets: u64, messages: u64) {
        if bytes == 0 && packets == 0 && messages == 0 {
            return;
        }
        self.traffic.push(TrafficSample {
            tick: now,
            bytes_in: bytes,
            packets_in: packets,
            messages_in: messages,
            ..TrafficSample::default()
        });
    }

    /// The next ping id: one past the most recently sent one, starting over at 1.
    pub fn next_ping_id(&self) -> u8 {
        self.ping
            .last()
            .map(|p| p.ping_id.wrapping_add(1))
            .unwrap_or(1)
    }

    pub fn record_ping_sent(&mut self, ping_id: u8, now: Tick) {
        self.ping.push(PingSample {
            ping_id,
            sent_tick: now,
            reply_tick: 0,
            reply_received: false,
        });
    }

    /// Matches a ping reply against the oldest unanswered request with this id. Returns the
    ///  measured round-trip ticks, or `None` for an unmatched reply.
    pub fn record_ping_reply(&mut self, ping_id: u8, now: Tick) -> Option<u64> {
        let sample = self
            .ping
            .iter_mut()
            .find(|p| p.ping_id == ping_id && !p.reply_received)?;
        sample.reply_received = true;
        sample.reply_tick = now;
        Some(clock::ticks_in_between(now, sample.sent_tick))
    }

    /// Prunes entries beyond the stats window and derives rates from what remains.
    pub fn refresh(&mut self, now: Tick) -> ConnectionRates {
        let oldest_allowed = now.wrapping_sub(SAMPLE_MAX_AGE_TICKS);
        self.traffic
            .retain(|s| clock::is_newer(s.tick, oldest_allowed));
        self.ping
            .retain(|p| clock::is_newer(p.sent_tick, oldest_allowed));

        if self.traffic.len() <= 1 {
            return ConnectionRates::default();
        }

        let mut totals = TrafficSample::default();
        for sample in &self.traffic {
            totals.bytes_in += sample.bytes_in;
            totals.bytes_out += sample.bytes_out;
            totals.packets_in += sample.packets_in;
            totals.packets_out += sample.packets_out;
            totals.messages_in += sample.messages_in;
            totals.messages_out += sample.messages_out;
        }

        let span_ticks = clock::ticks_in_between(
            self.traffic.last().expect("len checked above").tick,
            self.traffic.first().expect("len checked above").tick,
        );
        if span_ticks == 0 {
            return ConnectionRates::default();
        }
        let secs = span_ticks as f64 / TICKS_PER_SEC as f64;

        ConnectionRates {
            bytes_in_per_sec: totals.bytes_in as f64 / secs,
            bytes_out_per_sec: totals.bytes_out as f64 / secs,
            packets_in_per_sec: totals.packets_in as f64 / secs,
            packets_out_per_sec: totals.packets_out as f64 / secs,
            messages_in_per_sec: totals.messages_in as f64 / secs,
            messages_out_per_sec: totals.messages_out as f64 / secs,
        }
    }

    pub fn clear(&mut self) {
        self.traffic.clear();
        self.ping.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TICKS_PER_MS;

    #[test]
    fn test_rates_over_window() {
        let mut stats = ConnectionStatistics::new();
        stats.add_outbound(0, 1000, 1, 10);
        stats.add_outbound(TICKS_PER_SEC, 1000, 1, 10);
        stats.add_inbound(2 * TICKS_PER_SEC, 500, 2, 4);

        let rates = stats.refresh(2 * TICKS_PER_SEC);
        assert_eq!(rates.bytes_out_per_sec, 1000.0);
        assert_eq!(rates.packets_out_per_sec, 1.0);
        assert_eq!(rates.messages_out_per_sec, 10.0);
        assert_eq!(rates.bytes_in_per_sec, 250.0);
        assert_eq!(rates.packets_in_per_sec, 1.0);
    }

    #[test]
    fn test_single_sample_yields_no_rates() {
        let mut stats = ConnectionStatistics::new();
        stats.add_outbound(0, 1000, 1, 1);
        assert_eq!(stats.refresh(0), ConnectionRates::default());
    }

    #[test]
    fn test_empty_samples_are_not_recorded() {
        let mut stats = ConnectionStatistics::new();
        stats.add_outbound(0, 0, 0, 0);
        stats.add_inbound(0, 0, 0, 0);
        assert!(stats.traffic.is_empty());
    }

    #[test]
    fn test_old_samples_pruned_on_refresh() {
        let mut stats = ConnectionStatistics::new();
        stats.add_outbound(0, 1000, 1, 1);
        stats.add_outbound(TICKS_PER_SEC, 1000, 1, 1);

        stats.refresh(6 * TICKS_PER_SEC + 1);
        assert!(stats.traffic.is_empty());
    }

    #[test]
    fn test_ping_ids_increment_and_wrap() {
        let mut stats = ConnectionStatistics::new();
        assert_eq!(stats.next_ping_id(), 1);

        stats.record_ping_sent(1, 0);
        assert_eq!(stats.next_ping_id(), 2);

        stats.record_ping_sent(255, 0);
        assert_eq!(stats.next_ping_id(), 0);
    }

    #[test]
    fn test_ping_reply_matching() {
        let mut stats = ConnectionStatistics::new();
        stats.record_ping_sent(1, 1000);

        assert_eq!(stats.record_ping_reply(2, 2000), None);
        assert_eq!(
            stats.record_ping_reply(1, 1000 + 50 * TICKS_PER_MS),
            Some(50 * TICKS_PER_MS)
        );
        // a second reply with the same id finds no unanswered request
        assert_eq!(stats.record_ping_reply(1, 3000), None);
    }
}
