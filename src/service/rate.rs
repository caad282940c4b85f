use std::time::Instant;

/// Transfer rates since the previous sample.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct DataRate {
    pub bytes_in_per_sec: f64,
    pub bytes_out_per_sec: f64,
    pub pdus_in_per_sec: f64,
    pub pdus_out_per_sec: f64,
}

#[derive(Debug, Default, Copy, Clone)]
struct Counters {
    bytes_in: u64,
    bytes_out: u64,
    pdus_in: u64,
    pdus_out: u64,
}

#[derive(Debug)]
pub(crate) struct RateCounter {
    totals: Counters,
    sampled: Counters,
    sampled_at: Instant,
}

impl Default for RateCounter {
    fn default() -> Self {
        Self {
            totals: Counters::default(),
            sampled: Counters::default(),
            sampled_at: Instant::now(),
        }
    }
}

impl RateCounter {
    pub fn record_in(&mut self, len: usize) {
        self.totals.bytes_in += len as u64;
        self.totals.pdus_in += 1;
    }

    pub fn record_out(&mut self, len: usize) {
        self.totals.bytes_out += len as u64;
        self.totals.pdus_out += 1;
    }

    pub fn sample(&mut self) -> DataRate {
        self.sample_at(Instant::now())
    }

    fn sample_at(&mut self, now: Instant) -> DataRate {
        let elapsed = now.duration_since(self.sampled_at).as_secs_f64();
        let delta = |total: u64, sampled: u64| {
            if elapsed > 0.0 {
                (total - sampled) as f64 / elapsed
            } else {
                0.0
            }
        };
        let rate = DataRate {
            bytes_in_per_sec: delta(self.totals.bytes_in, self.sampled.bytes_in),
            bytes_out_per_sec: delta(self.totals.bytes_out, self.sampled.bytes_out),
            pdus_in_per_sec: delta(self.totals.pdus_in, self.sampled.pdus_in),
            pdus_out_per_sec: delta(self.totals.pdus_out, self.sampled.pdus_out),
        };
        self.sampled = self.totals;
        self.sampled_at = now;
        rate
    }
}
