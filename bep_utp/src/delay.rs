/// Number of buckets in the sliding base delay window.
const NUM_BUCKETS: usize = 60;

/// Microseconds each bucket covers, the window spans about a minute.
const BUCKET_SPAN_MICROS: u64 = 1_000_000;

/// Samples the current delay is minimized over.
const CUR_SAMPLES: usize = 3;

/// Sliding minimum tracker for one way delay samples.
///
/// The base delay is the minimum over roughly the last minute, bucketed in
/// sixty one second slots; subtracting it from raw samples cancels the
/// clock skew between the two hosts. The current delay is the minimum of
/// the last three adjusted samples, which filters isolated spikes without
/// hiding a standing queue.
pub struct DelayHistory {
    buckets: [u32; NUM_BUCKETS],
    bucket_index: usize,
    bucket_started: u64,
    current: [u32; CUR_SAMPLES],
    current_index: usize,
    has_samples: bool,
}

impl DelayHistory {
    pub fn new() -> DelayHistory {
        DelayHistory {
            buckets: [u32::max_value(); NUM_BUCKETS],
            bucket_index: 0,
            bucket_started: 0,
            current: [u32::max_value(); CUR_SAMPLES],
            current_index: 0,
            has_samples: false,
        }
    }

    /// Record a raw delay sample taken at the given monotonic time.
    pub fn add_sample(&mut self, sample: u32, now_micros: u64) {
        if !self.has_samples {
            self.bucket_started = now_micros;
            self.has_samples = true;
        }

        // Rotate buckets forward to the current time slot.
        while now_micros.saturating_sub(self.bucket_started) >= BUCKET_SPAN_MICROS {
            self.bucket_index = (self.bucket_index + 1) % NUM_BUCKETS;
            self.buckets[self.bucket_index] = u32::max_value();
            self.bucket_started += BUCKET_SPAN_MICROS;
        }

        if sample < self.buckets[self.bucket_index] {
            self.buckets[self.bucket_index] = sample;
        }

        let adjusted = sample.saturating_sub(self.base());
        self.current[self.current_index] = adjusted;
        self.current_index = (self.current_index + 1) % CUR_SAMPLES;
    }

    /// Minimum over the sliding window, the presumed fixed path delay.
    pub fn base(&self) -> u32 {
        let base = *self.buckets.iter().min().expect("bep_utp: DelayHistory Has No Buckets");

        if base == u32::max_value() {
            0
        } else {
            base
        }
    }

    /// Minimum of the last three base adjusted samples.
    pub fn queuing_delay(&self) -> u32 {
        let delay = *self.current.iter().min().expect("bep_utp: DelayHistory Has No Samples");

        if delay == u32::max_value() {
            0
        } else {
            delay
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DelayHistory;

    #[test]
    fn positive_base_tracks_minimum() {
        let mut history = DelayHistory::new();

        history.add_sample(5000, 0);
        history.add_sample(3000, 100);
        history.add_sample(8000, 200);

        assert_eq!(3000, history.base());
    }

    #[test]
    fn positive_queuing_delay_subtracts_base() {
        let mut history = DelayHistory::new();

        history.add_sample(3000, 0);
        history.add_sample(7000, 100);
        history.add_sample(9000, 200);

        // Last three adjusted samples are 0, 4000, and 6000.
        assert_eq!(0, history.queuing_delay());

        history.add_sample(7500, 300);
        // Now 4000, 6000, 4500.
        assert_eq!(4000, history.queuing_delay());
    }

    #[test]
    fn positive_base_expires_with_window() {
        let mut history = DelayHistory::new();

        history.add_sample(1000, 0);
        // A minute later the old minimum has rotated out.
        history.add_sample(5000, 61_000_000);

        assert_eq!(5000, history.base());
    }
}
