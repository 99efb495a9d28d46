/// Minimum number of samples before the 1% low is a real percentile.
///
/// Below this the worst single sample is reported instead; a percentile of
/// a handful of samples is noise.
const MIN_SAMPLES_FOR_PERCENTILE: usize = 10;

/// Round a reported statistic to one decimal place
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Fixed-capacity rolling buffer of FPS/frametime samples with
/// overwrite-oldest semantics and smoothness statistics.
///
/// Backed by a flat array with head/count indices: `add` is O(1) and never
/// fails; once full, the oldest sample is overwritten. The owner serializes
/// all mutation through its own lock; the buffer itself is not shared.
pub struct RollingStatsBuffer {
    buffer: Vec<f64>,
    head: usize,
    count: usize,
    capacity: usize,
}

impl RollingStatsBuffer {
    /// Create a buffer holding at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        if capacity == 0 {
            panic!("Rolling buffer capacity must be greater than 0");
        }

        Self {
            buffer: vec![0.0; capacity],
            head: 0,
            count: 0,
            capacity,
        }
    }

    /// Append a sample, overwriting the oldest once the buffer is full
    pub fn add(&mut self, value: f64) {
        self.buffer[self.head] = value;
        self.head = (self.head + 1) % self.capacity;

        if self.count < self.capacity {
            self.count += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Point-in-time copy of the held samples in insertion order
    pub fn snapshot(&self) -> Vec<f64> {
        let start = if self.is_full() { self.head } else { 0 };

        (0..self.count)
            .map(|i| self.buffer[(start + i) % self.capacity])
            .collect()
    }

    /// Arithmetic mean of the held samples, rounded to 1 decimal.
    /// Returns 0.0 when empty.
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }

        let start = if self.is_full() { self.head } else { 0 };
        let sum: f64 = (0..self.count)
            .map(|i| self.buffer[(start + i) % self.capacity])
            .sum();

        round1(sum / self.count as f64)
    }

    /// Average of the worst 1% of held samples, rounded to 1 decimal.
    ///
    /// With fewer than 10 samples this degrades to the minimum sample.
    /// Otherwise the `max(1, n/100)` smallest samples are averaged.
    /// Returns 0.0 when empty.
    pub fn one_percent_low(&self) -> f64 {
        one_percent_low_of(&self.snapshot())
    }

    /// Combined (average, 1% low) snapshot
    pub fn stats(&self) -> (f64, f64) {
        (self.average(), self.one_percent_low())
    }

    /// Drop all held samples
    pub fn clear(&mut self) {
        self.head = 0;
        self.count = 0;
    }
}

/// 1%-low of an arbitrary sample slice; shared with the session accumulator,
/// which holds an unbounded ordered sequence rather than a rolling window.
pub fn one_percent_low_of(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    if samples.len() < MIN_SAMPLES_FOR_PERCENTILE {
        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        return round1(min);
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let worst_count = std::cmp::max(1, sorted.len() / 100);
    let sum: f64 = sorted[..worst_count].iter().sum();

    round1(sum / worst_count as f64)
}

/// Mean of an arbitrary sample slice, rounded to 1 decimal
pub fn average_of(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    round1(samples.iter().sum::<f64>() / samples.len() as f64)
}
