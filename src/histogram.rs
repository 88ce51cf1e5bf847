//! Quantile histograms with bounded memory.
//!
//! A [`Histogram`] accepts unsigned 64-bit observations and keeps at most
//! [`MAX_BUCKETS`] variable-width buckets, merging neighbors when it fills
//! up. Reads interpolate within buckets, which makes rank queries and the
//! robust statistics built on them (trimean, IQR, six-sigma outlier
//! detection) approximate but stable under compaction.

/// Upper bound on the number of buckets a histogram retains.
pub const MAX_BUCKETS: usize = 256;

/// A bucket's span is stored in 40 bits.
const MAX_SPAN: u64 = (1 << 40) - 1;

/// A bucket's population is stored in 24 bits.
const MAX_COUNT: u32 = (1 << 24) - 1;

/// IQR-to-sigma scale for a normal distribution: `2·√2·erfc⁻¹(0.5)`.
const IQR_TO_SIGMA: f64 = 1.356_231_151_912_69;

/// Tail mass beyond ±6σ of a normal distribution.
const SIX_SIGMA_TAIL: f64 = 9.87e-10;

const SPARK_GLYPHS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// One bucket: `count` observations spread over `[min, min + span]`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Bucket {
    min: u64,
    span: u64,
    count: u32,
}

impl Bucket {
    fn single(observation: u64) -> Bucket {
        Bucket {
            min: observation,
            span: 0,
            count: 1,
        }
    }

    fn max(&self) -> u64 {
        self.min + self.span
    }
}

/// Rounding integer division.
fn div_round(numerator: u64, denominator: u64) -> u64 {
    (numerator + denominator / 2) / denominator
}

/// A bounded-memory histogram over `u64` observations.
///
/// ```
/// use scopeprof::Histogram;
///
/// let mut h = Histogram::new();
/// for v in [12, 15, 11, 14, 13, 900] {
///     h.add(v);
/// }
/// assert_eq!(h.count(), 6);
/// assert!(h.trimean() < 20.0);
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Histogram {
    buckets: Vec<Bucket>,
    total: u64,
}

impl Histogram {
    /// Construct an empty histogram.
    pub fn new() -> Histogram {
        Histogram::default()
    }

    /// Record one observation.
    pub fn add(&mut self, observation: u64) {
        self.buckets.push(Bucket::single(observation));
        self.total += 1;
        if self.buckets.len() >= MAX_BUCKETS {
            self.compact();
        }
    }

    /// Total number of observations recorded.
    pub fn count(&self) -> u64 {
        self.total
    }

    /// Merge buckets until strictly fewer than [`MAX_BUCKETS`] remain.
    ///
    /// Buckets are sorted by lower bound, then swept left to right; the
    /// current bucket merges into its left neighbor when the neighbor holds
    /// fewer than `1 + round(count / MAX_BUCKETS)` observations or their
    /// ranges overlap. Calling this twice in a row is a no-op the second
    /// time: after one pass every bucket but the last has reached the
    /// target population and neighbors no longer overlap.
    pub fn compact(&mut self) {
        if self.buckets.len() < 2 {
            return;
        }
        self.buckets.sort_unstable_by_key(|b| (b.min, b.span));
        let target = 1 + div_round(self.total, MAX_BUCKETS as u64);

        let mut merged: Vec<Bucket> = Vec::with_capacity(self.buckets.len() / 2 + 1);
        for bucket in self.buckets.drain(..) {
            match merged.last_mut() {
                Some(prev) if (prev.count as u64) < target || prev.max() >= bucket.min => {
                    let min = prev.min.min(bucket.min);
                    let max = prev.max().max(bucket.max());
                    let count = prev.count as u64 + bucket.count as u64;
                    debug_assert!(
                        count <= MAX_COUNT as u64,
                        "{}",
                        crate::error::Error::HistogramOverflow
                    );
                    prev.min = min;
                    prev.span = (max - min).min(MAX_SPAN);
                    prev.count = count.min(MAX_COUNT as u64) as u32;
                }
                _ => merged.push(bucket),
            }
        }
        self.buckets = merged;
        debug_assert!(self.buckets.len() < MAX_BUCKETS);
    }

    /// The observation at global rank `rank` (1-based, `1 ≤ rank ≤ count`),
    /// interpolated linearly inside the containing bucket.
    pub fn by_rank(&mut self, rank: u64) -> u64 {
        if self.total == 0 {
            return 0;
        }
        self.compact();
        let rank = rank.clamp(1, self.total);

        let mut remaining = rank;
        for bucket in &self.buckets {
            let population = bucket.count as u64;
            if remaining <= population {
                return if bucket.count == 1 {
                    bucket.min
                } else {
                    bucket.min + (remaining - 1) * bucket.span / (population - 1)
                };
            }
            remaining -= population;
        }
        // Unreachable while Σ count == total holds.
        self.buckets.last().map(Bucket::max).unwrap_or(0)
    }

    fn quartile_ranks(&self) -> (u64, u64, u64) {
        let q1 = div_round(self.total, 4).max(1);
        let q2 = div_round(self.total, 2);
        (q1, q2, q1 + q2)
    }

    /// Tukey's trimean, `(Q1 + 2·Q2 + Q3) / 4`.
    ///
    /// With fewer than four observations this degenerates to a single rank:
    /// the sole observation, the lower of two, or the median of three.
    pub fn trimean(&mut self) -> f64 {
        match self.total {
            0 => 0.0,
            1 | 2 => self.by_rank(1) as f64,
            3 => self.by_rank(2) as f64,
            _ => {
                let (r1, r2, r3) = self.quartile_ranks();
                let q1 = self.by_rank(r1) as f64;
                let q2 = self.by_rank(r2) as f64;
                let q3 = self.by_rank(r3) as f64;
                (q1 + 2.0 * q2 + q3) / 4.0
            }
        }
    }

    /// Interquartile range, `Q3 − Q1`.
    pub fn iqr(&mut self) -> f64 {
        match self.total {
            0 | 1 => 0.0,
            2 => (self.by_rank(2) - self.by_rank(1)) as f64,
            3 => (self.by_rank(3) - self.by_rank(1)) as f64,
            _ => {
                let (r1, _, r3) = self.quartile_ranks();
                self.by_rank(r3) as f64 - self.by_rank(r1) as f64
            }
        }
    }

    /// Robust standard-deviation estimate: IQR scaled to σ for a normal
    /// distribution.
    pub fn std_dev_estimate(&mut self) -> f64 {
        self.iqr() / IQR_TO_SIGMA
    }

    /// Signal-to-noise ratio in decibels, clamped to `0..=99`.
    ///
    /// A trimean of zero is treated as 1, and a σ estimate below 1 as 1, so
    /// the ratio stays defined for degenerate distributions.
    pub fn snr_db(&mut self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let signal = match self.trimean() {
            t if t == 0.0 => 1.0,
            t => t,
        };
        let noise = self.std_dev_estimate().max(1.0);
        (10.0 * ((signal * signal) / (noise * noise)).log10()).clamp(0.0, 99.0)
    }

    /// Observations at or below `limit`, apportioning bucket populations by
    /// the same linear interpolation as [`by_rank`](Histogram::by_rank).
    fn population_at_or_below(&self, limit: f64) -> u64 {
        let mut population = 0;
        for bucket in &self.buckets {
            let count = bucket.count as u64;
            if (bucket.max() as f64) <= limit {
                population += count;
            } else if (bucket.min as f64) <= limit && bucket.span > 0 {
                let fraction = (limit - bucket.min as f64) / bucket.span as f64;
                population += (fraction * (count - 1) as f64).floor() as u64 + 1;
            }
        }
        population
    }

    /// Observations at or above `limit`; the mirror of
    /// [`population_at_or_below`](Histogram::population_at_or_below).
    fn population_at_or_above(&self, limit: f64) -> u64 {
        let mut population = 0;
        for bucket in &self.buckets {
            let count = bucket.count as u64;
            if (bucket.min as f64) >= limit {
                population += count;
            } else if (bucket.max() as f64) >= limit && bucket.span > 0 {
                let fraction = (limit - bucket.min as f64) / bucket.span as f64;
                let below = (fraction * (count - 1) as f64).ceil() as u64;
                population += count - below.min(count);
            }
        }
        population
    }

    /// Six-sigma outlier test.
    ///
    /// Returns `(low, high)`: whether the number of observations at or
    /// beyond six σ estimates below/above the trimean exceeds the count a
    /// normal distribution of this size would put in each tail.
    pub fn has_outliers(&mut self) -> (bool, bool) {
        if self.total == 0 {
            return (false, false);
        }
        let center = self.trimean();
        let six_sigma = 6.0 * self.std_dev_estimate();
        let expected = (self.total as f64 * SIX_SIGMA_TAIL).round() as u64;

        let low_values = self.population_at_or_below(center - six_sigma);
        let high_values = self.population_at_or_above(center + six_sigma);
        (low_values > expected, high_values > expected)
    }

    /// A `width`-character textual chart of the distribution.
    ///
    /// Each character encodes the population landing at that horizontal
    /// position across the observed range, normalized to the tallest column
    /// by rounding division. An empty histogram yields an empty string.
    pub fn sparkline(&mut self, width: usize) -> String {
        if self.total == 0 || width == 0 {
            return String::new();
        }
        self.compact();

        let low = self.buckets[0].min;
        let high = self.buckets.last().map(Bucket::max).unwrap_or(low);
        let range = (high - low).max(1);

        let mut columns = vec![0_u64; width];
        for bucket in &self.buckets {
            let midpoint = bucket.min + bucket.span / 2;
            let column =
                ((midpoint - low) as u128 * (width as u128 - 1) / range as u128) as usize;
            columns[column.min(width - 1)] += bucket.count as u64;
        }

        let peak = columns.iter().copied().max().unwrap_or(1).max(1);
        columns
            .iter()
            .map(|&height| {
                let level = div_round(height * (SPARK_GLYPHS.len() as u64 - 1), peak);
                SPARK_GLYPHS[level as usize]
            })
            .collect()
    }

    #[cfg(test)]
    fn bucket_population(&self) -> u64 {
        self.buckets.iter().map(|b| b.count as u64).sum()
    }
}
