//! Histogram with exponentially decaying sample weights
//!
//! Rather than shrinking every stored weight as time passes, new samples are
//! inflated by `2^((t - reference) / half_life)`. Relative weights come out
//! the same. To keep the factors in range the reference timestamp is moved
//! forward (and stored weights scaled down) once the exponent grows past
//! `MAX_DECAY_EXPONENT`.

use super::checkpoint::HistogramCheckpoint;
use super::options::SharedOptions;
use super::weighted::Histogram;
use super::{HistogramError, HistogramResult};
use chrono::{DateTime, Duration, Utc};

/// Largest exponent applied to a sample before the reference is shifted
pub const MAX_DECAY_EXPONENT: i64 = 100;

#[derive(Debug, Clone)]
pub struct DecayingHistogram {
    histogram: Histogram,
    half_life: Duration,
    reference_timestamp: DateTime<Utc>,
}

impl DecayingHistogram {
    /// Empty histogram. The reference timestamp starts at the UNIX epoch.
    pub fn new(options: SharedOptions, half_life: Duration) -> Self {
        Self {
            histogram: Histogram::new(options),
            half_life,
            reference_timestamp: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn half_life(&self) -> Duration {
        self.half_life
    }

    pub fn reference_timestamp(&self) -> DateTime<Utc> {
        self.reference_timestamp
    }

    pub fn options(&self) -> &SharedOptions {
        self.histogram.options()
    }

    /// Underlying histogram, with weights relative to the reference timestamp
    pub fn inner(&self) -> &Histogram {
        &self.histogram
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    pub fn percentile(&self, percentile: f64) -> f64 {
        self.histogram.percentile(percentile)
    }

    pub fn add_sample(&mut self, value: f64, weight: f64, time: DateTime<Utc>) -> HistogramResult<()> {
        let factor = self.decay_factor(time);
        self.histogram.add_sample(value, weight * factor)
    }

    pub fn subtract_sample(
        &mut self,
        value: f64,
        weight: f64,
        time: DateTime<Utc>,
    ) -> HistogramResult<()> {
        let factor = self.decay_factor(time);
        self.histogram.subtract_sample(value, weight * factor)
    }

    /// Merge `other` into this histogram. Whichever side has the older
    /// reference timestamp is rescaled into the newer one's frame first.
    pub fn merge(&mut self, other: &DecayingHistogram) -> HistogramResult<()> {
        if self.half_life != other.half_life {
            return Err(HistogramError::HalfLifeMismatch);
        }
        if self.reference_timestamp < other.reference_timestamp {
            self.shift_reference_to(other.reference_timestamp);
            self.histogram.merge(&other.histogram)
        } else if other.reference_timestamp < self.reference_timestamp {
            let mut rebased = other.clone();
            rebased.shift_reference_to(self.reference_timestamp);
            self.histogram.merge(&rebased.histogram)
        } else {
            self.histogram.merge(&other.histogram)
        }
    }

    /// Same layout, half-life and reference timestamp, and equal weights
    pub fn equals(&self, other: &DecayingHistogram) -> bool {
        self.half_life == other.half_life
            && self.reference_timestamp == other.reference_timestamp
            && self.histogram.equals(&other.histogram)
    }

    pub fn save_checkpoint(&self) -> HistogramCheckpoint {
        let mut checkpoint = self.histogram.save_checkpoint();
        checkpoint.reference_timestamp = Some(self.reference_timestamp);
        checkpoint
    }

    /// Add the contents of a checkpoint, honouring its reference timestamp
    pub fn load_checkpoint(&mut self, checkpoint: &HistogramCheckpoint) -> HistogramResult<()> {
        let mut loaded = DecayingHistogram::new(self.options().clone(), self.half_life);
        loaded.histogram.load_checkpoint(checkpoint)?;
        loaded.reference_timestamp = checkpoint
            .reference_timestamp
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        self.merge(&loaded)
    }

    fn half_lives_since_reference(&self, time: DateTime<Utc>) -> f64 {
        let elapsed = (time - self.reference_timestamp).num_milliseconds() as f64;
        elapsed / self.half_life.num_milliseconds().max(1) as f64
    }

    fn decay_factor(&mut self, time: DateTime<Utc>) -> f64 {
        let exponent = self.half_lives_since_reference(time).floor() as i64;
        if exponent > MAX_DECAY_EXPONENT {
            self.shift_reference_by(exponent);
        }
        2_f64.powf(self.half_lives_since_reference(time))
    }

    /// Move the reference forward by whole half-lives
    fn shift_reference_by(&mut self, half_lives: i64) {
        self.histogram.scale(2_f64.powf(-(half_lives as f64)));
        let shift_ms = half_lives.saturating_mul(self.half_life.num_milliseconds());
        self.reference_timestamp = self
            .reference_timestamp
            .checked_add_signed(Duration::milliseconds(shift_ms))
            .unwrap_or(self.reference_timestamp);
    }

    fn shift_reference_to(&mut self, new_reference: DateTime<Utc>) {
        let half_lives = (self.reference_timestamp - new_reference).num_milliseconds() as f64
            / self.half_life.num_milliseconds().max(1) as f64;
        self.histogram.scale(2_f64.powf(half_lives));
        self.reference_timestamp = new_reference;
    }
}
