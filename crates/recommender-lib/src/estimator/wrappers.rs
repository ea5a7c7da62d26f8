//! Estimators that adjust the result of an inner estimator

use super::{ResourceEstimator, SharedEstimator};
use crate::model::AggregateContainerState;
use crate::models::{ResourceAmount, Resources};

/// Adds `fraction` of each estimated amount on top of it
#[derive(Debug, Clone)]
pub struct MarginEstimator {
    fraction: f64,
    base: SharedEstimator,
}

impl MarginEstimator {
    pub fn new(fraction: f64, base: SharedEstimator) -> Self {
        Self { fraction, base }
    }
}

impl ResourceEstimator for MarginEstimator {
    fn estimate(&self, state: &AggregateContainerState) -> Resources {
        self.base
            .estimate(state)
            .into_iter()
            .map(|(resource, amount)| (resource, amount.saturating_add(amount.scale(self.fraction))))
            .collect()
    }
}

/// Raises each estimated amount to at least the configured minimum
#[derive(Debug, Clone)]
pub struct MinResourcesEstimator {
    min_resources: Resources,
    base: SharedEstimator,
}

impl MinResourcesEstimator {
    pub fn new(min_resources: Resources, base: SharedEstimator) -> Self {
        Self {
            min_resources,
            base,
        }
    }
}

impl ResourceEstimator for MinResourcesEstimator {
    fn estimate(&self, state: &AggregateContainerState) -> Resources {
        self.base
            .estimate(state)
            .into_iter()
            .map(|(resource, amount)| {
                let floor = self.min_resources.get(&resource).copied().unwrap_or_default();
                (resource, amount.max(floor))
            })
            .collect()
    }
}

/// Scales estimates by `(1 + multiplier / confidence) ^ exponent`.
///
/// With a positive exponent short histories inflate the estimate, with a
/// negative one they deflate it. Zero confidence gives the maximum amount
/// or zero respectively.
#[derive(Debug, Clone)]
pub struct ConfidenceMultiplierEstimator {
    multiplier: f64,
    exponent: f64,
    base: SharedEstimator,
}

impl ConfidenceMultiplierEstimator {
    pub fn new(multiplier: f64, exponent: f64, base: SharedEstimator) -> Self {
        Self {
            multiplier,
            exponent,
            base,
        }
    }

    fn factor(&self, confidence: f64) -> f64 {
        (1.0 + self.multiplier / confidence).powf(self.exponent)
    }
}

impl ResourceEstimator for ConfidenceMultiplierEstimator {
    fn estimate(&self, state: &AggregateContainerState) -> Resources {
        let factor = self.factor(state.confidence());
        self.base
            .estimate(state)
            .into_iter()
            .map(|(resource, amount)| (resource, scale_saturating(amount, factor)))
            .collect()
    }
}

fn scale_saturating(amount: ResourceAmount, factor: f64) -> ResourceAmount {
    if amount.is_zero() {
        // 0 × ∞ is NaN; nothing to scale either way
        return amount;
    }
    amount.scale(factor)
}
