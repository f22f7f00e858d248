//! Pluggable limit and churn policy for the balancers.

use ballast_core::ResourceKind;

use crate::runtime::{ContainerRuntime, Runtime};
use crate::selector::SCORE_EPSILON;

pub trait BalancePolicy: Send + Sync {
    /// How many operators of `kind` may be in flight, at most `max`.
    fn adjust_limit(&self, rt: &Runtime, kind: ResourceKind, max: u64) -> u64;

    /// Whether moving one unit of `kind` from `source` to `target` is worth it.
    fn should_balance(&self, source: &ContainerRuntime, target: &ContainerRuntime, kind: ResourceKind) -> bool;
}

/// Limit follows the spread of the cluster; a move must shrink the gap.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBalancePolicy;

impl BalancePolicy for DefaultBalancePolicy {
    /// Population standard deviation of the per-container counts over
    /// `Up` containers, floored and clamped to `1..=max`.
    fn adjust_limit(&self, rt: &Runtime, kind: ResourceKind, max: u64) -> u64 {
        let counts: Vec<f64> = rt
            .containers()
            .into_iter()
            .filter(|c| c.is_up())
            .map(|c| c.count(kind) as f64)
            .collect();
        let limit = standard_deviation(&counts) as u64;
        limit.clamp(1, max.max(1))
    }

    /// After the move the absolute score gap between the two containers
    /// must be strictly smaller than before, and the source must start
    /// above the target.
    fn should_balance(&self, source: &ContainerRuntime, target: &ContainerRuntime, kind: ResourceKind) -> bool {
        if source.id() == target.id() || source.count(kind) == 0 {
            return false;
        }
        let before = source.score(kind) - target.score(kind);
        if before <= SCORE_EPSILON {
            return false;
        }
        let after = source.score_with_delta(kind, -1) - target.score_with_delta(kind, 1);
        after.abs() + SCORE_EPSILON < before
    }
}

fn standard_deviation(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}
