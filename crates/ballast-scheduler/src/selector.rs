//! Source/target selection for balancing moves.

use std::cmp::Ordering;

use ballast_core::{Config, ResourceKind};

use crate::filter::{Filter, exclude_source, exclude_target};
use crate::runtime::{ContainerRuntime, distinct_score};

/// Scores closer than this are treated as equal.
pub(crate) const SCORE_EPSILON: f64 = 1e-9;

/// Picks the most loaded source and the least loaded target for one
/// resource kind.
pub struct BalanceSelector {
    kind: ResourceKind,
    filters: Vec<Box<dyn Filter>>,
}

impl BalanceSelector {
    pub fn new(kind: ResourceKind, filters: Vec<Box<dyn Filter>>) -> Self {
        Self { kind, filters }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Highest score wins; ties go to the lower distinct score against
    /// `placement`, then to the lower id.
    pub fn select_source<'a>(
        &self,
        cfg: &Config,
        candidates: &[&'a ContainerRuntime],
        placement: &[&ContainerRuntime],
        extra: &[&dyn Filter],
    ) -> Option<&'a ContainerRuntime> {
        self.select(
            cfg,
            candidates,
            placement,
            |c| self.excluded(cfg, c, extra, exclude_source),
            |a, b| {
                cmp_score(b.0, a.0)
                    .then_with(|| cmp_score(a.1, b.1))
                    .then_with(|| a.2.cmp(&b.2))
            },
        )
    }

    /// Lowest score wins; ties go to the higher distinct score against
    /// `placement`, then to the lower id.
    pub fn select_target<'a>(
        &self,
        cfg: &Config,
        candidates: &[&'a ContainerRuntime],
        placement: &[&ContainerRuntime],
        extra: &[&dyn Filter],
    ) -> Option<&'a ContainerRuntime> {
        self.select(
            cfg,
            candidates,
            placement,
            |c| self.excluded(cfg, c, extra, exclude_target),
            |a, b| {
                cmp_score(a.0, b.0)
                    .then_with(|| cmp_score(b.1, a.1))
                    .then_with(|| a.2.cmp(&b.2))
            },
        )
    }

    /// Whether `container` passes this selector's filters and `extra` as a source.
    pub fn accepts_source(&self, cfg: &Config, container: &ContainerRuntime, extra: &[&dyn Filter]) -> bool {
        !self.excluded(cfg, container, extra, exclude_source)
    }

    fn excluded(
        &self,
        cfg: &Config,
        container: &ContainerRuntime,
        extra: &[&dyn Filter],
        exclude: fn(&[&dyn Filter], &Config, &ContainerRuntime) -> bool,
    ) -> bool {
        let own: Vec<&dyn Filter> = self.filters.iter().map(|f| f.as_ref()).collect();
        exclude(&own, cfg, container) || exclude(extra, cfg, container)
    }

    /// Return the candidate ordered first by `order` among those not
    /// `excluded`. Keys are `(score, distinct score, id)`.
    fn select<'a>(
        &self,
        cfg: &Config,
        candidates: &[&'a ContainerRuntime],
        placement: &[&ContainerRuntime],
        excluded: impl Fn(&ContainerRuntime) -> bool,
        order: impl Fn(&(f64, f64, u64), &(f64, f64, u64)) -> Ordering,
    ) -> Option<&'a ContainerRuntime> {
        candidates
            .iter()
            .copied()
            .filter(|c| !excluded(c))
            .map(|c| {
                let key = (
                    c.score(self.kind),
                    distinct_score(&cfg.location_labels, placement, c),
                    c.id(),
                );
                (key, c)
            })
            .min_by(|a, b| order(&a.0, &b.0))
            .map(|(_, c)| c)
    }
}

/// Total order on scores treating values within epsilon as equal.
fn cmp_score(a: f64, b: f64) -> Ordering {
    if (a - b).abs() < SCORE_EPSILON {
        Ordering::Equal
    } else if a < b {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}
