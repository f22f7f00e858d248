//! Container filters applied while choosing a source or target.
//!
//! A filter returns `true` to exclude a container. Filters compose by
//! logical OR: a container is usable only if no filter excludes it.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use ballast_core::{Config, ContainerId};

use crate::runtime::{ContainerRuntime, distinct_score};

pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    /// Exclude `container` as the origin of a move.
    fn filter_source(&self, cfg: &Config, container: &ContainerRuntime) -> bool;

    /// Exclude `container` as the destination of a move.
    fn filter_target(&self, cfg: &Config, container: &ContainerRuntime) -> bool;
}

/// True if any filter excludes `container` as a source.
pub fn exclude_source(
    filters: &[&dyn Filter],
    cfg: &Config,
    container: &ContainerRuntime,
) -> bool {
    filters.iter().any(|f| f.filter_source(cfg, container))
}

/// True if any filter excludes `container` as a target.
pub fn exclude_target(
    filters: &[&dyn Filter],
    cfg: &Config,
    container: &ContainerRuntime,
) -> bool {
    filters.iter().any(|f| f.filter_target(cfg, container))
}

/// Excludes containers an operator has blocked.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockFilter;

impl Filter for BlockFilter {
    fn name(&self) -> &str {
        "block-filter"
    }

    fn filter_source(&self, _cfg: &Config, container: &ContainerRuntime) -> bool {
        container.is_blocked()
    }

    fn filter_target(&self, _cfg: &Config, container: &ContainerRuntime) -> bool {
        container.is_blocked()
    }
}

/// Excludes containers that are not `Up`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StateFilter;

impl Filter for StateFilter {
    fn name(&self) -> &str {
        "state-filter"
    }

    fn filter_source(&self, _cfg: &Config, container: &ContainerRuntime) -> bool {
        !container.is_up()
    }

    fn filter_target(&self, _cfg: &Config, container: &ContainerRuntime) -> bool {
        !container.is_up()
    }
}

/// Excludes containers whose last heartbeat is older than
/// `max_allow_container_down_duration`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HealthFilter {
    /// Fixed clock in unix seconds; the system clock when unset.
    now: Option<u64>,
}

impl HealthFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate heartbeats against a fixed clock.
    pub fn at(now_secs: u64) -> Self {
        Self {
            now: Some(now_secs),
        }
    }

    fn is_down(&self, cfg: &Config, container: &ContainerRuntime) -> bool {
        let now = self.now.unwrap_or_else(epoch_secs);
        container.down_secs(now) > cfg.max_allow_container_down_duration.as_secs()
    }
}

impl Filter for HealthFilter {
    fn name(&self) -> &str {
        "health-filter"
    }

    fn filter_source(&self, cfg: &Config, container: &ContainerRuntime) -> bool {
        self.is_down(cfg, container)
    }

    fn filter_target(&self, cfg: &Config, container: &ContainerRuntime) -> bool {
        self.is_down(cfg, container)
    }
}

/// Excludes targets at or above `min_available_storage_used_rate`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StorageThresholdFilter;

impl Filter for StorageThresholdFilter {
    fn name(&self) -> &str {
        "storage-threshold-filter"
    }

    fn filter_source(&self, _cfg: &Config, _container: &ContainerRuntime) -> bool {
        false
    }

    fn filter_target(&self, cfg: &Config, container: &ContainerRuntime) -> bool {
        container.meta().storage_used_rate >= cfg.min_available_storage_used_rate
    }
}

/// Excludes explicit container ids, separately for sources and targets.
#[derive(Debug, Default, Clone)]
pub struct ExcludedFilter {
    sources: HashSet<ContainerId>,
    targets: HashSet<ContainerId>,
}

impl ExcludedFilter {
    pub fn new(
        sources: impl IntoIterator<Item = ContainerId>,
        targets: impl IntoIterator<Item = ContainerId>,
    ) -> Self {
        Self {
            sources: sources.into_iter().collect(),
            targets: targets.into_iter().collect(),
        }
    }

    /// Exclude the same ids in both roles.
    pub fn both(ids: impl IntoIterator<Item = ContainerId>) -> Self {
        let ids: HashSet<ContainerId> = ids.into_iter().collect();
        Self {
            sources: ids.clone(),
            targets: ids,
        }
    }
}

impl Filter for ExcludedFilter {
    fn name(&self) -> &str {
        "excluded-filter"
    }

    fn filter_source(&self, _cfg: &Config, container: &ContainerRuntime) -> bool {
        self.sources.contains(&container.id())
    }

    fn filter_target(&self, _cfg: &Config, container: &ContainerRuntime) -> bool {
        self.targets.contains(&container.id())
    }
}

/// Excludes targets that would place a replica less diversely than the
/// container it replaces.
#[derive(Debug, Clone)]
pub struct DistinctScoreFilter {
    labels: Vec<String>,
    /// Containers keeping their replica, without the one being replaced.
    placement: Vec<ContainerRuntime>,
    safe_score: f64,
}

impl DistinctScoreFilter {
    pub fn new(labels: &[String], placement: &[&ContainerRuntime], source: &ContainerRuntime) -> Self {
        let kept: Vec<ContainerRuntime> = placement
            .iter()
            .filter(|c| c.id() != source.id())
            .map(|c| (*c).clone())
            .collect();
        let refs: Vec<&ContainerRuntime> = kept.iter().collect();
        let safe_score = distinct_score(labels, &refs, source);
        Self {
            labels: labels.to_vec(),
            placement: kept,
            safe_score,
        }
    }
}

impl Filter for DistinctScoreFilter {
    fn name(&self) -> &str {
        "distinct-filter"
    }

    fn filter_source(&self, _cfg: &Config, _container: &ContainerRuntime) -> bool {
        false
    }

    fn filter_target(&self, _cfg: &Config, container: &ContainerRuntime) -> bool {
        let refs: Vec<&ContainerRuntime> = self.placement.iter().collect();
        distinct_score(&self.labels, &refs, container) < self.safe_score
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_core::{Container, ContainerState};
    use std::time::Duration;

    fn container(id: ContainerId) -> Container {
        let mut c = Container::new(id, format!("10.0.0.{id}:20160"));
        c.last_heartbeat = 1_000;
        c
    }

    fn rt(c: Container) -> ContainerRuntime {
        ContainerRuntime::new(c)
    }

    #[test]
    fn block_and_state_filters() {
        let cfg = Config::default();
        let mut blocked = container(1);
        blocked.blocked = true;
        let mut offline = container(2);
        offline.state = ContainerState::Offline;
        let healthy = container(3);

        assert!(BlockFilter.filter_source(&cfg, &rt(blocked.clone())));
        assert!(BlockFilter.filter_target(&cfg, &rt(blocked)));
        assert!(StateFilter.filter_target(&cfg, &rt(offline)));
        assert!(!StateFilter.filter_source(&cfg, &rt(healthy.clone())));
        assert!(!BlockFilter.filter_source(&cfg, &rt(healthy)));
    }

    #[test]
    fn health_filter_uses_down_duration() {
        let mut cfg = Config::default();
        cfg.max_allow_container_down_duration = Duration::from_secs(60);
        let c = rt(container(1));

        assert!(!HealthFilter::at(1_060).filter_source(&cfg, &c));
        assert!(HealthFilter::at(1_061).filter_source(&cfg, &c));
        assert!(HealthFilter::at(1_061).filter_target(&cfg, &c));
    }

    #[test]
    fn storage_threshold_only_applies_to_targets() {
        let cfg = Config::default();
        let mut full = container(1);
        full.storage_used_rate = cfg.min_available_storage_used_rate;
        let full = rt(full);

        assert!(StorageThresholdFilter.filter_target(&cfg, &full));
        assert!(!StorageThresholdFilter.filter_source(&cfg, &full));
    }

    #[test]
    fn excluded_filter_roles() {
        let cfg = Config::default();
        let filter = ExcludedFilter::new([1], [2]);
        assert!(filter.filter_source(&cfg, &rt(container(1))));
        assert!(!filter.filter_target(&cfg, &rt(container(1))));
        assert!(filter.filter_target(&cfg, &rt(container(2))));

        let both = ExcludedFilter::both([3]);
        assert!(both.filter_source(&cfg, &rt(container(3))));
        assert!(both.filter_target(&cfg, &rt(container(3))));
    }

    #[test]
    fn composition_is_any() {
        let cfg = Config::default();
        let excluded = ExcludedFilter::both([2]);
        let filters: [&dyn Filter; 2] = [&BlockFilter, &excluded];
        assert!(!exclude_source(&filters, &cfg, &rt(container(1))));
        assert!(exclude_source(&filters, &cfg, &rt(container(2))));
        assert!(exclude_target(&filters, &cfg, &rt(container(2))));
    }

    #[test]
    fn distinct_filter_rejects_less_diverse_target() {
        let cfg = Config::default();
        let labels = vec!["zone".to_string()];
        let zoned = |id, zone: &str| rt(container(id).with_label("zone", zone));

        let placed = [zoned(1, "z1"), zoned(2, "z2"), zoned(3, "z3")];
        let placement: Vec<&ContainerRuntime> = placed.iter().collect();
        let filter = DistinctScoreFilter::new(&labels, &placement, &placed[2]);

        assert!(filter.filter_target(&cfg, &zoned(4, "z1")));
        assert!(!filter.filter_target(&cfg, &zoned(5, "z4")));
        assert!(!filter.filter_source(&cfg, &zoned(4, "z1")));
    }
}
