//! Load-balancing strategies over healthy service instances.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::services::coordinator::{InstanceStatus, ServiceInstance};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    WeightedRoundRobin,
    Random,
    WeightedRandom,
    LeastConnections,
}

struct BalancerState {
    round_robin_index: usize,
    connection_counts: HashMap<String, usize>,
}

pub struct LoadBalancer {
    strategy: LoadBalancingStrategy,
    state: Mutex<BalancerState>,
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            strategy,
            state: Mutex::new(BalancerState {
                round_robin_index: 0,
                connection_counts: HashMap::new(),
            }),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BalancerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pick an instance; non-HEALTHY instances are skipped, and with no
    /// healthy candidate the selection is None.
    pub fn select(&self, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        let healthy: Vec<&ServiceInstance> = instances
            .iter()
            .filter(|instance| instance.status == InstanceStatus::Healthy)
            .collect();
        if healthy.is_empty() {
            return None;
        }

        let selected = match self.strategy {
            LoadBalancingStrategy::RoundRobin => self.round_robin(&healthy),
            LoadBalancingStrategy::WeightedRoundRobin => self.weighted_round_robin(&healthy),
            LoadBalancingStrategy::Random => Self::random(&healthy),
            LoadBalancingStrategy::WeightedRandom => Self::weighted_random(&healthy),
            LoadBalancingStrategy::LeastConnections => self.least_connections(&healthy),
        };
        Some(selected.clone())
    }

    fn round_robin<'a>(&self, instances: &[&'a ServiceInstance]) -> &'a ServiceInstance {
        let mut state = self.lock_state();
        let index = state.round_robin_index % instances.len();
        state.round_robin_index += 1;
        instances[index]
    }

    /// Expand each instance `weight` times and index modulo the list.
    fn weighted_round_robin<'a>(&self, instances: &[&'a ServiceInstance]) -> &'a ServiceInstance {
        let weighted: Vec<&ServiceInstance> = instances
            .iter()
            .flat_map(|instance| std::iter::repeat(*instance).take(instance.weight as usize))
            .collect();
        if weighted.is_empty() {
            return instances[0];
        }

        let mut state = self.lock_state();
        let index = state.round_robin_index % weighted.len();
        state.round_robin_index += 1;
        weighted[index]
    }

    fn random<'a>(instances: &[&'a ServiceInstance]) -> &'a ServiceInstance {
        let index = rand::thread_rng().gen_range(0..instances.len());
        instances[index]
    }

    fn weighted_random<'a>(instances: &[&'a ServiceInstance]) -> &'a ServiceInstance {
        let total_weight: u64 = instances.iter().map(|i| u64::from(i.weight)).sum();
        if total_weight == 0 {
            return Self::random(instances);
        }

        let mut r = rand::thread_rng().gen_range(0..total_weight);
        for instance in instances {
            let weight = u64::from(instance.weight);
            if r < weight {
                return instance;
            }
            r -= weight;
        }
        instances[instances.len() - 1]
    }

    fn least_connections<'a>(&self, instances: &[&'a ServiceInstance]) -> &'a ServiceInstance {
        let state = self.lock_state();
        instances
            .iter()
            .min_by_key(|instance| {
                state
                    .connection_counts
                    .get(&instance.instance_id)
                    .copied()
                    .unwrap_or(0)
            })
            .copied()
            .unwrap_or(instances[0])
    }

    pub fn record_connection(&self, instance_id: &str) {
        let mut state = self.lock_state();
        *state
            .connection_counts
            .entry(instance_id.to_string())
            .or_insert(0) += 1;
    }

    pub fn release_connection(&self, instance_id: &str) {
        let mut state = self.lock_state();
        if let Some(count) = state.connection_counts.get_mut(instance_id) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn get_connection_counts(&self) -> HashMap<String, usize> {
        self.lock_state().connection_counts.clone()
    }

    pub fn reset(&self) {
        let mut state = self.lock_state();
        state.round_robin_index = 0;
        state.connection_counts.clear();
    }
}
