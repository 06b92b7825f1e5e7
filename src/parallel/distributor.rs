//! Region assignment for batch requests.
//!
//! Each request gets an ordered list of K regions under a load-balancing
//! strategy; the single-request orchestrator uses that list as its
//! per-request region order.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::LoadBalancing;
use crate::error::{RelayError, Result};

/// The regions assigned to one request, in attempt order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionAssignment {
    /// The request this assignment belongs to.
    pub request_id: String,
    /// Ordered regions; a subset of the configured regions with at most K
    /// entries.
    pub assigned_regions: Vec<String>,
    /// Dispatch priority (higher first when prioritization is enabled).
    pub priority: u32,
}

/// Assigns regions to requests under a configured strategy.
///
/// `least-loaded` keeps a process-local dispatch counter per region,
/// guarded by a short-critical-section lock held only during selection.
#[derive(Debug)]
pub struct RegionDistributor {
    strategy: LoadBalancing,
    regions: Vec<String>,
    cursor: usize,
    load: Mutex<HashMap<String, usize>>,
}

impl RegionDistributor {
    /// Build a distributor over the configured regions.
    pub fn new(strategy: LoadBalancing, regions: Vec<String>) -> Result<Self> {
        if regions.is_empty() {
            return Err(RelayError::RegionDistribution(
                "no regions available for distribution".into(),
            ));
        }
        Ok(Self {
            strategy,
            regions,
            cursor: 0,
            load: Mutex::new(HashMap::new()),
        })
    }

    /// Assign `k` regions to `request_id`.
    pub fn assign(
        &mut self,
        request_id: impl Into<String>,
        k: usize,
        priority: u32,
    ) -> Result<RegionAssignment> {
        if k == 0 {
            return Err(RelayError::RegionDistribution(
                "target_regions_per_request must be positive".into(),
            ));
        }
        let k = k.min(self.regions.len());
        let assigned_regions = match self.strategy {
            LoadBalancing::RoundRobin => {
                let offset = self.cursor;
                self.cursor = (self.cursor + 1) % self.regions.len();
                (0..k)
                    .map(|i| self.regions[(offset + i) % self.regions.len()].clone())
                    .collect()
            }
            LoadBalancing::Random => {
                let mut indices: Vec<usize> = (0..self.regions.len()).collect();
                fastrand::shuffle(&mut indices);
                indices
                    .into_iter()
                    .take(k)
                    .map(|i| self.regions[i].clone())
                    .collect()
            }
            LoadBalancing::LeastLoaded => {
                let mut load = self.load.lock().expect("region load lock poisoned");
                let mut ranked: Vec<&String> = self.regions.iter().collect();
                ranked.sort_by_key(|region| load.get(*region).copied().unwrap_or(0));
                let chosen: Vec<String> = ranked.into_iter().take(k).cloned().collect();
                for region in &chosen {
                    *load.entry(region.clone()).or_insert(0) += 1;
                }
                chosen
            }
        };
        Ok(RegionAssignment {
            request_id: request_id.into(),
            assigned_regions,
            priority,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regions() -> Vec<String> {
        vec!["r1".into(), "r2".into(), "r3".into()]
    }

    #[test]
    fn test_round_robin_advances_offset_per_request() {
        let mut distributor = RegionDistributor::new(LoadBalancing::RoundRobin, regions()).unwrap();
        let a = distributor.assign("a", 2, 0).unwrap();
        let b = distributor.assign("b", 2, 0).unwrap();
        let c = distributor.assign("c", 2, 0).unwrap();
        assert_eq!(a.assigned_regions, vec!["r1", "r2"]);
        assert_eq!(b.assigned_regions, vec!["r2", "r3"]);
        assert_eq!(c.assigned_regions, vec!["r3", "r1"]);
        // Cycle wraps back around.
        let d = distributor.assign("d", 2, 0).unwrap();
        assert_eq!(d.assigned_regions, vec!["r1", "r2"]);
    }

    #[test]
    fn test_k_capped_at_region_count() {
        let mut distributor = RegionDistributor::new(LoadBalancing::RoundRobin, regions()).unwrap();
        let assignment = distributor.assign("a", 10, 0).unwrap();
        assert_eq!(assignment.assigned_regions.len(), 3);
    }

    #[test]
    fn test_random_is_a_permutation_subset() {
        let mut distributor = RegionDistributor::new(LoadBalancing::Random, regions()).unwrap();
        for _ in 0..20 {
            let assignment = distributor.assign("a", 2, 0).unwrap();
            assert_eq!(assignment.assigned_regions.len(), 2);
            let mut unique = assignment.assigned_regions.clone();
            unique.dedup();
            assert_eq!(unique.len(), 2);
            for region in &assignment.assigned_regions {
                assert!(regions().contains(region));
            }
        }
    }

    #[test]
    fn test_least_loaded_balances_counters() {
        let mut distributor =
            RegionDistributor::new(LoadBalancing::LeastLoaded, regions()).unwrap();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for i in 0..9 {
            let assignment = distributor.assign(format!("req-{i}"), 1, 0).unwrap();
            *counts
                .entry(assignment.assigned_regions[0].clone())
                .or_insert(0) += 1;
        }
        // 9 single-region assignments over 3 regions: perfectly even.
        assert!(counts.values().all(|&c| c == 3), "{counts:?}");
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(RegionDistributor::new(LoadBalancing::RoundRobin, vec![]).is_err());
        let mut distributor = RegionDistributor::new(LoadBalancing::RoundRobin, regions()).unwrap();
        assert!(distributor.assign("a", 0, 0).is_err());
    }
}
