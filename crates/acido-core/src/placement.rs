use rand::Rng;
use rand::seq::SliceRandom;

/// Provider policy: a container group co-schedules at most this many
/// instances.
pub const MAX_GROUP_SIZE: usize = 10;

#[derive(Debug, Clone)]
pub struct PlannedGroup {
    /// 1-based index within the fleet; also the group-name suffix.
    pub ordinal: usize,
    /// First shard index handed to this group.
    pub start: usize,
    /// Number of instances (and shards) in this group.
    pub size: usize,
    pub region: String,
}

/// Buckets `shard_count` shards into groups of `min(10, remaining)` in order
/// and draws each group's region uniformly at random, with replacement, from
/// `regions`. Random rather than round-robin spread keeps many small fleets
/// started at the same moment from piling onto the first region.
pub fn plan(shard_count: usize, regions: &[String]) -> Vec<PlannedGroup> {
    plan_with(shard_count, regions, &mut rand::thread_rng())
}

pub fn plan_with<R: Rng>(shard_count: usize, regions: &[String], rng: &mut R) -> Vec<PlannedGroup> {
    assert!(!regions.is_empty(), "regions must be non-empty");
    let mut groups = Vec::new();
    let mut start = 0;
    while start < shard_count {
        let size = (shard_count - start).min(MAX_GROUP_SIZE);
        let region = regions.choose(rng).unwrap().clone();
        groups.push(PlannedGroup {
            ordinal: groups.len() + 1,
            start,
            size,
            region,
        });
        start += size;
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn regions(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn groups_fill_in_order() {
        let mut rng = StdRng::seed_from_u64(7);
        let plan = plan_with(25, &regions(&["westeurope"]), &mut rng);
        assert_eq!(plan.len(), 3);
        assert_eq!((plan[0].start, plan[0].size), (0, 10));
        assert_eq!((plan[1].start, plan[1].size), (10, 10));
        assert_eq!((plan[2].start, plan[2].size), (20, 5));
        assert_eq!(plan[2].ordinal, 3);
    }

    #[test]
    fn exact_multiple_has_no_short_group() {
        let mut rng = StdRng::seed_from_u64(7);
        let plan = plan_with(20, &regions(&["eastus"]), &mut rng);
        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|g| g.size == 10));
    }

    #[test]
    fn regions_come_from_the_candidate_set() {
        let rs = regions(&["a", "b", "c"]);
        let mut rng = StdRng::seed_from_u64(42);
        let plan = plan_with(100, &rs, &mut rng);
        assert_eq!(plan.len(), 10);
        assert!(plan.iter().all(|g| rs.contains(&g.region)));
    }

    #[test]
    fn single_shard_single_group() {
        let mut rng = StdRng::seed_from_u64(0);
        let plan = plan_with(1, &regions(&["uksouth"]), &mut rng);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].size, 1);
        assert_eq!(plan[0].region, "uksouth");
    }
}
