//! Default placement sorters.

use mlsched_placement::{Sorter, SorterChain};

use crate::store::{ModelVersion, ServerReplica, ServerSnapshot};

pub type ServerSorterChain = SorterChain<ModelVersion, ServerSnapshot>;
pub type ReplicaSorterChain = SorterChain<ModelVersion, ServerReplica>;

/// Servers keep their name order unless a caller opts into a sorter.
pub fn default_server_sorters() -> ServerSorterChain {
    Vec::new()
}

/// Replica sorters, highest priority first.
pub fn default_replica_sorters() -> ReplicaSorterChain {
    vec![
        Box::new(ModelAlreadyLoadedSorter),
        Box::new(AvailableMemorySorter),
        Box::new(ReplicaIndexSorter),
    ]
}

fn hosts(model: &ModelVersion, replica: &ServerReplica) -> bool {
    model.is_placed_on(&replica.server_name, replica.idx)
        || replica.loaded_models.contains(&model.id())
}

/// Prefers replicas that already host the version.
pub struct ModelAlreadyLoadedSorter;

impl Sorter<ModelVersion, ServerReplica> for ModelAlreadyLoadedSorter {
    fn name(&self) -> &'static str {
        "model_already_loaded"
    }

    fn is_less(&self, model: &ModelVersion, a: &ServerReplica, b: &ServerReplica) -> bool {
        hosts(model, a) && !hosts(model, b)
    }
}

/// Prefers replicas with more free memory.
pub struct AvailableMemorySorter;

impl Sorter<ModelVersion, ServerReplica> for AvailableMemorySorter {
    fn name(&self) -> &'static str {
        "available_memory"
    }

    fn is_less(&self, _model: &ModelVersion, a: &ServerReplica, b: &ServerReplica) -> bool {
        a.free_memory_bytes() > b.free_memory_bytes()
    }
}

pub struct ReplicaIndexSorter;

impl Sorter<ModelVersion, ServerReplica> for ReplicaIndexSorter {
    fn name(&self) -> &'static str {
        "replica_index"
    }

    fn is_less(&self, _model: &ModelVersion, a: &ServerReplica, b: &ServerReplica) -> bool {
        a.idx < b.idx
    }
}

/// Prefers servers already hosting some replica of the version.
///
/// Not in the default chain.
pub struct ModelAlreadyLoadedOnServerSorter;

impl ModelAlreadyLoadedOnServerSorter {
    fn hosts_any(model: &ModelVersion, server: &ServerSnapshot) -> bool {
        server.replicas.iter().any(|r| hosts(model, r))
    }
}

impl Sorter<ModelVersion, ServerSnapshot> for ModelAlreadyLoadedOnServerSorter {
    fn name(&self) -> &'static str {
        "model_already_loaded_on_server"
    }

    fn is_less(&self, model: &ModelVersion, a: &ServerSnapshot, b: &ServerSnapshot) -> bool {
        Self::hosts_any(model, a) && !Self::hosts_any(model, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ModelSpec, ReplicaState, ServerReplicaConfig, ServerStats};
    use mlsched_placement::sort_candidates;
    use proptest::prelude::*;

    fn replica(idx: u32, available: u64) -> ServerReplica {
        ServerReplicaConfig::new("mlserver", idx, available).to_replica()
    }

    fn indices(replicas: &[ServerReplica]) -> Vec<u32> {
        replicas.iter().map(|r| r.idx).collect()
    }

    #[test]
    fn test_default_replica_order() {
        let mut mv = ModelVersion::new(1, ModelSpec::new("iris", 1, 10));
        mv.server = "mlserver".to_string();
        mv.set_replica_state(3, ReplicaState::Loaded, "");

        let mut replicas = vec![replica(0, 100), replica(1, 500), replica(2, 500), replica(3, 50)];
        sort_candidates(&default_replica_sorters(), &mv, &mut replicas);

        // Loaded first, then most memory, then lowest index.
        assert_eq!(indices(&replicas), vec![3, 1, 2, 0]);
    }

    #[test]
    fn test_memory_sorter_uses_reservations() {
        let mv = ModelVersion::new(1, ModelSpec::new("iris", 1, 10));
        let mut busy = replica(0, 500);
        busy.reserve(450);
        let idle = replica(1, 100);

        assert!(AvailableMemorySorter.is_less(&mv, &idle, &busy));
        assert!(!AvailableMemorySorter.is_less(&mv, &busy, &idle));
    }

    #[test]
    fn test_server_sorter_prefers_hosting_server() {
        let mv = ModelVersion::new(1, ModelSpec::new("iris", 1, 10));
        let mut hosting = replica(0, 100);
        hosting.server_name = "triton".to_string();
        hosting.loaded_models.insert(mv.id());

        let snapshot = |name: &str, replicas: Vec<ServerReplica>| ServerSnapshot {
            name: name.to_string(),
            replicas,
            shared: true,
            expected_replicas: -1,
            stats: ServerStats::default(),
        };
        let mut servers = vec![
            snapshot("mlserver", vec![replica(0, 1000)]),
            snapshot("triton", vec![hosting]),
        ];

        let chain: ServerSorterChain = vec![Box::new(ModelAlreadyLoadedOnServerSorter)];
        sort_candidates(&chain, &mv, &mut servers);
        assert_eq!(servers[0].name, "triton");

        assert!(default_server_sorters().is_empty());
    }

    proptest! {
        #[test]
        fn prop_order_is_independent_of_input_order(
            memory in proptest::collection::vec(0u64..4, 1..8),
            seed in any::<u64>(),
        ) {
            let mv = ModelVersion::new(1, ModelSpec::new("iris", 1, 1));
            let replicas: Vec<ServerReplica> = memory
                .iter()
                .enumerate()
                .map(|(idx, m)| replica(idx as u32, *m))
                .collect();

            let mut shuffled = replicas.clone();
            let len = shuffled.len();
            for i in 0..len {
                let j = ((seed >> (i % 64)) as usize + i * 7) % len;
                shuffled.swap(i, j);
            }

            let mut a = replicas;
            sort_candidates(&default_replica_sorters(), &mv, &mut a);
            sort_candidates(&default_replica_sorters(), &mv, &mut shuffled);
            prop_assert_eq!(indices(&a), indices(&shuffled));
        }
    }
}
