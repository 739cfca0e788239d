//! Shared setup for scenarios run against the simulated cluster

use std::sync::Arc;

use bft_harness::testing::{init_tracing, SimCluster, SimConfig};
use bft_harness::{BftConfig, ClusterConfig, ClusterController};

/// Started cluster of `bft` with `clients` client handles
#[allow(dead_code)]
pub async fn start_cluster(bft: BftConfig, clients: usize) -> (Arc<ClusterController>, SimCluster) {
    start_cluster_with(SimConfig::new(bft), clients).await
}

pub async fn start_cluster_with(sim_config: SimConfig, clients: usize) -> (Arc<ClusterController>, SimCluster) {
    init_tracing();
    let bft = sim_config.bft;
    let sim = SimCluster::new(sim_config);
    let config = ClusterConfig::new(bft).with_clients(clients);
    let controller = Arc::new(ClusterController::new(config, sim.collaborators()).unwrap());
    controller.start_all().await.unwrap();
    (controller, sim)
}
