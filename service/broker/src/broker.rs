use crate::builder::{Builder, KustomizeBuilder};
use crate::config::BrokerConfig;
use crate::registry::AppRegistry;
use k8s::{ClusterMutator, KubeMutator, KubePodDirectory, PodDirectory};
use std::sync::Arc;

/// The cluster facing collaborators, bundled so they can be swapped out wholesale.
#[derive(Clone)]
pub struct Cluster {
    pub directory: Arc<dyn PodDirectory>,
    pub mutator: Arc<dyn ClusterMutator>,
    pub builder: Arc<dyn Builder>,
}

impl Cluster {
    pub fn kube(client: kube::Client) -> Self {
        Self {
            directory: Arc::new(KubePodDirectory::new(client.clone())),
            mutator: Arc::new(KubeMutator::new(client)),
            builder: Arc::new(KustomizeBuilder),
        }
    }
}

/// Broker is the state shared by every request handler and background task.
pub struct Broker {
    pub config: Arc<BrokerConfig>,
    pub cluster: Cluster,
    pub registry: AppRegistry,
}

impl Broker {
    pub fn new(config: BrokerConfig, cluster: Cluster) -> Self {
        Self {
            config: Arc::new(config),
            cluster,
            registry: AppRegistry::default(),
        }
    }
}
