pub mod client;
pub mod directory;
pub mod errors;
pub mod mutator;
pub mod pod;

pub use directory::{KubePodDirectory, PodDirectory};
pub use mutator::{ClusterMutator, KubeMutator};
pub use pod::{PodExt, PodRecord};

/// The well known label naming the controller that currently owns a pod.
pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// The well known label carrying the per-user instance identifier.
pub const INSTANCE: &str = "app.kubernetes.io/instance";

/// Objects labelled with this key set to [RETAIN](crate::RETAIN) survive a
/// delete-by-kind sweep.
pub const DELETION_POLICY: &str = "app.broker/deletion-policy";
pub const RETAIN: &str = "abandon";
