//! The reservation engine: per-app pod tables, their reconciler, and everything that
//! acquires, releases and reports on leases.

pub mod allocator;
pub mod classifier;
pub mod ownership;
pub mod reconciler;
pub mod status;

use crate::apps::AppConfig;
use crate::config::BrokerConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Value of the managed-by label on pods the deployment still owns (the pool).
pub const POOL_MANAGER: &str = "pod-broker";

/// Value of the managed-by label on pods leased to a user.
pub const RESERVATION_MANAGER: &str = "reservation-broker";

/// A single pod the broker knows about.
#[derive(Debug, Clone, PartialEq)]
pub struct PodHandle {
    pub name: String,
    pub ip: String,
    pub created: Option<DateTime<Utc>>,
}

/// A lease of one pod to one user.
///
/// The session key and object kinds are fixed for the life of the reservation.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub pod: PodHandle,
    pub session_key: String,
    pub session_start: Option<DateTime<Utc>>,
    pub object_kinds: Vec<String>,
    pub user_params: BTreeMap<String, String>,
}

/// What a leased workload may learn about its own reservation.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ReservationMetadata {
    pub ip: String,
    pub session_key: String,
    pub user: String,
    /// Unix seconds, empty if the reservation predates session start tracking.
    pub session_start: String,
    pub user_params: BTreeMap<String, String>,
}

impl Reservation {
    pub fn metadata(&self, user: &str) -> ReservationMetadata {
        ReservationMetadata {
            ip: self.pod.ip.clone(),
            session_key: self.session_key.clone(),
            user: user.to_string(),
            session_start: self
                .session_start
                .map(|start| start.timestamp().to_string())
                .unwrap_or_default(),
            user_params: self.user_params.clone(),
        }
    }
}

/// Whom a source address belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolMember {
    Available(PodHandle),
    Reserved { user: String, reservation: Reservation },
}

/// The available queue and the reservations of one app.
///
/// A pod is never both available and reserved.
#[derive(Debug, Default)]
pub struct PodTable {
    available: VecDeque<PodHandle>,
    reserved: HashMap<String, Reservation>,
}

impl PodTable {
    pub fn available(&self) -> impl Iterator<Item = &PodHandle> {
        self.available.iter()
    }

    pub fn available_len(&self) -> usize {
        self.available.len()
    }

    pub fn reserved(&self) -> &HashMap<String, Reservation> {
        &self.reserved
    }

    pub fn reservation(&self, user: &str) -> Option<&Reservation> {
        self.reserved.get(user)
    }

    /// Oldest first.
    pub fn pop_available(&mut self) -> Option<PodHandle> {
        self.available.pop_front()
    }

    /// Hands a pod back to the head of the queue, as though it was never taken.
    pub fn restore_available(&mut self, pod: PodHandle) {
        if !self.is_reserved(&pod.name) {
            self.available.push_front(pod);
        }
    }

    /// Swaps in a fresh snapshot of the pool. Pods that are already reserved are dropped
    /// from the snapshot.
    pub fn replace_available(&mut self, pods: Vec<PodHandle>) {
        let reserved = &self.reserved;
        self.available = pods
            .into_iter()
            .filter(|pod| !reserved.values().any(|r| r.pod.name == pod.name))
            .collect();
    }

    pub fn remove_available(&mut self, name: &str) -> Option<PodHandle> {
        let position = self.available.iter().position(|pod| pod.name == name)?;
        self.available.remove(position)
    }

    pub fn reserve(&mut self, user: String, reservation: Reservation) {
        self.remove_available(&reservation.pod.name);
        self.reserved.insert(user, reservation);
    }

    pub fn release(&mut self, user: &str) -> Option<Reservation> {
        self.reserved.remove(user)
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        self.reserved.values().any(|r| r.pod.name == name)
    }

    /// Available pods are matched first.
    pub fn member_by_address(&self, addresses: &[&str]) -> Option<PoolMember> {
        if addresses.is_empty() {
            return None;
        }
        if let Some(pod) = self
            .available
            .iter()
            .find(|pod| addresses.contains(&pod.ip.as_str()))
        {
            return Some(PoolMember::Available(pod.clone()));
        }
        self.reserved
            .iter()
            .find(|(_, r)| addresses.contains(&r.pod.ip.as_str()))
            .map(|(user, reservation)| PoolMember::Reserved {
                user: user.clone(),
                reservation: reservation.clone(),
            })
    }
}

/// How callers of an app authenticate. Fixed at context creation.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthSettings {
    pub cookie_secret: String,
    pub auth_header: String,
    pub username_header: Option<String>,
}

impl From<&BrokerConfig> for AuthSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            cookie_secret: config.cookie_secret.clone(),
            auth_header: config.auth_header.clone(),
            username_header: config.username_header.clone(),
        }
    }
}

/// AppContext is everything the broker holds for one registered app.
///
/// `table` is the one lock guarding the app's pool. Acquire, release and every reconciler
/// pass hold it exclusively for their entire duration.
pub struct AppContext {
    pub name: String,
    pub auth: AuthSettings,
    spec: RwLock<Arc<AppConfig>>,
    pub table: RwLock<PodTable>,
    running: AtomicBool,
}

impl AppContext {
    pub fn new(spec: AppConfig, auth: AuthSettings) -> Self {
        Self {
            name: spec.name.clone(),
            auth,
            spec: RwLock::new(Arc::new(spec)),
            table: RwLock::new(PodTable::default()),
            running: AtomicBool::new(false),
        }
    }

    pub async fn spec(&self) -> Arc<AppConfig> {
        self.spec.read().await.clone()
    }

    pub async fn set_spec(&self, spec: AppConfig) {
        *self.spec.write().await = Arc::new(spec);
    }

    pub fn namespace(&self) -> &str {
        &self.name
    }

    pub fn reconciler_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_reconciler_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst)
    }

    /// Pods still owned by the deployment.
    pub async fn available_selector(&self) -> String {
        format!(
            "{},{}={}",
            self.spec().await.deployment.selector,
            k8s::MANAGED_BY,
            POOL_MANAGER
        )
    }

    /// Pods that have been released from the deployment, that is, leased.
    pub async fn reserved_selector(&self) -> String {
        format!(
            "{}, {} notin ({})",
            self.spec().await.deployment.selector,
            k8s::MANAGED_BY,
            POOL_MANAGER
        )
    }

    pub fn instance_id(&self, user: &str) -> String {
        names::instance_id(&self.name, user)
    }

    pub fn instance_selector(&self, user: &str) -> String {
        format!("{}={}", k8s::INSTANCE, self.instance_id(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(name: &str, ip: &str) -> PodHandle {
        PodHandle {
            name: name.to_string(),
            ip: ip.to_string(),
            created: None,
        }
    }

    fn reservation(pod: PodHandle) -> Reservation {
        Reservation {
            pod,
            session_key: "abc-defg-hij".to_string(),
            session_start: None,
            object_kinds: vec![],
            user_params: BTreeMap::new(),
        }
    }

    #[test]
    fn reserved_pods_never_become_available() {
        let mut table = PodTable::default();
        table.reserve("alice".to_string(), reservation(pod("p1", "10.0.0.1")));
        table.replace_available(vec![pod("p1", "10.0.0.1"), pod("p2", "10.0.0.2")]);
        assert_eq!(
            table.available().map(|p| p.name.as_str()).collect::<Vec<&str>>(),
            vec!["p2"]
        );
        table.restore_available(pod("p1", "10.0.0.1"));
        assert_eq!(table.available_len(), 1);
    }

    #[test]
    fn reserving_removes_from_the_queue() {
        let mut table = PodTable::default();
        table.replace_available(vec![pod("p1", "10.0.0.1"), pod("p2", "10.0.0.2")]);
        table.reserve("bob".to_string(), reservation(pod("p2", "10.0.0.2")));
        assert_eq!(table.available_len(), 1);
        assert!(table.is_reserved("p2"));
        assert_eq!(table.release("bob").map(|r| r.pod.name), Some("p2".to_string()));
        assert!(table.release("bob").is_none());
    }

    #[test]
    fn member_lookup() {
        let mut table = PodTable::default();
        table.replace_available(vec![pod("p1", "10.0.0.1")]);
        table.reserve("alice".to_string(), reservation(pod("p2", "10.0.0.2")));
        assert_eq!(
            table.member_by_address(&["192.168.0.1", "10.0.0.1"]),
            Some(PoolMember::Available(pod("p1", "10.0.0.1")))
        );
        match table.member_by_address(&["10.0.0.2"]) {
            Some(PoolMember::Reserved { user, .. }) => assert_eq!(user, "alice"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(table.member_by_address(&["10.9.9.9"]), None);
        assert_eq!(table.member_by_address(&[]), None);
    }

    #[test]
    fn metadata() {
        use chrono::TimeZone;
        let mut r = reservation(pod("p1", "10.0.0.1"));
        assert_eq!(r.metadata("alice").session_start, "");
        r.session_start = Some(Utc.timestamp(1_627_812_010, 0));
        let metadata = r.metadata("alice");
        assert_eq!(metadata.session_start, "1627812010");
        assert_eq!(metadata.ip, "10.0.0.1");
        assert_eq!(metadata.user, "alice");
    }

    #[tokio::test]
    async fn selectors() {
        let spec = AppConfig {
            name: "editor".to_string(),
            deployment: crate::apps::DeploymentSpec {
                selector: "app=editor".to_string(),
            },
            ..Default::default()
        };
        let ctx = AppContext::new(
            spec,
            AuthSettings {
                cookie_secret: "s".to_string(),
                auth_header: "x-auth".to_string(),
                username_header: None,
            },
        );
        assert_eq!(
            ctx.available_selector().await,
            "app=editor,app.kubernetes.io/managed-by=pod-broker"
        );
        assert_eq!(
            ctx.reserved_selector().await,
            "app=editor, app.kubernetes.io/managed-by notin (pod-broker)"
        );
        assert_eq!(
            ctx.instance_selector("alice"),
            format!("app.kubernetes.io/instance=editor-{}", names::pod_id("alice"))
        );
    }
}
