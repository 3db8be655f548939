use super::ownership::Ownership;
use super::{AppContext, PodHandle, Reservation};
use backoff::{backoff::Backoff, ExponentialBackoff};
use futures::{pin_mut, select, FutureExt};
use k8s::{PodDirectory, PodRecord};
use result::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use term_colors::cyan;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The Reconciler keeps one app's [PodTable](super::PodTable) in step with the cluster.
///
/// On start it recovers the reservations recorded on already leased pods, retrying until
/// the directory answers. Afterwards it replaces the available queue with a fresh snapshot
/// of the pool once every `interval`.
pub struct Reconciler {
    ctx: Arc<AppContext>,
    directory: Arc<dyn PodDirectory>,
    interval: Duration,
    token: CancellationToken,
}

/// Returned by [Reconciler::spawn](Reconciler::spawn). Dropping it does not stop the task, [stop](ReconcilerHandle::stop) does.
pub struct ReconcilerHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ReconcilerHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// True once the task has ended, whether it was cancelled or it panicked.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancels the reconciler and waits for it to finish its current pass.
    pub async fn stop(self) {
        self.cancel();
        if let Err(err) = self.handle.await {
            error!("A reconciler task failed to join, {:?}", err);
        }
    }
}

impl Reconciler {
    pub fn new(ctx: Arc<AppContext>, directory: Arc<dyn PodDirectory>, interval: Duration) -> Self {
        Self {
            ctx,
            directory,
            interval,
            token: CancellationToken::new(),
        }
    }

    pub fn spawn(self) -> ReconcilerHandle {
        ReconcilerHandle {
            token: self.token.clone(),
            handle: tokio::spawn(self.run()),
        }
    }

    async fn run(self) {
        self.ctx.set_reconciler_running(true);
        let _running = Running(self.ctx.clone());
        info!("Started the pod reconciler for {}", cyan(&self.ctx.name));
        if self.recover_until_done().await {
            let mut backoff = retry_policy();
            loop {
                let wait = match self.refresh().await {
                    Ok(()) => {
                        backoff.reset();
                        self.interval
                    }
                    Err(err) => {
                        warn!(
                            "Failed to list the pool of {}, {}",
                            cyan(&self.ctx.name),
                            error::chain(err.as_ref())
                        );
                        backoff.next_backoff().unwrap_or(self.interval)
                    }
                };
                if !self.sleep(wait).await {
                    break;
                }
            }
        }
        info!("Stopped the pod reconciler for {}", cyan(&self.ctx.name));
    }

    /// Returns false when cancelled before recovery could complete.
    async fn recover_until_done(&self) -> bool {
        let mut backoff = retry_policy();
        loop {
            match self.recover().await {
                Ok(()) => return true,
                Err(err) => {
                    warn!(
                        "Failed to list the existing reservations of {}, {}",
                        cyan(&self.ctx.name),
                        error::chain(err.as_ref())
                    );
                    let wait = backoff.next_backoff().unwrap_or(self.interval);
                    if !self.sleep(wait).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Rebuilds the reservations from the ownership records on leased pods.
    pub async fn recover(&self) -> Result<()> {
        let mut table = self.ctx.table.write().await;
        let pods = self
            .directory
            .list_pods(self.ctx.namespace(), &self.ctx.reserved_selector().await)
            .await?;
        for (user, reservation) in recovered(&self.ctx.name, pods) {
            info!(
                "Found the existing reservation of {} for {}",
                cyan(&reservation.pod.name),
                cyan(&user)
            );
            table.reserve(user, reservation);
        }
        Ok(())
    }

    /// A single pool pass. The table lock is held across the listing, and released
    /// before any backoff.
    pub async fn refresh(&self) -> Result<()> {
        let mut table = self.ctx.table.write().await;
        let pods = self
            .directory
            .list_pods(self.ctx.namespace(), &self.ctx.available_selector().await)
            .await?;
        table.replace_available(available(pods));
        trace!(
            "{} has {} available and {} reserved pods",
            cyan(&self.ctx.name),
            table.available_len(),
            table.reserved().len()
        );
        Ok(())
    }

    /// Returns false if the reconciler was cancelled while sleeping.
    async fn sleep(&self, duration: Duration) -> bool {
        let wait = tokio::time::sleep(duration).fuse();
        let cancelled = self.token.cancelled().fuse();
        pin_mut!(wait, cancelled);
        select! {
            _ = wait => true,
            _ = cancelled => false,
        }
    }
}

/// Clears the running flag however the task ends, unwinding included.
struct Running(Arc<AppContext>);

impl Drop for Running {
    fn drop(&mut self) {
        self.0.set_reconciler_running(false);
    }
}

fn retry_policy() -> ExponentialBackoff {
    ExponentialBackoff {
        max_elapsed_time: None,
        max_interval: Duration::from_secs(30),
        ..Default::default()
    }
}

/// Oldest first, without terminating pods or pods that have yet to get an address.
fn available(mut pods: Vec<PodRecord>) -> Vec<PodHandle> {
    pods.sort_by_key(|pod| pod.created);
    pods.into_iter()
        .filter(|pod| !pod.deleting)
        .filter_map(|pod| {
            Some(PodHandle {
                ip: pod.ip?,
                name: pod.name,
                created: pod.created,
            })
        })
        .collect()
}

fn recovered(app: &str, pods: Vec<PodRecord>) -> HashMap<String, Reservation> {
    let mut reservations: HashMap<String, Reservation> = HashMap::new();
    for pod in pods {
        if pod.deleting {
            debug!("Skipping the terminating pod {}", cyan(&pod.name));
            continue;
        }
        let ip = match pod.ip {
            Some(ip) => ip,
            None => {
                debug!("Skipping the pod {} as it has no IP", cyan(&pod.name));
                continue;
            }
        };
        if !pod.annotations.contains_key(super::ownership::USER) {
            debug!("Skipping the unowned pod {}", cyan(&pod.name));
            continue;
        }
        let ownership = match Ownership::decode(&pod.annotations) {
            Ok(ownership) => ownership,
            Err(err) => {
                warn!(
                    "Skipping the pod {} of {}, its ownership record is unreadable: {}",
                    cyan(&pod.name),
                    cyan(app),
                    error::chain(err.as_ref())
                );
                continue;
            }
        };
        if let Some(existing) = reservations.get(&ownership.user) {
            warn!(
                "Both {} and {} are reserved for {}, keeping {}",
                cyan(&existing.pod.name),
                cyan(&pod.name),
                cyan(&ownership.user),
                cyan(&existing.pod.name)
            );
            continue;
        }
        reservations.insert(
            ownership.user,
            Reservation {
                pod: PodHandle {
                    name: pod.name,
                    ip,
                    created: pod.created,
                },
                session_key: ownership.session_key,
                session_start: ownership.session_start,
                object_kinds: ownership.object_kinds,
                user_params: ownership.user_params,
            },
        );
    }
    reservations
}
