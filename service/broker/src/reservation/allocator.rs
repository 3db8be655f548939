//! Acquiring and releasing leases.
//!
//! Every operation here holds the app's table lock, exclusively, from start to finish. That
//! includes the cluster calls, which makes acquisitions within an app strictly sequential.

use super::ownership::Ownership;
use super::{AppContext, PodHandle, Reservation, RESERVATION_MANAGER};
use crate::broker::Cluster;
use crate::builder::TemplateData;
use crate::config::BrokerConfig;
use crate::cookie;
use chrono::{DateTime, TimeZone, Utc};
use error::*;
use response::Response;
use result::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use term_colors::cyan;

/// Leases the oldest available pod to `user`, or reports the one they already hold.
pub async fn acquire(
    ctx: &AppContext,
    cluster: &Cluster,
    config: &BrokerConfig,
    user: &str,
    username: &str,
    user_params: BTreeMap<String, String>,
) -> Result<Response> {
    let mut table = ctx.table.write().await;
    if let Some(existing) = table.reservation(user) {
        return Ok(Response::new(
            Status::Ok,
            format!("pod for {}: {}", user, existing.pod.name),
        ));
    }
    let pod = table.pop_available().ok_or(NoInstancesAvailable {})?;
    let spec = ctx.spec().await;
    // Whole seconds, so that what is recorded on the pod reads back identically.
    let session_start = Utc.timestamp(Utc::now().timestamp(), 0);
    let session_key = names::session_key();

    let mut data = TemplateData {
        app: ctx.name.clone(),
        namespace: ctx.namespace().to_string(),
        user: user.to_string(),
        username: username.to_string(),
        id: names::pod_id(user),
        full_name: ctx.instance_id(user),
        session_key: session_key.clone(),
        cookie_value: cookie::make_cookie_value(user, &ctx.name, &ctx.auth.cookie_secret),
        timestamp: session_start.timestamp().to_string(),
        sys_params: config.sys_params.clone(),
        ..Default::default()
    };
    data.app_params
        .insert("sessionKey".to_string(), session_key.clone());
    data.app_params.extend(spec.app_param_defaults());
    data.user_params = spec
        .user_params
        .iter()
        .map(|p| (p.name.clone(), p.default.clone()))
        .collect();
    data.user_params.extend(user_params.clone());

    let dest = overlay_dir(config, user).join(&ctx.name);
    let prepared = prepare(
        cluster,
        &config.user_bundle_dir.join(&ctx.name),
        &dest,
        &data,
        session_start,
        &user_params,
    )
    .await;
    // Nothing in the cluster has been touched yet, so the pod can go straight back.
    let (annotations, object_kinds) = match prepared {
        Ok(prepared) => prepared,
        Err(err) => {
            table.restore_available(pod);
            return Err(create_failed(ctx, user, err));
        }
    };

    if let Err(err) = claim(ctx, cluster, &pod, user, &annotations).await {
        abandon(ctx, cluster, &pod, user, &object_kinds).await;
        return Err(create_failed(ctx, user, err));
    }
    if let Err(err) = cluster.mutator.apply_manifests(&dest).await {
        abandon(ctx, cluster, &pod, user, &object_kinds).await;
        return Err(create_failed(ctx, user, err));
    }

    info!("Assigned the pod {} to {}", cyan(&pod.name), cyan(user));
    let message = format!("assigned pod: {}", pod.name);
    table.reserve(
        user.to_string(),
        Reservation {
            pod,
            session_key,
            session_start: Some(session_start),
            object_kinds,
            user_params,
        },
    );
    Ok(Response::new(Status::Ok, message))
}

/// Ends the lease held by `user`, if any.
///
/// The reservation is forgotten even when the cluster refuses some of the deletions, the
/// table records intent rather than confirmed cluster state.
pub async fn release(
    ctx: &AppContext,
    cluster: &Cluster,
    config: &BrokerConfig,
    user: &str,
) -> Result<Response> {
    let mut table = ctx.table.write().await;
    let reservation = match table.release(user) {
        Some(reservation) => reservation,
        None => return Ok(Response::new(Status::Accepted, "shutdown")),
    };
    let namespace = ctx.namespace();
    let pod = &reservation.pod.name;

    // Status lookups go by this label, it has to be gone before the pod starts terminating.
    if let Err(err) = cluster
        .mutator
        .label(namespace, pod, k8s::INSTANCE, None)
        .await
    {
        warn!(
            "Failed to remove the instance label from {}, {}",
            cyan(pod),
            chain(err.as_ref())
        );
    }
    run_shutdown_hooks(ctx, cluster, config, user, pod).await;

    info!("Deleting the pod {} of {}", cyan(pod), cyan(user));
    let deleted_pod = cluster.mutator.delete_pod(namespace, pod).await;
    let deleted_objects = cluster
        .mutator
        .delete_by_kinds(
            namespace,
            &reservation.object_kinds,
            &ctx.instance_selector(user),
            k8s::RETAIN,
        )
        .await;
    deleted_pod.and(deleted_objects).map_err(|err| DeleteFailed {
        app: ctx.name.clone(),
        user: user.to_string(),
        cause: err.into(),
    })?;
    Ok(Response::new(Status::Accepted, "terminating"))
}

/// Deletes a pool member that was never leased, at its own request.
pub async fn remove_unreserved(
    ctx: &AppContext,
    cluster: &Cluster,
    pod: &PodHandle,
) -> Result<Response> {
    let mut table = ctx.table.write().await;
    table.remove_available(&pod.name);
    info!("Deleting the unreserved pod {}", cyan(&pod.name));
    cluster
        .mutator
        .delete_pod(ctx.namespace(), &pod.name)
        .await
        .map_err(|err| DeleteFailed {
            app: ctx.name.clone(),
            user: String::new(),
            cause: err.into(),
        })?;
    Ok(Response::new(Status::Ok, "shutdown"))
}

/// Per user scratch space. Keyed by the pod id as user identities are not path safe.
fn overlay_dir(config: &BrokerConfig, user: &str) -> PathBuf {
    config.build_dir.join(names::pod_id(user))
}

/// Renders the user's overlay and works out the ownership record it implies.
async fn prepare(
    cluster: &Cluster,
    source: &Path,
    dest: &Path,
    data: &TemplateData,
    session_start: DateTime<Utc>,
    user_params: &BTreeMap<String, String>,
) -> Result<(BTreeMap<String, String>, Vec<String>)> {
    cluster
        .builder
        .build_overlay(source, dest, data)
        .await?;
    let object_kinds = cluster.builder.discover_object_kinds(dest).await?;
    let annotations = Ownership {
        user: data.user.clone(),
        session_key: data.session_key.clone(),
        session_start: Some(session_start),
        object_kinds: object_kinds.clone(),
        user_params: user_params.clone(),
    }
    .encode()?;
    Ok((annotations, object_kinds))
}

/// Takes the pod out of the deployment's hands and records who owns it.
async fn claim(
    ctx: &AppContext,
    cluster: &Cluster,
    pod: &PodHandle,
    user: &str,
    annotations: &BTreeMap<String, String>,
) -> Result<()> {
    let namespace = ctx.namespace();
    cluster
        .mutator
        .label(namespace, &pod.name, k8s::MANAGED_BY, Some(RESERVATION_MANAGER))
        .await?;
    cluster
        .mutator
        .annotate(namespace, &pod.name, annotations)
        .await?;
    let instance = ctx.instance_id(user);
    cluster
        .mutator
        .label(namespace, &pod.name, k8s::INSTANCE, Some(instance.as_str()))
        .await
}

/// A pod that was partially claimed is deleted rather than returned to the pool, so that
/// it can never be recovered as a reservation nobody holds.
async fn abandon(
    ctx: &AppContext,
    cluster: &Cluster,
    pod: &PodHandle,
    user: &str,
    object_kinds: &[String],
) {
    let namespace = ctx.namespace();
    if let Err(err) = cluster.mutator.delete_pod(namespace, &pod.name).await {
        error!(
            "Failed to delete the partially claimed pod {}, {}",
            cyan(&pod.name),
            chain(err.as_ref())
        );
    }
    if let Err(err) = cluster
        .mutator
        .delete_by_kinds(
            namespace,
            object_kinds,
            &ctx.instance_selector(user),
            k8s::RETAIN,
        )
        .await
    {
        error!(
            "Failed to delete the objects created for {}, {}",
            cyan(user),
            chain(err.as_ref())
        );
    }
}

/// Hooks are best effort. A failing hook is logged and the next one runs regardless.
async fn run_shutdown_hooks(
    ctx: &AppContext,
    cluster: &Cluster,
    config: &BrokerConfig,
    user: &str,
    pod: &str,
) {
    let hooks = ctx.spec().await.shutdown_hooks.clone();
    if hooks.is_empty() {
        return;
    }
    let scratch = overlay_dir(config, user);
    if let Err(err) = tokio::fs::create_dir_all(&scratch).await {
        warn!(
            "Skipping the shutdown hooks for {}, {} could not be created: {}",
            cyan(pod),
            scratch.display(),
            err
        );
        return;
    }
    for (i, hook) in hooks.iter().enumerate() {
        let local = scratch.join(format!("shutdown-hook-{}", i));
        let remote = format!("/tmp/broker_shutdown_hook_{}_{}", hook.container, i);
        if let Err(err) = tokio::fs::write(&local, &hook.command).await {
            warn!("Failed to write shutdown hook {} for {}, {}", i, cyan(pod), err);
            continue;
        }
        let outcome = run_hook(ctx, cluster, pod, &hook.container, &local, &remote).await;
        match outcome {
            Ok(()) => info!(
                "Finished shutdown hook {}/{} for {}",
                i + 1,
                hooks.len(),
                cyan(pod)
            ),
            Err(err) => warn!(
                "Shutdown hook {}/{} for {} failed, {}",
                i + 1,
                hooks.len(),
                cyan(pod),
                chain(err.as_ref())
            ),
        }
        let _ = tokio::fs::remove_file(&local).await;
    }
}

async fn run_hook(
    ctx: &AppContext,
    cluster: &Cluster,
    pod: &str,
    container: &str,
    local: &Path,
    remote: &str,
) -> Result<()> {
    cluster
        .mutator
        .copy_file_to_pod(ctx.namespace(), pod, container, local, remote)
        .await?;
    debug!("Running {} in {}/{}", remote, cyan(pod), container);
    cluster
        .mutator
        .exec_in_pod(
            ctx.namespace(),
            pod,
            container,
            &["sh".to_string(), remote.to_string()],
        )
        .await
}

fn create_failed(ctx: &AppContext, user: &str, err: Box<dyn BrokerError>) -> Box<dyn BrokerError> {
    CreateFailed {
        app: ctx.name.clone(),
        user: user.to_string(),
        cause: err.into(),
    }
    .into()
}

#[derive(Error, BrokerError, Debug)]
#[code(Status::NotFound)]
#[error("No available instances at this time")]
pub struct NoInstancesAvailable {}

#[derive(Error, BrokerError, Debug)]
#[code(Status::InternalServerError)]
#[error("error creating app")]
pub struct CreateFailed {
    app: String,
    user: String,
    #[source]
    cause: StringError,
}

#[derive(Error, BrokerError, Debug)]
#[code(Status::InternalServerError)]
#[error("error deleting app")]
pub struct DeleteFailed {
    app: String,
    user: String,
    #[source]
    cause: StringError,
}
