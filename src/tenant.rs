//! Tenant identity record
//!
//! Every tenant owns one service account in the home namespace whose labels
//! list the targets it may deploy to. Several units may edit that record at
//! the same time, so every edit is a versioned read-modify-write that re-reads
//! and retries when the store reports a conflict.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;

use crate::cluster::ClusterClient;
use crate::definitions::{self, TENANT_DEFAULT_LABEL, TENANT_GROUP_ACCESS_LABEL, TENANT_NODE_ACCESS_LABEL};
use crate::models::{Resource, ResourceKind, ResourceRef, TargetKind};
use crate::{Error, Result};

pub fn identity_ref(tenant: &str) -> ResourceRef {
    ResourceRef::namespaced(
        ResourceKind::ServiceAccount,
        definitions::TENANT_HOME_NAMESPACE,
        definitions::tenant_user_name(tenant),
    )
}

/// Apply `mutate` to the labels of `tenant`'s identity record.
///
/// `mutate` returns `false` when it changed nothing; no write is issued then.
/// The update carries the `resource_version` of the read it was based on and
/// is retried from a fresh read on conflict, at most `retries` times. No retry
/// starts once `cancel` fires.
pub async fn update_tenant_labels<F>(
    client: &dyn ClusterClient,
    tenant: &str,
    retries: u32,
    cancel: &CancellationToken,
    mut mutate: F,
) -> Result<Resource>
where
    F: FnMut(&mut BTreeMap<String, String>) -> bool + Send,
{
    let target = identity_ref(tenant);
    let mut attempt = 0u32;

    loop {
        if attempt > 0 && cancel.is_cancelled() {
            return Err(Error::Cancelled(target));
        }
        attempt += 1;
        let mut record = client.get(&target).await?;
        if !mutate(&mut record.meta.labels) {
            return Ok(record);
        }

        match client.update(record).await {
            Ok(updated) => return Ok(updated),
            Err(e) if e.is_conflict() && attempt <= retries => {
                tracing::debug!(tenant, attempt, error = %e, "Tenant record changed underneath us, retrying");
            }
            Err(e) if e.is_conflict() => {
                return Err(Error::ConflictRetriesExhausted {
                    resource: target,
                    attempts: attempt,
                })
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Allow `tenant` to deploy to `target`. The first granted target becomes the default.
pub async fn grant_target(
    client: &dyn ClusterClient,
    tenant: &str,
    target: &str,
    kind: TargetKind,
    retries: u32,
    cancel: &CancellationToken,
) -> Result<Resource> {
    let label = definitions::access_label(target, kind);
    update_tenant_labels(client, tenant, retries, cancel, |labels| {
        let mut changed = labels.insert(label.clone(), "true".into()).as_deref() != Some("true");
        let default = labels.entry(TENANT_DEFAULT_LABEL.to_string()).or_default();
        if default.is_empty() {
            *default = target.to_string();
            changed = true;
        }
        changed
    })
    .await
}

/// Withdraw `tenant`'s access to `target`, clearing the default if it pointed there.
///
/// The grant is removed whatever kind it was recorded as.
pub async fn revoke_target(
    client: &dyn ClusterClient,
    tenant: &str,
    target: &str,
    retries: u32,
    cancel: &CancellationToken,
) -> Result<Resource> {
    let grants = [
        definitions::access_label(target, TargetKind::Node),
        definitions::access_label(target, TargetKind::Group),
    ];
    update_tenant_labels(client, tenant, retries, cancel, |labels| {
        let mut changed = false;
        for label in &grants {
            changed |= labels.remove(label).is_some();
        }
        if labels.get(TENANT_DEFAULT_LABEL).map(String::as_str) == Some(target) {
            labels.insert(TENANT_DEFAULT_LABEL.to_string(), String::new());
            changed = true;
        }
        changed
    })
    .await
}

/// Point the tenant's default deploy target at `target`
pub async fn set_default_target(
    client: &dyn ClusterClient,
    tenant: &str,
    target: &str,
    retries: u32,
    cancel: &CancellationToken,
) -> Result<Resource> {
    update_tenant_labels(client, tenant, retries, cancel, |labels| {
        labels.insert(TENANT_DEFAULT_LABEL.to_string(), target.to_string()).as_deref() != Some(target)
    })
    .await
}

/// Targets granted on an identity record, sorted by name
pub fn granted_targets(record: &Resource) -> Vec<(String, TargetKind)> {
    record
        .meta
        .labels
        .keys()
        .filter_map(|key| {
            if let Some(name) = key.strip_prefix(TENANT_NODE_ACCESS_LABEL) {
                Some((name.to_string(), TargetKind::Node))
            } else {
                key.strip_prefix(TENANT_GROUP_ACCESS_LABEL)
                    .map(|name| (name.to_string(), TargetKind::Group))
            }
        })
        .collect()
}

pub fn default_target(record: &Resource) -> Option<&str> {
    record
        .meta
        .labels
        .get(TENANT_DEFAULT_LABEL)
        .map(String::as_str)
        .filter(|t| !t.is_empty())
}
