//! Cluster object model

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::quantity::Quantity;

/// Kind of object stored in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Namespace,
    ResourceQuota,
    LimitRange,
    Role,
    RoleBinding,
    NetworkPolicy,
    Pod,
    Secret,
    ServiceAccount,
}

impl ResourceKind {
    pub fn is_namespaced(&self) -> bool {
        !matches!(self, ResourceKind::Namespace)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Namespace => "namespace",
            ResourceKind::ResourceQuota => "resourcequota",
            ResourceKind::LimitRange => "limitrange",
            ResourceKind::Role => "role",
            ResourceKind::RoleBinding => "rolebinding",
            ResourceKind::NetworkPolicy => "networkpolicy",
            ResourceKind::Pod => "pod",
            ResourceKind::Secret => "secret",
            ResourceKind::ServiceAccount => "serviceaccount",
        };
        f.write_str(s)
    }
}

/// Address of a single object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    pub fn cluster(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.into(),
        }
    }

    pub fn namespaced(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Lifecycle phase reported by the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Pending,
    Active,
    Running,
    Succeeded,
    Failed,
    Terminating,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Pending => write!(f, "Pending"),
            Phase::Active => write!(f, "Active"),
            Phase::Running => write!(f, "Running"),
            Phase::Succeeded => write!(f, "Succeeded"),
            Phase::Failed => write!(f, "Failed"),
            Phase::Terminating => write!(f, "Terminating"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Set by the cluster; echoed back on update for optimistic concurrency
    pub resource_version: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub phase: Option<Phase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub api_groups: Vec<String>,
    pub resources: Vec<String>,
    pub verbs: Vec<String>,
    #[serde(default)]
    pub resource_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvSecretRef {
    pub env_name: String,
    pub secret_name: String,
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RestartPolicy {
    Always,
    OnFailure,
    #[default]
    Never,
}

/// Desired state of an object, one variant per kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ResourceSpec {
    Namespace,
    ResourceQuota {
        hard: BTreeMap<String, Quantity>,
    },
    LimitRange {
        min: BTreeMap<String, Quantity>,
        max: BTreeMap<String, Quantity>,
        default: BTreeMap<String, Quantity>,
        default_request: BTreeMap<String, Quantity>,
    },
    Role {
        rules: Vec<PolicyRule>,
    },
    RoleBinding {
        role: String,
        subjects: Vec<Subject>,
    },
    NetworkPolicy {
        ingress_from: BTreeMap<String, String>,
        egress_to: BTreeMap<String, String>,
        policy_types: Vec<String>,
    },
    Pod {
        image: String,
        command: Vec<String>,
        limits: BTreeMap<String, Quantity>,
        ports: Vec<u16>,
        env_secrets: Vec<EnvSecretRef>,
        image_pull_secret: Option<String>,
        restart_policy: RestartPolicy,
    },
    Secret {
        secret_type: String,
        data: BTreeMap<String, Vec<u8>>,
    },
    ServiceAccount,
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::Namespace => ResourceKind::Namespace,
            ResourceSpec::ResourceQuota { .. } => ResourceKind::ResourceQuota,
            ResourceSpec::LimitRange { .. } => ResourceKind::LimitRange,
            ResourceSpec::Role { .. } => ResourceKind::Role,
            ResourceSpec::RoleBinding { .. } => ResourceKind::RoleBinding,
            ResourceSpec::NetworkPolicy { .. } => ResourceKind::NetworkPolicy,
            ResourceSpec::Pod { .. } => ResourceKind::Pod,
            ResourceSpec::Secret { .. } => ResourceKind::Secret,
            ResourceSpec::ServiceAccount => ResourceKind::ServiceAccount,
        }
    }
}

/// An object as sent to or returned by the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub meta: ObjectMeta,
    pub spec: ResourceSpec,
    #[serde(default)]
    pub status: ResourceStatus,
}

impl Resource {
    pub fn new(name: impl Into<String>, namespace: Option<String>, spec: ResourceSpec) -> Self {
        Self {
            meta: ObjectMeta {
                name: name.into(),
                namespace,
                ..Default::default()
            },
            spec,
            status: ResourceStatus::default(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.spec.kind()
    }

    pub fn reference(&self) -> ResourceRef {
        ResourceRef {
            kind: self.kind(),
            namespace: self.meta.namespace.clone(),
            name: self.meta.name.clone(),
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        self.status.phase
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.annotations.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_display() {
        let ns = ResourceRef::cluster(ResourceKind::Namespace, "acme-west");
        assert_eq!(ns.to_string(), "namespace/acme-west");
        let quota = ResourceRef::namespaced(ResourceKind::ResourceQuota, "acme-west", "acme-west-limits");
        assert_eq!(quota.to_string(), "resourcequota/acme-west/acme-west-limits");
    }

    #[test]
    fn test_resource_reference_follows_spec_kind() {
        let sa = Resource::new("acme-user", Some("default".into()), ResourceSpec::ServiceAccount)
            .with_label("kufast/tenant", "acme");
        let r = sa.reference();
        assert_eq!(r.kind, ResourceKind::ServiceAccount);
        assert_eq!(r.namespace.as_deref(), Some("default"));
        assert_eq!(sa.meta.labels["kufast/tenant"], "acme");
        assert!(r.kind.is_namespaced());
        assert!(!ResourceKind::Namespace.is_namespaced());
    }
}
