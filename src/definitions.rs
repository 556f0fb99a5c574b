//! Object definitions
//!
//! Pure builders that turn request parameters into cluster objects. Nothing in
//! here talks to the cluster; the objects only exist locally until a unit
//! creates them.

use std::collections::BTreeMap;

use base64::Engine;

use crate::models::*;
use crate::quantity::Quantity;
use crate::{Error, Result};

/// Namespace holding tenant identity records
pub const TENANT_HOME_NAMESPACE: &str = "default";

pub const TENANT_LABEL: &str = "kufast/tenant";
/// Default deploy target of a tenant
pub const TENANT_DEFAULT_LABEL: &str = "kufast/default";
pub const TENANT_NODE_ACCESS_LABEL: &str = "kufast.nodeaccess/";
pub const TENANT_GROUP_ACCESS_LABEL: &str = "kufast.groupaccess/";
pub const NODE_HOSTNAME_LABEL: &str = "kubernetes.io/hostname";
pub const NODE_GROUP_LABEL: &str = "kufast.group/";
pub const NODE_SELECTOR_ANNOTATION: &str = "scheduler.alpha.kubernetes.io/node-selector";

pub fn tenant_user_name(tenant: &str) -> String {
    format!("{tenant}-user")
}

pub fn access_label(target: &str, kind: TargetKind) -> String {
    match kind {
        TargetKind::Node => format!("{TENANT_NODE_ACCESS_LABEL}{target}"),
        TargetKind::Group => format!("{TENANT_GROUP_ACCESS_LABEL}{target}"),
    }
}

pub fn role_name(namespace: &str) -> String {
    format!("{namespace}-role")
}

pub fn user_role_binding_name(user: &str, namespace: &str) -> String {
    format!("{user}-{namespace}-role-binding")
}

pub fn tenant_namespace_name(tenant: &str, target: &str) -> String {
    format!("{tenant}-{target}")
}

/// Isolation namespace for a tenant-target, pinned to the target's nodes
pub fn new_tenant_namespace(tenant: &str, target: &str, kind: TargetKind) -> Resource {
    let selector = match kind {
        TargetKind::Node => format!("{NODE_HOSTNAME_LABEL}={target}"),
        TargetKind::Group => format!("{NODE_GROUP_LABEL}{target}=true"),
    };
    Resource::new(tenant_namespace_name(tenant, target), None, ResourceSpec::Namespace)
        .with_label(TENANT_LABEL, tenant)
        .with_annotation(NODE_SELECTOR_ANNOTATION, selector)
}

pub fn new_namespace(name: &str) -> Resource {
    Resource::new(name, None, ResourceSpec::Namespace)
}

pub fn new_resource_quota(namespace: &str, limits: &ParsedLimits) -> Result<Resource> {
    let mut hard = BTreeMap::new();
    hard.insert("secrets".to_string(), Quantity::parse("100")?);
    hard.insert("limits.memory".to_string(), limits.memory.clone());
    hard.insert("requests.memory".to_string(), limits.memory.clone());
    hard.insert("limits.cpu".to_string(), limits.cpu.clone());
    hard.insert("requests.cpu".to_string(), limits.cpu.clone());
    hard.insert("pods".to_string(), limits.pods.clone());
    hard.insert("requests.storage".to_string(), limits.storage.clone());
    hard.insert("requests.ephemeral-storage".to_string(), limits.storage.clone());
    hard.insert("limits.ephemeral-storage".to_string(), limits.storage.clone());

    Ok(Resource::new(
        format!("{namespace}-limits"),
        Some(namespace.to_string()),
        ResourceSpec::ResourceQuota { hard },
    ))
}

pub fn new_limit_range(namespace: &str, limits: &ParsedLimits) -> Result<Resource> {
    let storage = |q: &Quantity| BTreeMap::from([("ephemeral-storage".to_string(), q.clone())]);
    let default_storage = Quantity::parse("1Gi")?;

    Ok(Resource::new(
        format!("{namespace}-limitrange"),
        Some(namespace.to_string()),
        ResourceSpec::LimitRange {
            min: storage(&limits.storage_min),
            max: storage(&limits.storage),
            default: storage(&default_storage),
            default_request: storage(&default_storage),
        },
    ))
}

pub fn new_role(namespace: &str) -> Resource {
    let rules = vec![
        PolicyRule {
            api_groups: vec![String::new()],
            resources: vec!["pods".into(), "secrets".into(), "pods/exec".into()],
            verbs: ["get", "list", "watch", "update", "delete", "create"]
                .iter()
                .map(|v| v.to_string())
                .collect(),
            resource_names: Vec::new(),
        },
        PolicyRule {
            api_groups: vec![String::new()],
            resources: vec!["pods/log".into(), "events".into()],
            verbs: vec!["get".into(), "list".into()],
            resource_names: Vec::new(),
        },
    ];
    Resource::new(role_name(namespace), Some(namespace.to_string()), ResourceSpec::Role { rules })
}

/// Allows traffic only between namespaces of the same tenant
pub fn new_network_policy(namespace: &str, tenant: &str) -> Resource {
    let peers = BTreeMap::from([(TENANT_LABEL.to_string(), tenant.to_string())]);
    Resource::new(
        format!("{namespace}-networkpolicy"),
        Some(namespace.to_string()),
        ResourceSpec::NetworkPolicy {
            ingress_from: peers.clone(),
            egress_to: peers,
            policy_types: vec!["Ingress".into()],
        },
    )
}

/// Binds the namespace role to the tenant identity
pub fn new_tenant_role_binding(namespace: &str, tenant: &str) -> Resource {
    Resource::new(
        format!("{namespace}-{tenant}-binding"),
        Some(namespace.to_string()),
        ResourceSpec::RoleBinding {
            role: role_name(namespace),
            subjects: vec![Subject {
                kind: "ServiceAccount".into(),
                name: tenant_user_name(tenant),
                namespace: TENANT_HOME_NAMESPACE.into(),
            }],
        },
    )
}

pub fn new_service_account(name: &str, namespace: &str) -> Resource {
    Resource::new(name, Some(namespace.to_string()), ResourceSpec::ServiceAccount)
}

pub fn new_user_role_binding(user: &str, namespace: &str) -> Resource {
    Resource::new(
        user_role_binding_name(user, namespace),
        Some(namespace.to_string()),
        ResourceSpec::RoleBinding {
            role: role_name(namespace),
            subjects: vec![Subject {
                kind: "ServiceAccount".into(),
                name: user.into(),
                namespace: namespace.into(),
            }],
        },
    )
}

/// Identity record of a tenant. Access labels are added per tenant-target.
pub fn new_tenant_user(tenant: &str) -> Resource {
    new_service_account(&tenant_user_name(tenant), TENANT_HOME_NAMESPACE)
        .with_label(TENANT_LABEL, tenant)
        .with_label(TENANT_DEFAULT_LABEL, "")
}

/// Lets a tenant read its own identity record
pub fn new_tenant_default_role(tenant: &str) -> Resource {
    Resource::new(
        format!("{tenant}-defaultrole"),
        Some(TENANT_HOME_NAMESPACE.to_string()),
        ResourceSpec::Role {
            rules: vec![PolicyRule {
                api_groups: vec![String::new()],
                resources: vec!["serviceaccounts".into()],
                verbs: vec!["get".into()],
                resource_names: vec![tenant_user_name(tenant)],
            }],
        },
    )
    .with_label(TENANT_LABEL, tenant)
}

pub fn new_tenant_default_role_binding(tenant: &str) -> Resource {
    Resource::new(
        format!("{tenant}-defaultrolebinding"),
        Some(TENANT_HOME_NAMESPACE.to_string()),
        ResourceSpec::RoleBinding {
            role: format!("{tenant}-defaultrole"),
            subjects: vec![Subject {
                kind: "ServiceAccount".into(),
                name: tenant_user_name(tenant),
                namespace: TENANT_HOME_NAMESPACE.into(),
            }],
        },
    )
    .with_label(TENANT_LABEL, tenant)
}

pub fn new_pod(name: &str, namespace: &str, params: &Parameters, limits: &ParsedLimits) -> Result<Resource> {
    let image = params
        .image
        .clone()
        .ok_or_else(|| Error::validation(format!("pod {name} requires an image")))?;

    let mut pod_limits = BTreeMap::new();
    pod_limits.insert("cpu".to_string(), limits.cpu.clone());
    pod_limits.insert("memory".to_string(), limits.memory.clone());
    pod_limits.insert("ephemeral-storage".to_string(), limits.storage.clone());

    let env_secrets = params
        .secrets
        .iter()
        .map(|secret| EnvSecretRef {
            env_name: secret.clone(),
            secret_name: secret.clone(),
            key: "secret".into(),
        })
        .collect();

    Ok(Resource::new(
        name,
        Some(namespace.to_string()),
        ResourceSpec::Pod {
            image,
            command: params.command.clone(),
            limits: pod_limits,
            ports: params.ports.clone(),
            env_secrets,
            image_pull_secret: params.deploy_secret.clone(),
            restart_policy: params.restart_policy.unwrap_or_default(),
        },
    )
    .with_label("network", namespace))
}

pub fn new_secret(namespace: &str, name: &str, data: &str) -> Resource {
    Resource::new(
        name,
        Some(namespace.to_string()),
        ResourceSpec::Secret {
            secret_type: "Opaque".into(),
            data: BTreeMap::from([("secret".to_string(), data.as_bytes().to_vec())]),
        },
    )
}

/// Registry credentials for pulling private images
pub fn new_deployment_secret(namespace: &str, name: &str, docker_config_b64: &str) -> Result<Resource> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(docker_config_b64.trim())
        .map_err(|e| Error::validation(format!("registry credentials for {name} are not valid base64: {e}")))?;

    Ok(Resource::new(
        name,
        Some(namespace.to_string()),
        ResourceSpec::Secret {
            secret_type: "kubernetes.io/dockerconfigjson".into(),
            data: BTreeMap::from([(".dockerconfigjson".to_string(), decoded)]),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ParsedLimits {
        ResourceLimits::default().parse().unwrap()
    }

    #[test]
    fn test_tenant_namespace_node_selector() {
        let node = new_tenant_namespace("acme", "west", TargetKind::Node);
        assert_eq!(node.meta.name, "acme-west");
        assert_eq!(node.meta.labels[TENANT_LABEL], "acme");
        assert_eq!(
            node.meta.annotations[NODE_SELECTOR_ANNOTATION],
            "kubernetes.io/hostname=west"
        );

        let group = new_tenant_namespace("acme", "gpu", TargetKind::Group);
        assert_eq!(group.meta.annotations[NODE_SELECTOR_ANNOTATION], "kufast.group/gpu=true");
    }

    #[test]
    fn test_quota_carries_limits() {
        let quota = new_resource_quota("acme-west", &limits()).unwrap();
        assert_eq!(quota.meta.name, "acme-west-limits");
        match quota.spec {
            ResourceSpec::ResourceQuota { hard } => {
                assert_eq!(hard["limits.cpu"].as_str(), "500m");
                assert_eq!(hard["requests.memory"].as_str(), "1Gi");
                assert_eq!(hard["pods"].as_str(), "1");
                assert_eq!(hard["secrets"].as_str(), "100");
            }
            other => panic!("unexpected spec {other:?}"),
        }
    }

    #[test]
    fn test_tenant_role_binding_targets_tenant_user() {
        let rb = new_tenant_role_binding("acme-west", "acme");
        assert_eq!(rb.meta.name, "acme-west-acme-binding");
        match rb.spec {
            ResourceSpec::RoleBinding { role, subjects } => {
                assert_eq!(role, "acme-west-role");
                assert_eq!(subjects[0].name, "acme-user");
                assert_eq!(subjects[0].namespace, "default");
            }
            other => panic!("unexpected spec {other:?}"),
        }
    }

    #[test]
    fn test_pod_definition() {
        let params = Parameters {
            image: Some("nginx:1.25".into()),
            secrets: vec!["db-password".into()],
            deploy_secret: Some("registry".into()),
            ports: vec![8080],
            restart_policy: Some(RestartPolicy::Always),
            ..Default::default()
        };
        let pod = new_pod("web", "acme-west", &params, &limits()).unwrap();
        assert_eq!(pod.meta.labels["network"], "acme-west");
        match pod.spec {
            ResourceSpec::Pod {
                image,
                env_secrets,
                image_pull_secret,
                restart_policy,
                ports,
                ..
            } => {
                assert_eq!(image, "nginx:1.25");
                assert_eq!(env_secrets[0].secret_name, "db-password");
                assert_eq!(env_secrets[0].key, "secret");
                assert_eq!(image_pull_secret.as_deref(), Some("registry"));
                assert_eq!(restart_policy, RestartPolicy::Always);
                assert_eq!(ports, vec![8080]);
            }
            other => panic!("unexpected spec {other:?}"),
        }
    }

    #[test]
    fn test_deployment_secret_decodes_payload() {
        let secret = new_deployment_secret("acme-west", "registry", "eyJhdXRocyI6e319").unwrap();
        match secret.spec {
            ResourceSpec::Secret { secret_type, data } => {
                assert_eq!(secret_type, "kubernetes.io/dockerconfigjson");
                assert_eq!(data[".dockerconfigjson"], br#"{"auths":{}}"#.to_vec());
            }
            other => panic!("unexpected spec {other:?}"),
        }
        assert!(new_deployment_secret("acme-west", "registry", "not base64!").is_err());
    }

    #[test]
    fn test_tenant_user_labels() {
        let user = new_tenant_user("acme");
        assert_eq!(user.meta.name, "acme-user");
        assert_eq!(user.meta.namespace.as_deref(), Some("default"));
        assert_eq!(user.meta.labels[TENANT_DEFAULT_LABEL], "");
        assert_eq!(access_label("west", TargetKind::Node), "kufast.nodeaccess/west");
        assert_eq!(access_label("gpu", TargetKind::Group), "kufast.groupaccess/gpu");
    }
}
