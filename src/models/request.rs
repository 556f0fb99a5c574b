//! Provisioning requests

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::RestartPolicy;
use crate::quantity::Quantity;
use crate::{Error, Result};

/// What a request provisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    Namespace,
    Pod,
    Secret,
    User,
    Tenant,
    TenantTarget,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Namespace => write!(f, "namespace"),
            RequestKind::Pod => write!(f, "pod"),
            RequestKind::Secret => write!(f, "secret"),
            RequestKind::User => write!(f, "user"),
            RequestKind::Tenant => write!(f, "tenant"),
            RequestKind::TenantTarget => write!(f, "tenant-target"),
        }
    }
}

/// Whether a target names a single node or a node group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[default]
    Node,
    Group,
}

/// Resource limits applied to namespaces and pods
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub cpu: String,
    pub memory: String,
    pub storage: String,
    pub storage_min: String,
    pub pods: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu: "500m".to_string(),
            memory: "1Gi".to_string(),
            storage: "10Gi".to_string(),
            storage_min: "1Gi".to_string(),
            pods: "1".to_string(),
        }
    }
}

/// Parsed form of [`ResourceLimits`]
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLimits {
    pub cpu: Quantity,
    pub memory: Quantity,
    pub storage: Quantity,
    pub storage_min: Quantity,
    pub pods: Quantity,
}

impl ResourceLimits {
    pub fn parse(&self) -> Result<ParsedLimits> {
        let parsed = ParsedLimits {
            cpu: Quantity::parse(&self.cpu)?,
            memory: Quantity::parse(&self.memory)?,
            storage: Quantity::parse(&self.storage)?,
            storage_min: Quantity::parse(&self.storage_min)?,
            pods: Quantity::parse(&self.pods)?,
        };

        for q in [&parsed.cpu, &parsed.memory, &parsed.storage, &parsed.storage_min, &parsed.pods] {
            if q.is_negative() {
                return Err(Error::validation(format!("limit {q} must not be negative")));
            }
        }
        if parsed.storage_min.value() > parsed.storage.value() {
            return Err(Error::validation(format!(
                "minimum storage {} exceeds storage limit {}",
                parsed.storage_min, parsed.storage
            )));
        }
        Ok(parsed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    pub limits: ResourceLimits,
    pub target_kind: TargetKind,
    pub image: Option<String>,
    pub command: Vec<String>,
    /// Secrets exposed to the pod as environment variables
    pub secrets: Vec<String>,
    /// Image pull secret
    pub deploy_secret: Option<String>,
    pub ports: Vec<u16>,
    pub restart_policy: Option<RestartPolicy>,
    pub secret_data: Option<String>,
    /// Base64 encoded registry credentials (`.dockerconfigjson`)
    pub docker_config: Option<String>,
    pub users: Vec<String>,
}

/// One independently named unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    pub kind: RequestKind,
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub params: Parameters,
}

impl ProvisioningRequest {
    pub fn new(kind: RequestKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            parent: None,
            params: Parameters::default(),
        }
    }

    pub fn namespace(name: impl Into<String>) -> Self {
        Self::new(RequestKind::Namespace, name)
    }

    pub fn tenant(name: impl Into<String>) -> Self {
        Self::new(RequestKind::Tenant, name)
    }

    pub fn tenant_target(tenant: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(RequestKind::TenantTarget, target).with_parent(tenant)
    }

    pub fn pod(namespace: impl Into<String>, name: impl Into<String>, image: impl Into<String>) -> Self {
        let mut req = Self::new(RequestKind::Pod, name).with_parent(namespace);
        req.params.image = Some(image.into());
        req
    }

    pub fn secret(namespace: impl Into<String>, name: impl Into<String>, data: impl Into<String>) -> Self {
        let mut req = Self::new(RequestKind::Secret, name).with_parent(namespace);
        req.params.secret_data = Some(data.into());
        req
    }

    pub fn user(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(RequestKind::User, name).with_parent(namespace)
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.params.limits = limits;
        self
    }

    pub fn with_target_kind(mut self, kind: TargetKind) -> Self {
        self.params.target_kind = kind;
        self
    }

    pub fn with_params(mut self, params: Parameters) -> Self {
        self.params = params;
        self
    }

    /// Name of the namespace the unit's primary object lives in (or is)
    pub fn namespace_name(&self) -> String {
        match self.kind {
            RequestKind::TenantTarget => {
                crate::definitions::tenant_namespace_name(self.parent.as_deref().unwrap_or_default(), &self.name)
            }
            RequestKind::Namespace => self.name.clone(),
            RequestKind::Tenant => crate::definitions::TENANT_HOME_NAMESPACE.to_string(),
            _ => self.parent.clone().unwrap_or_default(),
        }
    }

    /// Human readable unit label used in logs and outcomes
    pub fn display_name(&self) -> String {
        match self.kind {
            RequestKind::TenantTarget | RequestKind::Namespace => {
                format!("{} {}", self.kind, self.namespace_name())
            }
            _ => match &self.parent {
                Some(parent) => format!("{} {}/{}", self.kind, parent, self.name),
                None => format!("{} {}", self.kind, self.name),
            },
        }
    }

    /// Checks that the request names an object. Enough for deletion.
    pub fn validate_reference(&self) -> Result<()> {
        validate_name("name", &self.name)?;

        match self.kind {
            RequestKind::Namespace | RequestKind::Tenant => Ok(()),
            RequestKind::TenantTarget => {
                validate_name("tenant", self.parent_name()?)?;
                validate_name("namespace", &self.namespace_name())
            }
            _ => validate_name("parent", self.parent_name()?),
        }
    }

    fn parent_name(&self) -> Result<&str> {
        self.parent
            .as_deref()
            .ok_or_else(|| Error::validation(format!("{} {} requires a parent", self.kind, self.name)))
    }

    /// Checks the request shape for creation. Never touches the cluster.
    pub fn validate(&self) -> Result<()> {
        self.validate_reference()?;

        match self.kind {
            RequestKind::Namespace => {
                self.params.limits.parse()?;
                for user in &self.params.users {
                    validate_name("user", user)?;
                }
            }
            RequestKind::TenantTarget => {
                self.params.limits.parse()?;
            }
            RequestKind::Pod => {
                match self.params.image.as_deref() {
                    Some(image) if !image.trim().is_empty() => {}
                    _ => return Err(Error::validation(format!("pod {} requires an image", self.name))),
                }
                self.params.limits.parse()?;
                for secret in self.params.secrets.iter().chain(self.params.deploy_secret.iter()) {
                    validate_name("secret", secret)?;
                }
                if self.params.ports.contains(&0) {
                    return Err(Error::validation("port 0 is not a valid container port"));
                }
            }
            RequestKind::Secret => match (&self.params.secret_data, &self.params.docker_config) {
                (Some(_), None) | (None, Some(_)) => {}
                (None, None) => {
                    return Err(Error::validation(format!("secret {} has no data", self.name)))
                }
                (Some(_), Some(_)) => {
                    return Err(Error::validation(format!(
                        "secret {} sets both plain data and registry credentials",
                        self.name
                    )))
                }
            },
            RequestKind::User | RequestKind::Tenant => {}
        }
        Ok(())
    }
}

/// Object names must be DNS labels
pub fn validate_name(field: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "{field} {name:?} must be lowercase alphanumeric (dashes allowed inside), at most 63 characters"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_target_namespace_name() {
        let req = ProvisioningRequest::tenant_target("acme", "west");
        assert_eq!(req.namespace_name(), "acme-west");
        assert_eq!(req.display_name(), "tenant-target acme-west");
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_invalid_quantity_fails_validation() {
        let limits = ResourceLimits {
            cpu: "xyz".into(),
            ..Default::default()
        };
        let req = ProvisioningRequest::tenant_target("acme", "west").with_limits(limits);
        let err = req.validate().unwrap_err();
        assert!(matches!(err, Error::Quantity(_)));
        assert!(err.to_string().contains("xyz"));
    }

    #[test]
    fn test_storage_min_above_storage_rejected() {
        let limits = ResourceLimits {
            storage: "1Gi".into(),
            storage_min: "2Gi".into(),
            ..Default::default()
        };
        let req = ProvisioningRequest::namespace("team").with_limits(limits);
        assert!(matches!(req.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_parent_required() {
        let req = ProvisioningRequest::new(RequestKind::Pod, "web");
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_reference_validation_ignores_creation_params() {
        let mut req = ProvisioningRequest::new(RequestKind::Pod, "web").with_parent("acme-west");
        assert!(req.validate().is_err());
        assert!(req.validate_reference().is_ok());
        req.parent = None;
        assert!(req.validate_reference().is_err());
    }

    #[test]
    fn test_pod_requires_image() {
        let mut req = ProvisioningRequest::pod("acme-west", "web", "nginx");
        assert!(req.validate().is_ok());
        req.params.image = Some("  ".into());
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_secret_data_exclusive() {
        let mut req = ProvisioningRequest::secret("acme-west", "token", "hunter2");
        assert!(req.validate().is_ok());
        req.params.docker_config = Some("e30=".into());
        assert!(req.validate().is_err());
        req.params.secret_data = None;
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_name_rules() {
        assert!(validate_name("name", "a-west").is_ok());
        assert!(validate_name("name", "West").is_err());
        assert!(validate_name("name", "-west").is_err());
        assert!(validate_name("name", "a_west").is_err());
        assert!(validate_name("name", "").is_err());
        assert!(validate_name("name", &"a".repeat(64)).is_err());
    }

    #[test]
    fn test_request_from_json() {
        let req: ProvisioningRequest = serde_json::from_str(
            r#"{"kind": "tenant-target", "name": "west", "parent": "acme",
                "params": {"limits": {"cpu": "2"}, "target_kind": "group"}}"#,
        )
        .unwrap();
        assert_eq!(req.kind, RequestKind::TenantTarget);
        assert_eq!(req.params.limits.cpu, "2");
        assert_eq!(req.params.limits.memory, "1Gi");
        assert_eq!(req.params.target_kind, TargetKind::Group);
    }
}
