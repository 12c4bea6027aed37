//! Execution services and host requirements.

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::recipe::RecipeRequest;
use crate::{ResourceId, Result};

/// Identity of the master's own execution service.
pub const MASTER_SERVICE: &str = "master";

/// Stable identity of an execution service.
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[display("{_0}")]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn master() -> Self {
        Self(MASTER_SERVICE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServiceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Master,
    Agent,
}

/// What a service is and what it can do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: ServiceId,
    pub kind: ServiceKind,
    /// Named capabilities, each with an optional version.
    #[serde(default)]
    pub resources: BTreeMap<String, Option<String>>,
}

impl ServiceInfo {
    pub fn master() -> Self {
        Self {
            id: ServiceId::master(),
            kind: ServiceKind::Master,
            resources: BTreeMap::new(),
        }
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            id: ServiceId::new(id),
            kind: ServiceKind::Agent,
            resources: BTreeMap::new(),
        }
    }

    pub fn with_resource(mut self, name: impl Into<String>, version: Option<&str>) -> Self {
        self.resources
            .insert(name.into(), version.map(str::to_string));
        self
    }

    /// True if the service has the resource, at the given version when one
    /// is asked for.
    pub fn has_resource(&self, name: &str, version: Option<&str>) -> bool {
        match (self.resources.get(name), version) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(have), Some(want)) => have.as_deref() == Some(want),
        }
    }
}

/// Predicate deciding which services may run a recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostRequirement {
    Any,
    Master,
    Service { id: ServiceId },
    Resource { name: String, version: Option<String> },
    AllOf { requirements: Vec<HostRequirement> },
}

impl HostRequirement {
    pub fn fulfilled_by(&self, service: &ServiceInfo) -> bool {
        match self {
            HostRequirement::Any => true,
            HostRequirement::Master => service.kind == ServiceKind::Master,
            HostRequirement::Service { id } => &service.id == id,
            HostRequirement::Resource { name, version } => {
                service.has_resource(name, version.as_deref())
            }
            HostRequirement::AllOf { requirements } => {
                requirements.iter().all(|r| r.fulfilled_by(service))
            }
        }
    }
}

impl std::fmt::Display for HostRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostRequirement::Any => write!(f, "any service"),
            HostRequirement::Master => write!(f, "master"),
            HostRequirement::Service { id } => write!(f, "service '{id}'"),
            HostRequirement::Resource {
                name,
                version: Some(version),
            } => write!(f, "resource '{name}' version {version}"),
            HostRequirement::Resource {
                name,
                version: None,
            } => write!(f, "resource '{name}'"),
            HostRequirement::AllOf { requirements } => {
                let parts: Vec<String> = requirements.iter().map(|r| r.to_string()).collect();
                write!(f, "all of [{}]", parts.join(", "))
            }
        }
    }
}

/// Where collected results should go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectRequest {
    pub project: String,
    pub spec: String,
    pub recipe_id: ResourceId,
    pub incremental: bool,
    /// Receives the recipe output tree.
    pub output_dest: PathBuf,
    /// Receives the working copy, if wanted.
    pub working_copy_dest: Option<PathBuf>,
}

/// A host that can run recipes.
///
/// `build` hands the request off and returns without waiting for the recipe;
/// progress is reported through lifecycle events.
#[async_trait]
pub trait ExecutionService: Send + Sync {
    fn info(&self) -> &ServiceInfo;

    fn id(&self) -> &ServiceId {
        &self.info().id
    }

    async fn build(&self, request: RecipeRequest) -> Result<()>;

    /// Copy or move results out of the service. The output tree is always
    /// collected; the working copy only when a destination is given.
    async fn collect_results(&self, request: &CollectRequest) -> Result<()>;

    /// Remove the recipe's directories. The persistent working copy is kept
    /// for incremental builds.
    async fn cleanup(
        &self,
        project: &str,
        spec: &str,
        recipe_id: ResourceId,
        incremental: bool,
    ) -> Result<()>;

    /// Returns false if the recipe is unknown or already finished.
    async fn terminate(&self, recipe_id: ResourceId) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_requirements() {
        let master = ServiceInfo::master();
        let agent = ServiceInfo::agent("linux-1")
            .with_resource("jdk", Some("21"))
            .with_resource("docker", None);

        assert!(HostRequirement::Any.fulfilled_by(&master));
        assert!(HostRequirement::Master.fulfilled_by(&master));
        assert!(!HostRequirement::Master.fulfilled_by(&agent));
        assert!(
            HostRequirement::Service {
                id: ServiceId::new("linux-1")
            }
            .fulfilled_by(&agent)
        );

        let jdk21 = HostRequirement::Resource {
            name: "jdk".to_string(),
            version: Some("21".to_string()),
        };
        let jdk17 = HostRequirement::Resource {
            name: "jdk".to_string(),
            version: Some("17".to_string()),
        };
        assert!(jdk21.fulfilled_by(&agent));
        assert!(!jdk17.fulfilled_by(&agent));
        assert!(!jdk21.fulfilled_by(&master));

        let both = HostRequirement::AllOf {
            requirements: vec![
                jdk21,
                HostRequirement::Resource {
                    name: "docker".to_string(),
                    version: None,
                },
            ],
        };
        assert!(both.fulfilled_by(&agent));
    }

    #[test]
    fn test_requirement_display() {
        let requirement = HostRequirement::AllOf {
            requirements: vec![
                HostRequirement::Master,
                HostRequirement::Resource {
                    name: "gcc".to_string(),
                    version: None,
                },
            ],
        };
        assert_eq!(requirement.to_string(), "all of [master, resource 'gcc']");
    }
}
