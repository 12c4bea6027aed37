//! Server and agent configuration parsing.
//!
//! ```kdl
//! data-dir "/var/lib/hearth"
//! dispatch-policy "hold"
//! coalesce-policy "first-wins"
//!
//! master {
//!     resource "jdk" version="21"
//! }
//!
//! agent "linux-1" url="http://linux-1:8765" {
//!     resource "docker"
//! }
//! ```

use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use hearth_core::service::ServiceInfo;

use crate::node::{required_string_arg, resources, string_prop};
use crate::{ConfigError, ConfigResult};

pub const DEFAULT_AGENT_BIND: &str = "0.0.0.0:8765";

/// What to do with a recipe no registered service can run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchPolicy {
    /// Keep it until a suitable service registers.
    #[default]
    Hold,
    /// Reject it straight away.
    FailFast,
}

/// How a second request for an already queued project and spec is merged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoalescePolicy {
    #[default]
    FirstWins,
    LatestWins,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub url: String,
    pub resources: BTreeMap<String, Option<String>>,
}

impl AgentConfig {
    pub fn service_info(&self) -> ServiceInfo {
        let mut info = ServiceInfo::agent(self.name.clone());
        info.resources = self.resources.clone();
        info
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub dispatch_policy: DispatchPolicy,
    pub coalesce_policy: CoalescePolicy,
    pub master_resources: BTreeMap<String, Option<String>>,
    pub agents: Vec<AgentConfig>,
}

impl ServerConfig {
    pub fn master_info(&self) -> ServiceInfo {
        let mut info = ServiceInfo::master();
        info.resources = self.master_resources.clone();
        info
    }
}

/// Settings for a standalone agent process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub name: String,
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
    pub resources: BTreeMap<String, Option<String>>,
}

impl AgentSettings {
    pub fn service_info(&self) -> ServiceInfo {
        let mut info = ServiceInfo::agent(self.name.clone());
        info.resources = self.resources.clone();
        info
    }
}

/// Parse server configuration from KDL text.
pub fn parse_server_config(kdl: &str) -> ConfigResult<ServerConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut data_dir = None;
    let mut dispatch_policy = DispatchPolicy::default();
    let mut coalesce_policy = CoalescePolicy::default();
    let mut master_resources = BTreeMap::new();
    let mut agents: Vec<AgentConfig> = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "data-dir" => data_dir = Some(PathBuf::from(required_string_arg(node, 0, "data-dir")?)),
            "dispatch-policy" => dispatch_policy = parse_dispatch_policy(node)?,
            "coalesce-policy" => coalesce_policy = parse_coalesce_policy(node)?,
            "master" => master_resources = resources(node)?,
            "agent" => {
                let agent = parse_agent(node)?;
                if agents.iter().any(|a| a.name == agent.name) || agent.name == "master" {
                    return Err(ConfigError::Duplicate(format!("agent '{}'", agent.name)));
                }
                agents.push(agent);
            }
            _ => {}
        }
    }

    Ok(ServerConfig {
        data_dir: data_dir.ok_or_else(|| ConfigError::MissingField("data-dir".to_string()))?,
        dispatch_policy,
        coalesce_policy,
        master_resources,
        agents,
    })
}

pub fn load_server_config(path: &Path) -> ConfigResult<ServerConfig> {
    parse_server_config(&std::fs::read_to_string(path)?)
}

/// Parse agent settings from KDL text.
pub fn parse_agent_settings(kdl: &str) -> ConfigResult<AgentSettings> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = None;
    let mut bind = None;
    let mut data_dir = None;
    let mut resource_map = BTreeMap::new();

    for node in doc.nodes() {
        match node.name().value() {
            "name" => name = Some(required_string_arg(node, 0, "name")?),
            "bind" => bind = Some(parse_bind(&required_string_arg(node, 0, "bind")?)?),
            "data-dir" => data_dir = Some(PathBuf::from(required_string_arg(node, 0, "data-dir")?)),
            "resource" => {
                let resource = required_string_arg(node, 0, "resource name")?;
                resource_map.insert(resource, string_prop(node, "version"));
            }
            "resources" => resource_map.extend(resources(node)?),
            _ => {}
        }
    }

    Ok(AgentSettings {
        name: name.ok_or_else(|| ConfigError::MissingField("name".to_string()))?,
        bind: match bind {
            Some(bind) => bind,
            None => parse_bind(DEFAULT_AGENT_BIND)?,
        },
        data_dir: data_dir.ok_or_else(|| ConfigError::MissingField("data-dir".to_string()))?,
        resources: resource_map,
    })
}

pub fn load_agent_settings(path: &Path) -> ConfigResult<AgentSettings> {
    parse_agent_settings(&std::fs::read_to_string(path)?)
}

fn parse_agent(node: &KdlNode) -> ConfigResult<AgentConfig> {
    let name = required_string_arg(node, 0, "agent name")?;
    let url = string_prop(node, "url")
        .ok_or_else(|| ConfigError::MissingField(format!("url for agent '{name}'")))?;
    Ok(AgentConfig {
        name,
        url,
        resources: resources(node)?,
    })
}

fn parse_dispatch_policy(node: &KdlNode) -> ConfigResult<DispatchPolicy> {
    match required_string_arg(node, 0, "dispatch-policy")?.as_str() {
        "hold" => Ok(DispatchPolicy::Hold),
        "fail-fast" => Ok(DispatchPolicy::FailFast),
        other => Err(ConfigError::InvalidValue {
            field: "dispatch-policy".to_string(),
            message: format!("unknown policy '{other}'"),
        }),
    }
}

fn parse_coalesce_policy(node: &KdlNode) -> ConfigResult<CoalescePolicy> {
    match required_string_arg(node, 0, "coalesce-policy")?.as_str() {
        "first-wins" => Ok(CoalescePolicy::FirstWins),
        "latest-wins" => Ok(CoalescePolicy::LatestWins),
        other => Err(ConfigError::InvalidValue {
            field: "coalesce-policy".to_string(),
            message: format!("unknown policy '{other}'"),
        }),
    }
}

fn parse_bind(value: &str) -> ConfigResult<SocketAddr> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        field: "bind".to_string(),
        message: format!("'{value}' is not a socket address"),
    })
}
