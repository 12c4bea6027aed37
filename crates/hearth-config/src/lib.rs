//! KDL configuration parsing for Hearth.
//!
//! This crate handles parsing of:
//! - Recipe files (the commands a project builds with)
//! - Server configuration (data directory, policies, agents)
//! - Agent settings

pub mod error;
mod node;
pub mod recipe;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use recipe::{
    ArtifactConfig, CommandAction, CommandConfig, ProcessorConfig, ProjectRecipes, RecipeConfig,
    load_recipes, parse_recipes,
};
pub use system::{
    AgentConfig, AgentSettings, CoalescePolicy, DispatchPolicy, ServerConfig, load_agent_settings,
    load_server_config, parse_agent_settings, parse_server_config,
};
