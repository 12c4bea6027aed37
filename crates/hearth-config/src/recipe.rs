//! Recipe file parsing.
//!
//! A recipe file names one or more recipes, each an ordered list of
//! commands:
//!
//! ```kdl
//! default-recipe "build"
//! property "compiler" "gcc" env=#true
//!
//! recipe "build" {
//!     command "compile" {
//!         exec "make" "all" working-dir="src"
//!         artifact "reports" path="build/reports" directory=#true
//!         process-output {
//!             error "^error:"
//!         }
//!     }
//! }
//! ```

use hearth_core::artifact::FeatureLevel;
use hearth_core::scope::Property;
use kdl::{KdlDocument, KdlNode};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::node::{
    bool_prop, children, required_string_arg, string_arg, string_args, string_prop, string_props,
    u64_arg,
};
use crate::{ConfigError, ConfigResult};

/// Every recipe defined by one recipe file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectRecipes {
    pub default_recipe: Option<String>,
    /// Properties visible to every recipe in the file.
    pub properties: Vec<Property>,
    pub recipes: Vec<RecipeConfig>,
}

impl ProjectRecipes {
    pub fn recipe(&self, name: &str) -> Option<&RecipeConfig> {
        self.recipes.iter().find(|r| r.name == name)
    }

    /// The named recipe, or the default when no name is given.
    pub fn resolve(&self, name: Option<&str>) -> ConfigResult<&RecipeConfig> {
        let name = match name {
            Some(name) => name,
            None => self
                .default_recipe
                .as_deref()
                .ok_or(ConfigError::NoDefaultRecipe)?,
        };
        self.recipe(name)
            .ok_or_else(|| ConfigError::UndefinedRecipe(name.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecipeConfig {
    pub name: String,
    pub properties: Vec<Property>,
    pub commands: Vec<CommandConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandConfig {
    pub name: String,
    pub action: CommandAction,
    pub properties: Vec<Property>,
    pub artifacts: Vec<ArtifactConfig>,
    /// Processors run over the command's captured output.
    pub output_processors: Vec<ProcessorConfig>,
}

/// What a command does.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandAction {
    Exec {
        exe: String,
        args: Vec<String>,
        working_dir: Option<String>,
        env: BTreeMap<String, String>,
    },
    Print {
        message: String,
    },
    Sleep {
        millis: u64,
    },
    /// A command provided by a plugged-in factory.
    Custom {
        kind: String,
        args: BTreeMap<String, String>,
    },
}

/// Files or directories captured from the base directory after a command.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactConfig {
    pub name: String,
    pub path: String,
    pub directory: bool,
    /// Fail the command if nothing exists at `path`.
    pub required: bool,
    pub processors: Vec<ProcessorConfig>,
}

/// Regex patterns that turn matching lines into features.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    pub patterns: Vec<(FeatureLevel, String)>,
    pub fail_on_error: bool,
    pub fail_on_warning: bool,
}

/// Parse a recipe file from KDL text.
pub fn parse_recipes(kdl: &str) -> ConfigResult<ProjectRecipes> {
    let doc: KdlDocument = kdl.parse()?;
    let mut recipes = ProjectRecipes::default();

    for node in doc.nodes() {
        match node.name().value() {
            "default-recipe" => {
                recipes.default_recipe = Some(required_string_arg(node, 0, "default recipe name")?);
            }
            "property" => recipes.properties.push(parse_property(node)?),
            "recipe" => {
                let recipe = parse_recipe(node)?;
                if recipes.recipe(&recipe.name).is_some() {
                    return Err(ConfigError::Duplicate(format!("recipe '{}'", recipe.name)));
                }
                recipes.recipes.push(recipe);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if let Some(default) = &recipes.default_recipe {
        if recipes.recipe(default).is_none() {
            return Err(ConfigError::UndefinedRecipe(default.clone()));
        }
    }

    Ok(recipes)
}

/// Read and parse a recipe file.
pub fn load_recipes(path: &Path) -> ConfigResult<ProjectRecipes> {
    let text = std::fs::read_to_string(path)?;
    parse_recipes(&text)
}

fn parse_property(node: &KdlNode) -> ConfigResult<Property> {
    let name = required_string_arg(node, 0, "property name")?;
    let value = string_arg(node, 1).unwrap_or_default();
    Ok(Property {
        name,
        value,
        add_to_environment: bool_prop(node, "env").unwrap_or(false),
    })
}

fn parse_recipe(node: &KdlNode) -> ConfigResult<RecipeConfig> {
    let name = required_string_arg(node, 0, "recipe name")?;
    let mut properties = Vec::new();
    let mut commands: Vec<CommandConfig> = Vec::new();
    let mut seen = HashSet::new();

    for child in children(node) {
        match child.name().value() {
            "property" => properties.push(parse_property(child)?),
            "command" => {
                let command = parse_command(child)?;
                if !seen.insert(command.name.clone()) {
                    return Err(ConfigError::Duplicate(format!(
                        "command '{}' in recipe '{}'",
                        command.name, name
                    )));
                }
                commands.push(command);
            }
            _ => {}
        }
    }

    Ok(RecipeConfig {
        name,
        properties,
        commands,
    })
}

fn parse_command(node: &KdlNode) -> ConfigResult<CommandConfig> {
    let name = required_string_arg(node, 0, "command name")?;
    let mut action = None;
    let mut properties = Vec::new();
    let mut artifacts = Vec::new();
    let mut output_processors = Vec::new();

    for child in children(node) {
        let parsed = match child.name().value() {
            "exec" => Some(parse_exec(child)?),
            "print" => Some(CommandAction::Print {
                message: required_string_arg(child, 0, "print message")?,
            }),
            "sleep" => Some(CommandAction::Sleep {
                millis: u64_arg(child, 0, "sleep duration")?,
            }),
            "custom" => Some(CommandAction::Custom {
                kind: required_string_arg(child, 0, "custom command kind")?,
                args: string_props(child),
            }),
            "property" => {
                properties.push(parse_property(child)?);
                None
            }
            "artifact" => {
                artifacts.push(parse_artifact(child)?);
                None
            }
            "process-output" => {
                output_processors.push(parse_processor(child)?);
                None
            }
            _ => None,
        };
        if let Some(parsed) = parsed {
            if action.is_some() {
                return Err(ConfigError::InvalidValue {
                    field: format!("command '{name}'"),
                    message: "only one action is allowed per command".to_string(),
                });
            }
            action = Some(parsed);
        }
    }

    let action =
        action.ok_or_else(|| ConfigError::MissingField(format!("action for command '{name}'")))?;

    Ok(CommandConfig {
        name,
        action,
        properties,
        artifacts,
        output_processors,
    })
}

fn parse_exec(node: &KdlNode) -> ConfigResult<CommandAction> {
    let mut args = string_args(node).into_iter();
    let exe = args
        .next()
        .ok_or_else(|| ConfigError::MissingField("exec executable".to_string()))?;

    let mut env = BTreeMap::new();
    for child in children(node).filter(|c| c.name().value() == "env") {
        let key = required_string_arg(child, 0, "env name")?;
        env.insert(key, string_arg(child, 1).unwrap_or_default());
    }

    Ok(CommandAction::Exec {
        exe,
        args: args.collect(),
        working_dir: string_prop(node, "working-dir"),
        env,
    })
}

fn parse_artifact(node: &KdlNode) -> ConfigResult<ArtifactConfig> {
    let name = required_string_arg(node, 0, "artifact name")?;
    let path = string_prop(node, "path")
        .ok_or_else(|| ConfigError::MissingField(format!("path for artifact '{name}'")))?;

    let mut processors = Vec::new();
    for child in children(node).filter(|c| c.name().value() == "processor") {
        processors.push(parse_processor(child)?);
    }

    Ok(ArtifactConfig {
        name,
        path,
        directory: bool_prop(node, "directory").unwrap_or(false),
        required: bool_prop(node, "required").unwrap_or(true),
        processors,
    })
}

fn parse_processor(node: &KdlNode) -> ConfigResult<ProcessorConfig> {
    let mut patterns = Vec::new();
    for child in children(node) {
        let level = match child.name().value() {
            "error" => FeatureLevel::Error,
            "warning" => FeatureLevel::Warning,
            "info" => FeatureLevel::Info,
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "processor pattern".to_string(),
                    message: format!("unknown feature level '{other}'"),
                });
            }
        };
        let expr = required_string_arg(child, 0, "processor expression")?;
        if let Err(e) = regex::Regex::new(&expr) {
            return Err(ConfigError::InvalidValue {
                field: "processor expression".to_string(),
                message: e.to_string(),
            });
        }
        patterns.push((level, expr));
    }

    Ok(ProcessorConfig {
        patterns,
        fail_on_error: bool_prop(node, "fail-on-error").unwrap_or(true),
        fail_on_warning: bool_prop(node, "fail-on-warning").unwrap_or(false),
    })
}
