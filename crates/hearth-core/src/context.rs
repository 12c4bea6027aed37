//! The context a command executes in.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::{Path, PathBuf};

use crate::output::OutputSink;
use crate::recipe::RecipePaths;
use crate::scope::PropertyScope;
use crate::{Error, ResourceId, Result};

/// Scope layer holding recipe-wide properties.
pub const RECIPE_LAYER: &str = "recipe";
/// Scope layer holding the current command's properties.
pub const COMMAND_LAYER: &str = "command";

/// Encode an arbitrary name so it is safe as a single path component.
///
/// Alphanumerics and `-_.` pass through; everything else is percent encoded.
pub fn encode_path_component(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => {
                encoded.push(byte as char)
            }
            _ => {
                let _ = write!(encoded, "%{byte:02X}");
            }
        }
    }
    if encoded.is_empty() || encoded.chars().all(|c| c == '.') {
        encoded = encoded.replace('.', "%2E");
        if encoded.is_empty() {
            encoded.push_str("%00");
        }
    }
    encoded
}

/// Output directory name for the command at `index` (1-based).
pub fn command_dir_name(index: usize, name: &str) -> String {
    format!("{index:08}-{}", encode_path_component(name))
}

#[derive(Debug)]
pub struct CommandContext {
    recipe_id: ResourceId,
    paths: RecipePaths,
    scope: PropertyScope,
    command_dir: Option<PathBuf>,
    outputs: BTreeMap<String, PathBuf>,
    live: Option<OutputSink>,
}

impl CommandContext {
    /// `scope` should already hold the recipe-wide properties; a command
    /// layer is pushed on top of it for each command.
    pub fn new(
        recipe_id: ResourceId,
        paths: RecipePaths,
        scope: PropertyScope,
        live: Option<OutputSink>,
    ) -> Self {
        Self {
            recipe_id,
            paths,
            scope,
            command_dir: None,
            outputs: BTreeMap::new(),
            live,
        }
    }

    pub fn recipe_id(&self) -> ResourceId {
        self.recipe_id
    }

    pub fn paths(&self) -> &RecipePaths {
        &self.paths
    }

    pub fn base_dir(&self) -> &Path {
        &self.paths.base_dir
    }

    pub fn scope(&self) -> &PropertyScope {
        &self.scope
    }

    pub fn scope_mut(&mut self) -> &mut PropertyScope {
        &mut self.scope
    }

    pub fn into_scope(self) -> PropertyScope {
        self.scope
    }

    pub fn live(&self) -> Option<&OutputSink> {
        self.live.as_ref()
    }

    /// Start a command: create its output directory and a fresh scope layer.
    pub async fn begin_command(&mut self, index: usize, name: &str) -> Result<PathBuf> {
        self.scope.truncate_to(RECIPE_LAYER);
        self.scope.push(COMMAND_LAYER);
        self.outputs.clear();

        let dir = self.paths.output_dir.join(command_dir_name(index, name));
        tokio::fs::create_dir_all(&dir).await?;
        self.command_dir = Some(dir.clone());
        Ok(dir)
    }

    /// Drop the command's scope layer and forget its outputs.
    pub fn end_command(&mut self) {
        self.scope.truncate_to(RECIPE_LAYER);
        self.outputs.clear();
        self.command_dir = None;
    }

    pub fn command_dir(&self) -> Result<&Path> {
        self.command_dir
            .as_deref()
            .ok_or_else(|| Error::Internal("no command is executing".to_string()))
    }

    /// Reserve an output directory for the named output of the current
    /// command. Each name may be registered once per command.
    pub async fn register_output(&mut self, name: &str) -> Result<PathBuf> {
        if self.outputs.contains_key(name) {
            return Err(Error::Conflict(format!(
                "output '{name}' is already registered"
            )));
        }
        let dir = self.command_dir()?.join(encode_path_component(name));
        tokio::fs::create_dir_all(&dir).await?;
        self.outputs.insert(name.to_string(), dir.clone());
        Ok(dir)
    }

    pub fn registered_output(&self, name: &str) -> Option<&Path> {
        self.outputs.get(name).map(PathBuf::as_path)
    }

    /// Open a sink capturing to `path`, also feeding the live output when
    /// one is attached.
    pub fn open_output(&self, path: &Path) -> Result<OutputSink> {
        let sink = match &self.live {
            Some(live) => live.fork(path)?,
            None => OutputSink::to_file(path)?,
        };
        Ok(sink)
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.scope.value(name)
    }

    pub fn expand(&self, input: &str) -> String {
        self.scope.expand(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(dir: &Path) -> CommandContext {
        let paths = RecipePaths::new(dir.join("base"), dir.join("output"));
        let mut scope = PropertyScope::new();
        scope.add_value("compiler", "gcc");
        scope.push(RECIPE_LAYER);
        CommandContext::new(ResourceId::new(), paths, scope, None)
    }

    #[test]
    fn test_encode_path_component() {
        assert_eq!(encode_path_component("build"), "build");
        assert_eq!(encode_path_component("run tests"), "run%20tests");
        assert_eq!(encode_path_component("a/b"), "a%2Fb");
        assert_eq!(encode_path_component(".."), "%2E%2E");
        assert_eq!(encode_path_component(""), "%00");
    }

    #[test]
    fn test_command_dir_name() {
        assert_eq!(command_dir_name(1, "bootstrap"), "00000001-bootstrap");
        assert_eq!(command_dir_name(12, "unit tests"), "00000012-unit%20tests");
    }

    #[tokio::test]
    async fn test_register_output_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let command_dir = ctx.begin_command(1, "build").await.unwrap();

        let out = ctx.register_output("command output").await.unwrap();
        assert_eq!(out, command_dir.join("command%20output"));
        assert!(out.is_dir());

        assert!(matches!(
            ctx.register_output("command output").await,
            Err(Error::Conflict(_))
        ));
        assert!(ctx.register_output("reports").await.is_ok());
    }

    #[tokio::test]
    async fn test_outputs_reset_between_commands() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());

        ctx.begin_command(1, "first").await.unwrap();
        ctx.register_output("logs").await.unwrap();
        ctx.end_command();

        ctx.begin_command(2, "second").await.unwrap();
        let logs = ctx.register_output("logs").await.unwrap();
        assert!(logs.starts_with(dir.path().join("output/00000002-second")));
    }

    #[tokio::test]
    async fn test_command_layer_shadows_and_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());

        ctx.begin_command(1, "build").await.unwrap();
        ctx.scope_mut().add_value("compiler", "clang");
        assert_eq!(ctx.expand("${compiler}"), "clang");
        ctx.end_command();

        assert_eq!(ctx.property("compiler"), Some("gcc"));
    }

    #[test]
    fn test_register_requires_running_command() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        assert!(ctx.command_dir().is_err());
    }
}
