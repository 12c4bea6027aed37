//! Command and recipe results.
//!
//! Results start out `Initial`, move to `InProgress` when commenced and are
//! sealed by `complete()`. While in progress a result can only get worse
//! (success < failure < error < terminated); once sealed nothing about it
//! changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::artifact::{Feature, FeatureLevel, StoredArtifact};
use crate::{Error, ResourceId, Result};

/// State of a command, recipe or build result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultState {
    Initial,
    InProgress,
    Success,
    Failure,
    Error,
    Terminated,
}

impl ResultState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ResultState::Success
                | ResultState::Failure
                | ResultState::Error
                | ResultState::Terminated
        )
    }

    /// True while nothing has gone wrong.
    pub fn is_healthy(self) -> bool {
        matches!(
            self,
            ResultState::Initial | ResultState::InProgress | ResultState::Success
        )
    }

    fn severity(self) -> u8 {
        match self {
            ResultState::Initial | ResultState::InProgress | ResultState::Success => 0,
            ResultState::Failure => 1,
            ResultState::Error => 2,
            ResultState::Terminated => 3,
        }
    }

    /// The worse of two states. Ties keep `self`.
    pub fn worse(self, other: ResultState) -> ResultState {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for ResultState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResultState::Initial => "initial",
            ResultState::InProgress => "in progress",
            ResultState::Success => "success",
            ResultState::Failure => "failure",
            ResultState::Error => "error",
            ResultState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Outcome of one command within a recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    name: String,
    state: ResultState,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    properties: BTreeMap<String, String>,
    #[serde(default)]
    features: Vec<Feature>,
    #[serde(default)]
    artifacts: Vec<StoredArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output_dir: Option<PathBuf>,
}

impl CommandResult {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ResultState::Initial,
            started_at: None,
            completed_at: None,
            properties: BTreeMap::new(),
            features: Vec::new(),
            artifacts: Vec::new(),
            output_dir: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ResultState {
        self.state
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn artifacts(&self) -> &[StoredArtifact] {
        &self.artifacts
    }

    pub fn artifact(&self, name: &str) -> Option<&StoredArtifact> {
        self.artifacts.iter().find(|a| a.name == name)
    }

    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    pub fn is_sealed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn set_output_dir(&mut self, dir: impl Into<PathBuf>) {
        if !self.is_sealed() {
            self.output_dir = Some(dir.into());
        }
    }

    pub fn commence(&mut self) {
        if self.state == ResultState::Initial {
            self.state = ResultState::InProgress;
            self.started_at = Some(Utc::now());
        }
    }

    /// Record an expected failure. No effect once sealed.
    pub fn failure(&mut self, summary: impl Into<String>) {
        self.degrade(ResultState::Failure, summary.into());
    }

    /// Record an unexpected error. No effect once sealed.
    pub fn error(&mut self, summary: impl Into<String>) {
        self.degrade(ResultState::Error, summary.into());
    }

    fn degrade(&mut self, state: ResultState, summary: String) {
        if self.is_sealed() {
            return;
        }
        self.state = self.state.worse(state);
        self.features.push(Feature::error(summary));
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        self.properties.insert(name.into(), value.into());
        Ok(())
    }

    pub fn add_feature(&mut self, feature: Feature) -> Result<()> {
        self.ensure_open()?;
        self.features.push(feature);
        Ok(())
    }

    pub fn add_artifact(&mut self, artifact: StoredArtifact) -> Result<()> {
        self.ensure_open()?;
        self.artifacts.push(artifact);
        Ok(())
    }

    /// Swap in a new version of an artifact, e.g. once post-processing has
    /// added features. Unknown names are appended.
    pub fn replace_artifact(&mut self, artifact: StoredArtifact) -> Result<()> {
        self.ensure_open()?;
        match self.artifacts.iter_mut().find(|a| a.name == artifact.name) {
            Some(existing) => *existing = artifact,
            None => self.artifacts.push(artifact),
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_sealed() {
            return Err(Error::Sealed(format!("command '{}'", self.name)));
        }
        Ok(())
    }

    /// Seal the result. A command that ran without problems succeeds.
    pub fn complete(&mut self) {
        if self.is_sealed() {
            return;
        }
        let now = Utc::now();
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if !self.state.is_terminal() {
            self.state = ResultState::Success;
        }
        self.completed_at = Some(now);
    }

    /// Error summaries from the command itself and from its artifacts.
    pub fn collect_errors(&self) -> Vec<String> {
        let mut errors: Vec<String> = self
            .features
            .iter()
            .filter(|f| f.level == FeatureLevel::Error)
            .map(|f| f.summary.clone())
            .collect();
        for artifact in &self.artifacts {
            errors.extend(artifact.collect_features(FeatureLevel::Error));
        }
        errors
    }

    pub fn has_messages(&self, level: FeatureLevel) -> bool {
        self.features.iter().any(|f| f.level == level)
            || self.artifacts.iter().any(|a| a.has_messages(level))
    }
}

/// Outcome of one recipe: the commands that actually ran, in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeResult {
    id: ResourceId,
    recipe_name: Option<String>,
    state: ResultState,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    features: Vec<Feature>,
    #[serde(default)]
    commands: Vec<CommandResult>,
}

impl RecipeResult {
    pub fn new(id: ResourceId, recipe_name: Option<String>) -> Self {
        Self {
            id,
            recipe_name,
            state: ResultState::Initial,
            started_at: None,
            completed_at: None,
            features: Vec::new(),
            commands: Vec::new(),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn recipe_name(&self) -> Option<&str> {
        self.recipe_name.as_deref()
    }

    pub fn state(&self) -> ResultState {
        self.state
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn commands(&self) -> &[CommandResult] {
        &self.commands
    }

    pub fn command(&self, name: &str) -> Option<&CommandResult> {
        self.commands.iter().find(|c| c.name() == name)
    }

    pub fn is_sealed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn commence(&mut self) {
        if self.state == ResultState::Initial {
            self.state = ResultState::InProgress;
            self.started_at = Some(Utc::now());
        }
    }

    /// Fill in the recipe name once the default recipe has been resolved.
    pub fn set_recipe_name(&mut self, name: impl Into<String>) {
        if !self.is_sealed() {
            self.recipe_name = Some(name.into());
        }
    }

    /// Append a finished command. Open commands are refused so a sealed
    /// recipe only ever holds sealed commands.
    pub fn add_command(&mut self, command: CommandResult) -> Result<()> {
        if self.is_sealed() {
            return Err(Error::Sealed(format!("recipe {}", self.id)));
        }
        if !command.is_sealed() {
            return Err(Error::InvalidInput(format!(
                "command '{}' must be complete before it is recorded",
                command.name()
            )));
        }
        self.commands.push(command);
        Ok(())
    }

    pub fn error(&mut self, summary: impl Into<String>) {
        if self.is_sealed() {
            return;
        }
        self.state = self.state.worse(ResultState::Error);
        self.features.push(Feature::error(summary));
    }

    pub fn failure(&mut self, summary: impl Into<String>) {
        if self.is_sealed() {
            return;
        }
        self.state = self.state.worse(ResultState::Failure);
        self.features.push(Feature::error(summary));
    }

    /// Mark the recipe as cancelled by request.
    pub fn terminate(&mut self) {
        if self.is_sealed() {
            return;
        }
        self.state = ResultState::Terminated;
        self.features
            .push(Feature::warning("Recipe terminated by request"));
    }

    /// Seal the result, deriving the final state from the recorded commands.
    pub fn complete(&mut self) {
        if self.is_sealed() {
            return;
        }
        let mut state = self.state;
        for command in &self.commands {
            state = state.worse(command.state());
        }
        if !state.is_terminal() {
            state = ResultState::Success;
        }
        self.state = state;
        let now = Utc::now();
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.completed_at = Some(now);
    }

    pub fn collect_errors(&self) -> Vec<String> {
        let mut errors: Vec<String> = self
            .features
            .iter()
            .filter(|f| f.level == FeatureLevel::Error)
            .map(|f| f.summary.clone())
            .collect();
        for command in &self.commands {
            errors.extend(command.collect_errors());
        }
        errors
    }
}
