//! Build results: the root of the result tree.
//!
//! A build is split into stages, each of which runs one recipe on one
//! execution service. The build state is derived from the stages once every
//! stage has reported.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::artifact::Feature;
use crate::result::{RecipeResult, ResultState};
use crate::service::ServiceId;
use crate::{Error, ResourceId, Result};

/// File name a build result is persisted under in its build directory.
pub const BUILD_RESULT_FILE: &str = "build.json";

/// A single change included in a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub revision: String,
    pub author: String,
    pub comment: String,
    #[serde(default)]
    pub files: Vec<String>,
}

/// The SCM revision a build was run against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRevision {
    pub revision: Option<String>,
    /// Set when the revision was requested explicitly rather than "latest".
    #[serde(default)]
    pub fixed: bool,
    #[serde(default)]
    pub changes: Vec<Change>,
}

impl BuildRevision {
    pub fn latest() -> Self {
        Self::default()
    }

    pub fn fixed(revision: impl Into<String>) -> Self {
        Self {
            revision: Some(revision.into()),
            fixed: true,
            changes: Vec::new(),
        }
    }
}

/// Why a build was requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildReason {
    Manual { user: String },
    ScmChange,
    DependencyCompleted { upstream: String },
    Trigger { name: String },
}

impl BuildReason {
    pub fn summary(&self) -> String {
        match self {
            BuildReason::Manual { user } => format!("manual trigger by {user}"),
            BuildReason::ScmChange => "source code changed".to_string(),
            BuildReason::DependencyCompleted { upstream } => {
                format!("dependency '{upstream}' completed")
            }
            BuildReason::Trigger { name } => format!("trigger '{name}' fired"),
        }
    }
}

/// One stage node: the recipe it ran and where.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub host: Option<ServiceId>,
    pub result: RecipeResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub id: ResourceId,
    pub project: String,
    pub number: u64,
    pub reason: BuildReason,
    #[serde(default)]
    pub revision: BuildRevision,
    state: ResultState,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    /// Problems with the build as a whole, outside any stage.
    #[serde(default)]
    features: Vec<Feature>,
    #[serde(default)]
    stages: Vec<StageResult>,
}

impl BuildResult {
    pub fn new(project: impl Into<String>, number: u64, reason: BuildReason) -> Self {
        Self {
            id: ResourceId::new(),
            project: project.into(),
            number,
            reason,
            revision: BuildRevision::default(),
            state: ResultState::Initial,
            started_at: None,
            completed_at: None,
            features: Vec::new(),
            stages: Vec::new(),
        }
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

    pub fn stages(&self) -> &[StageResult] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == name)
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

    /// Add a stage node holding a pending recipe result.
    pub fn add_stage(&mut self, stage: impl Into<String>, recipe_id: ResourceId) -> Result<()> {
        if self.is_sealed() {
            return Err(Error::Sealed(format!("build {}", self.number)));
        }
        let stage = stage.into();
        if self.stage(&stage).is_some() {
            return Err(Error::Conflict(format!("duplicate stage '{stage}'")));
        }
        self.stages.push(StageResult {
            stage,
            host: None,
            result: RecipeResult::new(recipe_id, None),
        });
        Ok(())
    }

    pub fn set_stage_host(&mut self, recipe_id: ResourceId, host: ServiceId) -> Result<()> {
        let stage = self.stage_for_recipe_mut(recipe_id)?;
        stage.host = Some(host);
        Ok(())
    }

    /// Record the terminal result of a stage's recipe. A stage reports once.
    pub fn record_recipe(&mut self, result: RecipeResult) -> Result<()> {
        if self.is_sealed() {
            return Err(Error::Sealed(format!("build {}", self.number)));
        }
        if !result.is_sealed() {
            return Err(Error::InvalidInput(format!(
                "recipe {} is still in progress",
                result.id()
            )));
        }
        let stage = self.stage_for_recipe_mut(result.id())?;
        if stage.result.is_sealed() {
            return Err(Error::Sealed(format!("stage '{}'", stage.stage)));
        }
        stage.result = result;
        Ok(())
    }

    /// Seal a stage that never got to run, e.g. because it could not be
    /// dispatched.
    pub fn abandon_stage(&mut self, recipe_id: ResourceId, summary: &str) -> Result<()> {
        let stage = self.stage_for_recipe_mut(recipe_id)?;
        if !stage.result.is_sealed() {
            stage.result.commence();
            stage.result.error(summary);
            stage.result.complete();
        }
        Ok(())
    }

    /// Seal a stage that was cancelled before it got to run.
    pub fn terminate_stage(&mut self, recipe_id: ResourceId) -> Result<()> {
        let stage = self.stage_for_recipe_mut(recipe_id)?;
        if !stage.result.is_sealed() {
            stage.result.commence();
            stage.result.terminate();
            stage.result.complete();
        }
        Ok(())
    }

    /// Record a build-level error, e.g. the build could not be planned.
    pub fn error(&mut self, summary: impl Into<String>) {
        if self.is_sealed() {
            return;
        }
        self.state = self.state.worse(ResultState::Error);
        self.features.push(Feature::error(summary));
    }

    fn stage_for_recipe_mut(&mut self, recipe_id: ResourceId) -> Result<&mut StageResult> {
        self.stages
            .iter_mut()
            .find(|s| s.result.id() == recipe_id)
            .ok_or_else(|| Error::NotFound(format!("stage for recipe {recipe_id}")))
    }

    pub fn all_stages_reported(&self) -> bool {
        self.stages.iter().all(|s| s.result.is_sealed())
    }

    /// Seal the build with the worst state of its stages.
    pub fn complete(&mut self) {
        if self.is_sealed() {
            return;
        }
        let mut state = self.state;
        for stage in &self.stages {
            state = state.worse(stage.result.state());
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

    /// Write the result as `build.json` under `dir`.
    pub async fn save(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(dir.join(BUILD_RESULT_FILE), json).await?;
        Ok(())
    }

    pub async fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(BUILD_RESULT_FILE);
        let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
            _ => Error::Io(e),
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
