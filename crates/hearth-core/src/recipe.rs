//! Recipe requests and the directories a recipe runs in.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::ResourceId;
use crate::context::encode_path_component;

/// Describes the SCM a bootstrap checks out from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScmSpec {
    /// Connector kind, e.g. `git`.
    pub kind: String,
    pub location: String,
    /// Subdirectory of the repository to check out, if not the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// How the base directory is prepared before the recipe runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BootstrapSpec {
    /// Build whatever is already in the base directory.
    #[default]
    None,
    /// Copy a local directory into the base directory.
    Copy { source: PathBuf },
    /// Check out or update from an SCM.
    Scm {
        scm: ScmSpec,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        revision: Option<String>,
    },
}

/// Where the recipe file comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RecipeSource {
    /// Recipe file contents supplied with the request.
    Inline(String),
    /// Path relative to the base directory, read after bootstrapping.
    File(PathBuf),
}

/// Everything needed to run one recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeRequest {
    pub id: ResourceId,
    pub build_id: ResourceId,
    pub project: String,
    pub spec: String,
    #[serde(default)]
    pub bootstrap: BootstrapSpec,
    pub source: RecipeSource,
    /// Recipe to run; `None` runs the file's default recipe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe_name: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Build in the persistent working directory rather than a fresh one.
    #[serde(default)]
    pub incremental: bool,
}

impl RecipeRequest {
    pub fn new(project: impl Into<String>, spec: impl Into<String>, source: RecipeSource) -> Self {
        Self {
            id: ResourceId::new(),
            build_id: ResourceId::new(),
            project: project.into(),
            spec: spec.into(),
            bootstrap: BootstrapSpec::None,
            source,
            recipe_name: None,
            properties: BTreeMap::new(),
            incremental: false,
        }
    }

    pub fn with_build_id(mut self, build_id: ResourceId) -> Self {
        self.build_id = build_id;
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: BootstrapSpec) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn with_recipe(mut self, name: impl Into<String>) -> Self {
        self.recipe_name = Some(name.into());
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }
}

/// Directories used by a single recipe run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipePaths {
    /// Reused across builds of the same project and spec.
    pub persistent_work_dir: Option<PathBuf>,
    pub base_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl RecipePaths {
    pub fn new(base_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            persistent_work_dir: None,
            base_dir: base_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    /// The standard layout under a service's data directory:
    ///
    /// ```text
    /// <data>/work/<project>/<spec>        persistent working copy
    /// <data>/recipes/<id>/base            fresh working copy
    /// <data>/recipes/<id>/output          recipe output
    /// ```
    ///
    /// Incremental builds use the persistent directory as their base.
    pub fn server(
        data_dir: &Path,
        project: &str,
        spec: &str,
        id: ResourceId,
        incremental: bool,
    ) -> Self {
        let persistent = Self::persistent_dir_for(data_dir, project, spec);
        let root = Self::recipe_root(data_dir, id);
        let base_dir = if incremental {
            persistent.clone()
        } else {
            root.join("base")
        };
        Self {
            persistent_work_dir: Some(persistent),
            base_dir,
            output_dir: root.join("output"),
        }
    }

    pub fn recipe_root(data_dir: &Path, id: ResourceId) -> PathBuf {
        data_dir.join("recipes").join(id.to_string())
    }

    pub fn persistent_dir_for(data_dir: &Path, project: &str, spec: &str) -> PathBuf {
        data_dir
            .join("work")
            .join(encode_path_component(project))
            .join(encode_path_component(spec))
    }

    /// Create the base and output directories.
    pub async fn ensure(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        tokio::fs::create_dir_all(&self.output_dir).await?;
        Ok(())
    }

    /// `base.dir`, `output.dir` and, when present, `persistent.dir`.
    pub fn path_properties(&self) -> Vec<(&'static str, String)> {
        let mut properties = vec![
            ("base.dir", self.base_dir.display().to_string()),
            ("output.dir", self.output_dir.display().to_string()),
        ];
        if let Some(persistent) = &self.persistent_work_dir {
            properties.push(("persistent.dir", persistent.display().to_string()));
        }
        properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_layout() {
        let data = Path::new("/data");
        let id = ResourceId::new();
        let paths = RecipePaths::server(data, "my project", "default", id, false);

        assert_eq!(
            paths.persistent_work_dir.as_deref(),
            Some(Path::new("/data/work/my%20project/default"))
        );
        assert_eq!(
            paths.base_dir,
            data.join("recipes").join(id.to_string()).join("base")
        );
        assert_eq!(
            paths.output_dir,
            data.join("recipes").join(id.to_string()).join("output")
        );
    }

    #[test]
    fn test_incremental_builds_in_persistent_dir() {
        let data = Path::new("/data");
        let paths = RecipePaths::server(data, "hearth", "nightly", ResourceId::new(), true);
        assert_eq!(paths.base_dir, Path::new("/data/work/hearth/nightly"));
    }

    #[test]
    fn test_request_serializes_across_the_wire() {
        let request = RecipeRequest::new("hearth", "default", RecipeSource::Inline("recipe".into()))
            .with_recipe("release")
            .with_bootstrap(BootstrapSpec::Scm {
                scm: ScmSpec {
                    kind: "git".to_string(),
                    location: "https://example.com/hearth.git".to_string(),
                    path: None,
                },
                revision: Some("abc123".to_string()),
            })
            .with_property("flavour", "debug");

        let json = serde_json::to_string(&request).unwrap();
        let decoded: RecipeRequest = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded.id, request.id);
        assert_eq!(decoded.recipe_name.as_deref(), Some("release"));
        assert_eq!(decoded.bootstrap, request.bootstrap);
        assert_eq!(decoded.properties.get("flavour").map(String::as_str), Some("debug"));
    }

    #[tokio::test]
    async fn test_ensure_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RecipePaths::server(dir.path(), "hearth", "default", ResourceId::new(), false);
        paths.ensure().await.unwrap();
        assert!(paths.base_dir.is_dir());
        assert!(paths.output_dir.is_dir());
    }
}
