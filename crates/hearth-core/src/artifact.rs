//! Stored artifacts and the features discovered in them.

use serde::{Deserialize, Serialize};

/// Severity of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureLevel {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for FeatureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FeatureLevel::Info => "info",
            FeatureLevel::Warning => "warning",
            FeatureLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// A diagnostic finding: an error, warning or note with a summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub level: FeatureLevel,
    pub summary: String,
    /// 1-based line in the file the feature was found in, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
}

impl Feature {
    pub fn new(level: FeatureLevel, summary: impl Into<String>) -> Self {
        Self {
            level,
            summary: summary.into(),
            line: None,
        }
    }

    pub fn error(summary: impl Into<String>) -> Self {
        Self::new(FeatureLevel::Error, summary)
    }

    pub fn warning(summary: impl Into<String>) -> Self {
        Self::new(FeatureLevel::Warning, summary)
    }

    pub fn info(summary: impl Into<String>) -> Self {
        Self::new(FeatureLevel::Info, summary)
    }

    pub fn at_line(mut self, line: u64) -> Self {
        self.line = Some(line);
        self
    }
}

/// A single file within a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFileArtifact {
    /// Path relative to the owning command's output directory, `/` separated.
    pub path: String,
    #[serde(default)]
    pub features: Vec<Feature>,
}

impl StoredFileArtifact {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            features: Vec::new(),
        }
    }

    pub fn add_feature(&mut self, feature: Feature) {
        self.features.push(feature);
    }

    pub fn has_messages(&self, level: FeatureLevel) -> bool {
        self.features.iter().any(|f| f.level == level)
    }
}

/// A named output of a command, made up of one or more files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub name: String,
    #[serde(default)]
    pub files: Vec<StoredFileArtifact>,
}

impl StoredArtifact {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            files: Vec::new(),
        }
    }

    pub fn add(&mut self, file: StoredFileArtifact) {
        self.files.push(file);
    }

    pub fn file(&self, path: &str) -> Option<&StoredFileArtifact> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn features(&self) -> impl Iterator<Item = &Feature> {
        self.files.iter().flat_map(|f| f.features.iter())
    }

    /// Summaries of all features at the given level, in file order.
    pub fn collect_features(&self, level: FeatureLevel) -> Vec<String> {
        self.features()
            .filter(|f| f.level == level)
            .map(|f| f.summary.clone())
            .collect()
    }

    pub fn has_messages(&self, level: FeatureLevel) -> bool {
        self.files.iter().any(|f| f.has_messages(level))
    }
}
