//! Regex post-processing of captured files.

use hearth_config::ProcessorConfig;
use hearth_core::artifact::{Feature, FeatureLevel, StoredFileArtifact};
use hearth_core::result::CommandResult;
use hearth_core::{Error, Result};
use regex::Regex;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Features recorded per file before the rest are dropped.
pub const FEATURE_LIMIT_PER_FILE: usize = 100;

/// Turns lines matching configured expressions into features.
#[derive(Debug, Clone)]
pub struct RegexPostProcessor {
    patterns: Vec<(FeatureLevel, Regex)>,
    fail_on_error: bool,
    fail_on_warning: bool,
    limit: usize,
}

impl RegexPostProcessor {
    pub fn new(patterns: Vec<(FeatureLevel, Regex)>) -> Self {
        Self {
            patterns,
            fail_on_error: true,
            fail_on_warning: false,
            limit: FEATURE_LIMIT_PER_FILE,
        }
    }

    pub fn from_config(config: &ProcessorConfig) -> Result<Self> {
        let mut patterns = Vec::with_capacity(config.patterns.len());
        for (level, expr) in &config.patterns {
            let regex = Regex::new(expr)
                .map_err(|e| Error::InvalidInput(format!("invalid expression '{expr}': {e}")))?;
            patterns.push((*level, regex));
        }
        Ok(Self {
            fail_on_error: config.fail_on_error,
            fail_on_warning: config.fail_on_warning,
            ..Self::new(patterns)
        })
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Scan `path`, adding features to `file` and failing `result` when
    /// configured to.
    pub async fn process(
        &self,
        path: &Path,
        file: &mut StoredFileArtifact,
        result: &mut CommandResult,
    ) -> Result<()> {
        let reader = BufReader::new(tokio::fs::File::open(path).await?);
        let mut lines = reader.lines();
        let mut line_number = 0u64;
        let mut found = 0usize;
        let mut errors = false;
        let mut warnings = false;

        while let Some(line) = lines.next_line().await? {
            line_number += 1;
            let Some(level) = self.classify(&line) else {
                continue;
            };
            if found == self.limit {
                file.add_feature(Feature::info(format!(
                    "Feature limit of {} reached, further features ignored",
                    self.limit
                )));
                break;
            }
            found += 1;
            errors |= level == FeatureLevel::Error;
            warnings |= level == FeatureLevel::Warning;
            file.add_feature(Feature::new(level, line.trim_end()).at_line(line_number));
        }

        if self.fail_on_error && errors {
            result.failure(format!("Error features detected in '{}'", file.path));
        } else if self.fail_on_warning && warnings {
            result.failure(format!("Warning features detected in '{}'", file.path));
        }
        Ok(())
    }

    fn classify(&self, line: &str) -> Option<FeatureLevel> {
        self.patterns
            .iter()
            .find(|(_, regex)| regex.is_match(line))
            .map(|(level, _)| *level)
    }
}
