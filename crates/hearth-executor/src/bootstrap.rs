//! Bootstrappers: preparing the base directory before a recipe runs.

use async_trait::async_trait;
use hearth_core::command::{Bootstrapper, TerminateFlag};
use hearth_core::context::{CommandContext, RECIPE_LAYER};
use hearth_core::output::OutputSink;
use hearth_core::recipe::{BootstrapSpec, RecipeRequest, ScmSpec};
use hearth_core::result::CommandResult;
use hearth_core::scope::Property;
use hearth_core::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tracing::{info, warn};

use crate::commands::open_artifact_file;
use crate::fs::{copy_dir, to_slash};

/// Artifact listing what the bootstrap put in place.
pub const BOOTSTRAP_OUTPUT: &str = "bootstrap output";
pub const FILES_FILE: &str = "files.txt";

/// Progress reporting for SCM operations.
pub struct CheckoutLog {
    sink: OutputSink,
    flag: TerminateFlag,
}

impl CheckoutLog {
    pub fn new(sink: OutputSink, flag: TerminateFlag) -> Self {
        Self { sink, flag }
    }

    pub fn status(&self, message: &str) {
        if let Err(e) = self.sink.write_line(message) {
            warn!(error = %e, "Unable to write bootstrap output");
        }
    }

    pub fn file_checked_out(&self, path: &str, revision: Option<&str>, action: &str) {
        match revision {
            Some(revision) => self.status(&format!("{path}#{revision} - {action}")),
            None => self.status(&format!("{path} - {action}")),
        }
    }

    /// `Err(Terminated)` once the bootstrap has been asked to stop.
    pub fn check_cancelled(&self) -> Result<()> {
        self.flag.check()
    }

    pub fn flag(&self) -> &TerminateFlag {
        &self.flag
    }
}

/// A version control connector.
#[async_trait]
pub trait Scm: Send + Sync {
    /// Fresh checkout into `dir`, which may not exist yet. Returns the
    /// revision checked out.
    async fn checkout(
        &self,
        spec: &ScmSpec,
        revision: Option<&str>,
        dir: &Path,
        log: &CheckoutLog,
    ) -> Result<String>;

    /// Bring an existing working copy in `dir` up to date.
    async fn update(
        &self,
        spec: &ScmSpec,
        revision: Option<&str>,
        dir: &Path,
        log: &CheckoutLog,
    ) -> Result<String>;
}

/// Builds whatever is already in the base directory.
pub struct NoopBootstrapper;

#[async_trait]
impl Bootstrapper for NoopBootstrapper {
    async fn bootstrap(&self, _ctx: &mut CommandContext, _result: &mut CommandResult) -> Result<()> {
        Ok(())
    }

    fn terminate(&self) {}
}

/// Copies a local directory into the base directory.
pub struct CopyBootstrapper {
    source: PathBuf,
    flag: TerminateFlag,
}

impl CopyBootstrapper {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            flag: TerminateFlag::new(),
        }
    }
}

#[async_trait]
impl Bootstrapper for CopyBootstrapper {
    async fn bootstrap(&self, ctx: &mut CommandContext, result: &mut CommandResult) -> Result<()> {
        self.flag.check()?;
        if !self.source.is_dir() {
            return Err(Error::Build(format!(
                "Bootstrap source '{}' is not a directory",
                self.source.display()
            )));
        }

        let (sink, artifact) = open_artifact_file(ctx, BOOTSTRAP_OUTPUT, FILES_FILE).await?;
        let copied = copy_dir(&self.source, ctx.base_dir()).await?;
        for path in &copied {
            sink.write_line(&format!("{} - copied", to_slash(path)))?;
        }
        sink.flush()?;
        result.add_artifact(artifact)?;
        result.set_property("files copied", copied.len().to_string())?;
        Ok(())
    }

    fn terminate(&self) {
        self.flag.raise();
    }
}

/// Checks out or updates the base directory from an SCM.
pub struct ScmBootstrapper {
    scm: Arc<dyn Scm>,
    spec: ScmSpec,
    revision: Option<String>,
    incremental: bool,
    flag: TerminateFlag,
}

impl ScmBootstrapper {
    pub fn new(scm: Arc<dyn Scm>, spec: ScmSpec, revision: Option<String>, incremental: bool) -> Self {
        Self {
            scm,
            spec,
            revision,
            incremental,
            flag: TerminateFlag::new(),
        }
    }
}

async fn has_entries(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

#[async_trait]
impl Bootstrapper for ScmBootstrapper {
    async fn bootstrap(&self, ctx: &mut CommandContext, result: &mut CommandResult) -> Result<()> {
        self.flag.check()?;
        let work_dir = match &self.spec.path {
            Some(path) => ctx.base_dir().join(path),
            None => ctx.base_dir().to_path_buf(),
        };

        let (sink, artifact) = open_artifact_file(ctx, BOOTSTRAP_OUTPUT, FILES_FILE).await?;
        let log = CheckoutLog::new(sink.clone(), self.flag.clone());
        let update = self.incremental && has_entries(&work_dir).await;

        info!(
            location = %self.spec.location,
            dir = %work_dir.display(),
            update,
            "Bootstrapping from SCM"
        );
        let revision = if update {
            self.scm
                .update(&self.spec, self.revision.as_deref(), &work_dir, &log)
                .await
        } else {
            self.scm
                .checkout(&self.spec, self.revision.as_deref(), &work_dir, &log)
                .await
        };

        sink.flush()?;
        result.add_artifact(artifact)?;
        let revision = revision?;

        result.set_property("bootstrap", if update { "update" } else { "checkout" })?;
        result.set_property("revision", revision.clone())?;
        ctx.scope_mut()
            .add_to(RECIPE_LAYER, Property::new("build.revision", revision));
        Ok(())
    }

    fn terminate(&self) {
        self.flag.raise();
    }
}

/// Shells out to `git`.
#[derive(Debug, Default)]
pub struct GitScm;

impl GitScm {
    async fn git(&self, dir: &Path, args: &[&str], log: &CheckoutLog) -> Result<String> {
        log.check_cancelled()?;
        let child = tokio::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Build(format!("Unable to run git: {e}")))?;

        // Dropping the output future kills the process.
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = log.flag().raised() => return Err(Error::Terminated),
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            log.status(line);
        }
        if !output.status.success() {
            return Err(Error::Build(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn head(&self, dir: &Path, log: &CheckoutLog) -> Result<String> {
        Ok(self
            .git(dir, &["rev-parse", "HEAD"], log)
            .await?
            .trim()
            .to_string())
    }
}

#[async_trait]
impl Scm for GitScm {
    async fn checkout(
        &self,
        spec: &ScmSpec,
        revision: Option<&str>,
        dir: &Path,
        log: &CheckoutLog,
    ) -> Result<String> {
        crate::fs::remove_dir_if_exists(dir).await?;
        tokio::fs::create_dir_all(dir).await?;
        log.status(&format!("Cloning {}", spec.location));
        self.git(dir, &["clone", spec.location.as_str(), "."], log).await?;
        if let Some(revision) = revision {
            self.git(dir, &["checkout", "--quiet", revision], log)
                .await?;
        }

        let files = self.git(dir, &["ls-files"], log).await?;
        for file in files.lines() {
            log.file_checked_out(file, None, "added");
        }
        self.head(dir, log).await
    }

    async fn update(
        &self,
        _spec: &ScmSpec,
        revision: Option<&str>,
        dir: &Path,
        log: &CheckoutLog,
    ) -> Result<String> {
        let before = self.head(dir, log).await?;
        self.git(dir, &["fetch", "--quiet", "origin"], log).await?;
        let target = revision.unwrap_or("FETCH_HEAD");
        self.git(dir, &["checkout", "--quiet", "--force", target], log)
            .await?;

        let after = self.head(dir, log).await?;
        let range = format!("{before}..{after}");
        let changed = self
            .git(dir, &["diff", "--name-status", range.as_str()], log)
            .await?;
        for line in changed.lines() {
            if let Some((action, file)) = line.split_once('\t') {
                let action = match action {
                    "A" => "added",
                    "D" => "deleted",
                    _ => "edited",
                };
                log.file_checked_out(file, Some(&after), action);
            }
        }
        Ok(after)
    }
}

/// Creates the bootstrapper a request asks for.
#[derive(Clone)]
pub struct BootstrapperFactory {
    scms: HashMap<String, Arc<dyn Scm>>,
}

impl Default for BootstrapperFactory {
    fn default() -> Self {
        let mut factory = Self::empty();
        factory.register_scm("git", Arc::new(GitScm));
        factory
    }
}

impl BootstrapperFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory with no SCM connectors.
    pub fn empty() -> Self {
        Self {
            scms: HashMap::new(),
        }
    }

    pub fn register_scm(&mut self, kind: impl Into<String>, scm: Arc<dyn Scm>) {
        self.scms.insert(kind.into(), scm);
    }

    pub fn create(&self, request: &RecipeRequest) -> Result<Box<dyn Bootstrapper>> {
        let bootstrapper: Box<dyn Bootstrapper> = match &request.bootstrap {
            BootstrapSpec::None => Box::new(NoopBootstrapper),
            BootstrapSpec::Copy { source } => Box::new(CopyBootstrapper::new(source.clone())),
            BootstrapSpec::Scm { scm, revision } => {
                let connector = self.scms.get(&scm.kind).ok_or_else(|| {
                    Error::Build(format!("Unsupported SCM type '{}'", scm.kind))
                })?;
                Box::new(ScmBootstrapper::new(
                    connector.clone(),
                    scm.clone(),
                    revision.clone(),
                    request.incremental,
                ))
            }
        };
        Ok(bootstrapper)
    }
}
