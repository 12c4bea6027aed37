//! Artifact capture after a command has run.

use hearth_config::{ArtifactConfig, CommandConfig, ProcessorConfig};
use hearth_core::artifact::{StoredArtifact, StoredFileArtifact};
use hearth_core::context::CommandContext;
use hearth_core::result::CommandResult;
use hearth_core::{Error, Result};
use std::path::Path;
use tracing::debug;

use crate::commands::COMMAND_OUTPUT;
use crate::fs::{copy_dir, to_slash};
use crate::postprocess::RegexPostProcessor;

/// Capture the configured artifacts and run every processor. Runs even when
/// the command itself failed, so partial output still gets recorded.
pub async fn capture_outputs(
    ctx: &mut CommandContext,
    config: &CommandConfig,
    result: &mut CommandResult,
) -> Result<()> {
    if !config.output_processors.is_empty() {
        process_command_output(ctx, &config.output_processors, result).await?;
    }
    for artifact in &config.artifacts {
        capture_artifact(ctx, artifact, result).await?;
    }
    Ok(())
}

async fn process_command_output(
    ctx: &CommandContext,
    processors: &[ProcessorConfig],
    result: &mut CommandResult,
) -> Result<()> {
    let Some(mut artifact) = result.artifact(COMMAND_OUTPUT).cloned() else {
        debug!(command = %result.name(), "No command output to process");
        return Ok(());
    };
    let command_dir = ctx.command_dir()?.to_path_buf();

    // The artifact was recorded by the command; rebuild it with features.
    let mut processed = StoredArtifact::new(artifact.name.clone());
    for mut file in std::mem::take(&mut artifact.files) {
        run_processors(processors, &command_dir.join(&file.path), &mut file, result).await?;
        processed.add(file);
    }
    result.replace_artifact(processed)
}

async fn capture_artifact(
    ctx: &mut CommandContext,
    config: &ArtifactConfig,
    result: &mut CommandResult,
) -> Result<()> {
    let relative = ctx.expand(&config.path);
    let source = ctx.base_dir().join(&relative);

    let exists = if config.directory {
        source.is_dir()
    } else {
        source.is_file()
    };
    if !exists {
        if config.required {
            result.failure(format!(
                "Capturing artifact '{}': no {} found at '{relative}'",
                config.name,
                if config.directory { "directory" } else { "file" }
            ));
        }
        return Ok(());
    }

    let dest = ctx.register_output(&config.name).await?;
    let command_dir = ctx.command_dir()?.to_path_buf();
    let stored_dir = to_slash(
        dest.strip_prefix(&command_dir)
            .map_err(|e| Error::Internal(e.to_string()))?,
    );

    let copied = if config.directory {
        copy_dir(&source, &dest).await?
    } else {
        let file_name = source
            .file_name()
            .ok_or_else(|| Error::InvalidInput(format!("'{relative}' is not a file")))?;
        tokio::fs::copy(&source, dest.join(file_name)).await?;
        vec![file_name.into()]
    };

    let mut artifact = StoredArtifact::new(config.name.clone());
    for path in copied {
        let mut file = StoredFileArtifact::new(format!("{stored_dir}/{}", to_slash(&path)));
        run_processors(&config.processors, &dest.join(&path), &mut file, result).await?;
        artifact.add(file);
    }
    result.add_artifact(artifact)
}

async fn run_processors(
    processors: &[ProcessorConfig],
    path: &Path,
    file: &mut StoredFileArtifact,
    result: &mut CommandResult,
) -> Result<()> {
    for config in processors {
        RegexPostProcessor::from_config(config)?
            .process(path, file, result)
            .await?;
    }
    Ok(())
}
