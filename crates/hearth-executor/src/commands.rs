//! Built-in commands and the factory that creates commands from recipe
//! configuration.

use async_trait::async_trait;
use hearth_config::{CommandAction, CommandConfig};
use hearth_core::artifact::{StoredArtifact, StoredFileArtifact};
use hearth_core::command::{Command, TerminateFlag};
use hearth_core::context::CommandContext;
use hearth_core::output::OutputSink;
use hearth_core::result::CommandResult;
use hearth_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

use crate::fs::to_slash;

/// Artifact holding a command's captured output.
pub const COMMAND_OUTPUT: &str = "command output";
pub const OUTPUT_FILE: &str = "output.txt";

/// How long output capture may lag behind a killed process.
const PUMP_GRACE: Duration = Duration::from_secs(5);

/// Builds a command for a custom action kind.
pub type CustomCommandBuilder =
    Arc<dyn Fn(&str, &BTreeMap<String, String>) -> Result<Arc<dyn Command>> + Send + Sync>;

/// Creates commands from their configuration.
#[derive(Clone, Default)]
pub struct CommandFactory {
    custom: HashMap<String, CustomCommandBuilder>,
}

impl CommandFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a builder for `custom "<kind>"` actions.
    pub fn register(&mut self, kind: impl Into<String>, builder: CustomCommandBuilder) {
        self.custom.insert(kind.into(), builder);
    }

    pub fn create(&self, config: &CommandConfig) -> Result<Arc<dyn Command>> {
        let command: Arc<dyn Command> = match &config.action {
            CommandAction::Exec {
                exe,
                args,
                working_dir,
                env,
            } => Arc::new(ExecCommand {
                name: config.name.clone(),
                exe: exe.clone(),
                args: args.clone(),
                working_dir: working_dir.clone(),
                env: env.clone(),
                flag: TerminateFlag::new(),
            }),
            CommandAction::Print { message } => Arc::new(PrintCommand {
                name: config.name.clone(),
                message: message.clone(),
                flag: TerminateFlag::new(),
            }),
            CommandAction::Sleep { millis } => Arc::new(SleepCommand {
                name: config.name.clone(),
                duration: Duration::from_millis(*millis),
                flag: TerminateFlag::new(),
            }),
            CommandAction::Custom { kind, args } => {
                let builder = self.custom.get(kind).ok_or_else(|| {
                    Error::Build(format!(
                        "Unknown command type '{kind}' for command '{}'",
                        config.name
                    ))
                })?;
                builder(&config.name, args)?
            }
        };
        Ok(command)
    }
}

/// Register the `command output` artifact and open a sink writing to it.
pub async fn open_command_output(
    ctx: &mut CommandContext,
) -> Result<(OutputSink, StoredArtifact)> {
    open_artifact_file(ctx, COMMAND_OUTPUT, OUTPUT_FILE).await
}

/// Register an output named `name` and open a sink on `file` inside it.
/// The returned artifact lists the file, relative to the command directory.
pub async fn open_artifact_file(
    ctx: &mut CommandContext,
    name: &str,
    file: &str,
) -> Result<(OutputSink, StoredArtifact)> {
    let dir = ctx.register_output(name).await?;
    let path = dir.join(file);
    let sink = ctx.open_output(&path)?;

    let relative = path
        .strip_prefix(ctx.command_dir()?)
        .map(to_slash)
        .map_err(|e| Error::Internal(e.to_string()))?;
    let mut artifact = StoredArtifact::new(name);
    artifact.add(StoredFileArtifact::new(relative));
    Ok((sink, artifact))
}

/// Runs an executable, capturing stdout and stderr.
pub struct ExecCommand {
    name: String,
    exe: String,
    args: Vec<String>,
    working_dir: Option<String>,
    env: BTreeMap<String, String>,
    flag: TerminateFlag,
}

impl ExecCommand {
    pub fn new(name: impl Into<String>, exe: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            exe: exe.into(),
            args,
            working_dir: None,
            env: BTreeMap::new(),
            flag: TerminateFlag::new(),
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, sink: OutputSink) -> std::io::Result<()> {
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        sink.write(&buf[..n])?;
    }
}

#[async_trait]
impl Command for ExecCommand {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut CommandContext, result: &mut CommandResult) -> Result<()> {
        self.flag.check()?;

        let exe = ctx.expand(&self.exe);
        let args: Vec<String> = self.args.iter().map(|a| ctx.expand(a)).collect();
        let working_dir = match &self.working_dir {
            Some(dir) => ctx.base_dir().join(ctx.expand(dir)),
            None => ctx.base_dir().to_path_buf(),
        };

        let mut command_line = vec![exe.clone()];
        command_line.extend(args.iter().cloned());
        result.set_property("command line", command_line.join(" "))?;
        result.set_property("working directory", working_dir.display().to_string())?;

        let (sink, artifact) = open_command_output(ctx).await?;
        let mut process = tokio::process::Command::new(&exe);
        process
            .args(&args)
            .current_dir(&working_dir)
            .envs(ctx.scope().environment())
            .envs(self.env.iter().map(|(k, v)| (k.clone(), ctx.expand(v))))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(command = %self.name, exe = %exe, dir = %working_dir.display(), "Spawning process");
        let mut child = process
            .spawn()
            .map_err(|e| Error::Build(format!("Unable to run '{exe}': {e}")))?;

        let stdout = child.stdout.take().map(|out| tokio::spawn(pump(out, sink.clone())));
        let stderr = child.stderr.take().map(|err| tokio::spawn(pump(err, sink.clone())));

        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = self.flag.raised() => {
                debug!(command = %self.name, "Killing process");
                let _ = child.start_kill();
                let _ = child.wait().await;
                None
            }
        };

        for handle in [stdout, stderr].into_iter().flatten() {
            let pumped = match status {
                Some(_) => Ok(handle.await),
                // Orphaned grandchildren may keep the pipes open.
                None => tokio::time::timeout(PUMP_GRACE, handle).await,
            };
            match pumped {
                Ok(Ok(Err(e))) => {
                    debug!(command = %self.name, error = %e, "Output capture stopped early")
                }
                Err(_) => debug!(command = %self.name, "Output still open after kill"),
                _ => {}
            }
        }
        sink.flush()?;
        result.add_artifact(artifact)?;
        let Some(status) = status else {
            return Err(Error::Terminated);
        };

        match status.code() {
            Some(0) => {
                result.set_property("exit code", "0")?;
            }
            Some(code) => {
                result.set_property("exit code", code.to_string())?;
                result.failure(format!("Command exited with code {code}"));
            }
            None => {
                result.failure("Command was killed by a signal");
            }
        }
        Ok(())
    }

    fn terminate(&self) {
        self.flag.raise();
    }
}

/// Writes a message to the command output.
pub struct PrintCommand {
    name: String,
    message: String,
    flag: TerminateFlag,
}

#[async_trait]
impl Command for PrintCommand {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut CommandContext, result: &mut CommandResult) -> Result<()> {
        self.flag.check()?;
        let (sink, artifact) = open_command_output(ctx).await?;
        sink.write_line(&ctx.expand(&self.message))?;
        sink.flush()?;
        result.add_artifact(artifact)?;
        Ok(())
    }

    fn terminate(&self) {
        self.flag.raise();
    }
}

/// Waits, returning early when terminated.
pub struct SleepCommand {
    name: String,
    duration: Duration,
    flag: TerminateFlag,
}

impl SleepCommand {
    pub fn new(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            duration,
            flag: TerminateFlag::new(),
        }
    }
}

#[async_trait]
impl Command for SleepCommand {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &mut CommandContext, _result: &mut CommandResult) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => Ok(()),
            _ = self.flag.raised() => Err(Error::Terminated),
        }
    }

    fn terminate(&self) {
        self.flag.raise();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::ResourceId;
    use hearth_core::context::RECIPE_LAYER;
    use hearth_core::recipe::RecipePaths;
    use hearth_core::result::ResultState;
    use hearth_core::scope::PropertyScope;
    use std::path::Path;

    async fn context(dir: &Path) -> CommandContext {
        let paths = RecipePaths::new(dir.join("base"), dir.join("output"));
        paths.ensure().await.unwrap();
        let mut scope = PropertyScope::new();
        scope.push(RECIPE_LAYER);
        scope.add_value("greeting", "hello");
        let mut ctx = CommandContext::new(ResourceId::new(), paths, scope, None);
        ctx.begin_command(1, "test").await.unwrap();
        ctx
    }

    fn config(name: &str, action: CommandAction) -> CommandConfig {
        CommandConfig {
            name: name.to_string(),
            action,
            properties: Vec::new(),
            artifacts: Vec::new(),
            output_processors: Vec::new(),
        }
    }

    async fn run(command: &dyn Command, ctx: &mut CommandContext) -> (Result<()>, CommandResult) {
        let mut result = CommandResult::new(command.name());
        result.commence();
        let outcome = command.execute(ctx, &mut result).await;
        (outcome, result)
    }

    #[tokio::test]
    async fn test_print_writes_expanded_message() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path()).await;
        let command = CommandFactory::new()
            .create(&config(
                "greet",
                CommandAction::Print {
                    message: "${greeting} world".to_string(),
                },
            ))
            .unwrap();

        let (outcome, result) = run(command.as_ref(), &mut ctx).await;
        outcome.unwrap();

        let artifact = result.artifact(COMMAND_OUTPUT).unwrap();
        assert_eq!(artifact.files[0].path, "command%20output/output.txt");
        let output = ctx.command_dir().unwrap().join("command%20output/output.txt");
        assert_eq!(std::fs::read_to_string(output).unwrap(), "hello world\n");
    }

    #[tokio::test]
    async fn test_sleep_terminates_early() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path()).await;
        let command = Arc::new(SleepCommand::new("wait", Duration::from_secs(30)));

        let terminator = {
            let command = command.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                command.terminate();
            })
        };

        let started = std::time::Instant::now();
        let (outcome, _) = run(command.as_ref(), &mut ctx).await;
        terminator.await.unwrap();

        assert!(matches!(outcome, Err(Error::Terminated)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_terminate_before_execute_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path()).await;
        let command = SleepCommand::new("wait", Duration::from_secs(30));
        command.terminate();

        let (outcome, _) = run(&command, &mut ctx).await;
        assert!(matches!(outcome, Err(Error::Terminated)));
    }

    #[tokio::test]
    async fn test_unknown_custom_kind() {
        let result = CommandFactory::new().create(&config(
            "deploy",
            CommandAction::Custom {
                kind: "ant".to_string(),
                args: BTreeMap::new(),
            },
        ));
        assert!(matches!(result, Err(Error::Build(_))));
    }

    #[tokio::test]
    async fn test_custom_kind_is_used() {
        let mut factory = CommandFactory::new();
        factory.register(
            "nap",
            Arc::new(
                |name: &str, _args: &BTreeMap<String, String>| -> Result<Arc<dyn Command>> {
                    Ok(Arc::new(SleepCommand::new(name, Duration::from_millis(1))))
                },
            ),
        );
        let command = factory
            .create(&config(
                "short",
                CommandAction::Custom {
                    kind: "nap".to_string(),
                    args: BTreeMap::new(),
                },
            ))
            .unwrap();
        assert_eq!(command.name(), "short");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_records_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path()).await;
        let command = ExecCommand::new(
            "fail",
            "sh",
            vec!["-c".to_string(), "echo ${greeting}; exit 3".to_string()],
        );

        let (outcome, mut result) = run(&command, &mut ctx).await;
        outcome.unwrap();
        result.complete();

        assert_eq!(result.state(), ResultState::Failure);
        assert_eq!(
            result.properties().get("exit code").map(String::as_str),
            Some("3")
        );
        let output = ctx.command_dir().unwrap().join("command%20output/output.txt");
        assert_eq!(std::fs::read_to_string(output).unwrap(), "hello\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_is_killed_on_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path()).await;
        let command = Arc::new(ExecCommand::new(
            "hang",
            "sleep",
            vec!["30".to_string()],
        ));

        let terminator = {
            let command = command.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                command.terminate();
            })
        };

        let started = std::time::Instant::now();
        let (outcome, _) = run(command.as_ref(), &mut ctx).await;
        terminator.await.unwrap();

        assert!(matches!(outcome, Err(Error::Terminated)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_keeps_output_written_before_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path()).await;
        let command = Arc::new(ExecCommand::new(
            "chatty",
            "sh",
            vec!["-c".to_string(), "echo started; exec sleep 30".to_string()],
        ));

        let terminator = {
            let command = command.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                command.terminate();
            })
        };

        let (outcome, result) = run(command.as_ref(), &mut ctx).await;
        terminator.await.unwrap();

        assert!(matches!(outcome, Err(Error::Terminated)));
        assert_eq!(result.artifacts().len(), 1);
        let output = ctx.command_dir().unwrap().join("command%20output/output.txt");
        assert_eq!(std::fs::read_to_string(output).unwrap(), "started\n");
    }

    #[tokio::test]
    async fn test_exec_missing_binary_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path()).await;
        let command = ExecCommand::new("missing", "/definitely/not/here", Vec::new());

        let (outcome, _) = run(&command, &mut ctx).await;
        assert!(matches!(outcome, Err(Error::Build(_))));
    }
}
