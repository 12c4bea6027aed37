//! The recipe processor: runs a recipe's commands in order and reports
//! progress on the event bus.
//!
//! One processor can run many recipes at once, each on the caller's task.
//! Termination is cooperative: a recipe asked to stop either never starts
//! its next command or has the running command's `terminate` called.

use chrono::Utc;
use futures::FutureExt;
use hearth_config::{CommandConfig, ProjectRecipes, parse_recipes};
use hearth_core::command::{BootstrapCommand, Command};
use hearth_core::context::{CommandContext, RECIPE_LAYER};
use hearth_core::event::{Event, EventBus};
use hearth_core::output::OutputSink;
use hearth_core::recipe::{RecipePaths, RecipeRequest, RecipeSource};
use hearth_core::result::{CommandResult, RecipeResult};
use hearth_core::scope::{Property, PropertyScope};
use hearth_core::{Error, ResourceId, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::bootstrap::BootstrapperFactory;
use crate::capture::capture_outputs;
use crate::commands::CommandFactory;

/// The recipe file as it was run, stored in the output directory.
pub const RECIPE_FILE: &str = "recipe.kdl";
/// The final recipe result, stored in the output directory.
pub const RECIPE_RESULT_FILE: &str = "recipe.json";

/// Recipe name reported while the default recipe is still unresolved.
const DEFAULT_RECIPE_LABEL: &str = "[default]";

#[derive(Default)]
struct RunningRecipe {
    terminating: bool,
    command: Option<Arc<dyn Command>>,
    /// The termination stopped or interrupted a command.
    observed: bool,
    /// All commands are done; termination no longer has an effect.
    finishing: bool,
}

/// Removes a recipe from the running set, however its run ends.
struct Registration<'a> {
    running: &'a Mutex<HashMap<ResourceId, RunningRecipe>>,
    id: ResourceId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.running.lock().remove(&self.id);
    }
}

/// Runs once a recipe has stopped, before its completion is published.
pub type CompletionHook = Box<dyn FnOnce() + Send>;

enum Step {
    Continue,
    Stop,
    Terminated,
}

pub struct RecipeProcessor {
    events: Arc<EventBus>,
    commands: CommandFactory,
    bootstrappers: BootstrapperFactory,
    running: Mutex<HashMap<ResourceId, RunningRecipe>>,
}

impl RecipeProcessor {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self::with_factories(events, CommandFactory::new(), BootstrapperFactory::new())
    }

    pub fn with_factories(
        events: Arc<EventBus>,
        commands: CommandFactory,
        bootstrappers: BootstrapperFactory,
    ) -> Self {
        Self {
            events,
            commands,
            bootstrappers,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn is_running(&self, id: ResourceId) -> bool {
        self.running.lock().contains_key(&id)
    }

    /// Run a recipe to completion.
    pub async fn build(&self, request: RecipeRequest, paths: RecipePaths) -> Result<RecipeResult> {
        self.build_with_output(request, paths, None).await
    }

    /// Run a recipe, mirroring command output to `live` as it is produced.
    ///
    /// Only fails if a recipe with the same id is already running; every
    /// other problem is recorded on the returned result.
    pub async fn build_with_output(
        &self,
        request: RecipeRequest,
        paths: RecipePaths,
        live: Option<OutputSink>,
    ) -> Result<RecipeResult> {
        self.run(request, paths, live, None).await
    }

    /// Run a recipe, calling `hook` after it stops and before the
    /// completion event, so listeners reacting to the completion see the
    /// hook's effects.
    pub async fn build_with_hook(
        &self,
        request: RecipeRequest,
        paths: RecipePaths,
        hook: impl FnOnce() + Send + 'static,
    ) -> Result<RecipeResult> {
        self.run(request, paths, None, Some(Box::new(hook))).await
    }

    async fn run(
        &self,
        request: RecipeRequest,
        paths: RecipePaths,
        live: Option<OutputSink>,
        hook: Option<CompletionHook>,
    ) -> Result<RecipeResult> {
        let id = request.id;
        let registration = {
            let mut running = self.running.lock();
            if running.contains_key(&id) {
                return Err(Error::Conflict(format!("recipe {id} is already running")));
            }
            running.insert(id, RunningRecipe::default());
            Registration {
                running: &self.running,
                id,
            }
        };

        let mut result = RecipeResult::new(id, request.recipe_name.clone());
        result.commence();
        info!(recipe_id = %id, project = %request.project, spec = %request.spec, "Recipe commenced");
        self.events.publish(Event::RecipeCommenced {
            recipe_id: id,
            recipe_name: request.recipe_name.clone(),
            at: result.started_at().unwrap_or_else(Utc::now),
        });

        let outcome = AssertUnwindSafe(self.execute_request(&request, &paths, live, &mut result))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(Error::Internal(format!(
                    "recipe panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });
        if let Err(e) = outcome {
            let message = e.summary();
            warn!(recipe_id = %id, error = %message, "Recipe aborted");
            result.error(message.clone());
            self.events.publish(Event::RecipeError {
                recipe_id: id,
                message,
            });
        }

        let observed = {
            let mut running = self.running.lock();
            match running.get_mut(&id) {
                Some(entry) => {
                    entry.finishing = true;
                    entry.observed
                }
                None => false,
            }
        };
        if observed {
            result.terminate();
        }

        self.events.publish(Event::RecipeStatus {
            recipe_id: id,
            message: "Storing recipe result...".to_string(),
        });
        result.complete();
        if let Err(e) = store_result(&paths.output_dir, &result).await {
            error!(recipe_id = %id, error = %e, "Unable to store recipe result");
        }

        drop(registration);
        if let Some(hook) = hook {
            hook();
        }
        info!(recipe_id = %id, state = %result.state(), "Recipe completed");
        self.events.publish(Event::RecipeCompleted {
            recipe_id: id,
            result: result.clone(),
        });
        Ok(result)
    }

    /// Ask a running recipe to stop. Returns false if the recipe is not
    /// running or has already finished its commands.
    pub fn terminate_recipe(&self, id: ResourceId) -> bool {
        let mut running = self.running.lock();
        let Some(entry) = running.get_mut(&id) else {
            return false;
        };
        if entry.finishing {
            return false;
        }
        if !entry.terminating {
            info!(recipe_id = %id, "Terminating recipe");
            entry.terminating = true;
            if let Some(command) = &entry.command {
                command.terminate();
                entry.observed = true;
            }
        }
        true
    }

    async fn execute_request(
        &self,
        request: &RecipeRequest,
        paths: &RecipePaths,
        live: Option<OutputSink>,
        result: &mut RecipeResult,
    ) -> Result<()> {
        paths.ensure().await.map_err(|e| {
            Error::Build(format!("Could not create recipe directories: {e}"))
        })?;

        let scope = recipe_scope(request, paths, result);
        let mut ctx = CommandContext::new(request.id, paths.clone(), scope, live);
        let mut index = 0;

        let bootstrap: Arc<dyn Command> =
            Arc::new(BootstrapCommand::new(self.bootstrappers.create(request)?));
        index += 1;
        match self
            .execute_command(&mut ctx, index, bootstrap, None, false, result)
            .await?
        {
            Step::Continue => {}
            Step::Stop | Step::Terminated => return Ok(()),
        }

        let recipes = load_recipes(request, paths).await?;
        let recipe = recipes
            .resolve(request.recipe_name.as_deref())
            .map_err(|e| Error::Build(e.to_string()))?;
        result.set_recipe_name(recipe.name.clone());
        ctx.scope_mut()
            .add_to(RECIPE_LAYER, Property::new("recipe", recipe.name.clone()));
        for property in recipes.properties.iter().chain(&recipe.properties) {
            ctx.scope_mut().add_to(RECIPE_LAYER, property.clone());
        }

        // Create every command up front so a bad one aborts before any run.
        let mut commands = Vec::with_capacity(recipe.commands.len());
        for config in &recipe.commands {
            commands.push((self.commands.create(config)?, config));
        }

        if commands.is_empty() {
            self.finish_commands(request.id);
        }

        let count = commands.len();
        for (position, (command, config)) in commands.into_iter().enumerate() {
            index += 1;
            let last = position + 1 == count;
            match self
                .execute_command(&mut ctx, index, command, Some(config), last, result)
                .await?
            {
                Step::Continue => {}
                Step::Stop | Step::Terminated => break,
            }
        }
        Ok(())
    }

    async fn execute_command(
        &self,
        ctx: &mut CommandContext,
        index: usize,
        command: Arc<dyn Command>,
        config: Option<&CommandConfig>,
        last: bool,
        recipe: &mut RecipeResult,
    ) -> Result<Step> {
        let id = ctx.recipe_id();
        {
            let mut running = self.running.lock();
            let entry = running
                .get_mut(&id)
                .ok_or_else(|| Error::Internal(format!("recipe {id} is not registered")))?;
            if entry.terminating {
                entry.observed = true;
                debug!(recipe_id = %id, command = %command.name(), "Not starting command, recipe terminating");
                return Ok(Step::Terminated);
            }
            entry.command = Some(command.clone());
        }

        let mut result = CommandResult::new(command.name());
        let dir = match ctx.begin_command(index, command.name()).await {
            Ok(dir) => dir,
            Err(e) => {
                self.clear_command(id, false);
                return Err(Error::Build(format!(
                    "Could not create command output directory: {e}"
                )));
            }
        };
        result.set_output_dir(dir);
        if let Some(config) = config {
            for property in &config.properties {
                ctx.scope_mut().add(property.clone());
            }
        }

        result.commence();
        debug!(recipe_id = %id, command = %command.name(), "Command commenced");
        self.events.publish(Event::CommandCommenced {
            recipe_id: id,
            command: command.name().to_string(),
            at: result.started_at().unwrap_or_else(Utc::now),
        });

        let outcome = AssertUnwindSafe(command.execute(ctx, &mut result))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => result.error(e.summary()),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(recipe_id = %id, command = %command.name(), panic = %message, "Command panicked");
                result.error(format!("Unexpected error: command panicked: {message}"));
            }
        }
        if let Some(config) = config {
            if let Err(e) = capture_outputs(ctx, config, &mut result).await {
                result.error(e.summary());
            }
        }

        let follows = !last && result.state().is_healthy();
        let interrupted = self.clear_command(id, follows);
        if interrupted && result.state().is_healthy() {
            result.error("Command terminated");
        }
        if let Some(live) = ctx.live() {
            if let Err(e) = live.flush() {
                warn!(recipe_id = %id, error = %e, "Unable to flush live output");
            }
        }
        ctx.end_command();
        result.complete();

        let healthy = result.state().is_healthy();
        debug!(recipe_id = %id, command = %result.name(), state = %result.state(), "Command completed");
        self.events.publish(Event::CommandCompleted {
            recipe_id: id,
            result: result.clone(),
        });
        recipe.add_command(result)?;

        Ok(if interrupted {
            Step::Terminated
        } else if healthy {
            Step::Continue
        } else {
            Step::Stop
        })
    }

    /// Forget the running command. Without a following command the recipe
    /// is finishing and can no longer be terminated. Returns true if the
    /// recipe was asked to terminate while the command ran.
    fn clear_command(&self, id: ResourceId, follows: bool) -> bool {
        let mut running = self.running.lock();
        match running.get_mut(&id) {
            Some(entry) => {
                entry.command = None;
                if !follows && !entry.terminating {
                    entry.finishing = true;
                }
                entry.terminating
            }
            None => false,
        }
    }

    fn finish_commands(&self, id: ResourceId) {
        if let Some(entry) = self.running.lock().get_mut(&id) {
            if !entry.terminating {
                entry.finishing = true;
            }
        }
    }
}

fn recipe_scope(request: &RecipeRequest, paths: &RecipePaths, result: &RecipeResult) -> PropertyScope {
    let mut scope = PropertyScope::new();
    for (name, value) in &request.properties {
        scope.add_value(name.clone(), value.clone());
    }

    scope.push(RECIPE_LAYER);
    for (name, value) in paths.path_properties() {
        scope.add_value(name, value);
    }
    let started = result.started_at().unwrap_or_else(Utc::now);
    scope.add_value(
        "recipe",
        request
            .recipe_name
            .clone()
            .unwrap_or_else(|| DEFAULT_RECIPE_LABEL.to_string()),
    );
    scope.add_value("recipe.id", request.id.to_string());
    scope.add_value("build.id", request.build_id.to_string());
    scope.add_value("project", request.project.clone());
    scope.add_value("spec", request.spec.clone());
    scope.add_value("recipe.timestamp.millis", started.timestamp_millis().to_string());
    scope
}

async fn load_recipes(request: &RecipeRequest, paths: &RecipePaths) -> Result<ProjectRecipes> {
    let text = match &request.source {
        RecipeSource::Inline(text) => text.clone(),
        RecipeSource::File(path) => tokio::fs::read_to_string(paths.base_dir.join(path))
            .await
            .map_err(|e| {
                Error::Build(format!(
                    "Unable to parse recipe file: unable to read '{}': {e}",
                    path.display()
                ))
            })?,
    };

    tokio::fs::write(paths.output_dir.join(RECIPE_FILE), &text).await?;
    if text.trim().is_empty() {
        return Err(Error::Build(
            "Unable to parse recipe file: File is empty".to_string(),
        ));
    }
    parse_recipes(&text).map_err(|e| Error::Build(format!("Unable to parse recipe file: {e}")))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn store_result(output_dir: &Path, result: &RecipeResult) -> Result<()> {
    let json = serde_json::to_vec_pretty(result)?;
    tokio::fs::write(output_dir.join(RECIPE_RESULT_FILE), json).await?;
    Ok(())
}
