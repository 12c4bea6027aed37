//! Execution service running recipes in-process.
//!
//! Used directly by the master, and by the agent to host recipes sent to it
//! over HTTP.

use async_trait::async_trait;
use hearth_core::context::encode_path_component;
use hearth_core::event::EventBus;
use hearth_core::recipe::{RecipePaths, RecipeRequest};
use hearth_core::service::{CollectRequest, ExecutionService, ServiceInfo};
use hearth_core::{Error, ResourceId, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::fs::{copy_dir, move_dir, remove_dir_if_exists};
use crate::processor::RecipeProcessor;

type WorkKey = (String, String);

/// Releases a project+spec working directory when the recipe task ends.
struct ActiveGuard {
    active: Arc<Mutex<HashSet<WorkKey>>>,
    key: WorkKey,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.key);
    }
}

pub struct LocalExecutionService {
    info: ServiceInfo,
    data_dir: PathBuf,
    processor: Arc<RecipeProcessor>,
    active: Arc<Mutex<HashSet<WorkKey>>>,
}

impl LocalExecutionService {
    pub fn new(info: ServiceInfo, data_dir: impl Into<PathBuf>, processor: Arc<RecipeProcessor>) -> Self {
        Self {
            info,
            data_dir: data_dir.into(),
            processor,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn events(&self) -> &Arc<EventBus> {
        self.processor.events()
    }

    pub fn processor(&self) -> &Arc<RecipeProcessor> {
        &self.processor
    }

    /// Output directory of a recipe that has not been collected yet.
    pub fn output_dir(&self, recipe_id: ResourceId) -> PathBuf {
        RecipePaths::recipe_root(&self.data_dir, recipe_id).join("output")
    }

    /// Remove every persistent working copy of a project.
    pub async fn cleanup_project(&self, project: &str) -> Result<()> {
        let dir = self
            .data_dir
            .join("work")
            .join(encode_path_component(project));
        info!(service = %self.info.id, project, "Removing persistent working copies");
        remove_dir_if_exists(&dir).await?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionService for LocalExecutionService {
    fn info(&self) -> &ServiceInfo {
        &self.info
    }

    async fn build(&self, request: RecipeRequest) -> Result<()> {
        if self.processor.is_running(request.id) {
            return Err(Error::Conflict(format!(
                "recipe {} is already running",
                request.id
            )));
        }

        let key = (request.project.clone(), request.spec.clone());
        {
            let mut active = self.active.lock();
            if !active.insert(key.clone()) {
                return Err(Error::Conflict(format!(
                    "a recipe for project '{}' spec '{}' is already running on {}",
                    key.0, key.1, self.info.id
                )));
            }
        }
        let guard = ActiveGuard {
            active: self.active.clone(),
            key,
        };

        let paths = RecipePaths::server(
            &self.data_dir,
            &request.project,
            &request.spec,
            request.id,
            request.incremental,
        );
        let processor = self.processor.clone();
        let service = self.info.id.clone();
        info!(service = %service, recipe_id = %request.id, "Accepted recipe");

        tokio::spawn(async move {
            let id = request.id;
            // Free the working directory before the completion is published,
            // so a follow-up build of the same spec is not refused.
            let release = move || drop(guard);
            match processor.build_with_hook(request, paths, release).await {
                Ok(result) => {
                    debug!(service = %service, recipe_id = %id, state = %result.state(), "Recipe task finished")
                }
                Err(e) => error!(service = %service, recipe_id = %id, error = %e, "Recipe task failed"),
            }
        });
        Ok(())
    }

    async fn collect_results(&self, request: &CollectRequest) -> Result<()> {
        let root = RecipePaths::recipe_root(&self.data_dir, request.recipe_id);
        let output = root.join("output");
        if !output.is_dir() {
            return Err(Error::NotFound(format!(
                "no output for recipe {}",
                request.recipe_id
            )));
        }
        move_dir(&output, &request.output_dest).await?;

        if let Some(dest) = &request.working_copy_dest {
            if request.incremental {
                // The persistent directory is reused by the next build.
                let persistent =
                    RecipePaths::persistent_dir_for(&self.data_dir, &request.project, &request.spec);
                if persistent.is_dir() {
                    copy_dir(&persistent, dest).await?;
                }
            } else {
                let base = root.join("base");
                if base.is_dir() {
                    move_dir(&base, dest).await?;
                }
            }
        }
        debug!(service = %self.info.id, recipe_id = %request.recipe_id, "Collected results");
        Ok(())
    }

    async fn cleanup(
        &self,
        project: &str,
        spec: &str,
        recipe_id: ResourceId,
        incremental: bool,
    ) -> Result<()> {
        debug!(service = %self.info.id, recipe_id = %recipe_id, project, spec, incremental, "Cleaning up recipe");
        remove_dir_if_exists(&RecipePaths::recipe_root(&self.data_dir, recipe_id)).await?;
        Ok(())
    }

    async fn terminate(&self, recipe_id: ResourceId) -> Result<bool> {
        Ok(self.processor.terminate_recipe(recipe_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::event::Event;
    use hearth_core::recipe::RecipeSource;
    use hearth_core::result::{RecipeResult, ResultState};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const RECIPES: &str = r#"
        default-recipe "build"
        recipe "build" {
            command "hello" {
                print "hello from ${project}"
            }
        }
        recipe "slow" {
            command "wait" {
                sleep 60000
            }
        }
    "#;

    fn service(dir: &Path) -> (LocalExecutionService, mpsc::UnboundedReceiver<Event>) {
        let bus = Arc::new(EventBus::new());
        let (_, rx) = bus.channel();
        let processor = Arc::new(RecipeProcessor::new(bus));
        (
            LocalExecutionService::new(ServiceInfo::master(), dir, processor),
            rx,
        )
    }

    fn request() -> RecipeRequest {
        RecipeRequest::new("hearth", "default", RecipeSource::Inline(RECIPES.to_string()))
    }

    async fn completed(rx: &mut mpsc::UnboundedReceiver<Event>, id: ResourceId) -> RecipeResult {
        let wait = async {
            loop {
                match rx.recv().await {
                    Some(Event::RecipeCompleted { recipe_id, result }) if recipe_id == id => {
                        return result;
                    }
                    Some(_) => continue,
                    None => panic!("event stream closed"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait).await.unwrap()
    }

    async fn started(rx: &mut mpsc::UnboundedReceiver<Event>, id: ResourceId) {
        loop {
            match rx.recv().await {
                Some(Event::CommandCommenced { recipe_id, command, .. })
                    if recipe_id == id && command == "wait" =>
                {
                    return;
                }
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_build_collect_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let (service, mut rx) = service(&dir.path().join("data"));
        let request = request();
        let id = request.id;

        service.build(request).await.unwrap();
        let result = completed(&mut rx, id).await;
        assert_eq!(result.state(), ResultState::Success);

        let collect = CollectRequest {
            project: "hearth".to_string(),
            spec: "default".to_string(),
            recipe_id: id,
            incremental: false,
            output_dest: dir.path().join("build/output"),
            working_copy_dest: Some(dir.path().join("build/working")),
        };
        service.collect_results(&collect).await.unwrap();

        let output = dir
            .path()
            .join("build/output/00000002-hello/command%20output/output.txt");
        assert_eq!(std::fs::read_to_string(output).unwrap(), "hello from hearth\n");
        assert!(dir.path().join("build/output/recipe.json").exists());
        assert!(dir.path().join("build/working").is_dir());
        assert!(!service.output_dir(id).exists());

        service.cleanup("hearth", "default", id, false).await.unwrap();
        assert!(!RecipePaths::recipe_root(service.data_dir(), id).exists());
    }

    #[tokio::test]
    async fn test_incremental_collect_keeps_persistent_copy() {
        let dir = tempfile::tempdir().unwrap();
        let (service, mut rx) = service(&dir.path().join("data"));
        let request = request().incremental(true);
        let id = request.id;
        let persistent = RecipePaths::persistent_dir_for(service.data_dir(), "hearth", "default");
        std::fs::create_dir_all(&persistent).unwrap();
        std::fs::write(persistent.join("cached.o"), "object").unwrap();

        service.build(request).await.unwrap();
        completed(&mut rx, id).await;

        let collect = CollectRequest {
            project: "hearth".to_string(),
            spec: "default".to_string(),
            recipe_id: id,
            incremental: true,
            output_dest: dir.path().join("out"),
            working_copy_dest: Some(dir.path().join("working")),
        };
        service.collect_results(&collect).await.unwrap();
        service.cleanup("hearth", "default", id, true).await.unwrap();

        assert!(dir.path().join("working/cached.o").exists());
        assert!(persistent.join("cached.o").exists());

        service.cleanup_project("hearth").await.unwrap();
        assert!(!persistent.exists());
    }

    #[tokio::test]
    async fn test_same_project_spec_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let (service, mut rx) = service(dir.path());
        let first = request().with_recipe("slow");
        let id = first.id;

        service.build(first).await.unwrap();
        started(&mut rx, id).await;

        assert!(matches!(
            service.build(request()).await,
            Err(Error::Conflict(_))
        ));

        assert!(service.terminate(id).await.unwrap());
        let result = completed(&mut rx, id).await;
        assert_eq!(result.state(), ResultState::Terminated);

        let second = request();
        let second_id = second.id;
        service.build(second).await.unwrap();
        completed(&mut rx, second_id).await;
    }

    #[tokio::test]
    async fn test_follow_up_build_from_completion_listener() {
        let dir = tempfile::tempdir().unwrap();
        let (service, mut rx) = service(dir.path());
        let service = Arc::new(service);
        let first = request();
        let first_id = first.id;
        let follow_up = request();
        let follow_up_id = follow_up.id;

        let accepted = Arc::new(Mutex::new(None));
        {
            let bus = service.events().clone();
            let service = service.clone();
            let accepted = accepted.clone();
            bus.register(Arc::new(move |event: &Event| {
                if let Event::RecipeCompleted { recipe_id, .. } = event {
                    if *recipe_id == first_id {
                        let outcome =
                            futures::executor::block_on(service.build(follow_up.clone()));
                        *accepted.lock() = Some(outcome.map_err(|e| e.to_string()));
                    }
                }
            }));
        }

        service.build(first).await.unwrap();
        completed(&mut rx, first_id).await;
        assert_eq!(*accepted.lock(), Some(Ok(())));
        let result = completed(&mut rx, follow_up_id).await;
        assert_eq!(result.state(), ResultState::Success);
    }

    #[tokio::test]
    async fn test_terminate_unknown_recipe() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _rx) = service(dir.path());
        assert!(!service.terminate(ResourceId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_collect_unknown_recipe() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _rx) = service(dir.path());
        let collect = CollectRequest {
            project: "hearth".to_string(),
            spec: "default".to_string(),
            recipe_id: ResourceId::new(),
            incremental: false,
            output_dest: dir.path().join("out"),
            working_copy_dest: None,
        };
        assert!(matches!(
            service.collect_results(&collect).await,
            Err(Error::NotFound(_))
        ));
    }
}
