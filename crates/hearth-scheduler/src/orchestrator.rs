//! Build orchestration: from an admitted build request to a sealed,
//! persisted build result.
//!
//! The orchestrator reacts to lifecycle events on its own task. It records
//! where each stage was dispatched and, as stages complete, collects their
//! results into the build directory and cleans up after them on the service
//! that ran them. When every stage has reported the build is sealed, written
//! to `build.json`, and the project's next queued request is started.

use async_trait::async_trait;
use hearth_core::build::{BuildResult, BuildRevision};
use hearth_core::context::encode_path_component;
use hearth_core::event::{Event, EventBus};
use hearth_core::result::RecipeResult;
use hearth_core::service::{CollectRequest, ServiceId};
use hearth_core::{ResourceId, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::project_queue::{BuildRequest, ProjectBuildRequestQueue};
use crate::queue::{DispatchOutcome, DispatchRequest, RecipeDispatchQueue};

/// One stage of a build: a recipe and where it may run.
#[derive(Debug, Clone)]
pub struct StagePlan {
    pub stage: String,
    pub dispatch: DispatchRequest,
    /// Collect the working copy as well as the recipe output.
    pub collect_working_copy: bool,
}

/// Decomposes a build request into stages.
#[async_trait]
pub trait BuildPlanner: Send + Sync {
    async fn plan(&self, request: &BuildRequest, build: &BuildResult) -> Result<Vec<StagePlan>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildAdmission {
    Started { number: u64 },
    /// Another build of the project is running.
    Queued,
}

#[derive(Debug, Clone)]
struct StageInfo {
    stage: String,
    spec: String,
    incremental: bool,
    collect_working_copy: bool,
    host: Option<ServiceId>,
    /// Results collected, or nothing to collect.
    collected: bool,
}

struct ActiveBuild {
    result: BuildResult,
    stages: HashMap<ResourceId, StageInfo>,
}

#[derive(Default)]
struct State {
    numbers: HashMap<String, u64>,
    builds: HashMap<String, ActiveBuild>,
    /// Recipe id to the project whose build it belongs to.
    recipes: HashMap<ResourceId, String>,
}

pub struct BuildOrchestrator {
    builds_dir: PathBuf,
    dispatch: Arc<RecipeDispatchQueue>,
    projects: ProjectBuildRequestQueue,
    planner: Arc<dyn BuildPlanner>,
    state: Mutex<State>,
}

impl BuildOrchestrator {
    pub fn new(
        builds_dir: impl Into<PathBuf>,
        dispatch: Arc<RecipeDispatchQueue>,
        projects: ProjectBuildRequestQueue,
        planner: Arc<dyn BuildPlanner>,
    ) -> Self {
        Self {
            builds_dir: builds_dir.into(),
            dispatch,
            projects,
            planner,
            state: Mutex::new(State::default()),
        }
    }

    /// Follow lifecycle events on a task of its own. The task ends when the
    /// orchestrator is dropped.
    pub fn start(self: &Arc<Self>, events: &EventBus) -> JoinHandle<()> {
        let orchestrator: Weak<Self> = Arc::downgrade(self);
        let (listener, mut rx) = events.channel();
        debug!(?listener, "Orchestrator listening for events");
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };
                orchestrator.handle_event(event).await;
            }
        })
    }

    pub fn projects(&self) -> &ProjectBuildRequestQueue {
        &self.projects
    }

    pub fn build_dir(&self, project: &str, number: u64) -> PathBuf {
        self.builds_dir
            .join(encode_path_component(project))
            .join(format!("{number:08}"))
    }

    /// Snapshot of the project's running build.
    pub fn active_build(&self, project: &str) -> Option<BuildResult> {
        self.state
            .lock()
            .builds
            .get(project)
            .map(|b| b.result.clone())
    }

    /// A finished build, read back from its build directory.
    pub async fn load_build(&self, project: &str, number: u64) -> Result<BuildResult> {
        BuildResult::load(&self.build_dir(project, number)).await
    }

    /// Start a build, or queue it behind the project's running build.
    pub async fn request_build(&self, request: BuildRequest) -> Result<BuildAdmission> {
        if !self.projects.build_requested(request.clone()) {
            info!(project = %request.project, spec = %request.spec, "Build request queued");
            return Ok(BuildAdmission::Queued);
        }
        let number = self.start_chain(request).await;
        Ok(BuildAdmission::Started { number })
    }

    /// Cancel held stages and terminate running ones. Returns false if the
    /// project has no running build.
    pub async fn terminate_build(&self, project: &str) -> Result<bool> {
        let stages: Vec<(ResourceId, Option<ServiceId>)> = {
            let state = self.state.lock();
            let Some(build) = state.builds.get(project) else {
                return Ok(false);
            };
            build
                .result
                .stages()
                .iter()
                .filter(|s| !s.result.is_sealed())
                .map(|s| {
                    let id = s.result.id();
                    (id, build.stages.get(&id).and_then(|i| i.host.clone()))
                })
                .collect()
        };

        info!(project, stages = stages.len(), "Terminating build");
        for (id, host) in stages {
            if self.dispatch.cancel_request(id) {
                self.settle_stage(project, id, |result| result.terminate_stage(id));
                continue;
            }
            let Some(service) = host.and_then(|h| self.dispatch.registry().get(&h)) else {
                continue;
            };
            if let Err(e) = service.terminate(id).await {
                warn!(project, recipe_id = %id, error = %e, "Unable to terminate recipe");
            }
        }

        self.advance(project).await;
        Ok(true)
    }

    async fn handle_event(&self, event: Event) {
        match event {
            Event::RecipeDispatched { recipe_id, service } => {
                self.recipe_dispatched(recipe_id, service).await;
            }
            Event::RecipeCompleted { recipe_id, result } => {
                self.recipe_completed(recipe_id, result).await;
            }
            Event::RecipeDispatchFailed {
                recipe_id,
                service,
                message,
            } => {
                debug!(recipe_id = %recipe_id, service = %service, error = %message, "Dispatch attempt failed");
            }
            _ => {}
        }
    }

    async fn recipe_dispatched(&self, recipe_id: ResourceId, service: ServiceId) {
        // A quick recipe can complete before its dispatch is announced; its
        // results are collected once the host is known.
        let pending = {
            let mut state = self.state.lock();
            let Some(project) = state.recipes.get(&recipe_id).cloned() else {
                return;
            };
            let Some(build) = state.builds.get_mut(&project) else {
                return;
            };
            if let Err(e) = build.result.set_stage_host(recipe_id, service.clone()) {
                warn!(recipe_id = %recipe_id, error = %e, "Unable to record stage host");
            }
            let reported = build
                .result
                .stages()
                .iter()
                .any(|s| s.result.id() == recipe_id && s.result.is_sealed());
            let number = build.result.number;
            let Some(info) = build.stages.get_mut(&recipe_id) else {
                return;
            };
            info.host = Some(service);
            (reported && !info.collected).then(|| (project, info.clone(), number))
        };

        if let Some((project, info, number)) = pending {
            self.collect(&project, number, recipe_id, &info).await;
            self.advance(&project).await;
        }
    }

    async fn recipe_completed(&self, recipe_id: ResourceId, result: RecipeResult) {
        let (project, pending) = {
            let mut state = self.state.lock();
            let Some(project) = state.recipes.get(&recipe_id).cloned() else {
                return;
            };
            let Some(build) = state.builds.get_mut(&project) else {
                return;
            };
            if let Err(e) = build.result.record_recipe(result) {
                warn!(project = %project, recipe_id = %recipe_id, error = %e, "Unable to record recipe result");
            }
            let number = build.result.number;
            let pending = build
                .stages
                .get(&recipe_id)
                .filter(|info| info.host.is_some() && !info.collected)
                .map(|info| (info.clone(), number));
            (project, pending)
        };

        if let Some((info, number)) = pending {
            self.collect(&project, number, recipe_id, &info).await;
        } else {
            debug!(project = %project, recipe_id = %recipe_id, "Recipe completed before its dispatch was recorded");
        }
        self.advance(&project).await;
    }

    /// Pull a stage's results into the build directory, then clean up on the
    /// service that ran it.
    async fn collect(&self, project: &str, number: u64, recipe_id: ResourceId, info: &StageInfo) {
        match info
            .host
            .as_ref()
            .and_then(|h| self.dispatch.registry().get(h))
        {
            Some(service) => {
                let stage_dir = self
                    .build_dir(project, number)
                    .join(encode_path_component(&info.stage));
                let request = CollectRequest {
                    project: project.to_string(),
                    spec: info.spec.clone(),
                    recipe_id,
                    incremental: info.incremental,
                    output_dest: stage_dir.join("output"),
                    working_copy_dest: info.collect_working_copy.then(|| stage_dir.join("working")),
                };
                if let Err(e) = service.collect_results(&request).await {
                    error!(project, recipe_id = %recipe_id, service = %service.id(), error = %e, "Unable to collect results");
                }
                if let Err(e) = service
                    .cleanup(project, &info.spec, recipe_id, info.incremental)
                    .await
                {
                    warn!(project, recipe_id = %recipe_id, service = %service.id(), error = %e, "Unable to clean up recipe");
                }
            }
            None => {
                warn!(project, recipe_id = %recipe_id, "No service to collect stage results from");
            }
        }
        self.settle_stage(project, recipe_id, |_| Ok(()));
    }

    /// Start a build, then any requests that become startable because
    /// builds finished without waiting. Returns the first build's number.
    async fn start_chain(&self, request: BuildRequest) -> u64 {
        let project = request.project.clone();
        let number = self.start_build(request).await;
        self.advance(&project).await;
        number
    }

    /// Finish the project's build if it is done, starting queued requests
    /// for as long as builds keep finishing immediately.
    async fn advance(&self, project: &str) {
        while let Some(next) = self.finish_if_done(project).await {
            self.start_build(next).await;
        }
    }

    async fn start_build(&self, request: BuildRequest) -> u64 {
        let number = self.next_number(&request.project).await;
        let mut result = BuildResult::new(request.project.clone(), number, request.reason.clone());
        if let Some(revision) = &request.revision {
            result.revision = BuildRevision::fixed(revision.clone());
        }
        result.commence();
        info!(project = %request.project, spec = %request.spec, number, reason = %request.reason.summary(), "Build commenced");

        let plans = match self.planner.plan(&request, &result).await {
            Ok(plans) => plans,
            Err(e) => {
                error!(project = %request.project, number, error = %e, "Unable to plan build");
                result.error(format!("Unable to plan build: {e}"));
                Vec::new()
            }
        };

        let mut stages = HashMap::new();
        let mut dispatches = Vec::new();
        for plan in plans {
            let id = plan.dispatch.id();
            if let Err(e) = result.add_stage(plan.stage.clone(), id) {
                result.error(format!("Unable to add stage '{}': {e}", plan.stage));
                continue;
            }
            stages.insert(
                id,
                StageInfo {
                    stage: plan.stage.clone(),
                    spec: plan.dispatch.request.spec.clone(),
                    incremental: plan.dispatch.request.incremental,
                    collect_working_copy: plan.collect_working_copy,
                    host: None,
                    collected: false,
                },
            );
            dispatches.push((plan.stage, plan.dispatch));
        }

        {
            let mut state = self.state.lock();
            for id in stages.keys() {
                state.recipes.insert(*id, request.project.clone());
            }
            state
                .builds
                .insert(request.project.clone(), ActiveBuild { result, stages });
        }

        for (stage, dispatch) in dispatches {
            let id = dispatch.id();
            match self.dispatch.enqueue(dispatch).await {
                Ok(DispatchOutcome::Dispatched { service }) => {
                    debug!(project = %request.project, stage = %stage, service = %service, "Stage dispatched");
                }
                Ok(DispatchOutcome::Held) => {
                    info!(project = %request.project, stage = %stage, "Stage waiting for a service");
                }
                Err(e) => {
                    warn!(project = %request.project, stage = %stage, error = %e, "Stage not dispatched");
                    let summary = format!("Unable to dispatch stage '{stage}': {e}");
                    self.settle_stage(&request.project, id, |result| {
                        result.abandon_stage(id, &summary)
                    });
                }
            }
        }
        number
    }

    /// If every stage has reported and been collected, seal and persist the
    /// build and release the project. Returns the next request to start.
    async fn finish_if_done(&self, project: &str) -> Option<BuildRequest> {
        let ActiveBuild { mut result, .. } = {
            let mut state = self.state.lock();
            let done = state
                .builds
                .get(project)
                .is_some_and(|b| b.result.all_stages_reported() && b.stages.values().all(|s| s.collected));
            if !done {
                return None;
            }
            let build = state.builds.remove(project)?;
            for id in build.stages.keys() {
                state.recipes.remove(id);
            }
            build
        };

        result.complete();
        let dir = self.build_dir(project, result.number);
        if let Err(e) = result.save(&dir).await {
            error!(project, number = result.number, error = %e, "Unable to store build result");
        }
        info!(project, number = result.number, state = %result.state(), "Build completed");
        self.projects.build_completed(project)
    }

    /// Apply a final update to a stage and mark it as needing no collection.
    fn settle_stage(
        &self,
        project: &str,
        recipe_id: ResourceId,
        update: impl FnOnce(&mut BuildResult) -> Result<()>,
    ) {
        let mut state = self.state.lock();
        state.recipes.remove(&recipe_id);
        let Some(build) = state.builds.get_mut(project) else {
            return;
        };
        if let Err(e) = update(&mut build.result) {
            warn!(project, recipe_id = %recipe_id, error = %e, "Unable to update build result");
        }
        if let Some(info) = build.stages.get_mut(&recipe_id) {
            info.collected = true;
        }
    }

    /// One past the highest build number seen for the project, on disk or
    /// in this process.
    async fn next_number(&self, project: &str) -> u64 {
        let known = self.state.lock().numbers.get(project).copied();
        let last = match known {
            Some(last) => last,
            None => last_build_number(&self.builds_dir.join(encode_path_component(project))).await,
        };
        let mut state = self.state.lock();
        let entry = state.numbers.entry(project.to_string()).or_insert(last);
        *entry = (*entry).max(last) + 1;
        *entry
    }
}

async fn last_build_number(dir: &Path) -> u64 {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    let mut last = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Some(number) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u64>().ok())
        {
            last = last.max(number);
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceRegistry;
    use hearth_config::{CoalescePolicy, DispatchPolicy};
    use hearth_core::build::BuildReason;
    use hearth_core::recipe::{RecipeRequest, RecipeSource};
    use hearth_core::result::ResultState;
    use hearth_core::service::{HostRequirement, ServiceInfo};
    use hearth_executor::{LocalExecutionService, RecipeProcessor};
    use std::time::Duration;

    const RECIPES: &str = r#"
        default-recipe "build"
        recipe "build" {
            command "compile" { print "compiling ${spec}" }
        }
        recipe "slow" {
            command "wait" { sleep 60000 }
        }
    "#;

    /// One stage per build, running the spec's recipe.
    struct SingleStage {
        requirement: HostRequirement,
        recipe: Option<String>,
    }

    #[async_trait]
    impl BuildPlanner for SingleStage {
        async fn plan(&self, request: &BuildRequest, build: &BuildResult) -> Result<Vec<StagePlan>> {
            let mut recipe = RecipeRequest::new(
                request.project.clone(),
                request.spec.clone(),
                RecipeSource::Inline(RECIPES.to_string()),
            )
            .with_build_id(build.id);
            if let Some(name) = &self.recipe {
                recipe = recipe.with_recipe(name.clone());
            }
            Ok(vec![StagePlan {
                stage: "default".to_string(),
                dispatch: DispatchRequest::new(recipe, self.requirement.clone()),
                collect_working_copy: true,
            }])
        }
    }

    struct Fixture {
        orchestrator: Arc<BuildOrchestrator>,
        _dir: tempfile::TempDir,
        _tasks: Vec<JoinHandle<()>>,
    }

    fn fixture(planner: SingleStage, policy: DispatchPolicy) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(ServiceRegistry::new());
        let processor = Arc::new(RecipeProcessor::new(bus.clone()));
        registry
            .add(Arc::new(LocalExecutionService::new(
                ServiceInfo::master(),
                dir.path().join("data"),
                processor,
            )))
            .unwrap();

        let dispatch = Arc::new(RecipeDispatchQueue::new(registry, bus.clone(), policy));
        let orchestrator = Arc::new(BuildOrchestrator::new(
            dir.path().join("builds"),
            dispatch.clone(),
            ProjectBuildRequestQueue::new(CoalescePolicy::FirstWins),
            Arc::new(planner),
        ));
        let tasks = vec![dispatch.start(), orchestrator.start(&bus)];
        Fixture {
            orchestrator,
            _dir: dir,
            _tasks: tasks,
        }
    }

    async fn wait_for_build(orchestrator: &BuildOrchestrator, project: &str, number: u64) -> BuildResult {
        let wait = async {
            loop {
                if let Ok(build) = orchestrator.load_build(project, number).await {
                    return build;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait).await.unwrap()
    }

    fn request(spec: &str) -> BuildRequest {
        BuildRequest::new(
            "hearth",
            spec,
            BuildReason::Manual {
                user: "ci".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_build_runs_to_a_persisted_result() {
        let fixture = fixture(
            SingleStage {
                requirement: HostRequirement::Any,
                recipe: None,
            },
            DispatchPolicy::Hold,
        );
        let orchestrator = &fixture.orchestrator;

        let admission = orchestrator.request_build(request("default")).await.unwrap();
        assert_eq!(admission, BuildAdmission::Started { number: 1 });

        let build = wait_for_build(orchestrator, "hearth", 1).await;
        assert_eq!(build.state(), ResultState::Success);
        let stage = build.stage("default").unwrap();
        assert_eq!(stage.host, Some(ServiceId::master()));
        assert_eq!(stage.result.commands().len(), 2);

        let output = orchestrator
            .build_dir("hearth", 1)
            .join("default/output/00000002-compile/command%20output/output.txt");
        assert_eq!(std::fs::read_to_string(output).unwrap(), "compiling default\n");
        assert!(orchestrator.build_dir("hearth", 1).join("default/working").is_dir());
        assert!(!orchestrator.projects().is_active("hearth"));
    }

    #[tokio::test]
    async fn test_queued_request_starts_after_the_active_build() {
        let fixture = fixture(
            SingleStage {
                requirement: HostRequirement::Any,
                recipe: None,
            },
            DispatchPolicy::Hold,
        );
        let orchestrator = &fixture.orchestrator;

        orchestrator.request_build(request("default")).await.unwrap();
        let second = orchestrator.request_build(request("nightly")).await.unwrap();
        // The first build may already be done if it ran very quickly.
        assert!(matches!(
            second,
            BuildAdmission::Queued | BuildAdmission::Started { number: 2 }
        ));

        let first = wait_for_build(orchestrator, "hearth", 1).await;
        let second = wait_for_build(orchestrator, "hearth", 2).await;
        assert_eq!(first.state(), ResultState::Success);
        assert_eq!(second.state(), ResultState::Success);
    }

    #[tokio::test]
    async fn test_undispatchable_stage_completes_the_build() {
        let fixture = fixture(
            SingleStage {
                requirement: HostRequirement::Resource {
                    name: "gcc".to_string(),
                    version: None,
                },
                recipe: None,
            },
            DispatchPolicy::FailFast,
        );
        let orchestrator = &fixture.orchestrator;

        orchestrator.request_build(request("default")).await.unwrap();

        let build = orchestrator.load_build("hearth", 1).await.unwrap();
        assert_eq!(build.state(), ResultState::Error);
        let errors = build.stage("default").unwrap().result.collect_errors();
        assert!(errors[0].starts_with("Unable to dispatch stage 'default'"));
        assert!(!orchestrator.projects().is_active("hearth"));
    }

    #[tokio::test]
    async fn test_terminate_held_build() {
        let fixture = fixture(
            SingleStage {
                requirement: HostRequirement::Service {
                    id: ServiceId::new("absent"),
                },
                recipe: None,
            },
            DispatchPolicy::Hold,
        );
        let orchestrator = &fixture.orchestrator;

        orchestrator.request_build(request("default")).await.unwrap();
        assert!(orchestrator.active_build("hearth").is_some());

        assert!(orchestrator.terminate_build("hearth").await.unwrap());
        let build = orchestrator.load_build("hearth", 1).await.unwrap();
        assert_eq!(build.state(), ResultState::Terminated);
        assert!(!orchestrator.terminate_build("hearth").await.unwrap());
    }

    #[tokio::test]
    async fn test_terminate_running_build() {
        let fixture = fixture(
            SingleStage {
                requirement: HostRequirement::Master,
                recipe: Some("slow".to_string()),
            },
            DispatchPolicy::Hold,
        );
        let orchestrator = &fixture.orchestrator;

        orchestrator.request_build(request("default")).await.unwrap();
        // Wait for the orchestrator to learn where the stage runs.
        let hosted = async {
            loop {
                let host = orchestrator
                    .active_build("hearth")
                    .and_then(|b| b.stage("default").and_then(|s| s.host.clone()));
                if host.is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), hosted).await.unwrap();

        assert!(orchestrator.terminate_build("hearth").await.unwrap());
        let build = wait_for_build(orchestrator, "hearth", 1).await;
        assert_eq!(build.state(), ResultState::Terminated);
    }

    #[tokio::test]
    async fn test_build_numbers_continue_from_disk() {
        let fixture = fixture(
            SingleStage {
                requirement: HostRequirement::Any,
                recipe: None,
            },
            DispatchPolicy::Hold,
        );
        let orchestrator = &fixture.orchestrator;
        std::fs::create_dir_all(orchestrator.build_dir("hearth", 41)).unwrap();

        let admission = orchestrator.request_build(request("default")).await.unwrap();
        assert_eq!(admission, BuildAdmission::Started { number: 42 });
        wait_for_build(orchestrator, "hearth", 42).await;
    }
}
