//! Per-project admission control: one build per project at a time.

use hearth_config::CoalescePolicy;
use hearth_core::build::BuildReason;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use tracing::{debug, info};

/// A request to build one spec of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub project: String,
    pub spec: String,
    pub reason: BuildReason,
    /// Build this revision instead of the latest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

impl BuildRequest {
    pub fn new(project: impl Into<String>, spec: impl Into<String>, reason: BuildReason) -> Self {
        Self {
            project: project.into(),
            spec: spec.into(),
            reason,
            revision: None,
        }
    }

    pub fn at_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }
}

/// Active and queued requests of one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectQueueSnapshot {
    pub project: String,
    pub active: BuildRequest,
    /// At most one per spec, in the order the specs were first queued.
    pub queued: Vec<BuildRequest>,
}

#[derive(Debug)]
struct ProjectState {
    active: BuildRequest,
    queued: Vec<BuildRequest>,
}

pub struct ProjectBuildRequestQueue {
    policy: CoalescePolicy,
    projects: Mutex<HashMap<String, ProjectState>>,
}

impl ProjectBuildRequestQueue {
    pub fn new(policy: CoalescePolicy) -> Self {
        Self {
            policy,
            projects: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if the request became the project's active build, false
    /// if it was queued behind the active one.
    pub fn build_requested(&self, request: BuildRequest) -> bool {
        let mut projects = self.projects.lock();
        let state = match projects.entry(request.project.clone()) {
            Entry::Vacant(vacant) => {
                info!(project = %request.project, spec = %request.spec, "Build admitted");
                vacant.insert(ProjectState {
                    active: request,
                    queued: Vec::new(),
                });
                return true;
            }
            Entry::Occupied(occupied) => occupied.into_mut(),
        };

        match state.queued.iter_mut().find(|q| q.spec == request.spec) {
            Some(queued) => match self.policy {
                CoalescePolicy::FirstWins => {
                    debug!(project = %request.project, spec = %request.spec, "Dropping duplicate build request");
                }
                CoalescePolicy::LatestWins => {
                    debug!(project = %request.project, spec = %request.spec, "Replacing queued build request");
                    *queued = request;
                }
            },
            None => {
                debug!(project = %request.project, spec = %request.spec, "Build queued");
                state.queued.push(request);
            }
        }
        false
    }

    /// The project's active build finished. Returns the next request to
    /// start, which becomes active, or `None` leaving the project idle.
    pub fn build_completed(&self, project: &str) -> Option<BuildRequest> {
        let mut projects = self.projects.lock();
        let state = projects.get_mut(project)?;
        if state.queued.is_empty() {
            projects.remove(project);
            debug!(project, "Project idle");
            return None;
        }
        let next = state.queued.remove(0);
        state.active = next.clone();
        info!(project, spec = %next.spec, "Queued build admitted");
        Some(next)
    }

    pub fn is_active(&self, project: &str) -> bool {
        self.projects.lock().contains_key(project)
    }

    /// Drop a queued request. Returns false if none was queued for the spec.
    pub fn cancel_queued(&self, project: &str, spec: &str) -> bool {
        let mut projects = self.projects.lock();
        let Some(state) = projects.get_mut(project) else {
            return false;
        };
        let before = state.queued.len();
        state.queued.retain(|q| q.spec != spec);
        before != state.queued.len()
    }

    /// Every busy project, sorted by name.
    pub fn snapshot(&self) -> Vec<ProjectQueueSnapshot> {
        let mut snapshot: Vec<ProjectQueueSnapshot> = self
            .projects
            .lock()
            .iter()
            .map(|(project, state)| ProjectQueueSnapshot {
                project: project.clone(),
                active: state.active.clone(),
                queued: state.queued.clone(),
            })
            .collect();
        snapshot.sort_by(|a, b| a.project.cmp(&b.project));
        snapshot
    }
}
