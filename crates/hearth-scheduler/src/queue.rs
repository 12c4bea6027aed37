//! Recipe dispatch: matching recipe requests to execution services.

use hearth_config::{DispatchPolicy, parse_recipes};
use hearth_core::event::{Event, EventBus};
use hearth_core::recipe::{RecipeRequest, RecipeSource};
use hearth_core::service::{ExecutionService, HostRequirement, ServiceId};
use hearth_core::{Error, ResourceId, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registry::ServiceRegistry;

/// A recipe and the hosts allowed to run it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub request: RecipeRequest,
    pub requirement: HostRequirement,
}

impl DispatchRequest {
    pub fn new(request: RecipeRequest, requirement: HostRequirement) -> Self {
        Self {
            request,
            requirement,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.request.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched { service: ServiceId },
    /// No service can take the request yet; it waits for the registry to
    /// change.
    Held,
}

struct HeldRequest {
    dispatch: DispatchRequest,
    /// A retry pass is handing this request to a service.
    in_flight: bool,
}

pub struct RecipeDispatchQueue {
    registry: Arc<ServiceRegistry>,
    events: Arc<EventBus>,
    policy: DispatchPolicy,
    held: Mutex<Vec<HeldRequest>>,
}

impl RecipeDispatchQueue {
    pub fn new(registry: Arc<ServiceRegistry>, events: Arc<EventBus>, policy: DispatchPolicy) -> Self {
        Self {
            registry,
            events,
            policy,
            held: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Hand a request to the first service that satisfies it, or hold it.
    ///
    /// Returns once the service has accepted the recipe, without waiting
    /// for it to run.
    pub async fn enqueue(&self, dispatch: DispatchRequest) -> Result<DispatchOutcome> {
        check_recipe(&dispatch.request)?;

        let version = self.registry.version();
        let candidates = self.registry.candidates(&dispatch.requirement);
        if candidates.is_empty() && self.policy == DispatchPolicy::FailFast {
            return Err(Error::NoService(dispatch.requirement.to_string()));
        }

        if let Some(service) = self.try_dispatch(&dispatch, &candidates).await {
            return Ok(DispatchOutcome::Dispatched { service });
        }

        debug!(recipe_id = %dispatch.id(), requirement = %dispatch.requirement, "Holding recipe");
        self.held.lock().push(HeldRequest {
            dispatch,
            in_flight: false,
        });
        // A service may have arrived after the candidates were taken.
        if self.registry.version() != version {
            self.dispatch_pending().await;
        }
        Ok(DispatchOutcome::Held)
    }

    /// Held requests, oldest first. Nothing is removed.
    pub fn take_snapshot(&self) -> Vec<DispatchRequest> {
        self.held
            .lock()
            .iter()
            .map(|h| h.dispatch.clone())
            .collect()
    }

    /// Remove a held request. Returns false if it is unknown, already
    /// dispatched, or being dispatched right now.
    pub fn cancel_request(&self, id: ResourceId) -> bool {
        let mut held = self.held.lock();
        match held.iter().position(|h| h.dispatch.id() == id) {
            Some(index) if !held[index].in_flight => {
                held.remove(index);
                info!(recipe_id = %id, "Cancelled held recipe");
                true
            }
            _ => false,
        }
    }

    /// Retry every held request. Returns the number dispatched.
    pub async fn dispatch_pending(&self) -> usize {
        let claimed: Vec<DispatchRequest> = {
            let mut held = self.held.lock();
            held.iter_mut()
                .filter(|h| !h.in_flight)
                .map(|h| {
                    h.in_flight = true;
                    h.dispatch.clone()
                })
                .collect()
        };

        let mut dispatched = 0;
        for dispatch in claimed {
            let candidates = self.registry.candidates(&dispatch.requirement);
            let done = self.try_dispatch(&dispatch, &candidates).await.is_some();

            let mut held = self.held.lock();
            if let Some(index) = held.iter().position(|h| h.dispatch.id() == dispatch.id()) {
                if done {
                    held.remove(index);
                    dispatched += 1;
                } else {
                    held[index].in_flight = false;
                }
            }
        }
        dispatched
    }

    /// Retry held requests whenever the registry changes. The task ends when
    /// the queue is dropped.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let queue: Weak<Self> = Arc::downgrade(self);
        let mut changes = self.registry.subscribe();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let Some(queue) = queue.upgrade() else {
                    break;
                };
                let count = queue.dispatch_pending().await;
                if count > 0 {
                    info!(count, "Dispatched held recipes");
                }
            }
        })
    }

    /// First-fit over the candidates. A service refusing the build is
    /// reported and the next one is tried.
    async fn try_dispatch(
        &self,
        dispatch: &DispatchRequest,
        candidates: &[Arc<dyn ExecutionService>],
    ) -> Option<ServiceId> {
        let id = dispatch.id();
        for service in candidates {
            match service.build(dispatch.request.clone()).await {
                Ok(()) => {
                    info!(recipe_id = %id, service = %service.id(), "Recipe dispatched");
                    self.events.publish(Event::RecipeDispatched {
                        recipe_id: id,
                        service: service.id().clone(),
                    });
                    return Some(service.id().clone());
                }
                Err(e) => {
                    warn!(recipe_id = %id, service = %service.id(), error = %e, "Service refused recipe");
                    self.events.publish(Event::RecipeDispatchFailed {
                        recipe_id: id,
                        service: service.id().clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        None
    }
}

/// An inline recipe file must define the recipe asked for. Files that do
/// not parse are left for the processor to report.
fn check_recipe(request: &RecipeRequest) -> Result<()> {
    let (RecipeSource::Inline(text), Some(name)) = (&request.source, &request.recipe_name) else {
        return Ok(());
    };
    match parse_recipes(text) {
        Ok(recipes) if recipes.recipe(name).is_none() => Err(Error::UnknownRecipe(name.clone())),
        _ => Ok(()),
    }
}
