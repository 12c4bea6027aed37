//! The set of execution services recipes can be dispatched to.

use hearth_core::service::{ExecutionService, HostRequirement, ServiceId, ServiceKind};
use hearth_core::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Ordered registry of execution services.
///
/// Iteration order is the dispatch order: the master first, then agents in
/// the order they registered. Every change bumps a version that watchers
/// are notified of.
pub struct ServiceRegistry {
    services: Mutex<Vec<Arc<dyn ExecutionService>>>,
    version: watch::Sender<u64>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            services: Mutex::new(Vec::new()),
            version,
        }
    }

    /// Register a service. A second registration of a known id is refused.
    pub fn add(&self, service: Arc<dyn ExecutionService>) -> Result<()> {
        {
            let mut services = self.services.lock();
            if services.iter().any(|s| s.id() == service.id()) {
                return Err(Error::Conflict(format!(
                    "service '{}' is already registered",
                    service.id()
                )));
            }
            let index = if service.info().kind == ServiceKind::Master {
                services
                    .iter()
                    .position(|s| s.info().kind != ServiceKind::Master)
                    .unwrap_or(services.len())
            } else {
                services.len()
            };
            info!(service = %service.id(), "Service registered");
            services.insert(index, service);
        }
        self.version.send_modify(|v| *v += 1);
        Ok(())
    }

    pub fn remove(&self, id: &ServiceId) -> Option<Arc<dyn ExecutionService>> {
        let removed = {
            let mut services = self.services.lock();
            let index = services.iter().position(|s| s.id() == id)?;
            services.remove(index)
        };
        info!(service = %id, "Service removed");
        self.version.send_modify(|v| *v += 1);
        Some(removed)
    }

    pub fn get(&self, id: &ServiceId) -> Option<Arc<dyn ExecutionService>> {
        self.services.lock().iter().find(|s| s.id() == id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn ExecutionService>> {
        self.services.lock().clone()
    }

    /// Services able to satisfy a requirement, in dispatch order.
    pub fn candidates(&self, requirement: &HostRequirement) -> Vec<Arc<dyn ExecutionService>> {
        self.services
            .lock()
            .iter()
            .filter(|s| requirement.fulfilled_by(s.info()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Receiver that is notified on every change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use hearth_core::ResourceId;
    use hearth_core::recipe::RecipeRequest;
    use hearth_core::service::{CollectRequest, ServiceInfo};

    /// Service that records the recipes handed to it.
    pub(crate) struct StubService {
        pub info: ServiceInfo,
        pub builds: Mutex<Vec<ResourceId>>,
        pub fail: std::sync::atomic::AtomicBool,
    }

    impl StubService {
        pub fn new(info: ServiceInfo) -> Arc<Self> {
            Arc::new(Self {
                info,
                builds: Mutex::new(Vec::new()),
                fail: std::sync::atomic::AtomicBool::new(false),
            })
        }

        pub fn built(&self) -> Vec<ResourceId> {
            self.builds.lock().clone()
        }
    }

    #[async_trait]
    impl ExecutionService for StubService {
        fn info(&self) -> &ServiceInfo {
            &self.info
        }

        async fn build(&self, request: RecipeRequest) -> Result<()> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::Remote("agent offline".to_string()));
            }
            self.builds.lock().push(request.id);
            Ok(())
        }

        async fn collect_results(&self, _request: &CollectRequest) -> Result<()> {
            Ok(())
        }

        async fn cleanup(&self, _: &str, _: &str, _: ResourceId, _: bool) -> Result<()> {
            Ok(())
        }

        async fn terminate(&self, _recipe_id: ResourceId) -> Result<bool> {
            Ok(false)
        }
    }

    fn ids(registry: &ServiceRegistry) -> Vec<String> {
        registry
            .snapshot()
            .iter()
            .map(|s| s.id().to_string())
            .collect()
    }

    #[test]
    fn test_master_is_first_then_registration_order() {
        let registry = ServiceRegistry::new();
        registry.add(StubService::new(ServiceInfo::agent("b"))).unwrap();
        registry.add(StubService::new(ServiceInfo::agent("a"))).unwrap();
        registry.add(StubService::new(ServiceInfo::master())).unwrap();

        assert_eq!(ids(&registry), vec!["master", "b", "a"]);
    }

    #[test]
    fn test_duplicate_registration_is_refused() {
        let registry = ServiceRegistry::new();
        registry.add(StubService::new(ServiceInfo::agent("a"))).unwrap();
        let version = registry.version();

        assert!(matches!(
            registry.add(StubService::new(ServiceInfo::agent("a"))),
            Err(Error::Conflict(_))
        ));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.version(), version);
    }

    #[test]
    fn test_remove_and_candidates() {
        let registry = ServiceRegistry::new();
        registry.add(StubService::new(ServiceInfo::master())).unwrap();
        registry
            .add(StubService::new(
                ServiceInfo::agent("linux").with_resource("gcc", None),
            ))
            .unwrap();

        let gcc = HostRequirement::Resource {
            name: "gcc".to_string(),
            version: None,
        };
        assert_eq!(registry.candidates(&gcc).len(), 1);
        assert_eq!(registry.candidates(&HostRequirement::Any).len(), 2);

        assert!(registry.remove(&ServiceId::new("linux")).is_some());
        assert!(registry.remove(&ServiceId::new("linux")).is_none());
        assert!(registry.candidates(&gcc).is_empty());
    }

    #[tokio::test]
    async fn test_changes_notify_watchers() {
        let registry = ServiceRegistry::new();
        let mut rx = registry.subscribe();

        registry.add(StubService::new(ServiceInfo::agent("a"))).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);

        registry.remove(&ServiceId::new("a"));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 2);
    }
}
