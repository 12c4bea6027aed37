//! Application state.

use hearth_config::AgentSettings;
use hearth_core::event::EventBus;
use hearth_core::service::ServiceInfo;
use hearth_executor::{LocalExecutionService, RecipeProcessor};
use std::sync::Arc;

use crate::feed::EventFeed;

/// Shared application state.
#[derive(Clone)]
pub struct AgentState {
    pub info: ServiceInfo,
    pub service: Arc<LocalExecutionService>,
    pub feed: Arc<EventFeed>,
}

impl AgentState {
    pub fn new(settings: &AgentSettings) -> Self {
        let events = Arc::new(EventBus::new());
        let feed = Arc::new(EventFeed::new());
        events.register(feed.clone());

        let info = settings.service_info();
        let processor = Arc::new(RecipeProcessor::new(events));
        let service = Arc::new(LocalExecutionService::new(
            info.clone(),
            &settings.data_dir,
            processor,
        ));

        Self {
            info,
            service,
            feed,
        }
    }
}
