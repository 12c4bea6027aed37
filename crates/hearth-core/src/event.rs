//! Recipe lifecycle events and the bus they are published on.
//!
//! Listeners are called synchronously on the publishing task, in
//! registration order. Listeners that need to do real work should hand the
//! event off, for example through [`EventBus::channel`].

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

use crate::ResourceId;
use crate::result::{CommandResult, RecipeResult};
use crate::service::ServiceId;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    RecipeCommenced {
        recipe_id: ResourceId,
        recipe_name: Option<String>,
        at: DateTime<Utc>,
    },
    CommandCommenced {
        recipe_id: ResourceId,
        command: String,
        at: DateTime<Utc>,
    },
    CommandCompleted {
        recipe_id: ResourceId,
        result: CommandResult,
    },
    RecipeStatus {
        recipe_id: ResourceId,
        message: String,
    },
    /// The recipe aborted for a reason outside any command.
    RecipeError {
        recipe_id: ResourceId,
        message: String,
    },
    /// Always the last event for a recipe.
    RecipeCompleted {
        recipe_id: ResourceId,
        result: RecipeResult,
    },
    RecipeDispatched {
        recipe_id: ResourceId,
        service: ServiceId,
    },
    RecipeDispatchFailed {
        recipe_id: ResourceId,
        service: ServiceId,
        message: String,
    },
}

impl Event {
    pub fn recipe_id(&self) -> ResourceId {
        match self {
            Event::RecipeCommenced { recipe_id, .. }
            | Event::CommandCommenced { recipe_id, .. }
            | Event::CommandCompleted { recipe_id, .. }
            | Event::RecipeStatus { recipe_id, .. }
            | Event::RecipeError { recipe_id, .. }
            | Event::RecipeCompleted { recipe_id, .. }
            | Event::RecipeDispatched { recipe_id, .. }
            | Event::RecipeDispatchFailed { recipe_id, .. } => *recipe_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::RecipeCompleted { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::RecipeCommenced { .. } => "recipe_commenced",
            Event::CommandCommenced { .. } => "command_commenced",
            Event::CommandCompleted { .. } => "command_completed",
            Event::RecipeStatus { .. } => "recipe_status",
            Event::RecipeError { .. } => "recipe_error",
            Event::RecipeCompleted { .. } => "recipe_completed",
            Event::RecipeDispatched { .. } => "recipe_dispatched",
            Event::RecipeDispatchFailed { .. } => "recipe_dispatch_failed",
        }
    }
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> EventListener for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn EventListener>)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Register a listener that forwards every event to a channel.
    pub fn channel(&self) -> (ListenerId, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.register(Arc::new(ChannelListener::new(tx)));
        (id, rx)
    }

    pub fn publish(&self, event: Event) {
        debug!(recipe_id = %event.recipe_id(), kind = event.kind(), "Publishing event");
        // Listeners may (un)register while being called.
        let listeners: Vec<Arc<dyn EventListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener.on_event(&event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

/// Forwards events to an unbounded channel. Sends to a closed channel are
/// dropped.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelListener {
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }
}

impl EventListener for ChannelListener {
    fn on_event(&self, event: &Event) {
        let _ = self.tx.send(event.clone());
    }
}
