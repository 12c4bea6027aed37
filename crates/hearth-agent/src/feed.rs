//! Per-recipe event buffers behind `GET /recipes/{id}/events`.
//!
//! Every event the agent's processor publishes is kept until the recipe is
//! cleaned up, so a master that connects late still sees the whole run.

use futures::Stream;
use hearth_core::ResourceId;
use hearth_core::event::{Event, EventListener};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

struct RecipeLog {
    events: Vec<Event>,
    /// Bumped on every appended event.
    version: watch::Sender<usize>,
}

impl RecipeLog {
    fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            events: Vec::new(),
            version,
        }
    }
}

enum Lookup {
    Event(Event),
    Pending,
    Gone,
}

#[derive(Default)]
pub struct EventFeed {
    recipes: Mutex<HashMap<ResourceId, RecipeLog>>,
}

impl EventFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start buffering a recipe before its first event is published.
    pub fn track(&self, recipe_id: ResourceId) {
        self.recipes
            .lock()
            .entry(recipe_id)
            .or_insert_with(RecipeLog::new);
    }

    /// Drop a recipe's buffer. Open streams end.
    pub fn forget(&self, recipe_id: ResourceId) -> bool {
        let removed = self.recipes.lock().remove(&recipe_id).is_some();
        if removed {
            debug!(recipe_id = %recipe_id, "Dropped event buffer");
        }
        removed
    }

    pub fn is_tracked(&self, recipe_id: ResourceId) -> bool {
        self.recipes.lock().contains_key(&recipe_id)
    }

    /// Events recorded so far for a recipe.
    pub fn events(&self, recipe_id: ResourceId) -> Vec<Event> {
        self.recipes
            .lock()
            .get(&recipe_id)
            .map(|log| log.events.clone())
            .unwrap_or_default()
    }

    /// Every event of a recipe from the first, ending after its completion
    /// event. `None` if the recipe is not tracked.
    pub fn subscribe(self: &Arc<Self>, recipe_id: ResourceId) -> Option<impl Stream<Item = Event> + Send + 'static> {
        let rx = self.recipes.lock().get(&recipe_id)?.version.subscribe();
        let state = (self.clone(), rx, 0usize, false);

        Some(futures::stream::unfold(
            state,
            move |(feed, mut rx, next, done)| async move {
                if done {
                    return None;
                }
                loop {
                    rx.borrow_and_update();
                    match feed.lookup(recipe_id, next) {
                        Lookup::Event(event) => {
                            let terminal = event.is_terminal();
                            return Some((event, (feed, rx, next + 1, terminal)));
                        }
                        Lookup::Pending => rx.changed().await.ok()?,
                        Lookup::Gone => return None,
                    }
                }
            },
        ))
    }

    fn lookup(&self, recipe_id: ResourceId, index: usize) -> Lookup {
        match self.recipes.lock().get(&recipe_id) {
            Some(log) => match log.events.get(index) {
                Some(event) => Lookup::Event(event.clone()),
                None => Lookup::Pending,
            },
            None => Lookup::Gone,
        }
    }
}

impl EventListener for EventFeed {
    fn on_event(&self, event: &Event) {
        let mut recipes = self.recipes.lock();
        let log = recipes
            .entry(event.recipe_id())
            .or_insert_with(RecipeLog::new);
        log.events.push(event.clone());
        let count = log.events.len();
        log.version.send_replace(count);
    }
}
