//! Execution service backed by an agent process reached over HTTP.
//!
//! The agent runs recipes with its own processor. After handing a recipe
//! over, this service follows the agent's newline-delimited JSON event feed
//! and republishes every event on the master's bus.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::StreamExt;
use hearth_core::event::{Event, EventBus};
use hearth_core::recipe::RecipeRequest;
use hearth_core::result::RecipeResult;
use hearth_core::service::{CollectRequest, ExecutionService, ServiceId, ServiceInfo};
use hearth_core::{Error, ResourceId, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

/// Response to `POST /recipes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildAccepted {
    pub recipe_id: ResourceId,
}

/// Response to `POST /recipes/{id}/terminate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminateResponse {
    pub terminated: bool,
}

/// Body of `POST /recipes/{id}/cleanup`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupRequest {
    pub project: String,
    pub spec: String,
    pub incremental: bool,
}

/// Which of a recipe's directory trees a file request refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileTree {
    Output,
    Working,
}

/// Query of `GET /recipes/{id}/files` and `GET /recipes/{id}/file`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileQuery {
    pub tree: FileTree,
    pub project: String,
    pub spec: String,
    #[serde(default)]
    pub incremental: bool,
    /// Slash-separated path inside the tree; only for single files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Response to `GET /recipes/{id}/files`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileList {
    pub files: Vec<String>,
}

/// Error body returned by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

pub struct RemoteExecutionService {
    info: ServiceInfo,
    base: Url,
    client: reqwest::Client,
    events: Arc<EventBus>,
}

impl RemoteExecutionService {
    pub fn new(info: ServiceInfo, url: &str, events: Arc<EventBus>) -> Result<Self> {
        let base = Url::parse(url)
            .map_err(|e| Error::InvalidInput(format!("invalid agent url '{url}': {e}")))?;
        if base.cannot_be_a_base() {
            return Err(Error::InvalidInput(format!("invalid agent url '{url}'")));
        }
        Ok(Self {
            info,
            base,
            client: reqwest::Client::new(),
            events,
        })
    }

    pub fn url(&self) -> &Url {
        &self.base
    }

    /// Check the agent is reachable.
    pub async fn ping(&self) -> Result<()> {
        let response = self
            .client
            .get(self.endpoint(&["health"])?)
            .send()
            .await
            .map_err(remote_error)?;
        check(response).await.map(|_| ())
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidInput(format!("invalid agent url '{}'", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn recipe_endpoint(&self, id: ResourceId, action: &str) -> Result<Url> {
        self.endpoint(&["recipes", &id.to_string(), action])
    }

    async fn download_tree(
        &self,
        request: &CollectRequest,
        tree: FileTree,
        dest: &Path,
    ) -> Result<usize> {
        let mut query = FileQuery {
            tree,
            project: request.project.clone(),
            spec: request.spec.clone(),
            incremental: request.incremental,
            path: None,
        };
        let response = self
            .client
            .get(self.recipe_endpoint(request.recipe_id, "files")?)
            .query(&query)
            .send()
            .await
            .map_err(remote_error)?;
        let list: FileList = check(response)
            .await?
            .json()
            .await
            .map_err(remote_error)?;

        tokio::fs::create_dir_all(dest).await?;
        for file in &list.files {
            let target = safe_join(dest, file)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            query.path = Some(file.clone());
            let response = self
                .client
                .get(self.recipe_endpoint(request.recipe_id, "file")?)
                .query(&query)
                .send()
                .await
                .map_err(remote_error)?;
            let body = check(response).await?.bytes().await.map_err(remote_error)?;
            tokio::fs::write(&target, &body).await?;
        }
        Ok(list.files.len())
    }
}

#[async_trait]
impl ExecutionService for RemoteExecutionService {
    fn info(&self) -> &ServiceInfo {
        &self.info
    }

    async fn build(&self, request: RecipeRequest) -> Result<()> {
        let id = request.id;
        let recipe_name = request.recipe_name.clone();
        let response = self
            .client
            .post(self.endpoint(&["recipes"])?)
            .json(&request)
            .send()
            .await
            .map_err(remote_error)?;
        check(response).await?;
        info!(service = %self.info.id, recipe_id = %id, "Recipe handed to agent");

        let follower = EventFollower {
            client: self.client.clone(),
            url: self.recipe_endpoint(id, "events")?,
            service: self.info.id.clone(),
            events: self.events.clone(),
            recipe_id: id,
            recipe_name,
        };
        tokio::spawn(follower.run());
        Ok(())
    }

    async fn collect_results(&self, request: &CollectRequest) -> Result<()> {
        let count = self
            .download_tree(request, FileTree::Output, &request.output_dest)
            .await?;
        debug!(service = %self.info.id, recipe_id = %request.recipe_id, files = count, "Collected output");
        if let Some(dest) = &request.working_copy_dest {
            self.download_tree(request, FileTree::Working, dest).await?;
        }
        Ok(())
    }

    async fn cleanup(
        &self,
        project: &str,
        spec: &str,
        recipe_id: ResourceId,
        incremental: bool,
    ) -> Result<()> {
        let body = CleanupRequest {
            project: project.to_string(),
            spec: spec.to_string(),
            incremental,
        };
        let response = self
            .client
            .post(self.recipe_endpoint(recipe_id, "cleanup")?)
            .json(&body)
            .send()
            .await
            .map_err(remote_error)?;
        check(response).await.map(|_| ())
    }

    async fn terminate(&self, recipe_id: ResourceId) -> Result<bool> {
        let response = self
            .client
            .post(self.recipe_endpoint(recipe_id, "terminate")?)
            .send()
            .await
            .map_err(remote_error)?;
        let body: TerminateResponse = check(response)
            .await?
            .json()
            .await
            .map_err(remote_error)?;
        Ok(body.terminated)
    }
}

/// Follows one recipe's event feed until its completion event.
struct EventFollower {
    client: reqwest::Client,
    url: Url,
    service: ServiceId,
    events: Arc<EventBus>,
    recipe_id: ResourceId,
    recipe_name: Option<String>,
}

impl EventFollower {
    async fn run(self) {
        match self.follow().await {
            Ok(true) => debug!(service = %self.service, recipe_id = %self.recipe_id, "Event feed finished"),
            Ok(false) => self.lost("event feed ended before the recipe completed".to_string()),
            Err(e) => self.lost(e.to_string()),
        }
    }

    /// Returns true once the completion event has been republished.
    async fn follow(&self) -> Result<bool> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(remote_error)?;
        let mut stream = std::pin::pin!(check(response).await?.bytes_stream());
        let mut buffer = BytesMut::new();

        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk.map_err(remote_error)?);
            while let Some(end) = buffer.iter().position(|b| *b == b'\n') {
                let line = buffer.split_to(end + 1);
                let line = &line[..end];
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let event: Event = serde_json::from_slice(line)?;
                let terminal = event.is_terminal();
                self.events.publish(event);
                if terminal {
                    return Ok(true);
                }
            }
        }
        if buffer.has_remaining() {
            warn!(service = %self.service, recipe_id = %self.recipe_id, "Discarding partial event");
        }
        Ok(false)
    }

    /// Report the recipe as errored so the master does not wait forever.
    fn lost(&self, reason: String) {
        let message = format!("Lost contact with agent '{}': {reason}", self.service);
        error!(service = %self.service, recipe_id = %self.recipe_id, error = %reason, "Lost recipe event feed");

        let mut result = RecipeResult::new(self.recipe_id, self.recipe_name.clone());
        result.commence();
        result.error(message.clone());
        result.complete();
        self.events.publish(Event::RecipeError {
            recipe_id: self.recipe_id,
            message,
        });
        self.events.publish(Event::RecipeCompleted {
            recipe_id: self.recipe_id,
            result,
        });
    }
}

fn remote_error(e: reqwest::Error) -> Error {
    Error::Remote(e.to_string())
}

/// Map an agent error response onto the matching core error.
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.error)
        .unwrap_or(text);
    Err(match status {
        reqwest::StatusCode::NOT_FOUND => Error::NotFound(message),
        reqwest::StatusCode::CONFLICT => Error::Conflict(message),
        reqwest::StatusCode::BAD_REQUEST => Error::InvalidInput(message),
        _ => Error::Remote(format!("agent returned {status}: {message}")),
    })
}

/// Join a slash-separated relative path, refusing anything that escapes
/// `dir`.
fn safe_join(dir: &Path, relative: &str) -> Result<std::path::PathBuf> {
    let mut path = dir.to_path_buf();
    for part in relative.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                return Err(Error::InvalidInput(format!(
                    "path '{relative}' leaves the collection directory"
                )));
            }
            part => path.push(part),
        }
    }
    Ok(path)
}
