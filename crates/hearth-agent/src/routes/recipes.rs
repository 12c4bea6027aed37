//! Recipe endpoints: accept, follow, terminate, collect and clean up.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use hearth_core::ResourceId;
use hearth_core::recipe::{RecipePaths, RecipeRequest};
use hearth_core::service::ExecutionService;
use hearth_executor::fs::{list_files, to_slash};
use hearth_executor::remote::{
    BuildAccepted, CleanupRequest, FileList, FileQuery, FileTree, TerminateResponse,
};
use std::convert::Infallible;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::AgentState;
use crate::error::ApiError;

pub fn router() -> Router<AgentState> {
    Router::new()
        .route("/", post(build))
        .route("/{id}/events", get(events))
        .route("/{id}/terminate", post(terminate))
        .route("/{id}/files", get(list))
        .route("/{id}/file", get(download))
        .route("/{id}/cleanup", post(cleanup))
}

async fn build(
    State(state): State<AgentState>,
    Json(request): Json<RecipeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let recipe_id = request.id;
    let fresh = !state.feed.is_tracked(recipe_id);
    state.feed.track(recipe_id);

    if let Err(e) = state.service.build(request).await {
        warn!(recipe_id = %recipe_id, error = %e, "Refused recipe");
        // Keep the buffer of a recipe that is already running here.
        if fresh {
            state.feed.forget(recipe_id);
        }
        return Err(e.into());
    }
    info!(recipe_id = %recipe_id, "Recipe accepted");
    Ok((StatusCode::ACCEPTED, Json(BuildAccepted { recipe_id })))
}

/// Newline-delimited JSON, one event per line, ending after the recipe's
/// completion event.
async fn events(
    State(state): State<AgentState>,
    Path(id): Path<ResourceId>,
) -> Result<Response, ApiError> {
    let stream = state
        .feed
        .subscribe(id)
        .ok_or_else(|| ApiError::NotFound(format!("unknown recipe {id}")))?;

    let lines = stream.filter_map(|event| async move {
        match serde_json::to_string(&event) {
            Ok(line) => Some(Ok::<_, Infallible>(line + "\n")),
            Err(e) => {
                warn!(error = %e, kind = event.kind(), "Dropping unencodable event");
                None
            }
        }
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

async fn terminate(
    State(state): State<AgentState>,
    Path(id): Path<ResourceId>,
) -> Result<Json<TerminateResponse>, ApiError> {
    let terminated = state.service.terminate(id).await?;
    Ok(Json(TerminateResponse { terminated }))
}

async fn list(
    State(state): State<AgentState>,
    Path(id): Path<ResourceId>,
    Query(query): Query<FileQuery>,
) -> Result<Json<FileList>, ApiError> {
    let dir = tree_dir(&state, id, &query);
    if !dir.is_dir() {
        return match query.tree {
            FileTree::Output => Err(ApiError::NotFound(format!("no output for recipe {id}"))),
            // Recipes that never checked anything out have no working copy.
            FileTree::Working => Ok(Json(FileList::default())),
        };
    }
    let files = list_files(&dir).await?;
    Ok(Json(FileList {
        files: files.iter().map(|f| to_slash(f)).collect(),
    }))
}

async fn download(
    State(state): State<AgentState>,
    Path(id): Path<ResourceId>,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    let relative = query
        .path
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("missing file path".to_string()))?;
    let path = join_relative(tree_dir(&state, id, &query), relative)?;
    if !path.is_file() {
        return Err(ApiError::NotFound(format!("no file '{relative}' for recipe {id}")));
    }
    let content = tokio::fs::read(&path).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        content,
    )
        .into_response())
}

async fn cleanup(
    State(state): State<AgentState>,
    Path(id): Path<ResourceId>,
    Json(request): Json<CleanupRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .service
        .cleanup(&request.project, &request.spec, id, request.incremental)
        .await?;
    state.feed.forget(id);
    Ok(StatusCode::NO_CONTENT)
}

fn tree_dir(state: &AgentState, id: ResourceId, query: &FileQuery) -> PathBuf {
    let data_dir = state.service.data_dir();
    match query.tree {
        FileTree::Output => state.service.output_dir(id),
        FileTree::Working if query.incremental => {
            RecipePaths::persistent_dir_for(data_dir, &query.project, &query.spec)
        }
        FileTree::Working => RecipePaths::recipe_root(data_dir, id).join("base"),
    }
}

fn join_relative(mut dir: PathBuf, relative: &str) -> Result<PathBuf, ApiError> {
    for part in relative.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                return Err(ApiError::BadRequest(format!(
                    "path '{relative}' leaves the recipe directory"
                )));
            }
            part => dir.push(part),
        }
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes;
    use axum::http::Request;
    use hearth_config::AgentSettings;
    use hearth_core::event::Event;
    use hearth_core::recipe::RecipeSource;
    use hearth_core::result::ResultState;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

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

    fn state(dir: &TempDir) -> AgentState {
        AgentState::new(&AgentSettings {
            name: "agent-1".to_string(),
            bind: "127.0.0.1:0".parse().unwrap(),
            data_dir: dir.path().to_path_buf(),
            resources: BTreeMap::new(),
        })
    }

    fn request(recipe: Option<&str>) -> RecipeRequest {
        let request = RecipeRequest::new(
            "hearth",
            "default",
            RecipeSource::Inline(RECIPES.to_string()),
        );
        match recipe {
            Some(name) => request.with_recipe(name),
            None => request,
        }
    }

    fn post_json<T: serde::Serialize>(uri: &str, body: &T) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    async fn submit(state: &AgentState, request: &RecipeRequest) -> Response {
        routes::router(state.clone())
            .oneshot(post_json("/recipes", request))
            .await
            .unwrap()
    }

    async fn read_events(state: &AgentState, id: ResourceId) -> Vec<Event> {
        let response = routes::router(state.clone())
            .oneshot(get_request(&format!("/recipes/{id}/events")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = tokio::time::timeout(Duration::from_secs(10), body_bytes(response))
            .await
            .unwrap();
        String::from_utf8(body)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn query(tree: &str, path: Option<&str>) -> String {
        let mut query = format!("tree={tree}&project=hearth&spec=default&incremental=false");
        if let Some(path) = path {
            query.push_str(&format!("&path={}", path.replace('%', "%25")));
        }
        query
    }

    #[tokio::test]
    async fn test_build_streams_events_and_serves_output() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let request = request(None);
        let id = request.id;

        let response = submit(&state, &request).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let accepted: BuildAccepted = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(accepted.recipe_id, id);

        let events = read_events(&state, id).await;
        assert_eq!(events.first().map(Event::kind), Some("recipe_commenced"));
        match events.last() {
            Some(Event::RecipeCompleted { result, .. }) => {
                assert_eq!(result.state(), ResultState::Success)
            }
            other => panic!("unexpected last event {other:?}"),
        }

        let response = routes::router(state.clone())
            .oneshot(get_request(&format!("/recipes/{id}/files?{}", query("output", None))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let list: FileList = serde_json::from_slice(&body_bytes(response).await).unwrap();
        let output = list
            .files
            .iter()
            .find(|f| f.ends_with("output.txt"))
            .cloned()
            .unwrap();

        let response = routes::router(state.clone())
            .oneshot(get_request(&format!(
                "/recipes/{id}/file?{}",
                query("output", Some(&output))
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(content.contains("hello from hearth"));
    }

    #[tokio::test]
    async fn test_duplicate_recipe_is_a_conflict() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let request = request(Some("slow"));
        let id = request.id;

        assert_eq!(submit(&state, &request).await.status(), StatusCode::ACCEPTED);
        let response = submit(&state, &request).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(body["error"].is_string());
        assert!(state.feed.is_tracked(id));

        // Let the first one go.
        let response = routes::router(state.clone())
            .oneshot(Request::post(format!("/recipes/{id}/terminate")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_terminate_running_recipe() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let request = request(Some("slow"));
        let id = request.id;
        submit(&state, &request).await;

        // Wait for the command to start before terminating.
        let wait = async {
            loop {
                let started = state
                    .feed
                    .events(id)
                    .iter()
                    .any(|e| matches!(e, Event::CommandCommenced { .. }));
                if started {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap();

        let response = routes::router(state.clone())
            .oneshot(Request::post(format!("/recipes/{id}/terminate")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body: TerminateResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(body.terminated);

        match read_events(&state, id).await.last() {
            Some(Event::RecipeCompleted { result, .. }) => {
                assert_eq!(result.state(), ResultState::Terminated)
            }
            other => panic!("unexpected last event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_recipe_responses() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let id = ResourceId::new();

        let response = routes::router(state.clone())
            .oneshot(get_request(&format!("/recipes/{id}/events")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = routes::router(state.clone())
            .oneshot(get_request(&format!("/recipes/{id}/files?{}", query("output", None))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = routes::router(state.clone())
            .oneshot(get_request(&format!("/recipes/{id}/files?{}", query("working", None))))
            .await
            .unwrap();
        let list: FileList = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(list.files.is_empty());

        let response = routes::router(state.clone())
            .oneshot(Request::post(format!("/recipes/{id}/terminate")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body: TerminateResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(!body.terminated);
    }

    #[tokio::test]
    async fn test_file_path_cannot_escape() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let id = ResourceId::new();

        let response = routes::router(state.clone())
            .oneshot(get_request(&format!(
                "/recipes/{id}/file?{}",
                query("output", Some("../../secret"))
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = routes::router(state.clone())
            .oneshot(get_request(&format!("/recipes/{id}/file?{}", query("output", None))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cleanup_removes_recipe_and_buffer() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let request = request(None);
        let id = request.id;
        submit(&state, &request).await;
        read_events(&state, id).await;
        assert!(RecipePaths::recipe_root(dir.path(), id).exists());

        let body = CleanupRequest {
            project: "hearth".to_string(),
            spec: "default".to_string(),
            incremental: false,
        };
        let response = routes::router(state.clone())
            .oneshot(post_json(&format!("/recipes/{id}/cleanup"), &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(!RecipePaths::recipe_root(dir.path(), id).exists());
        assert!(!state.feed.is_tracked(id));
    }

    #[tokio::test]
    async fn test_health_names_the_agent() {
        let dir = TempDir::new().unwrap();
        let response = routes::router(state(&dir))
            .oneshot(get_request("/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["agent"], "agent-1");
    }
}
