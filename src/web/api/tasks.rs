//! Task endpoints, served against the relay's own task store.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::ApiJson;
use crate::error::Result;
use crate::tasks::{
    AckOutcome, AckResult, BroadcastRollup, ListFilter, SendTaskRequest, SendTaskResult, Task,
    TaskView,
};
use crate::web::server::AppState;

#[derive(Serialize)]
pub struct TasksResponse {
    pub tasks: Vec<TaskView>,
    pub count: usize,
}

#[derive(Deserialize)]
pub struct ClaimRequest {
    #[serde(default)]
    pub agent: Option<String>,
}

#[derive(Deserialize)]
pub struct AckRequest {
    #[serde(default)]
    pub status: AckOutcome,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub agent: Option<String>,
}

pub async fn send_task(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<SendTaskRequest>,
) -> Result<Json<SendTaskResult>> {
    Ok(Json(state.tasks.send_task(request).await?))
}

/// `GET /tasks?agent=&overdue=&all=`
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(filter): Query<ListFilter>,
) -> Result<Json<TasksResponse>> {
    let tasks = state.tasks.list_tasks(&filter)?;
    Ok(Json(TasksResponse {
        count: tasks.len(),
        tasks,
    }))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskView>> {
    Ok(Json(state.tasks.get_task(&id)?))
}

pub async fn claim_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ClaimRequest>>,
) -> Result<Json<Task>> {
    let agent = body.and_then(|Json(body)| body.agent);
    Ok(Json(state.tasks.claim_task(&id, agent.as_deref()).await?))
}

pub async fn ack_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<AckRequest>,
) -> Result<Json<AckResult>> {
    let result = state
        .tasks
        .acknowledge_task(&id, body.status, &body.summary, body.agent.as_deref())
        .await?;
    Ok(Json(result))
}

pub async fn get_rollup(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BroadcastRollup>> {
    Ok(Json(state.tasks.broadcast_rollup(&id)?))
}

#[cfg(test)]
mod tests {
    use crate::config::TaskDefaults;
    use crate::relay::RelayHub;
    use crate::tasks::SqliteTaskStore;
    use crate::web::{create_app_router, AppState};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> Router {
        let store = Arc::new(SqliteTaskStore::open_in_memory().unwrap());
        create_app_router(AppState::new(
            Arc::new(RelayHub::new()),
            store,
            TaskDefaults::default(),
        ))
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_lifecycle_over_http() {
        let app = app();
        let (status, sent) = call(
            &app,
            post(
                "/tasks",
                json!({
                    "fromAgent": "sybil",
                    "toAgents": ["sam", "saber"],
                    "message": "Pull latest skills repo",
                    "priority": "high",
                    "timeoutHours": 2
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let parent_id = sent["parentTaskId"].as_str().unwrap().to_string();
        let sam_task = sent["results"][0]["taskId"].as_str().unwrap().to_string();

        let (status, listed) = call(&app, get("/tasks?agent=sam")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["count"], 1);
        assert_eq!(listed["tasks"][0]["priority"], "high");

        let (status, claimed) = call(&app, post(&format!("/tasks/{}/claim", sam_task), json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(claimed["status"], "acknowledged");

        let (status, acked) = call(
            &app,
            post(
                &format!("/tasks/{}/ack", sam_task),
                json!({"status": "completed", "summary": "Pulled", "agent": "sam"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(acked["rollup"]["completed"], 1);

        let (status, rollup) = call(&app, get(&format!("/tasks/{}/rollup", parent_id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(rollup["completed"], 1);
        assert_eq!(rollup["pending"], 1);
        assert_eq!(rollup["settled"], false);
        assert_eq!(rollup["parent"]["status"], "sent");
    }

    #[tokio::test]
    async fn test_malformed_task_body_gets_json_error() {
        let app = app();
        let (status, body) = call(
            &app,
            post(
                "/tasks",
                json!({"fromAgent": "sybil", "toAgents": ["sam"], "message": "x", "priority": "critical"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("critical"));

        let raw = Request::builder()
            .method("POST")
            .uri("/tasks")
            .header("content-type", "application/json")
            .body(Body::from("{\"fromAgent\":"))
            .unwrap();
        let (status, body) = call(&app, raw).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_task_errors_map_to_status_codes() {
        let app = app();
        let (status, body) = call(&app, get("/tasks/TASK-20260101-000000")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("TASK-20260101-000000"));

        let (status, sent) = call(
            &app,
            post("/tasks", json!({"fromAgent": "sybil", "toAgents": ["sam"], "message": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let id = sent["results"][0]["taskId"].as_str().unwrap().to_string();

        let (status, _) = call(
            &app,
            post(&format!("/tasks/{}/ack", id), json!({"summary": ""})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            post(&format!("/tasks/{}/ack", id), json!({"status": "failed", "summary": "no"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            &app,
            post(&format!("/tasks/{}/ack", id), json!({"summary": "again"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(
            &app,
            post(&format!("/tasks/{}/ack", id), json!({"status": "maybe", "summary": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("maybe"));

        let (_, listed) = call(&app, get("/tasks")).await;
        assert_eq!(listed["count"], 0);
        let (_, listed) = call(&app, get("/tasks?all=true")).await;
        assert_eq!(listed["count"], 1);
    }
}
