//! HTTP API for submitting and inspecting orchestration instances.

use axum::{
	body::Bytes,
	extract::{Path, State},
	http::StatusCode,
	response::{IntoResponse, Json, Response},
	routing::{get, post},
	Router,
};
use orchestrator_core::{EngineError, Orchestrator, RaiseOutcome};
use orchestrator_outbox::{DeadLetter, OutboxError};
use orchestrator_types::{InstanceStatus, StatusReport, WorkInstance};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

#[derive(Clone)]
struct AppState {
	orchestrator: Arc<Orchestrator>,
}

#[derive(Debug, Default, Deserialize)]
struct StartRequest {
	event_count: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartResponse {
	pub instance_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct CancelRequest {
	reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RaiseResponse {
	pub outcome: String,
	pub status: Option<InstanceStatus>,
}

impl From<RaiseOutcome> for RaiseResponse {
	fn from(outcome: RaiseOutcome) -> Self {
		let (outcome, status) = match outcome {
			RaiseOutcome::Satisfied { status } => ("satisfied", Some(status)),
			RaiseOutcome::Duplicate => ("duplicate", None),
			RaiseOutcome::Expired { status } => ("expired", Some(status)),
			RaiseOutcome::UnknownEvent => ("unknown_event", None),
		};
		Self {
			outcome: outcome.to_string(),
			status,
		}
	}
}

/// Error rendered as `{"error": "..."}` with a matching status code.
struct ApiError {
	status: StatusCode,
	message: String,
}

impl ApiError {
	fn bad_request(message: impl Into<String>) -> Self {
		Self {
			status: StatusCode::BAD_REQUEST,
			message: message.into(),
		}
	}
}

impl From<EngineError> for ApiError {
	fn from(err: EngineError) -> Self {
		let status = match &err {
			EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
			EngineError::InvalidInstance(_) => StatusCode::BAD_REQUEST,
			EngineError::Storage(_) | EngineError::Outbox(_) => StatusCode::SERVICE_UNAVAILABLE,
			EngineError::WaitTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
			EngineError::Fault { .. } => StatusCode::INTERNAL_SERVER_ERROR,
		};
		Self {
			status,
			message: err.to_string(),
		}
	}
}

impl From<OutboxError> for ApiError {
	fn from(err: OutboxError) -> Self {
		Self {
			status: StatusCode::SERVICE_UNAVAILABLE,
			message: err.to_string(),
		}
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		if self.status.is_server_error() {
			warn!(status = %self.status, error = %self.message, "Request failed");
		}
		(
			self.status,
			Json(serde_json::json!({ "error": self.message })),
		)
			.into_response()
	}
}

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
	Router::new()
		.route("/health", get(health_check))
		.route("/start", post(start_instance))
		.route("/instances/{id}", get(get_status))
		.route("/instances/{id}/history", get(get_history))
		.route("/instances/{id}/events/{event_id}", post(raise_event))
		.route("/instances/{id}/cancel", post(cancel_instance))
		.route("/dead-letters", get(get_dead_letters))
		.with_state(AppState { orchestrator })
		.layer(
			ServiceBuilder::new()
				.layer(TraceLayer::new_for_http())
				.layer(CorsLayer::permissive()),
		)
}

pub async fn serve(orchestrator: Arc<Orchestrator>, port: u16) -> anyhow::Result<()> {
	let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

	info!("API server listening on port {}", port);

	axum::serve(listener, router(orchestrator)).await?;

	Ok(())
}

/// Empty bodies decode to the type's default.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
	if body.is_empty() {
		return Ok(T::default());
	}
	serde_json::from_slice(body).map_err(|e| ApiError::bad_request(e.to_string()))
}

/// 200 while the orchestrator is running, 503 otherwise
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
	let lifecycle = state.orchestrator.lifecycle().get_state().await;
	let status = if state.orchestrator.lifecycle().is_running().await {
		StatusCode::OK
	} else {
		StatusCode::SERVICE_UNAVAILABLE
	};

	(
		status,
		Json(serde_json::json!({
			"service": state.orchestrator.config().service.name,
			"lifecycle": lifecycle.to_string(),
			"timestamp": chrono::Utc::now().timestamp()
		})),
	)
}

async fn start_instance(
	State(state): State<AppState>,
	body: Bytes,
) -> Result<Json<StartResponse>, ApiError> {
	let request: StartRequest = parse_body(&body)?;
	let count = request
		.event_count
		.unwrap_or(state.orchestrator.config().engine.default_event_count);

	let instance_id = state
		.orchestrator
		.dispatcher()
		.submit_detached(count)
		.await?;
	Ok(Json(StartResponse { instance_id }))
}

async fn get_status(
	State(state): State<AppState>,
	Path(id): Path<String>,
) -> Result<Json<StatusReport>, ApiError> {
	Ok(Json(state.orchestrator.engine().get_status(&id).await?))
}

async fn get_history(
	State(state): State<AppState>,
	Path(id): Path<String>,
) -> Result<Json<WorkInstance>, ApiError> {
	Ok(Json(state.orchestrator.engine().instance(&id).await?))
}

async fn raise_event(
	State(state): State<AppState>,
	Path((id, event_id)): Path<(String, String)>,
	body: Bytes,
) -> Result<Json<RaiseResponse>, ApiError> {
	let payload: serde_json::Value = parse_body(&body)?;
	let outcome = state
		.orchestrator
		.engine()
		.raise(&id, &event_id, payload)
		.await?;
	Ok(Json(outcome.into()))
}

async fn cancel_instance(
	State(state): State<AppState>,
	Path(id): Path<String>,
	body: Bytes,
) -> Result<Json<StatusReport>, ApiError> {
	let request: CancelRequest = parse_body(&body)?;
	let reason = request
		.reason
		.unwrap_or_else(|| "cancelled via API".to_string());

	let engine = state.orchestrator.engine();
	engine.cancel(&id, &reason).await?;
	Ok(Json(engine.get_status(&id).await?))
}

async fn get_dead_letters(
	State(state): State<AppState>,
) -> Result<Json<Vec<DeadLetter>>, ApiError> {
	Ok(Json(state.orchestrator.outbox().dead_letters().await?))
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::body::Body;
	use axum::http::Request;
	use orchestrator_core::OrchestratorBuilder;
	use orchestrator_storage::implementations::memory;
	use orchestrator_types::OrchestratorConfig;
	use tower::ServiceExt;

	fn orchestrator() -> Arc<Orchestrator> {
		Arc::new(
			OrchestratorBuilder::new(OrchestratorConfig::default())
				.with_storage_factory("memory", memory::create_storage)
				.build()
				.unwrap(),
		)
	}

	async fn send(
		orchestrator: &Arc<Orchestrator>,
		method: &str,
		uri: &str,
		body: &str,
	) -> (StatusCode, serde_json::Value) {
		let request = Request::builder()
			.method(method)
			.uri(uri)
			.header("content-type", "application/json")
			.body(Body::from(body.to_string()))
			.unwrap();

		let response = router(orchestrator.clone()).oneshot(request).await.unwrap();
		let status = response.status();
		let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
			.await
			.unwrap();
		let json = if bytes.is_empty() {
			serde_json::Value::Null
		} else {
			serde_json::from_slice(&bytes).unwrap()
		};
		(status, json)
	}

	#[tokio::test]
	async fn test_health_reflects_lifecycle() {
		let orchestrator = orchestrator();
		let (status, body) = send(&orchestrator, "GET", "/health", "").await;
		assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
		assert_eq!(body["lifecycle"], "Uninitialized");

		orchestrator.start().await.unwrap();
		let (status, _) = send(&orchestrator, "GET", "/health", "").await;
		assert_eq!(status, StatusCode::OK);
		orchestrator.shutdown().await.unwrap();
	}

	#[tokio::test]
	async fn test_start_returns_instance_id() {
		let orchestrator = orchestrator();
		let (status, body) = send(&orchestrator, "POST", "/start", r#"{"event_count": 2}"#).await;
		assert_eq!(status, StatusCode::OK);

		let instance_id = body["instance_id"].as_str().unwrap().to_string();
		let (status, report) =
			send(&orchestrator, "GET", &format!("/instances/{instance_id}"), "").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(report["instance_id"], instance_id.as_str());
		assert_eq!(report["total_count"], 2);
	}

	#[tokio::test]
	async fn test_start_rejects_malformed_body() {
		let orchestrator = orchestrator();
		let (status, body) = send(&orchestrator, "POST", "/start", "{not json").await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
		assert!(body["error"].is_string());
	}

	#[tokio::test]
	async fn test_start_rejects_oversized_event_count() {
		let orchestrator = orchestrator();
		let limit = orchestrator.config().engine.max_event_count;

		for count in [limit + 1, usize::MAX] {
			let body = format!(r#"{{"event_count": {count}}}"#);
			let (status, body) = send(&orchestrator, "POST", "/start", &body).await;
			assert_eq!(status, StatusCode::BAD_REQUEST);
			assert!(body["error"].as_str().unwrap().contains("limit"));
		}
	}

	#[tokio::test]
	async fn test_unknown_instance_is_404() {
		let orchestrator = orchestrator();
		let (status, _) = send(&orchestrator, "GET", "/instances/missing", "").await;
		assert_eq!(status, StatusCode::NOT_FOUND);

		let (status, _) = send(&orchestrator, "POST", "/instances/missing/events/a", "{}").await;
		assert_eq!(status, StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn test_manual_raise_completes_instance() {
		let orchestrator = orchestrator();
		let instance_id = orchestrator.submit(Some(1)).await.unwrap();
		let instance = orchestrator.engine().instance(&instance_id).await.unwrap();
		let event_id = instance.expected_event_ids[0].clone();

		let uri = format!("/instances/{instance_id}/events/{event_id}");
		let (status, body) = send(&orchestrator, "POST", &uri, r#"{"source": "manual"}"#).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["outcome"], "satisfied");
		assert_eq!(body["status"], "Completed");

		let (status, history) =
			send(&orchestrator, "GET", &format!("/instances/{instance_id}/history"), "").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(history["history"][0]["payload"]["source"], "manual");

		// The instance is archived; further raises find nothing to update.
		let (status, _) = send(&orchestrator, "POST", &uri, "").await;
		assert_eq!(status, StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn test_cancel_then_cancel_again() {
		let orchestrator = orchestrator();
		let instance_id = orchestrator.submit(Some(2)).await.unwrap();
		let uri = format!("/instances/{instance_id}/cancel");

		let (status, report) = send(&orchestrator, "POST", &uri, r#"{"reason": "test"}"#).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(report["status"], "Failed");

		let (status, _) = send(&orchestrator, "POST", &uri, "").await;
		assert_eq!(status, StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn test_dead_letters_empty() {
		let orchestrator = orchestrator();
		let (status, body) = send(&orchestrator, "GET", "/dead-letters", "").await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body, serde_json::json!([]));
	}
}
