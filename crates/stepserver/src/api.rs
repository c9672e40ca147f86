use crate::error::{ApiError, ErrorResponse};
use actix_web::http::StatusCode;
use actix_web::{delete, error::InternalError, get, post, web, HttpRequest, HttpResponse, Responder};
use actix_ws::Message;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use stepcore::{
    ExecutionId, ExecutionStatus, FlowError, StepDefinition, ValidationIssue, ValidationReport,
    WorkflowDefinition, WorkflowId,
};
use stepruntime::ExecutionSupervisor;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Application state shared across handlers
pub struct AppState {
    pub supervisor: Arc<ExecutionSupervisor>,
}

type ApiResult = Result<HttpResponse, ApiError>;

/// Request body for workflow execution
#[derive(Debug, Default, Deserialize)]
struct ExecuteRequest {
    #[serde(default)]
    context: Value,
    #[serde(default)]
    parameters: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    execution_id: Option<ExecutionId>,
}

/// Result of creating or editing a workflow
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidationResponse {
    workflow_id: WorkflowId,
    valid: bool,
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
}

impl ValidationResponse {
    fn new(workflow_id: impl Into<WorkflowId>, report: ValidationReport) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            valid: report.is_valid(),
            errors: report.errors,
            warnings: report.warnings,
        }
    }
}

/// Response for a newly queued execution
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionAccepted {
    execution_id: ExecutionId,
    status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_execution_id: Option<ExecutionId>,
}

/// Turn a create or edit result into `status`/400 with the report as body.
fn report_response(
    workflow_id: &str,
    status: StatusCode,
    result: Result<ValidationReport, FlowError>,
) -> ApiResult {
    match result {
        Ok(report) => Ok(HttpResponse::build(status).json(ValidationResponse::new(workflow_id, report))),
        Err(FlowError::Validation(report)) => {
            Ok(HttpResponse::BadRequest().json(ValidationResponse::new(workflow_id, report)))
        }
        Err(e) => Err(e.into()),
    }
}

/// Health check endpoint
#[get("/health")]
async fn health_check(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "stepwise",
        "running": data.supervisor.running_count(),
        "queued": data.supervisor.queued_count(),
    }))
}

/// List all workflows
#[get("/api/workflows")]
async fn list_workflows(data: web::Data<AppState>) -> impl Responder {
    let workflows: Vec<_> = data
        .supervisor
        .list_workflows()
        .into_iter()
        .map(|w| {
            json!({
                "id": w.definition.name,
                "description": w.definition.description,
                "trigger": w.definition.trigger,
                "steps": w.definition.steps.len(),
                "validated": w.validated,
                "revision": w.revision,
                "updated_at": w.updated_at,
            })
        })
        .collect();

    HttpResponse::Ok().json(workflows)
}

/// Create a new workflow
#[post("/api/workflows")]
async fn create_workflow(data: web::Data<AppState>, body: web::Json<WorkflowDefinition>) -> ApiResult {
    let definition = body.into_inner();
    let workflow_id = definition.name.clone();

    info!(workflow_id = %workflow_id, steps = definition.steps.len(), "Creating workflow");

    let result = data.supervisor.create_workflow(definition);
    report_response(&workflow_id, StatusCode::CREATED, result)
}

/// Get a specific workflow
#[get("/api/workflows/{id}")]
async fn get_workflow(data: web::Data<AppState>, path: web::Path<String>) -> ApiResult {
    let stored = data.supervisor.get_workflow(&path)?;
    Ok(HttpResponse::Ok().json(stored))
}

/// Delete a workflow
#[delete("/api/workflows/{id}")]
async fn delete_workflow(data: web::Data<AppState>, path: web::Path<String>) -> ApiResult {
    data.supervisor.delete_workflow(&path)?;
    Ok(HttpResponse::Ok().json(json!({
        "message": "Workflow deleted successfully"
    })))
}

/// Append a step to a workflow
#[post("/api/workflows/{id}/steps")]
async fn add_step(
    data: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<StepDefinition>,
) -> ApiResult {
    let workflow_id = path.into_inner();
    let result = data.supervisor.add_step(&workflow_id, body.into_inner());
    report_response(&workflow_id, StatusCode::OK, result)
}

/// Remove a step from a workflow
#[delete("/api/workflows/{id}/steps/{step_id}")]
async fn remove_step(data: web::Data<AppState>, path: web::Path<(String, String)>) -> ApiResult {
    let (workflow_id, step_id) = path.into_inner();
    let result = data.supervisor.remove_step(&workflow_id, &step_id);
    report_response(&workflow_id, StatusCode::OK, result)
}

/// Queue a workflow execution
#[post("/api/workflows/{id}/execute")]
async fn execute_workflow(
    data: web::Data<AppState>,
    path: web::Path<String>,
    body: Option<web::Json<ExecuteRequest>>,
) -> ApiResult {
    let workflow_id = path.into_inner();
    let request = body.map(|b| b.into_inner()).unwrap_or_default();

    let execution_id = data
        .supervisor
        .execute(&workflow_id, request.context, request.parameters)?;

    Ok(HttpResponse::Accepted().json(ExecutionAccepted {
        execution_id,
        status: ExecutionStatus::Queued,
        parent_execution_id: None,
    }))
}

/// Live executions and recent history, newest first
#[get("/api/executions")]
async fn list_executions(data: web::Data<AppState>, query: web::Query<HistoryQuery>) -> impl Responder {
    let limit = query.limit.unwrap_or(50);
    HttpResponse::Ok().json(json!({
        "active": data.supervisor.active_executions(),
        "recent": data.supervisor.recent_history(limit),
    }))
}

#[get("/api/executions/{id}")]
async fn get_execution(data: web::Data<AppState>, path: web::Path<ExecutionId>) -> ApiResult {
    let execution = data.supervisor.status(path.into_inner())?;
    Ok(HttpResponse::Ok().json(execution))
}

/// Request cancellation; succeeds for executions that already finished
#[post("/api/executions/{id}/cancel")]
async fn cancel_execution(data: web::Data<AppState>, path: web::Path<ExecutionId>) -> ApiResult {
    let execution_id = path.into_inner();
    data.supervisor.cancel(execution_id)?;
    let status = data.supervisor.status(execution_id)?.status;
    Ok(HttpResponse::Ok().json(json!({
        "executionId": execution_id,
        "status": status,
    })))
}

/// Re-run a failed, timed-out or cancelled execution
#[post("/api/executions/{id}/retry")]
async fn retry_execution(data: web::Data<AppState>, path: web::Path<ExecutionId>) -> ApiResult {
    let parent = path.into_inner();
    let execution_id = data.supervisor.retry(parent)?;
    Ok(HttpResponse::Accepted().json(ExecutionAccepted {
        execution_id,
        status: ExecutionStatus::Queued,
        parent_execution_id: Some(parent),
    }))
}

#[get("/api/metrics")]
async fn metrics(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(data.supervisor.metrics())
}

/// List available action types
#[get("/api/actions")]
async fn list_action_types(data: web::Data<AppState>) -> impl Responder {
    let registry = data.supervisor.registry();
    let actions: Vec<_> = registry
        .list_action_types()
        .iter()
        .map(|action_type| {
            let metadata = registry.get_metadata(action_type).unwrap_or_default();
            let retry_safe = registry.get(action_type).map(|a| a.retry_safe()).unwrap_or(false);
            json!({
                "type": action_type,
                "description": metadata.description,
                "category": metadata.category,
                "retry_safe": retry_safe,
            })
        })
        .collect();

    HttpResponse::Ok().json(actions)
}

/// WebSocket endpoint for real-time events, optionally for one execution
#[get("/api/events")]
async fn websocket_events(
    req: HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
    query: web::Query<EventsQuery>,
) -> actix_web::Result<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;
    let filter = query.execution_id;
    let mut events = data.supervisor.subscribe_events();

    info!(execution_id = ?filter, "WebSocket client connected");

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if filter.is_some_and(|id| id != event.execution_id()) {
                                continue;
                            }
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "WebSocket client lagging, events dropped");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

/// Register every route and the JSON error handler.
pub fn configure(cfg: &mut web::ServiceConfig) {
    let json_config = web::JsonConfig::default().error_handler(|err, _req| {
        let body = ErrorResponse {
            error: "invalid_request",
            message: stepcore::sanitize(&err.to_string()),
            errors: None,
        };
        InternalError::from_response(err, HttpResponse::BadRequest().json(body)).into()
    });

    cfg.app_data(json_config)
        .service(health_check)
        .service(list_workflows)
        .service(create_workflow)
        .service(get_workflow)
        .service(delete_workflow)
        .service(add_step)
        .service(remove_step)
        .service(execute_workflow)
        .service(list_executions)
        .service(get_execution)
        .service(cancel_execution)
        .service(retry_execution)
        .service(metrics)
        .service(list_action_types)
        .service(websocket_events);
}
