// REST Control Plane
//
// Maps the /v1 HTTP surface onto the server facade. Input validation maps
// to 400, unknown VMs to 404, everything else to 500, with the error chain
// in the message. The internal callback endpoint keeps its own flat error
// shape because the guest-side agent expects it.

use crate::error::Error;
use crate::server::{Server, StartParams};
use crate::vm::instance::VmView;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

pub fn router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route(
            "/v1/vms",
            post(start_vm).get(list_all_vms).delete(destroy_all_vms),
        )
        .route("/v1/vms/:name", get(list_vm).delete(destroy_vm))
        .route("/v1/vms/:name/exec", post(vm_exec))
        .route("/v1/internal/callback", post(internal_callback))
        .with_state(server)
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct StartVmRequest {
    vm_name: String,
    kernel: Option<String>,
    rootfs: Option<String>,
    initramfs: Option<String>,
    callback_url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VmDescriptor {
    vm_name: String,
    ip: String,
    status: String,
    tap_device_name: String,
}

impl From<VmView> for VmDescriptor {
    fn from(view: VmView) -> Self {
        Self {
            vm_name: view.name,
            ip: view.ip.to_string(),
            status: view.status.to_string(),
            tap_device_name: view.tap.name,
        }
    }
}

#[derive(Debug, Serialize)]
struct ListVmsResponse {
    vms: Vec<VmDescriptor>,
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct VmExecRequest {
    cmd: String,
    blocking: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct InternalCallbackRequest {
    vm_name: String,
    method: String,
    params: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Default)]
struct InternalCallbackResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn error_response(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: ErrorBody { message },
        }),
    )
        .into_response()
}

/// 400 for validation, 404 for unknown VMs, 500 otherwise.
fn status_for(err: &anyhow::Error) -> StatusCode {
    match err.downcast_ref::<Error>() {
        Some(Error::NotFound(_)) => StatusCode::NOT_FOUND,
        Some(Error::InvalidConfig(_)) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Unknown-VM errors surface their own message; everything else gets the
/// operation's context prefix plus the chain.
fn failure(err: anyhow::Error, prefix: &str) -> Response {
    let status = status_for(&err);
    let message = match err.downcast_ref::<Error>() {
        Some(not_found @ Error::NotFound(_)) => not_found.to_string(),
        _ => format!("{prefix}: {err:#}"),
    };
    error_response(status, message)
}

async fn health() -> Response {
    let body = serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    });
    Json(body).into_response()
}

async fn start_vm(State(server): State<Arc<Server>>, body: Json<serde_json::Value>) -> Response {
    let request: StartVmRequest = match serde_json::from_value(body.0) {
        Ok(request) => request,
        Err(e) => {
            error!("invalid start request body: {e}");
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("Invalid request format: {e}"),
            );
        }
    };

    if request.vm_name.is_empty() {
        error!("empty vm name");
        return error_response(StatusCode::BAD_REQUEST, "Empty vm name".to_string());
    }

    let vm_name = request.vm_name.clone();
    let start_time = std::time::Instant::now();

    let params = StartParams {
        vm_name: request.vm_name,
        kernel: request.kernel,
        rootfs: request.rootfs,
        initramfs: request.initramfs,
    };

    let view = match server.start_vm(params).await {
        Ok(view) => view,
        Err(e) => {
            error!("failed to start VM {vm_name}: {e:#}");
            return failure(e, "Failed to start VM");
        }
    };

    // The callback session only makes sense once the VM is actually up.
    if let Some(callback_url) = request.callback_url.filter(|u| !u.is_empty()) {
        match server.sessions().register(&vm_name, &callback_url) {
            Ok(_) => info!("registered HTTP callback for VM {vm_name} -> {callback_url}"),
            Err(e) => warn!(
                "failed to register HTTP callback for VM {vm_name}, callbacks will not work: {e:#}"
            ),
        }
    }

    info!(
        "VM {vm_name} started successfully in {:?}",
        start_time.elapsed()
    );
    Json(VmDescriptor::from(view)).into_response()
}

async fn list_all_vms(State(server): State<Arc<Server>>) -> Response {
    let vms = server
        .list_all()
        .await
        .into_iter()
        .map(VmDescriptor::from)
        .collect();
    Json(ListVmsResponse { vms }).into_response()
}

async fn list_vm(State(server): State<Arc<Server>>, Path(name): Path<String>) -> Response {
    match server.list_vm(&name).await {
        Ok(view) => Json(VmDescriptor::from(view)).into_response(),
        Err(e) => {
            error!("failed to get VM info for {name}: {e:#}");
            failure(e, "Failed to get VM info")
        }
    }
}

async fn destroy_vm(State(server): State<Arc<Server>>, Path(name): Path<String>) -> Response {
    info!("destroying VM {name}");

    // Drop the callback session first so a half-destroyed VM cannot keep
    // routing callbacks.
    server.sessions().remove(&name);

    match server.destroy_vm(&name).await {
        Ok(()) => {
            info!("VM {name} destroyed successfully");
            Json(SuccessResponse { success: true }).into_response()
        }
        Err(e) => {
            error!("failed to destroy VM {name}: {e:#}");
            failure(e, "Failed to destroy VM")
        }
    }
}

async fn destroy_all_vms(State(server): State<Arc<Server>>) -> Response {
    info!("destroying all VMs");
    match server.destroy_all().await {
        Ok(()) => Json(SuccessResponse { success: true }).into_response(),
        Err(e) => {
            error!("failed to destroy all VMs: {e:#}");
            failure(e, "Failed to destroy all VMs")
        }
    }
}

async fn vm_exec(
    State(server): State<Arc<Server>>,
    Path(name): Path<String>,
    body: Json<serde_json::Value>,
) -> Response {
    let request: VmExecRequest = match serde_json::from_value(body.0) {
        Ok(request) => request,
        Err(e) => {
            error!("invalid exec request body for {name}: {e}");
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("Invalid request format: {e}"),
            );
        }
    };

    if request.cmd.is_empty() {
        error!("empty command for VM {name}");
        return error_response(
            StatusCode::BAD_REQUEST,
            "Command cannot be empty".to_string(),
        );
    }

    let blocking = request.blocking.unwrap_or(true);
    match server.vm_exec(&name, &request.cmd, blocking).await {
        Ok(response) => {
            info!("successfully executed command in VM {name}");
            Json(response).into_response()
        }
        Err(e) => {
            error!("failed to execute command in VM {name}: {e:#}");
            failure(e, "Failed to execute command")
        }
    }
}

/// Callback entry point for the guest-side vsock agent.
async fn internal_callback(
    State(server): State<Arc<Server>>,
    body: Json<serde_json::Value>,
) -> Response {
    let request: InternalCallbackRequest = match serde_json::from_value(body.0) {
        Ok(request) => request,
        Err(e) => {
            error!("invalid callback request body: {e}");
            return (
                StatusCode::BAD_REQUEST,
                Json(InternalCallbackResponse {
                    error: Some(format!("Invalid request format: {e}")),
                    ..Default::default()
                }),
            )
                .into_response();
        }
    };

    if request.vm_name.is_empty() || request.method.is_empty() {
        error!("missing vmName or method in callback request");
        return (
            StatusCode::BAD_REQUEST,
            Json(InternalCallbackResponse {
                error: Some("vmName and method are required".to_string()),
                ..Default::default()
            }),
        )
            .into_response();
    }

    info!(
        "processing callback from VM {} ({})",
        request.vm_name, request.method
    );
    match server
        .route_callback(&request.vm_name, &request.method, request.params)
        .await
    {
        Ok(result) => Json(InternalCallbackResponse {
            result: Some(result),
            ..Default::default()
        })
        .into_response(),
        Err(e) => {
            error!(
                "failed to route callback for VM {}: {e:#}",
                request.vm_name
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(InternalCallbackResponse {
                    error: Some(format!("Callback failed: {e:#}")),
                    ..Default::default()
                }),
            )
                .into_response()
        }
    }
}
