// Callback Sessions
//
// A VM may be started with a subscriber URL; guest code can then originate
// RPC-style requests that the daemon forwards to that URL and answers back
// into the guest. One session per VM name; registering again replaces (and
// closes) the previous session.

use crate::error::Error;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Default timeout for one callback round trip to the subscriber.
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Request POSTed to the subscriber URL.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRequest {
    pub id: String,
    pub vm_name: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    /// Unix seconds
    pub timestamp: i64,
}

/// Structured subscriber response. Anything that does not parse as this is
/// treated as a raw result.
#[derive(Debug, Deserialize)]
struct CallbackResponse {
    #[allow(dead_code)]
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<CallbackErrorBody>,
}

#[derive(Debug, Deserialize)]
struct CallbackErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// An HTTP callback session for one VM.
pub struct Session {
    pub id: String,
    pub vm_name: String,
    pub url: String,
    client: reqwest::Client,
}

impl Session {
    fn new(vm_name: &str, url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(CALLBACK_TIMEOUT)
            .build()
            .context("failed to build callback HTTP client")?;
        Ok(Self {
            id: format!("{vm_name}-http-{}", unix_nanos()),
            vm_name: vm_name.to_string(),
            url: url.to_string(),
            client,
        })
    }

    /// Drop the session's connection pool.
    fn close(&self) {
        debug!("closed callback session {} for VM {}", self.id, self.vm_name);
    }

    async fn send(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let request = CallbackRequest {
            id: format!("{}-{}", self.vm_name, unix_nanos()),
            vm_name: self.vm_name.clone(),
            method: method.to_string(),
            params,
            timestamp: unix_seconds(),
        };

        debug!(
            "sending callback {} for VM {} to {}",
            method, self.vm_name, self.url
        );
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("callback request to {} failed", self.url))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .context("failed to read callback response")?;

        if status.as_u16() >= 400 {
            return Err(Error::CallbackTransport {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).to_string(),
            }
            .into());
        }

        let parsed: CallbackResponse = match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(_) => {
                // The subscriber answered with plain JSON (or plain text);
                // hand it back verbatim as the result.
                debug!("callback response is not structured, returning raw body");
                return Ok(serde_json::from_slice(&body).unwrap_or_else(|_| {
                    serde_json::Value::String(String::from_utf8_lossy(&body).to_string())
                }));
            }
        };

        if let Some(error) = parsed.error {
            return Err(Error::CallbackError {
                code: error.code,
                message: error.message,
            }
            .into());
        }

        Ok(parsed.result.unwrap_or(serde_json::Value::Null))
    }
}

/// Registry of active callback sessions, keyed by VM name.
#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the subscriber URL for a VM. A replaced
    /// session is closed first.
    pub fn register(&self, vm_name: &str, url: &str) -> Result<Arc<Session>> {
        let session = Arc::new(Session::new(vm_name, url)?);

        let previous = self
            .sessions
            .write()
            .unwrap()
            .insert(vm_name.to_string(), session.clone());
        if let Some(previous) = previous {
            previous.close();
        }

        info!(
            "callback session {} registered for VM {} -> {}",
            session.id, vm_name, url
        );
        Ok(session)
    }

    pub fn get(&self, vm_name: &str) -> Option<Arc<Session>> {
        self.sessions.read().unwrap().get(vm_name).cloned()
    }

    pub fn has(&self, vm_name: &str) -> bool {
        self.sessions.read().unwrap().contains_key(vm_name)
    }

    /// Remove and close the session for a VM, if any.
    pub fn remove(&self, vm_name: &str) {
        let session = self.sessions.write().unwrap().remove(vm_name);
        if let Some(session) = session {
            session.close();
            info!("callback session {} removed for VM {}", session.id, vm_name);
        }
    }

    /// Forward a guest-originated request to the VM's subscriber and return
    /// the subscriber's result. The session lock is not held across the
    /// HTTP round trip, so concurrent routes are independent.
    pub async fn route(
        &self,
        vm_name: &str,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let session = self
            .get(vm_name)
            .ok_or_else(|| Error::NoSession(vm_name.to_string()))?;
        session.send(method, params).await
    }
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/cb")
    }

    #[test]
    fn test_register_replaces_the_previous_session() {
        let manager = SessionManager::new();
        manager.register("vm-a", "http://one/cb").unwrap();
        manager.register("vm-a", "http://two/cb").unwrap();

        let session = manager.get("vm-a").unwrap();
        assert_eq!(session.url, "http://two/cb");
        assert_eq!(manager.sessions.read().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_clears_the_session() {
        let manager = SessionManager::new();
        manager.register("vm-a", "http://one/cb").unwrap();
        assert!(manager.has("vm-a"));
        manager.remove("vm-a");
        assert!(!manager.has("vm-a"));
        // Removing again is harmless.
        manager.remove("vm-a");
    }

    #[tokio::test]
    async fn test_route_without_session_fails() {
        let manager = SessionManager::new();
        let err = manager.route("ghost", "ping", None).await.unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::NoSession(name)) => assert_eq!(name, "ghost"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("no active callback session"));
    }

    #[tokio::test]
    async fn test_route_returns_the_subscriber_result() {
        let url = serve(Router::new().route(
            "/cb",
            post(|Json(req): Json<serde_json::Value>| async move {
                assert_eq!(req["vmName"], "vm-b");
                assert_eq!(req["method"], "ping");
                assert_eq!(req["params"]["x"], 1);
                assert!(req["id"].as_str().unwrap().starts_with("vm-b-"));
                assert!(req["timestamp"].as_i64().unwrap() > 0);
                Json(json!({"id": req["id"], "result": "pong"}))
            }),
        ))
        .await;

        let manager = SessionManager::new();
        manager.register("vm-b", &url).unwrap();
        let result = manager
            .route("vm-b", "ping", Some(json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(result, json!("pong"));
    }

    #[tokio::test]
    async fn test_route_surfaces_subscriber_error_objects() {
        let url = serve(Router::new().route(
            "/cb",
            post(|| async { Json(json!({"id": "1", "error": {"code": 42, "message": "boom"}})) }),
        ))
        .await;

        let manager = SessionManager::new();
        manager.register("vm-c", &url).unwrap();
        let err = manager.route("vm-c", "ping", None).await.unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::CallbackError { code, message }) => {
                assert_eq!(*code, 42);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_route_surfaces_http_errors() {
        let url = serve(Router::new().route(
            "/cb",
            post(|| async {
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    "subscriber down",
                )
            }),
        ))
        .await;

        let manager = SessionManager::new();
        manager.register("vm-d", &url).unwrap();
        let err = manager.route("vm-d", "ping", None).await.unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::CallbackTransport { status, body }) => {
                assert_eq!(*status, 500);
                assert_eq!(body, "subscriber down");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_route_tolerates_unstructured_bodies() {
        let url = serve(Router::new().route("/cb", post(|| async { Json(json!([1, 2, 3])) }))).await;

        let manager = SessionManager::new();
        manager.register("vm-e", &url).unwrap();
        let result = manager.route("vm-e", "ping", None).await.unwrap();
        assert_eq!(result, json!([1, 2, 3]));
    }
}
