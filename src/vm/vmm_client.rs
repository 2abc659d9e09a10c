// VMM API Client
//
// Typed HTTP client for the per-VM cloud-hypervisor process, spoken over its
// Unix control socket. State transitions answer 204; anything in [200, 300)
// is treated as success.

use crate::error::Error;
use crate::vm::vmm_types::VmConfig;
use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::debug;

/// Per-request timeout against the VMM API.
pub const VMM_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll period for readiness waits.
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Client for one VMM's control socket.
#[derive(Debug, Clone)]
pub struct VmmClient {
    socket_path: PathBuf,
}

impl VmmClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn ping(&self) -> Result<()> {
        self.request(Method::GET, "vmm.ping", None).await.map(|_| ())
    }

    pub async fn create_vm(&self, config: &VmConfig) -> Result<()> {
        let body = serde_json::to_string(config).context("failed to serialize VM config")?;
        self.request(Method::PUT, "vm.create", Some(body))
            .await
            .map(|_| ())
    }

    pub async fn boot_vm(&self) -> Result<()> {
        self.request(Method::PUT, "vm.boot", None).await.map(|_| ())
    }

    pub async fn shutdown_vm(&self) -> Result<()> {
        self.request(Method::PUT, "vm.shutdown", None)
            .await
            .map(|_| ())
    }

    pub async fn delete_vm(&self) -> Result<()> {
        self.request(Method::PUT, "vm.delete", None).await.map(|_| ())
    }

    pub async fn shutdown_vmm(&self) -> Result<()> {
        self.request(Method::PUT, "vmm.shutdown", None)
            .await
            .map(|_| ())
    }

    /// Poll ping until the VMM answers or the deadline expires. The loop
    /// re-checks the deadline on every iteration, so dropping the future
    /// cancels the wait promptly.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.ping().await.is_ok() {
                debug!("VMM at {} is up", self.socket_path.display());
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::VmmTimeout.into());
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// One request/response exchange over a fresh connection. The request
    /// volume per VM is a handful of calls, so connection reuse buys
    /// nothing.
    async fn request(&self, method: Method, endpoint: &str, body: Option<String>) -> Result<String> {
        let exchange = async {
            let stream = UnixStream::connect(&self.socket_path).await.with_context(|| {
                format!("failed to connect to VMM socket {}", self.socket_path.display())
            })?;
            let io = TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .context("VMM API handshake failed")?;

            tokio::task::spawn(async move {
                if let Err(err) = conn.await {
                    // The VMM closes the connection after each response.
                    debug!("VMM connection closed: {err:?}");
                }
            });

            let request = Request::builder()
                .method(method)
                // Host is required by HTTP/1.1 but ignored on a unix socket.
                .uri(format!("http://localhost/api/v1/{endpoint}"))
                .header("Content-Type", "application/json")
                .header("Accept", "application/json")
                .body(Full::new(Bytes::from(body.unwrap_or_default())))
                .context("failed to build VMM request")?;

            let response = sender
                .send_request(request)
                .await
                .with_context(|| format!("VMM request {endpoint} failed"))?;

            let status = response.status();
            let bytes = response
                .collect()
                .await
                .context("failed to read VMM response body")?
                .to_bytes();
            let text = String::from_utf8_lossy(&bytes).to_string();

            if status.is_success() {
                Ok(text)
            } else {
                Err(Error::VmmTransport {
                    status: status.as_u16(),
                    body: text,
                }
                .into())
            }
        };

        match tokio::time::timeout(VMM_REQUEST_TIMEOUT, exchange).await {
            Ok(result) => result,
            Err(_) => Err(Error::VmmTimeout.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_request_against_missing_socket_fails() {
        let client = VmmClient::new("/tmp/microvmd-test-no-such.sock");
        assert!(client.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_wait_ready_times_out_without_a_server() {
        let client = VmmClient::new("/tmp/microvmd-test-no-such.sock");
        let start = std::time::Instant::now();
        let err = client
            .wait_ready(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::VmmTimeout)
        ));
    }

    #[tokio::test]
    async fn test_status_codes_map_to_transport_errors() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("vmm.sock");
        let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();

        // Minimal one-shot server answering 500 with a body.
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(
                    b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 9\r\n\r\nvmm broke",
                )
                .await;
        });

        let client = VmmClient::new(&socket_path);
        let err = client.boot_vm().await.unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::VmmTransport { status, body }) => {
                assert_eq!(*status, 500);
                assert_eq!(body, "vmm broke");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_success_status_is_accepted() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("vmm.sock");
        let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
                .await;
        });

        let client = VmmClient::new(&socket_path);
        client.shutdown_vm().await.unwrap();
    }
}
