// Guest Command Client
//
// Client side of the command server that runs inside every guest. The server
// listens on the guest's bridge address; commands go over plain HTTP since
// the bridge subnet is host-local.

use crate::error::Error;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::time::Instant;

/// Port the in-guest command server listens on.
pub const GUEST_CMD_PORT: u16 = 4031;

/// Timeout for one exec round trip.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a freshly booted guest gets to bring up its command server.
pub const GUEST_READY_TIMEOUT: Duration = Duration::from_secs(60);

const READY_RETRY_DELAY: Duration = Duration::from_millis(10);
const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct RunCmdRequest<'a> {
    cmd: &'a str,
    blocking: bool,
}

/// Response of the in-guest command server. For non-blocking commands the
/// guest decides what, if anything, `output` carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCmdResponse {
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
}

/// Run a command inside the guest at `addr`.
pub async fn exec(
    client: &reqwest::Client,
    addr: Ipv4Addr,
    cmd: &str,
    blocking: bool,
) -> Result<RunCmdResponse> {
    exec_url(client, &format!("http://{addr}:{GUEST_CMD_PORT}"), cmd, blocking).await
}

async fn exec_url(
    client: &reqwest::Client,
    base_url: &str,
    cmd: &str,
    blocking: bool,
) -> Result<RunCmdResponse> {
    let response = client
        .post(format!("{base_url}/cmd"))
        .timeout(EXEC_TIMEOUT)
        .json(&RunCmdRequest { cmd, blocking })
        .send()
        .await
        .map_err(|e| Error::GuestUnreachable(e.to_string()))?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        anyhow::bail!("exec request failed with status: {status}");
    }

    response
        .json::<RunCmdResponse>()
        .await
        .context("failed to decode exec response")
}

/// Poll the guest's command server until it answers 200 or `timeout`
/// elapses. The deadline is re-checked on every iteration so dropping the
/// future cancels the poll.
pub async fn wait_ready(client: &reqwest::Client, addr: Ipv4Addr, timeout: Duration) -> Result<()> {
    wait_ready_url(
        client,
        &format!("http://{addr}:{GUEST_CMD_PORT}/"),
        timeout,
    )
    .await
}

async fn wait_ready_url(client: &reqwest::Client, url: &str, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let probe = client.get(url).timeout(READY_PROBE_TIMEOUT).send().await;
        if let Ok(response) = probe {
            if response.status() == reqwest::StatusCode::OK {
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            return Err(Error::GuestUnreachable(format!(
                "timeout waiting for command server at {url}"
            ))
            .into());
        }
        tokio::time::sleep(READY_RETRY_DELAY).await;
    }
}
