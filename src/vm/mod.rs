// MicroVM Lifecycle Module
//
// Everything needed to take a VM from nothing to RUNNING and back:
// host networking, resource pools, the VMM API client, and the per-VM
// supervisor.

pub mod cid_pool;
pub mod guest;
pub mod instance;
pub mod ip_pool;
pub mod network;
pub mod tap;
pub mod vmm_client;
pub mod vmm_types;

use crate::error::{Error, Result};
use tokio::process::Command;

/// Run a host utility, mapping a non-zero exit into a `Subprocess` error
/// that carries the command line and captured stderr.
pub(crate) async fn run_host_command(cmd: &mut Command, what: &str) -> Result<()> {
    let rendered = render(cmd);
    let output = cmd.output().await.map_err(|e| Error::Subprocess {
        cmd: rendered.clone(),
        exit: None,
        stderr: format!("{what}: failed to spawn: {e}"),
    })?;

    if output.status.success() {
        return Ok(());
    }

    Err(Error::Subprocess {
        cmd: rendered,
        exit: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Run a host utility and return its stdout.
pub(crate) async fn run_host_command_capture(cmd: &mut Command, what: &str) -> Result<String> {
    let rendered = render(cmd);
    let output = cmd.output().await.map_err(|e| Error::Subprocess {
        cmd: rendered.clone(),
        exit: None,
        stderr: format!("{what}: failed to spawn: {e}"),
    })?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).to_string());
    }

    Err(Error::Subprocess {
        cmd: rendered,
        exit: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

fn render(cmd: &Command) -> String {
    let std_cmd = cmd.as_std();
    let mut rendered = std_cmd.get_program().to_string_lossy().to_string();
    for arg in std_cmd.get_args() {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_host_command_success() {
        run_host_command(Command::new("true").arg("x"), "noop")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_host_command_failure_carries_command_line() {
        let err = run_host_command(Command::new("false").arg("y"), "noop")
            .await
            .unwrap_err();
        match err {
            Error::Subprocess { cmd, exit, .. } => {
                assert_eq!(cmd, "false y");
                assert_eq!(exit, Some(1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_host_command_capture() {
        let out = run_host_command_capture(Command::new("echo").arg("hello"), "echo")
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }
}
