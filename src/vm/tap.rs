// TAP Device Factory
//
// Creates host TAP interfaces, attaches them to the guest bridge, and tears
// them down again. TAPs are raw L2 endpoints; IP assignment happens inside
// the guest via the kernel cmdline.

use crate::error::Result;
use crate::vm::run_host_command;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::process::Command;
use tracing::{info, warn};

/// Prefix for generated TAP interface names. Startup cleanup deletes every
/// interface carrying it, so a fresh daemon start is idempotent after a
/// crash.
pub const TAP_PREFIX: &str = "tap";

/// A TAP interface owned by the factory until destroyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapDevice {
    pub name: String,
    pub mac: String,
}

/// Creates TAP devices bound to one bridge.
pub struct TapFactory {
    bridge: String,
    counter: AtomicU32,
}

impl TapFactory {
    pub fn new(bridge: impl Into<String>) -> Self {
        Self {
            bridge: bridge.into(),
            counter: AtomicU32::new(0),
        }
    }

    /// Create a TAP interface, attach it to the bridge, and bring it up.
    ///
    /// A name is generated from a process-local counter unless one is given.
    pub async fn create(&self, name: Option<String>) -> Result<TapDevice> {
        let name =
            name.unwrap_or_else(|| format!("{TAP_PREFIX}{}", self.counter.fetch_add(1, Ordering::SeqCst)));
        let mac = random_mac();

        run_host_command(
            Command::new("ip").args(["tuntap", "add", name.as_str(), "mode", "tap"]),
            "create tap",
        )
        .await?;

        let attach = async {
            run_host_command(
                Command::new("ip").args(["link", "set", name.as_str(), "address", mac.as_str()]),
                "set tap mac",
            )
            .await?;
            run_host_command(
                Command::new("ip").args(["link", "set", name.as_str(), "master", self.bridge.as_str()]),
                "attach tap to bridge",
            )
            .await?;
            run_host_command(
                Command::new("ip").args(["link", "set", name.as_str(), "up"]),
                "set tap up",
            )
            .await
        };

        if let Err(e) = attach.await {
            let _ = Command::new("ip")
                .args(["link", "delete", name.as_str()])
                .output()
                .await;
            return Err(e);
        }

        info!("created tap device {} ({})", name, mac);
        Ok(TapDevice { name, mac })
    }

    /// Delete a TAP interface.
    pub async fn destroy(&self, device: &TapDevice) -> Result<()> {
        run_host_command(
            Command::new("ip").args(["link", "delete", device.name.as_str()]),
            "delete tap",
        )
        .await?;
        info!("deleted tap device {}", device.name);
        Ok(())
    }
}

/// Delete every host interface whose name starts with `prefix`.
///
/// Per-interface failures are logged and skipped; a crashed previous run may
/// leave taps in odd states and the remainder should still be swept.
pub async fn cleanup_tap_devices(prefix: &str) -> Result<()> {
    let entries = match std::fs::read_dir("/sys/class/net") {
        Ok(entries) => entries,
        Err(e) => {
            warn!("could not list host interfaces: {e}");
            return Ok(());
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(prefix) {
            continue;
        }
        match run_host_command(
            Command::new("ip").args(["link", "delete", name.as_str()]),
            "delete stale tap",
        )
        .await
        {
            Ok(()) => info!("deleted stale tap device {name}"),
            Err(e) => warn!("failed to delete stale tap device {name}: {e}"),
        }
    }
    Ok(())
}

/// Locally-administered unicast MAC (the 02: prefix sets the local bit).
fn random_mac() -> String {
    let bytes: [u8; 5] = rand::random();
    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_mac_is_locally_administered_unicast() {
        for _ in 0..32 {
            let mac = random_mac();
            assert!(mac.starts_with("02:"));
            assert_eq!(mac.len(), 17);
            assert_eq!(mac.split(':').count(), 6);
        }
    }

    #[test]
    fn test_generated_names_are_sequential() {
        let factory = TapFactory::new("br0");
        let a = factory.counter.fetch_add(1, Ordering::SeqCst);
        let b = factory.counter.fetch_add(1, Ordering::SeqCst);
        assert_eq!(a + 1, b);
    }

    #[tokio::test]
    async fn test_create_reports_failures() {
        let has_ip = std::process::Command::new("which")
            .arg("ip")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !has_ip {
            println!("skipping: ip utility not found");
            return;
        }

        // `ip tuntap add` needs CAP_NET_ADMIN; unprivileged runs must see
        // the failure, not have it swallowed.
        let factory = TapFactory::new("microvmd-test-br");
        match factory.create(Some("microvmd-test0".to_string())).await {
            Ok(device) => {
                // Running privileged: clean up after ourselves.
                let _ = factory.destroy(&device).await;
            }
            Err(e) => assert!(matches!(e, crate::error::Error::Subprocess { .. })),
        }
    }
}
