// Daemon Configuration
//
// TOML configuration for the microvmd daemon. Every field has a default so a
// partial file still yields a runnable development setup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::warn;

/// Guest memory percentage used when the configured value is out of range.
pub const DEFAULT_GUEST_MEM_PERCENTAGE: i32 = 50;

/// Daemon configuration, loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Address the REST control plane binds to
    pub host: String,

    /// Port the REST control plane binds to
    pub port: u16,

    /// Directory holding per-VM state (sockets, disks, logs)
    pub state_dir: String,

    /// Name of the Linux bridge guests attach to
    pub bridge_name: String,

    /// Bridge address in CIDR form, e.g. "10.20.1.1/24"
    pub bridge_ip: String,

    /// Guest subnet in CIDR form, e.g. "10.20.1.0/24"
    pub bridge_subnet: String,

    /// Path to the cloud-hypervisor binary
    pub vmm_bin: String,

    /// Default kernel image path
    pub kernel: String,

    /// Default root filesystem path
    pub rootfs: String,

    /// Default initramfs path
    pub initramfs: String,

    /// Size of each VM's writable stateful disk, in MiB
    pub stateful_size_mib: i64,

    /// Share of host memory given to each guest, in percent (0, 100]
    pub guest_mem_percentage: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4030,
            state_dir: "/var/lib/microvmd/vms".to_string(),
            bridge_name: "br0".to_string(),
            bridge_ip: "10.20.1.1/24".to_string(),
            bridge_subnet: "10.20.1.0/24".to_string(),
            vmm_bin: "cloud-hypervisor".to_string(),
            kernel: "/var/lib/microvmd/images/vmlinux".to_string(),
            rootfs: "/var/lib/microvmd/images/rootfs.ext4".to_string(),
            initramfs: "/var/lib/microvmd/images/initramfs.img".to_string(),
            stateful_size_mib: 2048,
            guest_mem_percentage: DEFAULT_GUEST_MEM_PERCENTAGE,
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{host: {}, port: {}, state_dir: {}, bridge: {} ({} / {}), vmm: {}, stateful: {} MiB, mem: {}%}}",
            self.host,
            self.port,
            self.state_dir,
            self.bridge_name,
            self.bridge_ip,
            self.bridge_subnet,
            self.vmm_bin,
            self.stateful_size_mib,
            self.guest_mem_percentage,
        )
    }
}

impl Config {
    /// Load configuration from a TOML file and normalize it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.normalize();
        Ok(config)
    }

    /// Clamp out-of-range values to their defaults.
    pub fn normalize(&mut self) {
        if self.guest_mem_percentage <= 0 || self.guest_mem_percentage > 100 {
            warn!(
                "invalid guest memory percentage {}, using default of {}%",
                self.guest_mem_percentage, DEFAULT_GUEST_MEM_PERCENTAGE
            );
            self.guest_mem_percentage = DEFAULT_GUEST_MEM_PERCENTAGE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bridge_name, "br0");
        assert_eq!(config.guest_mem_percentage, 50);
        assert_eq!(config.port, 4030);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bridge_name = \"vmbr1\"\nport = 9000").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.bridge_name, "vmbr1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.bridge_subnet, "10.20.1.0/24");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::load("/nonexistent/microvmd.toml").is_err());
    }

    #[test]
    fn test_memory_percentage_out_of_range_collapses_to_default() {
        for pct in [0, 101, -1] {
            let mut config = Config {
                guest_mem_percentage: pct,
                ..Config::default()
            };
            config.normalize();
            assert_eq!(config.guest_mem_percentage, DEFAULT_GUEST_MEM_PERCENTAGE);
        }
    }

    #[test]
    fn test_memory_percentage_in_range_is_kept() {
        let mut config = Config {
            guest_mem_percentage: 75,
            ..Config::default()
        };
        config.normalize();
        assert_eq!(config.guest_mem_percentage, 75);
    }
}
