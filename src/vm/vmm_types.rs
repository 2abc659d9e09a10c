// cloud-hypervisor API Payloads
//
// Serialized request bodies for the per-VM VMM REST API. Field names follow
// the VMM's wire format.

use serde::Serialize;

pub const SERIAL_PORT_MODE: &str = "Tty";
pub const CONSOLE_PORT_MODE: &str = "Off";

pub const NET_DEVICE_QUEUES: i32 = 2;
pub const NET_DEVICE_QUEUE_SIZE: i32 = 256;
pub const NET_DEVICE_ID: &str = "_net0";

/// Body of `PUT /api/v1/vm.create`.
#[derive(Debug, Serialize)]
pub struct VmConfig {
    pub payload: PayloadConfig,
    pub disks: Vec<DiskConfig>,
    pub cpus: CpusConfig,
    pub memory: MemoryConfig,
    pub serial: ConsoleConfig,
    pub console: ConsoleConfig,
    pub net: Vec<NetConfig>,
    pub vsock: VsockConfig,
}

#[derive(Debug, Serialize)]
pub struct PayloadConfig {
    pub kernel: String,
    pub cmdline: String,
    pub initramfs: String,
}

#[derive(Debug, Serialize)]
pub struct DiskConfig {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
    pub num_queues: i32,
}

#[derive(Debug, Serialize)]
pub struct CpusConfig {
    pub boot_vcpus: i32,
    pub max_vcpus: i32,
}

#[derive(Debug, Serialize)]
pub struct MemoryConfig {
    /// Guest memory size in bytes
    pub size: i64,
}

#[derive(Debug, Serialize)]
pub struct ConsoleConfig {
    pub mode: String,
}

impl ConsoleConfig {
    pub fn new(mode: &str) -> Self {
        Self {
            mode: mode.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NetConfig {
    pub tap: String,
    pub num_queues: i32,
    pub queue_size: i32,
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct VsockConfig {
    pub cid: i64,
    pub socket: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_readonly_is_omitted_when_unset() {
        let rw = DiskConfig {
            path: "/tmp/stateful.img".to_string(),
            readonly: None,
            num_queues: 4,
        };
        let json = serde_json::to_string(&rw).unwrap();
        assert!(!json.contains("readonly"));

        let ro = DiskConfig {
            path: "/tmp/rootfs.ext4".to_string(),
            readonly: Some(true),
            num_queues: 4,
        };
        let json = serde_json::to_string(&ro).unwrap();
        assert!(json.contains("\"readonly\":true"));
    }

    #[test]
    fn test_full_payload_shape() {
        let config = VmConfig {
            payload: PayloadConfig {
                kernel: "/img/vmlinux".to_string(),
                cmdline: "console=ttyS0".to_string(),
                initramfs: "/img/initramfs.img".to_string(),
            },
            disks: vec![DiskConfig {
                path: "/img/rootfs.ext4".to_string(),
                readonly: Some(true),
                num_queues: 2,
            }],
            cpus: CpusConfig {
                boot_vcpus: 2,
                max_vcpus: 2,
            },
            memory: MemoryConfig {
                size: 1024 * 1024 * 1024,
            },
            serial: ConsoleConfig::new(SERIAL_PORT_MODE),
            console: ConsoleConfig::new(CONSOLE_PORT_MODE),
            net: vec![NetConfig {
                tap: "tap0".to_string(),
                num_queues: NET_DEVICE_QUEUES,
                queue_size: NET_DEVICE_QUEUE_SIZE,
                id: NET_DEVICE_ID.to_string(),
            }],
            vsock: VsockConfig {
                cid: 3,
                socket: "/run/vm/vsock.sock".to_string(),
            },
        };

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["serial"]["mode"], "Tty");
        assert_eq!(json["console"]["mode"], "Off");
        assert_eq!(json["net"][0]["id"], "_net0");
        assert_eq!(json["net"][0]["queue_size"], 256);
        assert_eq!(json["vsock"]["cid"], 3);
        assert_eq!(json["memory"]["size"], 1073741824i64);
        assert_eq!(json["cpus"]["boot_vcpus"], json["cpus"]["max_vcpus"]);
    }
}
