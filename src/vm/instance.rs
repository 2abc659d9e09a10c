// Per-VM Supervisor
//
// Owns one VM's state and its lifecycle transitions. Boot and destroy are
// serialized by the instance's write lock; the registry lock is never held
// across a VMM call.

use crate::vm::guest;
use crate::vm::ip_pool::GuestIp;
use crate::vm::network;
use crate::vm::run_host_command;
use crate::vm::tap::TapDevice;
use crate::vm::vmm_client::VmmClient;
use anyhow::{Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

pub const STATEFUL_DISK_FILENAME: &str = "stateful.img";
pub const VSOCK_SOCKET_FILENAME: &str = "vsock.sock";
pub const VMM_LOG_FILENAME: &str = "log";

/// How long a VMM process may take to exit before it is killed.
pub const REAP_VM_TIMEOUT: Duration = Duration::from_secs(20);

pub const MIN_GUEST_MEMORY_MIB: i64 = 1024;
pub const MAX_GUEST_MEMORY_MIB: i64 = 32768;

const MIN_VCPUS: i32 = 1;
const MAX_VCPUS: i32 = 8;

/// Lifecycle state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    Created,
    Running,
    Stopped,
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            VmStatus::Created => "CREATED",
            VmStatus::Running => "RUNNING",
            VmStatus::Stopped => "STOPPED",
        };
        f.write_str(text)
    }
}

/// Everything known about a live VM.
pub struct VmShared {
    pub state_dir: PathBuf,
    pub api_socket: PathBuf,
    pub client: VmmClient,
    pub process: Arc<Mutex<Option<Child>>>,
    pub ip: GuestIp,
    pub tap: TapDevice,
    pub cid: u32,
    pub vsock_path: PathBuf,
    pub stateful_disk: PathBuf,
    pub status: VmStatus,
}

/// Snapshot of a VM descriptor for listings and resource release.
#[derive(Debug, Clone)]
pub struct VmView {
    pub name: String,
    pub ip: GuestIp,
    pub status: VmStatus,
    pub tap: TapDevice,
    pub cid: u32,
}

/// One supervised VM.
pub struct VmInstance {
    name: String,
    shared: RwLock<VmShared>,
}

impl VmInstance {
    pub fn new(name: impl Into<String>, shared: VmShared) -> Self {
        Self {
            name: name.into(),
            shared: RwLock::new(shared),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn describe(&self) -> VmView {
        let shared = self.shared.read().await;
        VmView {
            name: self.name.clone(),
            ip: shared.ip,
            status: shared.status,
            tap: shared.tap.clone(),
            cid: shared.cid,
        }
    }

    pub async fn guest_addr(&self) -> std::net::Ipv4Addr {
        self.shared.read().await.ip.addr
    }

    /// Boot the configured VM. Serialized against destroy by the write lock.
    pub async fn boot(&self) -> Result<()> {
        let mut shared = self.shared.write().await;
        shared
            .client
            .boot_vm()
            .await
            .with_context(|| format!("failed to boot VM {}", self.name))?;
        shared.status = VmStatus::Running;
        info!("successfully booted VM {}", self.name);
        Ok(())
    }

    /// Best-effort shutdown of the guest, used when boot fails right after
    /// create so the VMM is not left running a half-configured machine.
    pub async fn shutdown_after_failed_boot(&self) {
        let shared = self.shared.read().await;
        if let Err(e) = shared.client.shutdown_vm().await {
            warn!("failed to shut down VM {} after boot failure: {e:#}", self.name);
        }
    }

    /// Tear the VM down: guest shutdown (best effort), VM delete, VMM
    /// shutdown, process reap, DNAT rule reap, state dir removal.
    ///
    /// TAP/IP/CID release is the caller's job once this returns Ok, so a
    /// failed destroy leaves the descriptor intact for a retry.
    pub async fn destroy(&self) -> Result<()> {
        let mut shared = self.shared.write().await;

        if let Err(e) = shared.client.shutdown_vm().await {
            warn!("failed to shutdown VM {} before deleting: {e:#}", self.name);
        }

        shared
            .client
            .delete_vm()
            .await
            .with_context(|| format!("failed to delete VM {}", self.name))?;

        shared
            .client
            .shutdown_vmm()
            .await
            .with_context(|| format!("failed to shutdown VMM for {}", self.name))?;

        if let Err(e) = reap_process(&shared.process, REAP_VM_TIMEOUT).await {
            warn!("failed to reap VMM process for {}: {e:#}", self.name);
        }

        let guest_addr = shared.ip.addr.to_string();
        if let Err(e) = network::reap_dnat_rules(&guest_addr).await {
            warn!("failed to delete DNAT rules for {guest_addr}: {e:#}");
        }

        if let Err(e) = tokio::fs::remove_dir_all(&shared.state_dir).await {
            warn!(
                "failed to remove state dir {}: {e}",
                shared.state_dir.display()
            );
        }

        shared.status = VmStatus::Stopped;
        Ok(())
    }

    /// Poll the in-guest command server after boot. Not fatal; a guest that
    /// is slow to come up can still be reached later via exec.
    pub async fn wait_for_guest(&self, client: &reqwest::Client) {
        let addr = self.guest_addr().await;
        info!("waiting for command server in VM {} at {addr}", self.name);
        if let Err(e) = guest::wait_ready(client, addr, guest::GUEST_READY_TIMEOUT).await {
            warn!("command server in VM {} not ready: {e:#}", self.name);
        }
    }
}

/// Spawn the VMM with its API socket, stdio redirected into the VM's log
/// file, in its own process group so stray signals to the daemon don't take
/// the fleet down with it.
pub fn spawn_vmm(vmm_bin: &str, api_socket: &Path, log_path: &Path) -> Result<Child> {
    let log_file = std::fs::File::create(log_path)
        .with_context(|| format!("failed to create log file {}", log_path.display()))?;
    let stderr_file = log_file
        .try_clone()
        .context("failed to clone log file handle")?;

    let child = Command::new(vmm_bin)
        .arg("--api-socket")
        .arg(api_socket)
        .stdout(std::process::Stdio::from(log_file))
        .stderr(std::process::Stdio::from(stderr_file))
        .process_group(0)
        .spawn()
        .with_context(|| format!("error spawning VMM {vmm_bin}"))?;
    Ok(child)
}

/// Wait for the VMM process to exit, killing it after `timeout`.
pub async fn reap_process(process: &Arc<Mutex<Option<Child>>>, timeout: Duration) -> Result<()> {
    let mut guard = process.lock().await;
    let Some(child) = guard.as_mut() else {
        return Ok(());
    };

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            let status = status.context("failed to wait for VMM process")?;
            info!("VMM process exited via wait: {status}");
            *guard = None;
            Ok(())
        }
        Err(_) => {
            warn!("timeout waiting for VMM process to exit, killing it");
            child.kill().await.context("failed to kill VMM process")?;
            *guard = None;
            anyhow::bail!("VMM process was force killed after timeout")
        }
    }
}

/// Create the per-VM writable disk: a sparse file of the requested size,
/// formatted ext4. The guest mounts it beside the read-only shared rootfs.
pub async fn create_stateful_disk(path: &Path, size_mib: i64) -> crate::error::Result<()> {
    info!("creating stateful disk at {} ({size_mib} MiB)", path.display());
    let size = format!("{size_mib}M");
    run_host_command(
        Command::new("truncate").arg("-s").arg(&size).arg(path),
        "create stateful disk",
    )
    .await?;
    run_host_command(
        Command::new("mkfs.ext4").arg(path),
        "format stateful disk",
    )
    .await
}

/// Kernel command line handed to the guest; the guest's init parses the
/// quoted key=value pairs to configure its network.
pub fn kernel_cmdline(gateway_ip: &str, guest_ip: &GuestIp, vm_name: &str) -> String {
    format!(
        "console=ttyS0 gateway_ip=\"{gateway_ip}\" guest_ip=\"{guest_ip}\" vm_name=\"{vm_name}\"",
    )
}

pub fn vm_state_dir(state_dir: &str, vm_name: &str) -> PathBuf {
    Path::new(state_dir).join(vm_name)
}

pub fn vm_socket_path(vm_state_dir: &Path, vm_name: &str) -> PathBuf {
    vm_state_dir.join(format!("{vm_name}.sock"))
}

/// vCPUs for a new guest: half the host's, clamped to [1, 8].
pub fn calculate_vcpu_count() -> i32 {
    let host_cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    vcpu_count_for(host_cpus)
}

fn vcpu_count_for(host_cpus: usize) -> i32 {
    ((host_cpus / 2) as i32).clamp(MIN_VCPUS, MAX_VCPUS)
}

/// Guest memory for a new VM in MiB: the configured share of host memory,
/// clamped to [1 GiB, 32 GiB]. Falls back to the floor when host memory
/// cannot be determined.
pub fn calculate_guest_memory_mib(memory_percentage: i32) -> i64 {
    match read_host_memory_kb() {
        Some(total_kb) => guest_memory_mib_for(total_kb, memory_percentage),
        None => {
            warn!(
                "could not determine host memory size, using {} MiB",
                MIN_GUEST_MEMORY_MIB
            );
            MIN_GUEST_MEMORY_MIB
        }
    }
}

fn guest_memory_mib_for(total_kb: i64, memory_percentage: i32) -> i64 {
    let pct = if memory_percentage <= 0 || memory_percentage > 100 {
        warn!(
            "invalid memory percentage {memory_percentage}, using default of {}%",
            crate::config::DEFAULT_GUEST_MEM_PERCENTAGE
        );
        crate::config::DEFAULT_GUEST_MEM_PERCENTAGE
    } else {
        memory_percentage
    };

    let suggested_kb = total_kb * pct as i64 / 100;
    (suggested_kb / 1024).clamp(MIN_GUEST_MEMORY_MIB, MAX_GUEST_MEMORY_MIB)
}

fn read_host_memory_kb() -> Option<i64> {
    let data = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = data.lines().find(|line| line.starts_with("MemTotal:"))?;
    line.split_whitespace().nth(1)?.parse().ok()
}
