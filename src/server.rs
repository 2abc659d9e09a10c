// VM Server Facade
//
// Coordinates the registry, host networking, resource pools and callback
// sessions behind the operations the REST layer exposes. The registry lock
// is only ever held to publish or unpublish a VM, never across a VMM or
// guest call.

use crate::callback::SessionManager;
use crate::config::Config;
use crate::error::Error;
use crate::vm::cid_pool::CidPool;
use crate::vm::guest::{self, RunCmdResponse};
use crate::vm::instance::{self, VmInstance, VmShared, VmStatus, VmView};
use crate::vm::ip_pool::IpPool;
use crate::vm::network;
use crate::vm::tap::{self, TapDevice, TapFactory, TAP_PREFIX};
use crate::vm::vmm_client::VmmClient;
use crate::vm::vmm_types;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

/// How long a freshly spawned VMM gets to open its API socket.
const VMM_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Parameters of a Start operation after REST-level validation.
#[derive(Debug, Clone, Default)]
pub struct StartParams {
    pub vm_name: String,
    pub kernel: Option<String>,
    pub rootfs: Option<String>,
    pub initramfs: Option<String>,
}

/// Compensating actions for resources acquired during create, executed in
/// reverse order of acquisition when a later step fails and discarded
/// wholesale on success.
enum Rollback {
    RemoveStateDir(PathBuf),
    ReapProcess(Arc<Mutex<Option<Child>>>),
    KillProcess(Arc<Mutex<Option<Child>>>),
    DestroyTap(Arc<TapFactory>, TapDevice),
    FreeIp(Arc<IpPool>, Ipv4Addr),
    FreeCid(Arc<CidPool>, u32),
}

impl Rollback {
    async fn run(self, vm_name: &str) {
        match self {
            Rollback::RemoveStateDir(dir) => {
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    error!("failed to remove vm state dir {}: {e}", dir.display());
                }
            }
            Rollback::ReapProcess(process) => {
                info!("reaping VMM process for {vm_name}");
                if let Err(e) = instance::reap_process(&process, instance::REAP_VM_TIMEOUT).await {
                    error!("failed to reap VMM process for {vm_name}: {e:#}");
                }
            }
            Rollback::KillProcess(process) => {
                info!("killing VMM process for {vm_name}");
                let mut guard = process.lock().await;
                if let Some(child) = guard.as_mut() {
                    if let Err(e) = child.start_kill() {
                        error!("error killing VMM process for {vm_name}: {e}");
                    }
                }
            }
            Rollback::DestroyTap(factory, device) => {
                if let Err(e) = factory.destroy(&device).await {
                    error!("failed to delete tap device {}: {e}", device.name);
                }
            }
            Rollback::FreeIp(pool, addr) => {
                info!("freeing IP {addr} for {vm_name}");
                if let Err(e) = pool.free(addr) {
                    error!("failed to free IP {addr}: {e}");
                }
            }
            Rollback::FreeCid(pool, cid) => {
                if let Err(e) = pool.free(cid) {
                    error!("failed to free CID {cid}: {e}");
                }
            }
        }
    }
}

struct CleanupStack {
    vm_name: String,
    actions: Vec<Rollback>,
}

impl CleanupStack {
    fn new(vm_name: &str) -> Self {
        Self {
            vm_name: vm_name.to_string(),
            actions: Vec::new(),
        }
    }

    fn push(&mut self, action: Rollback) {
        self.actions.push(action);
    }

    /// Commit: the acquisitions now belong to the descriptor.
    fn release(&mut self) {
        self.actions.clear();
    }

    async fn unwind(&mut self) {
        for action in self.actions.drain(..).rev() {
            action.run(&self.vm_name).await;
        }
        info!("create cleanup done for {}", self.vm_name);
    }
}

/// The process-wide VM server.
pub struct Server {
    config: Config,
    vms: RwLock<HashMap<String, Arc<VmInstance>>>,
    tap_factory: Arc<TapFactory>,
    ip_pool: Arc<IpPool>,
    cid_pool: Arc<CidPool>,
    sessions: Arc<SessionManager>,
    guest_http: reqwest::Client,
}

impl Server {
    /// Prepare the host (sweep stale taps, bridge and DNAT rules; create
    /// the state dir; set up bridge + NAT) and build the server. Any host
    /// networking failure is fatal.
    pub async fn new(config: Config, sessions: Arc<SessionManager>) -> Result<Self> {
        tap::cleanup_tap_devices(TAP_PREFIX)
            .await
            .context("failed to cleanup tap devices")?;

        network::cleanup_bridge(&config.bridge_name)
            .await
            .context("failed to cleanup bridge")?;

        let ip_prefix = network::ip_prefix_of(&config.bridge_subnet)
            .context("failed to derive the subnet's IP prefix")?;
        info!("cleaning up DNAT rules for IP prefix {ip_prefix}");
        network::reap_dnat_rules(&ip_prefix)
            .await
            .context("failed to cleanup iptables rules")?;

        tokio::fs::create_dir_all(&config.state_dir)
            .await
            .with_context(|| format!("failed to create vm state dir {}", config.state_dir))?;

        let backup_path = format!(
            "/tmp/iptables-backup-{}.rules",
            chrono::Utc::now().format("%Y%m%d-%H%M%S")
        );
        network::setup_bridge_and_firewall(
            &backup_path,
            &config.bridge_name,
            &config.bridge_ip,
            &config.bridge_subnet,
        )
        .await
        .context("failed to setup networking on the host")?;

        let server = Self::with_components(config, sessions)?;
        info!("server config: {}", server.config);
        Ok(server)
    }

    /// Build the server without touching host state. Used by `new` after
    /// host preparation and directly by tests.
    pub fn with_components(config: Config, sessions: Arc<SessionManager>) -> Result<Self> {
        let ip_pool = IpPool::new(&config.bridge_subnet, &config.bridge_ip)
            .context("failed to create IP pool")?;
        let cid_pool = CidPool::default();
        let tap_factory = TapFactory::new(config.bridge_name.clone());
        let guest_http = reqwest::Client::builder()
            .build()
            .context("failed to build guest HTTP client")?;

        Ok(Self {
            config,
            vms: RwLock::new(HashMap::new()),
            tap_factory: Arc::new(tap_factory),
            ip_pool: Arc::new(ip_pool),
            cid_pool: Arc::new(cid_pool),
            sessions,
            guest_http,
        })
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    async fn get_vm(&self, vm_name: &str) -> Option<Arc<VmInstance>> {
        self.vms.read().await.get(vm_name).cloned()
    }

    /// Name of the VM owning a vsock context ID.
    pub async fn vm_name_by_cid(&self, cid: u32) -> Result<String> {
        let vms = self.vms.read().await;
        for (name, instance) in vms.iter() {
            if instance.describe().await.cid == cid {
                return Ok(name.clone());
            }
        }
        anyhow::bail!("no VM found for CID {cid}")
    }

    /// Start a VM: boot it if the name is already registered, otherwise
    /// create it first. Guest command-server readiness is polled afterwards
    /// but is not fatal.
    pub async fn start_vm(&self, params: StartParams) -> Result<VmView> {
        if params.vm_name.is_empty() {
            return Err(Error::InvalidConfig("vmName is required".to_string()).into());
        }
        let vm_name = params.vm_name.clone();
        info!("starting VM {vm_name}");

        let kernel = params.kernel.unwrap_or_else(|| self.config.kernel.clone());
        let rootfs = params.rootfs.unwrap_or_else(|| self.config.rootfs.clone());
        let initramfs = params
            .initramfs
            .unwrap_or_else(|| self.config.initramfs.clone());

        let instance = match self.get_vm(&vm_name).await {
            Some(existing) => {
                existing
                    .boot()
                    .await
                    .context("failed to boot existing VM")?;
                existing
            }
            None => {
                let created = self
                    .create_vm(&vm_name, &kernel, &initramfs, &rootfs)
                    .await?;
                if let Err(e) = created.boot().await {
                    error!("failed to boot VM {vm_name}: {e:#}");
                    created.shutdown_after_failed_boot().await;
                    return Err(e);
                }
                created
            }
        };

        instance.wait_for_guest(&self.guest_http).await;
        info!("VM {vm_name} ready");
        Ok(instance.describe().await)
    }

    /// Spawn a VMM, wait for its API, acquire tap/IP/CID/disk, post the VM
    /// config and publish the descriptor. Every acquisition is paired with
    /// a rollback entry that runs if any later step fails.
    async fn create_vm(
        &self,
        vm_name: &str,
        kernel: &str,
        initramfs: &str,
        rootfs: &str,
    ) -> Result<Arc<VmInstance>> {
        let mut cleanup = CleanupStack::new(vm_name);
        match self
            .try_create_vm(vm_name, kernel, initramfs, rootfs, &mut cleanup)
            .await
        {
            Ok(instance) => {
                cleanup.release();
                Ok(instance)
            }
            Err(e) => {
                error!("failed to create VM {vm_name}: {e:#}");
                cleanup.unwind().await;
                Err(e)
            }
        }
    }

    async fn try_create_vm(
        &self,
        vm_name: &str,
        kernel: &str,
        initramfs: &str,
        rootfs: &str,
        cleanup: &mut CleanupStack,
    ) -> Result<Arc<VmInstance>> {
        if self.vms.read().await.contains_key(vm_name) {
            return Err(Error::AlreadyExists(vm_name.to_string()).into());
        }

        let state_dir = instance::vm_state_dir(&self.config.state_dir, vm_name);
        tokio::fs::create_dir_all(&state_dir)
            .await
            .with_context(|| format!("failed to create vm state dir {}", state_dir.display()))?;
        cleanup.push(Rollback::RemoveStateDir(state_dir.clone()));
        info!("created state dir {}", state_dir.display());

        let api_socket = instance::vm_socket_path(&state_dir, vm_name);
        let client = VmmClient::new(&api_socket);

        let log_path = state_dir.join(instance::VMM_LOG_FILENAME);
        let child = instance::spawn_vmm(&self.config.vmm_bin, &api_socket, &log_path)?;
        let pid = child.id();
        let process = Arc::new(Mutex::new(Some(child)));
        cleanup.push(Rollback::ReapProcess(process.clone()));

        client
            .wait_ready(VMM_READY_TIMEOUT)
            .await
            .context("error waiting for the VMM API")?;
        cleanup.push(Rollback::KillProcess(process.clone()));
        info!("VMM for {vm_name} started, pid {pid:?}");

        let tap = self.tap_factory.create(None).await?;
        cleanup.push(Rollback::DestroyTap(self.tap_factory.clone(), tap.clone()));

        let ip = self.ip_pool.allocate()?;
        info!("allocated IP {ip} for {vm_name}");
        cleanup.push(Rollback::FreeIp(self.ip_pool.clone(), ip.addr));

        let vsock_path = state_dir.join(instance::VSOCK_SOCKET_FILENAME);
        let cid = self.cid_pool.allocate()?;
        cleanup.push(Rollback::FreeCid(self.cid_pool.clone(), cid));

        let stateful_disk = state_dir.join(instance::STATEFUL_DISK_FILENAME);
        instance::create_stateful_disk(&stateful_disk, self.config.stateful_size_mib).await?;

        let vcpus = instance::calculate_vcpu_count();
        let memory_mib = instance::calculate_guest_memory_mib(self.config.guest_mem_percentage);
        info!("calculated vCPUs: {vcpus}, memory: {memory_mib} MiB");

        let vm_config = vmm_types::VmConfig {
            payload: vmm_types::PayloadConfig {
                kernel: kernel.to_string(),
                cmdline: instance::kernel_cmdline(&self.config.bridge_ip, &ip, vm_name),
                initramfs: initramfs.to_string(),
            },
            disks: vec![
                vmm_types::DiskConfig {
                    path: rootfs.to_string(),
                    readonly: Some(true),
                    num_queues: vcpus,
                },
                vmm_types::DiskConfig {
                    path: stateful_disk.display().to_string(),
                    readonly: None,
                    num_queues: vcpus,
                },
            ],
            cpus: vmm_types::CpusConfig {
                boot_vcpus: vcpus,
                max_vcpus: vcpus,
            },
            memory: vmm_types::MemoryConfig {
                size: memory_mib * 1024 * 1024,
            },
            serial: vmm_types::ConsoleConfig::new(vmm_types::SERIAL_PORT_MODE),
            console: vmm_types::ConsoleConfig::new(vmm_types::CONSOLE_PORT_MODE),
            net: vec![vmm_types::NetConfig {
                tap: tap.name.clone(),
                num_queues: vmm_types::NET_DEVICE_QUEUES,
                queue_size: vmm_types::NET_DEVICE_QUEUE_SIZE,
                id: vmm_types::NET_DEVICE_ID.to_string(),
            }],
            vsock: vmm_types::VsockConfig {
                cid: cid as i64,
                socket: vsock_path.display().to_string(),
            },
        };

        info!("posting VM config for {vm_name}");
        client
            .create_vm(&vm_config)
            .await
            .context("failed to create VM")?;

        let instance = Arc::new(VmInstance::new(
            vm_name,
            VmShared {
                state_dir,
                api_socket,
                client,
                process,
                ip,
                tap,
                cid,
                vsock_path,
                stateful_disk,
                status: VmStatus::Created,
            },
        ));
        info!("successfully created VM {vm_name}");

        self.vms
            .write()
            .await
            .insert(vm_name.to_string(), instance.clone());
        Ok(instance)
    }

    /// Destroy one VM and release its resources. A destroy failure leaves
    /// the descriptor registered so the operation can be retried.
    pub async fn destroy_vm(&self, vm_name: &str) -> Result<()> {
        info!("received request to destroy VM {vm_name}");
        let instance = self
            .get_vm(vm_name)
            .await
            .ok_or_else(|| Error::NotFound(vm_name.to_string()))?;

        instance
            .destroy()
            .await
            .with_context(|| format!("failed to destroy vm {vm_name}"))?;

        let view = instance.describe().await;

        self.tap_factory
            .destroy(&view.tap)
            .await
            .with_context(|| format!("failed to destroy the tap device for vm {vm_name}"))?;

        self.ip_pool
            .free(view.ip.addr)
            .with_context(|| format!("failed to free IP {}", view.ip))?;

        if let Err(e) = self.cid_pool.free(view.cid) {
            error!("failed to free CID {}: {e}", view.cid);
        }

        self.vms.write().await.remove(vm_name);
        Ok(())
    }

    /// Destroy every registered VM, joining per-VM failures. VMs whose
    /// destroy failed stay registered for a retry.
    pub async fn destroy_all(&self) -> Result<()> {
        info!("received request to destroy all VMs");
        let names: Vec<String> = self.vms.read().await.keys().cloned().collect();

        let mut failures = Vec::new();
        for vm_name in names {
            if let Err(e) = self.destroy_vm(&vm_name).await {
                warn!("failed to destroy and clean up vm {vm_name}");
                failures.push(format!("{vm_name}: {e:#}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("failed to destroy all VMs: {}", failures.join("; "))
        }
    }

    pub async fn list_all(&self) -> Vec<VmView> {
        let vms = self.vms.read().await;
        let mut views = Vec::with_capacity(vms.len());
        for instance in vms.values() {
            views.push(instance.describe().await);
        }
        views
    }

    pub async fn list_vm(&self, vm_name: &str) -> Result<VmView> {
        let instance = self
            .get_vm(vm_name)
            .await
            .ok_or_else(|| Error::NotFound(vm_name.to_string()))?;
        Ok(instance.describe().await)
    }

    /// Run a command inside a VM through its guest command server. The
    /// `blocking` flag is forwarded untouched; the guest decides what the
    /// response carries.
    pub async fn vm_exec(&self, vm_name: &str, cmd: &str, blocking: bool) -> Result<RunCmdResponse> {
        let instance = self
            .get_vm(vm_name)
            .await
            .ok_or_else(|| Error::NotFound(vm_name.to_string()))?;
        let addr = instance.guest_addr().await;
        guest::exec(&self.guest_http, addr, cmd, blocking).await
    }

    /// Forward a guest-originated callback to the VM's subscriber.
    pub async fn route_callback(
        &self,
        vm_name: &str,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        self.sessions.route(vm_name, method, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server() -> Server {
        let config = Config {
            bridge_subnet: "10.20.1.0/24".to_string(),
            bridge_ip: "10.20.1.1/24".to_string(),
            ..Config::default()
        };
        Server::with_components(config, Arc::new(SessionManager::new())).unwrap()
    }

    #[tokio::test]
    async fn test_listing_starts_empty() {
        let server = test_server();
        assert!(server.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_exec_on_unknown_vm_is_not_found() {
        let server = test_server();
        let err = server.vm_exec("ghost", "echo hi", true).await.unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::NotFound(name)) => assert_eq!(name, "ghost"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            err.downcast_ref::<Error>().unwrap().to_string(),
            "vm not found: ghost"
        );
    }

    #[tokio::test]
    async fn test_destroy_unknown_vm_is_not_found() {
        let server = test_server();
        let err = server.destroy_vm("ghost").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_unknown_vm_is_not_found() {
        let server = test_server();
        assert!(server.list_vm("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_start_requires_a_name() {
        let server = test_server();
        let err = server.start_vm(StartParams::default()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_destroy_all_with_no_vms_succeeds() {
        let server = test_server();
        server.destroy_all().await.unwrap();
        assert!(server.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_cid_reverse_lookup_with_no_vms_fails() {
        let server = test_server();
        assert!(server.vm_name_by_cid(3).await.is_err());
    }

    #[tokio::test]
    async fn test_route_callback_without_session_fails() {
        let server = test_server();
        let err = server
            .route_callback("ghost", "ping", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::NoSession(_))
        ));
    }

    #[tokio::test]
    async fn test_rollback_stack_runs_in_reverse_order() {
        // Free order must be the reverse of allocation order: the CID entry
        // pushed last must be unwound before the IP entry.
        let ip_pool = Arc::new(IpPool::new("10.20.1.0/30", "10.20.1.1").unwrap());
        let cid_pool = Arc::new(CidPool::new(3, 4).unwrap());

        let ip = ip_pool.allocate().unwrap();
        let cid = cid_pool.allocate().unwrap();

        let mut stack = CleanupStack::new("test-vm");
        stack.push(Rollback::FreeIp(ip_pool.clone(), ip.addr));
        stack.push(Rollback::FreeCid(cid_pool.clone(), cid));
        stack.unwind().await;

        assert_eq!(ip_pool.in_use(), 0);
        assert_eq!(cid_pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_released_stack_keeps_resources() {
        let ip_pool = Arc::new(IpPool::new("10.20.1.0/30", "10.20.1.1").unwrap());
        let ip = ip_pool.allocate().unwrap();

        let mut stack = CleanupStack::new("test-vm");
        stack.push(Rollback::FreeIp(ip_pool.clone(), ip.addr));
        stack.release();
        stack.unwind().await;

        assert_eq!(ip_pool.in_use(), 1);
    }
}
