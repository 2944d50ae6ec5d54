//! The per-VM coordinator.
//!
//! A `VmContext` owns the VM's sockets, channels, allocators, device
//! registry, and current state. All mutation of the shared maps happens
//! under one lock that is never held across an await point or a channel
//! send; serialization of state transitions comes from the single-consumer
//! dispatch loop in [`super::state`], not from the lock.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch};

use podlite_shared::codes::PodResponse;
use podlite_shared::{Frame, MessageCode, PodliteError, PodliteResult, VmContainer, VmEnvVar, VmPod};

use crate::agent::{self, WATCHDOG_TIMEOUT};
use crate::pod::UserPod;
use crate::qmp::{self, QmpSession, SessionOutcome};
use crate::qmp::types::QmpCommand;
use crate::runtime::layout::{VmLayout, SHARE_DIR_TAG};
use crate::runtime::options::VmBootConfig;
use crate::storage;
use crate::tty::{self, TtyMultiplexer};
use crate::vm::devices::{BlockDescriptor, DeviceRegistry, VolumeInfo, FSTYPE_DIR};
use crate::vm::events::{BlockdevInsertedInfo, BlockdevSource, VmEvent};
use crate::vm::progress::ProgressTracker;
use crate::vm::state::VmState;

/// First PCI slot available for hotplug; lower slots hold the fixed
/// virtio-serial, virtio-scsi, and 9p controllers.
pub const PCI_ADDR_BASE: u32 = 0x05;

/// Mutable coordinator state, guarded by the context lock.
pub(crate) struct ContextInner {
    pci_addr: u32,
    scsi_id: u32,
    attach_id: u64,

    pub devices: DeviceRegistry,
    pub progress: ProgressTracker,
    pub user_spec: Option<UserPod>,
    pub vm_spec: Option<VmPod>,
    pub tty: TtyMultiplexer,

    /// Interfaces requested for this pod.
    pub networks: usize,
    pub qemu_pid: Option<i32>,
    pub process_exited: bool,
    pub qmp_ready: bool,
    pub agent_ready: bool,

    /// Current state; `None` exactly when the context is closed.
    pub state: Option<VmState>,
}

pub struct VmContext {
    id: String,
    cpu: u32,
    memory: u32,
    kernel: PathBuf,
    initrd: PathBuf,
    layout: VmLayout,
    images_dir: PathBuf,

    hub: mpsc::Sender<VmEvent>,
    client: mpsc::Sender<PodResponse>,
    qmp: mpsc::Sender<QmpSession>,
    agent: mpsc::Sender<Frame>,

    closed: watch::Sender<bool>,

    pub(crate) inner: Mutex<ContextInner>,
}

impl VmContext {
    /// Set up the VM directory, listen on its sockets, and start the driver
    /// tasks. No QEMU process exists yet; that happens on `RunPod`.
    ///
    /// Any failure here unwinds the partially created directory.
    pub fn create(
        id: String,
        layout: VmLayout,
        boot: &VmBootConfig,
        images_dir: PathBuf,
        hub: mpsc::Sender<VmEvent>,
        client: mpsc::Sender<PodResponse>,
    ) -> PodliteResult<Arc<Self>> {
        layout.prepare()?;

        let listeners = match bind_sockets(&layout) {
            Ok(listeners) => listeners,
            Err(e) => {
                layout.cleanup();
                return Err(e);
            }
        };
        let (qmp_listener, agent_listener, tty_listener) = listeners;

        let (qmp_tx, qmp_rx) = mpsc::channel(128);
        let (agent_tx, agent_rx) = mpsc::channel(128);
        let (tty_tx, tty_rx) = mpsc::channel(128);
        let (closed_tx, closed_rx) = watch::channel(false);

        let ctx = Arc::new(Self {
            id,
            cpu: boot.cpus,
            memory: boot.memory_mib,
            kernel: boot.kernel.clone(),
            initrd: boot.initrd.clone(),
            layout,
            images_dir,
            hub: hub.clone(),
            client,
            qmp: qmp_tx,
            agent: agent_tx,
            closed: closed_tx,
            inner: Mutex::new(ContextInner {
                pci_addr: PCI_ADDR_BASE,
                scsi_id: 0,
                attach_id: 1,
                devices: DeviceRegistry::new(),
                progress: ProgressTracker::new(),
                user_spec: None,
                vm_spec: None,
                tty: TtyMultiplexer::new(),
                networks: 0,
                qemu_pid: None,
                process_exited: false,
                qmp_ready: false,
                agent_ready: false,
                state: Some(VmState::Init),
            }),
        });

        tokio::spawn(qmp::qmp_driver(
            qmp_listener,
            qmp_rx,
            hub.clone(),
            closed_rx.clone(),
        ));
        tokio::spawn(agent::agent_channel(
            agent_listener,
            agent_rx,
            tty_rx,
            hub.clone(),
            WATCHDOG_TIMEOUT,
            closed_rx.clone(),
        ));
        tokio::spawn(tty::tty_server(tty_listener, hub, tty_tx, closed_rx));

        Ok(ctx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn layout(&self) -> &VmLayout {
        &self.layout
    }

    pub fn images_dir(&self) -> &PathBuf {
        &self.images_dir
    }

    pub fn hub(&self) -> mpsc::Sender<VmEvent> {
        self.hub.clone()
    }

    // ------------------------------------------------------------------
    // allocators
    // ------------------------------------------------------------------

    pub fn next_scsi_id(&self) -> u32 {
        let mut inner = self.inner.lock();
        let id = inner.scsi_id;
        inner.scsi_id += 1;
        id
    }

    pub fn next_pci_addr(&self) -> u32 {
        let mut inner = self.inner.lock();
        let addr = inner.pci_addr;
        inner.pci_addr += 1;
        addr
    }

    pub fn next_attach_id(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_attach_id_locked()
    }

    /// Reset the device-address allocators between VM lifetimes.
    /// Attach ids are never reset.
    pub fn reset_addrs(&self) {
        let mut inner = self.inner.lock();
        inner.pci_addr = PCI_ADDR_BASE;
        inner.scsi_id = 0;
    }

    // ------------------------------------------------------------------
    // state
    // ------------------------------------------------------------------

    pub fn current_state(&self) -> Option<VmState> {
        self.inner.lock().state
    }

    /// Point-in-time state replacement, observed under the lock.
    pub fn become_state(&self, state: VmState) {
        self.inner.lock().state = Some(state);
    }

    // ------------------------------------------------------------------
    // spec ingestion
    // ------------------------------------------------------------------

    /// Pre-populate the registry and progress maps from the user spec and
    /// assemble the skeletal vm spec. Interfaces and routes stay empty here;
    /// the network batch fills them in.
    pub fn init_device_context(&self, spec: UserPod, networks: usize) {
        let mut inner = self.inner.lock();
        inner.networks = networks;

        for i in 0..networks {
            inner.progress.adding.networks.insert(i);
        }

        for vol in &spec.volumes {
            let info = if vol.source.is_empty() {
                VolumeInfo {
                    info: BlockDescriptor {
                        name: vol.name.clone(),
                        ..Default::default()
                    },
                    ..Default::default()
                }
            } else if vol.driver.is_block() {
                inner.progress.adding.blockdevs.insert(vol.name.clone());
                VolumeInfo {
                    info: BlockDescriptor {
                        name: vol.name.clone(),
                        filename: vol.source.clone(),
                        format: vol.driver.as_str().into(),
                        fstype: "ext4".into(),
                        ..Default::default()
                    },
                    ..Default::default()
                }
            } else {
                VolumeInfo {
                    info: BlockDescriptor {
                        name: vol.name.clone(),
                        filename: vol.source.clone(),
                        format: vol.driver.as_str().into(),
                        fstype: FSTYPE_DIR.into(),
                        ..Default::default()
                    },
                    ..Default::default()
                }
            };
            inner.devices.volume_map.insert(vol.name.clone(), info);
            inner.progress.adding.volumes.insert(vol.name.clone());
        }

        let mut containers = Vec::with_capacity(spec.containers.len());
        for (i, container) in spec.containers.iter().enumerate() {
            for vref in &container.volumes {
                if let Some(vol) = inner.devices.volume_map.get_mut(&vref.volume) {
                    vol.pos.insert(i, vref.path.clone());
                    vol.read_only.insert(i, vref.read_only);
                }
            }

            let envs = container
                .envs
                .iter()
                .map(|e| VmEnvVar {
                    env: e.env.clone(),
                    value: e.value.clone(),
                })
                .collect();

            let restart = if container.restart_policy.is_empty() {
                "never".to_string()
            } else {
                container.restart_policy.clone()
            };

            let mut vm_container = VmContainer {
                rootfs: "rootfs".into(),
                fstype: "ext4".into(),
                workdir: container.workdir.clone(),
                entrypoint: container.entrypoint.clone(),
                cmd: container.command.clone(),
                envs,
                restart_policy: restart,
                ..Default::default()
            };

            inner.progress.adding.containers.insert(i);
            if spec.tty || container.tty {
                let attach_id = inner.next_attach_id_locked();
                vm_container.tty = attach_id;
                inner.tty.register(attach_id, i);
            }
            containers.push(vm_container);
        }

        inner.vm_spec = Some(VmPod {
            hostname: spec.name.clone(),
            containers,
            interfaces: Vec::new(),
            routes: Vec::new(),
            socket: self
                .layout
                .agent_socket()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            share_dir: SHARE_DIR_TAG.into(),
        });
        inner.user_spec = Some(spec);
    }

    /// A point-in-time copy of the resolved vm spec, for inspection.
    pub fn vm_spec_snapshot(&self) -> Option<VmPod> {
        self.inner.lock().vm_spec.clone()
    }

    /// Find a container index by its id.
    pub fn lookup(&self, container_id: &str) -> Option<usize> {
        if container_id.is_empty() {
            return None;
        }
        let inner = self.inner.lock();
        inner
            .vm_spec
            .as_ref()?
            .containers
            .iter()
            .position(|c| c.id == container_id)
    }

    // ------------------------------------------------------------------
    // QEMU process
    // ------------------------------------------------------------------

    /// The exact QEMU argument list; bit-exact where the guest contract
    /// depends on it. Falls back to emulation when /dev/kvm is absent.
    pub fn qemu_arguments(&self) -> Vec<String> {
        let mut args: Vec<String> = if std::path::Path::new("/dev/kvm").exists() {
            vec![
                "-machine".into(),
                "pc-i440fx-2.0,accel=kvm,usb=off".into(),
                "-global".into(),
                "kvm-pit.lost_tick_policy=discard".into(),
                "-cpu".into(),
                "host".into(),
            ]
        } else {
            tracing::info!("/dev/kvm not present, falling back to emulation");
            vec![
                "-machine".into(),
                "pc-i440fx-2.0,usb=off".into(),
                "-cpu".into(),
                "core2duo".into(),
            ]
        };

        let share_dir = self.layout.share_dir();
        args.extend(
            [
                "-realtime",
                "mlock=off",
                "-no-user-config",
                "-nodefaults",
                "-no-hpet",
                "-rtc",
                "base=utc,driftfix=slew",
                "-no-reboot",
                "-display",
                "none",
                "-boot",
                "strict=on",
            ]
            .into_iter()
            .map(String::from),
        );
        args.extend([
            "-m".into(),
            self.memory.to_string(),
            "-smp".into(),
            self.cpu.to_string(),
            "-kernel".into(),
            self.kernel.display().to_string(),
            "-initrd".into(),
            self.initrd.display().to_string(),
            "-append".into(),
            "console=ttyS0 panic=1".into(),
            "-qmp".into(),
            format!("unix:{}", self.layout.qmp_socket().display()),
            "-serial".into(),
            format!(
                "unix:{},server,nowait",
                self.layout.console_socket().display()
            ),
            "-device".into(),
            "virtio-serial-pci,id=virtio-serial0,bus=pci.0,addr=0x2".into(),
            "-device".into(),
            "virtio-scsi-pci,id=scsi0,bus=pci.0,addr=0x3".into(),
            "-chardev".into(),
            format!(
                "socket,id=charch0,path={}",
                self.layout.agent_socket().display()
            ),
            "-device".into(),
            "virtserialport,bus=virtio-serial0.0,nr=1,chardev=charch0,id=channel0,name=org.getdvm.channel.0".into(),
            "-chardev".into(),
            format!(
                "socket,id=charch1,path={}",
                self.layout.agent_socket().display()
            ),
            "-device".into(),
            "virtserialport,bus=virtio-serial0.0,nr=2,chardev=charch1,id=channel1,name=org.getdvm.channel.1".into(),
            "-fsdev".into(),
            format!(
                "local,id=virtio9p,path={},security_model=none",
                share_dir.display()
            ),
            "-device".into(),
            format!("virtio-9p-pci,fsdev=virtio9p,mount_tag={}", SHARE_DIR_TAG),
        ]);
        args
    }

    /// Spawn QEMU and a waiter task that reports its exit to the hub.
    pub fn launch_qemu(&self) -> PodliteResult<()> {
        let mut child = tokio::process::Command::new("qemu-system-x86_64")
            .args(self.qemu_arguments())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PodliteError::Qemu(format!("failed to launch qemu: {}", e)))?;

        let pid = child.id().map(|p| p as i32);
        self.inner.lock().qemu_pid = pid;
        tracing::info!(vm = %self.id, pid = ?pid, "qemu launched");

        let hub = self.hub.clone();
        tokio::spawn(async move {
            let status = child.wait().await.ok().and_then(|s| s.code());
            let _ = hub.send(VmEvent::ProcessExited { status }).await;
        });
        Ok(())
    }

    /// Force the QEMU process down. Used on fatal paths where the guest
    /// cannot be asked nicely.
    pub fn kill_qemu(&self) {
        let pid = self.inner.lock().qemu_pid;
        if let Some(pid) = pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                tracing::debug!(pid, error = %e, "qemu kill failed (may have exited)");
            }
        }
    }

    // ------------------------------------------------------------------
    // outbound channels
    // ------------------------------------------------------------------

    /// Report toward the control client. A gone client is not an error.
    pub async fn reply(&self, code: i32, cause: impl Into<String>) {
        let _ = self
            .client
            .send(PodResponse::new(self.id.clone(), code, cause))
            .await;
    }

    pub async fn send_agent(&self, frame: Frame) {
        let _ = self.agent.send(frame).await;
    }

    /// Returns false when the QMP driver is gone; callers on the teardown
    /// path must then complete the work themselves so the drain converges.
    pub async fn send_qmp(&self, session: QmpSession) -> bool {
        self.qmp.send(session).await.is_ok()
    }

    /// Serialize the resolved vm spec and hand it to the guest agent.
    pub async fn send_run_pod(&self) -> PodliteResult<()> {
        let payload = {
            let inner = self.inner.lock();
            let spec = inner
                .vm_spec
                .as_ref()
                .ok_or_else(|| PodliteError::InvalidState("no vm spec ingested".into()))?;
            serde_json::to_vec(spec)?
        };
        self.send_agent(Frame::new(MessageCode::RunPod, payload))
            .await;
        Ok(())
    }

    /// Request a two-step disk hotplug for a prepared blockdev.
    pub async fn insert_blockdev(
        &self,
        name: String,
        source: BlockdevSource,
        filename: String,
        format: String,
    ) {
        let scsi_id = self.next_scsi_id();
        let pci_addr = self.next_pci_addr();
        let node_name = format!("drive{}", scsi_id);
        let device_id = format!("scsi-disk-{}", scsi_id);
        let device_name = qmp::scsi_device_name(scsi_id);

        self.send_qmp(QmpSession {
            commands: vec![
                QmpCommand::blockdev_add(&node_name, &filename, &format),
                QmpCommand::device_add_scsi_hd(&device_id, &node_name, scsi_id),
            ],
            wait_device_deleted: None,
            outcome: SessionOutcome::BlockdevInserted(BlockdevInsertedInfo {
                name,
                source,
                device_name,
                scsi_id,
                pci_addr,
            }),
        })
        .await;
    }

    /// Request a netdev hotplug for a created tap interface.
    pub async fn insert_netdev(&self, index: usize, host_device: String) {
        let pci_addr = self.next_pci_addr();
        let netdev_id = format!("netdev{}", index);
        let device_id = format!("virtio-net-{}", index);

        self.send_qmp(QmpSession {
            commands: vec![
                QmpCommand::netdev_add(&netdev_id, &host_device),
                QmpCommand::device_add_virtio_net(&device_id, &netdev_id, pci_addr),
            ],
            wait_device_deleted: None,
            outcome: SessionOutcome::NetdevInserted { index },
        })
        .await;
    }

    // ------------------------------------------------------------------
    // teardown families
    // ------------------------------------------------------------------

    /// Unmount every directory-backed volume from the share tree.
    pub fn release_volume_dirs(&self) {
        let targets: Vec<String> = {
            let mut inner = self.inner.lock();
            let names: Vec<String> = inner
                .devices
                .volume_map
                .iter()
                .filter(|(_, v)| v.info.fstype == FSTYPE_DIR)
                .map(|(name, _)| name.clone())
                .collect();
            for name in &names {
                inner.progress.deleting.volumes.insert(name.clone());
            }
            names
        };

        for name in targets {
            tracing::debug!(volume = %name, "releasing volume dir");
            tokio::spawn(storage::umount_volume(
                self.layout.clone(),
                name,
                self.hub.clone(),
            ));
        }
    }

    /// Unmount every directory-backed container rootfs overlay.
    pub fn release_overlay_dirs(&self) {
        let targets: Vec<(usize, String)> = {
            let mut inner = self.inner.lock();
            let Some(spec) = inner.vm_spec.as_ref() else {
                return;
            };
            let targets: Vec<(usize, String)> = spec
                .containers
                .iter()
                .enumerate()
                .filter(|(_, c)| c.fstype == FSTYPE_DIR && !c.id.is_empty())
                .map(|(idx, c)| (idx, c.id.clone()))
                .collect();
            for (idx, _) in &targets {
                inner.progress.deleting.containers.insert(*idx);
            }
            targets
        };

        for (idx, id) in targets {
            tracing::debug!(container = idx, "releasing overlay rootfs");
            tokio::spawn(storage::umount_container(
                self.layout.clone(),
                id,
                idx,
                self.hub.clone(),
            ));
        }
    }

    /// `device_del` every block-backed volume and wait for DEVICE_DELETED.
    pub async fn remove_volume_drives(&self) {
        let sessions: Vec<(String, QmpSession)> = {
            let mut inner = self.inner.lock();
            let mut sessions = Vec::new();
            for (name, vol) in &inner.devices.volume_map {
                if vol.info.format == "raw" || vol.info.format == "qcow2" {
                    let device_id = format!("scsi-disk-{}", vol.info.scsi_id);
                    sessions.push((
                        name.clone(),
                        QmpSession {
                            commands: vec![QmpCommand::device_del(&device_id)],
                            wait_device_deleted: Some(device_id),
                            outcome: SessionOutcome::VolumeUnplugged { name: name.clone() },
                        },
                    ));
                }
            }
            for (name, _) in &sessions {
                inner.progress.deleting.volumes.insert(name.clone());
            }
            sessions
        };

        for (name, session) in sessions {
            tracing::debug!(volume = %name, "detaching volume drive");
            if !self.send_qmp(session).await {
                let _ = self
                    .hub
                    .send(VmEvent::VolumeUnmounted {
                        name,
                        success: false,
                    })
                    .await;
            }
        }
    }

    /// `device_del` every image disk and wait for DEVICE_DELETED.
    pub async fn remove_image_drives(&self) {
        let sessions: Vec<(usize, QmpSession)> = {
            let mut inner = self.inner.lock();
            let mut sessions = Vec::new();
            for image in inner.devices.image_map.values() {
                if image.info.fstype != FSTYPE_DIR {
                    let device_id = format!("scsi-disk-{}", image.info.scsi_id);
                    sessions.push((
                        image.pos,
                        QmpSession {
                            commands: vec![QmpCommand::device_del(&device_id)],
                            wait_device_deleted: Some(device_id),
                            outcome: SessionOutcome::ImageUnplugged { index: image.pos },
                        },
                    ));
                }
            }
            for (index, _) in &sessions {
                inner.progress.deleting.containers.insert(*index);
            }
            sessions
        };

        for (index, session) in sessions {
            tracing::debug!(container = index, "ejecting image drive");
            if !self.send_qmp(session).await {
                let _ = self
                    .hub
                    .send(VmEvent::ContainerUnmounted {
                        index,
                        success: false,
                    })
                    .await;
            }
        }
    }

    /// Release the device-mapper nodes behind block images and volumes.
    pub fn remove_dm_devices(&self) {
        let targets: Vec<(String, String)> = {
            let mut inner = self.inner.lock();
            let mut targets = Vec::new();
            for (name, image) in &inner.devices.image_map {
                if image.info.fstype != FSTYPE_DIR {
                    targets.push((image.info.filename.clone(), name.clone()));
                }
            }
            for (name, vol) in &inner.devices.volume_map {
                if vol.info.fstype != FSTYPE_DIR && !vol.info.filename.is_empty() {
                    targets.push((vol.info.filename.clone(), name.clone()));
                }
            }
            for (_, name) in &targets {
                inner.progress.deleting.blockdevs.insert(name.clone());
            }
            targets
        };

        for (filename, name) in targets {
            tokio::spawn(storage::remove_dm_device(filename, name, self.hub.clone()));
        }
    }

    // ------------------------------------------------------------------
    // close
    // ------------------------------------------------------------------

    /// Final teardown: stop driver tasks, remove socket files and the share
    /// directory, and null the state. Runs exactly once, from Cleaning.
    pub fn close(&self) {
        let _ = self.closed.send(true);
        self.layout.cleanup();
        self.inner.lock().state = None;
        tracing::info!(vm = %self.id, "context closed");
    }
}

impl ContextInner {
    pub(crate) fn next_attach_id_locked(&mut self) -> u64 {
        let id = self.attach_id;
        self.attach_id += 1;
        id
    }
}

fn bind_sockets(layout: &VmLayout) -> PodliteResult<(UnixListener, UnixListener, UnixListener)> {
    let qmp = UnixListener::bind(layout.qmp_socket()).map_err(|e| {
        PodliteError::Setup(format!(
            "cannot listen on {}: {}",
            layout.qmp_socket().display(),
            e
        ))
    })?;
    let agent = UnixListener::bind(layout.agent_socket()).map_err(|e| {
        PodliteError::Setup(format!(
            "cannot listen on {}: {}",
            layout.agent_socket().display(),
            e
        ))
    })?;
    let tty = UnixListener::bind(layout.tty_socket()).map_err(|e| {
        PodliteError::Setup(format!(
            "cannot listen on {}: {}",
            layout.tty_socket().display(),
            e
        ))
    })?;
    Ok((qmp, agent, tty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::{UserContainer, UserVolume, UserVolumeRef, VolumeDriver};
    use crate::runtime::layout::FilesystemLayout;
    use tempfile::TempDir;

    fn test_context() -> (Arc<VmContext>, TempDir, mpsc::Receiver<VmEvent>) {
        let dir = TempDir::new().unwrap();
        let layout = FilesystemLayout::new(dir.path());
        let (hub_tx, hub_rx) = mpsc::channel(128);
        let (client_tx, _client_rx) = mpsc::channel(128);

        let ctx = VmContext::create(
            "vm-testabcdef".into(),
            layout.vm("vm-testabcdef"),
            &VmBootConfig::default(),
            dir.path().join("images"),
            hub_tx,
            client_tx,
        )
        .unwrap();
        (ctx, dir, hub_rx)
    }

    #[tokio::test]
    async fn test_allocators_are_monotonic() {
        let (ctx, _dir, _hub) = test_context();

        let scsi: Vec<u32> = (0..5).map(|_| ctx.next_scsi_id()).collect();
        assert_eq!(scsi, vec![0, 1, 2, 3, 4]);

        let pci: Vec<u32> = (0..5).map(|_| ctx.next_pci_addr()).collect();
        assert!(pci.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(pci[0], PCI_ADDR_BASE);

        let attach: Vec<u64> = (0..5).map(|_| ctx.next_attach_id()).collect();
        assert_eq!(attach, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_reset_addrs_keeps_attach_ids() {
        let (ctx, _dir, _hub) = test_context();
        ctx.next_scsi_id();
        ctx.next_pci_addr();
        ctx.next_attach_id();

        ctx.reset_addrs();
        assert_eq!(ctx.next_scsi_id(), 0);
        assert_eq!(ctx.next_pci_addr(), PCI_ADDR_BASE);
        // attach ids survive the reset
        assert_eq!(ctx.next_attach_id(), 2);
    }

    #[tokio::test]
    async fn test_init_device_context_populates_progress() {
        let (ctx, _dir, _hub) = test_context();

        let spec = UserPod {
            name: "pod".into(),
            containers: vec![
                UserContainer {
                    image: "busybox".into(),
                    volumes: vec![UserVolumeRef {
                        volume: "v1".into(),
                        path: "/data".into(),
                        read_only: false,
                    }],
                    ..Default::default()
                },
                UserContainer {
                    image: "nginx".into(),
                    volumes: vec![UserVolumeRef {
                        volume: "v1".into(),
                        path: "/data".into(),
                        read_only: true,
                    }],
                    ..Default::default()
                },
            ],
            volumes: vec![UserVolume {
                name: "v1".into(),
                source: "/vols/v1.img".into(),
                driver: VolumeDriver::Raw,
            }],
            tty: false,
        };
        ctx.init_device_context(spec, 2);

        let inner = ctx.inner.lock();
        assert_eq!(inner.progress.adding.containers.len(), 2);
        assert_eq!(inner.progress.adding.volumes.len(), 1);
        assert!(inner.progress.adding.blockdevs.contains("v1"));
        assert_eq!(inner.progress.adding.networks.len(), 2);

        let vol = inner.devices.volume_map.get("v1").unwrap();
        assert_eq!(vol.pos.get(&0).map(String::as_str), Some("/data"));
        assert_eq!(vol.read_only.get(&1), Some(&true));

        let spec = inner.vm_spec.as_ref().unwrap();
        assert_eq!(spec.hostname, "pod");
        assert!(spec.interfaces.is_empty());
        assert!(spec.routes.is_empty());
        assert_eq!(spec.share_dir, SHARE_DIR_TAG);
        assert_eq!(spec.containers[0].restart_policy, "never");
        assert_eq!(spec.containers[0].tty, 0);
    }

    #[tokio::test]
    async fn test_tty_pods_get_attach_ids() {
        let (ctx, _dir, _hub) = test_context();

        let spec = UserPod {
            name: "pod".into(),
            containers: (0..32)
                .map(|_| UserContainer {
                    image: "busybox".into(),
                    ..Default::default()
                })
                .collect(),
            volumes: Vec::new(),
            tty: true,
        };
        ctx.init_device_context(spec, 0);

        let inner = ctx.inner.lock();
        let spec = inner.vm_spec.as_ref().unwrap();
        let ids: Vec<u64> = spec.containers.iter().map(|c| c.tty).collect();
        assert_eq!(ids, (1..=32).collect::<Vec<u64>>());
        assert_eq!(inner.tty.session_count(), 32);
    }

    #[tokio::test]
    async fn test_lookup_by_container_id() {
        let (ctx, _dir, _hub) = test_context();
        let spec = UserPod {
            name: "pod".into(),
            containers: vec![UserContainer {
                image: "busybox".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        ctx.init_device_context(spec, 0);

        assert_eq!(ctx.lookup(""), None);
        assert_eq!(ctx.lookup("missing"), None);

        let cid = "a".repeat(64);
        ctx.inner.lock().vm_spec.as_mut().unwrap().containers[0].id = cid.clone();
        assert_eq!(ctx.lookup(&cid), Some(0));
    }

    #[tokio::test]
    async fn test_qemu_arguments_contract() {
        let (ctx, _dir, _hub) = test_context();
        let args = ctx.qemu_arguments();
        let joined = args.join(" ");

        assert!(joined.contains("pc-i440fx-2.0"));
        assert!(joined.contains("-append console=ttyS0 panic=1"));
        assert!(joined.contains("virtio-serial-pci,id=virtio-serial0,bus=pci.0,addr=0x2"));
        assert!(joined.contains("virtio-scsi-pci,id=scsi0,bus=pci.0,addr=0x3"));
        assert!(joined.contains("name=org.getdvm.channel.0"));
        assert!(joined.contains("name=org.getdvm.channel.1"));
        assert!(joined.contains("mount_tag=share_dir"));
        assert!(joined.contains(&format!("unix:{}", ctx.layout().qmp_socket().display())));
    }

    #[tokio::test]
    async fn test_close_removes_everything_and_nulls_state() {
        let (ctx, _dir, _hub) = test_context();
        assert_eq!(ctx.current_state(), Some(VmState::Init));
        assert!(ctx.layout().share_dir().is_dir());

        ctx.close();

        assert_eq!(ctx.current_state(), None);
        assert!(!ctx.layout().qmp_socket().exists());
        assert!(!ctx.layout().agent_socket().exists());
        assert!(!ctx.layout().tty_socket().exists());
        assert!(!ctx.layout().share_dir().exists());
        assert!(!ctx.layout().root().exists());
    }
}
